use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::warn;

use crate::db::StoreError;

/// API错误类型
pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

impl AppError {
    pub fn bad_request(error: impl Into<anyhow::Error>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: error.into() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, format!("{:#}", self.error)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        let status = match error.downcast_ref::<StoreError>() {
            Some(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            Some(StoreError::InvalidName(_) | StoreError::DimensionMismatch { .. }) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, error }
    }
}

/// 只有冲突和非法输入会返回给调用方，其余特征库错误记录日志后按未生效处理
pub fn recover<T>(result: crate::db::Result<T>, fallback: impl FnOnce() -> T) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(
            e @ (StoreError::Conflict(_)
            | StoreError::InvalidName(_)
            | StoreError::DimensionMismatch { .. }),
        ) => Err(e.into()),
        Err(e) => {
            warn!("操作未生效: {e}");
            Ok(fallback())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recover() {
        let full = StoreError::CapacityExceeded { scope: "alice".into(), size: 10, limit: 10 };
        assert_eq!(recover(Err(full), || 0).ok(), Some(0));
        let io = StoreError::Io(std::io::Error::other("disk"));
        assert_eq!(recover(Err(io), || 0).ok(), Some(0));
        assert_eq!(recover(Ok(3), || 0).ok(), Some(3));

        let err = recover::<usize>(Err(StoreError::Conflict("bob".into())), || 0).unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
        let err = recover::<usize>(Err(StoreError::InvalidName("..".into())), || 0).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
