use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum_typed_multipart::TypedMultipart;
use log::info;
use tokio::task::block_in_place;

use super::error::{AppError, Result, recover};
use super::state::AppState;
use super::types::*;
use crate::db::Prediction;
use crate::{metrics, utils, vector};

/// 解析上传的图片和特征
fn decode_upload(image: &[u8], vector: &[u8]) -> Result<Vec<f32>> {
    utils::imdecode(image).map_err(AppError::bad_request)?;
    vector::decode_npy(vector).map_err(AppError::bad_request)
}

/// 列出所有用户及其人脸
#[utoipa::path(
    get,
    path = "/api/users",
    responses(
        (status = 200, body = BTreeMap<String, Vec<String>>),
    )
)]
pub async fn users_handler(
    State(state): State<Arc<AppState>>,
) -> Json<BTreeMap<String, Vec<String>>> {
    Json(state.node.users())
}

/// 用户改名，新用户名已存在时返回 409
#[utoipa::path(
    post,
    path = "/api/users/remark",
    request_body = RemarkRequest,
    responses(
        (status = 200, body = CountResponse),
        (status = 409, description = "新用户名已存在"),
    )
)]
pub async fn remark_handler(
    State(state): State<Arc<AppState>>,
    Json(data): Json<RemarkRequest>,
) -> Result<Json<CountResponse>> {
    let count = recover(
        block_in_place(|| state.node.rename(&data.remark_user_id, &data.old_user_id)),
        || 0,
    )?;
    Ok(Json(CountResponse { count }))
}

/// 为用户添加一张人脸，用户已满时不保存并返回 `created: false`
#[utoipa::path(
    post,
    path = "/api/users/{user_id}/faces",
    params(("user_id" = String, Path, description = "用户名")),
    request_body(content = FaceForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = EnrollResponse),
    )
)]
pub async fn enroll_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    data: TypedMultipart<FaceRequest>,
) -> Result<Json<EnrollResponse>> {
    let saved = block_in_place(|| -> Result<_> {
        let vector = decode_upload(&data.image, &data.vector)?;
        recover(state.node.enroll(&user_id, &data.image, &vector).map(Some), || None)
    })?;
    Ok(Json(match saved {
        Some(saved) => EnrollResponse { face_key: Some(saved.key), created: saved.created },
        None => EnrollResponse { face_key: None, created: false },
    }))
}

/// 删除用户
#[utoipa::path(
    delete,
    path = "/api/users/{user_id}/faces",
    params(("user_id" = String, Path, description = "用户名")),
    responses(
        (status = 200, body = CountResponse),
    )
)]
pub async fn delete_user_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<CountResponse>> {
    let count = recover(block_in_place(|| state.node.delete_user(&user_id)), || 0)?;
    Ok(Json(CountResponse { count }))
}

/// 删除用户的一张人脸
#[utoipa::path(
    delete,
    path = "/api/users/{user_id}/faces/{face_key}",
    params(
        ("user_id" = String, Path, description = "用户名"),
        ("face_key" = String, Path, description = "人脸 key"),
    ),
    responses(
        (status = 200, body = CountResponse),
    )
)]
pub async fn delete_face_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, face_key)): Path<(String, String)>,
) -> Result<Json<CountResponse>> {
    let deleted =
        recover(block_in_place(|| state.node.delete_face(&user_id, &face_key)), || false)?;
    Ok(Json(CountResponse { count: deleted as usize }))
}

/// 将一张人脸移动到另一个用户名下
#[utoipa::path(
    post,
    path = "/api/faces/{face_key}/move",
    params(("face_key" = String, Path, description = "人脸 key")),
    request_body = MoveRequest,
    responses(
        (status = 200, body = CountResponse),
    )
)]
pub async fn move_face_handler(
    State(state): State<Arc<AppState>>,
    Path(face_key): Path<String>,
    Json(data): Json<MoveRequest>,
) -> Result<Json<CountResponse>> {
    let moved =
        recover(block_in_place(|| state.node.move_face(&face_key, &data.dest_user_id)), || false)?;
    Ok(Json(CountResponse { count: moved as usize }))
}

/// 向其他设备广播所有用户
#[utoipa::path(
    get,
    path = "/api/users/sync",
    responses(
        (status = 200, body = CountResponse),
    )
)]
pub async fn sync_handler(State(state): State<Arc<AppState>>) -> Json<CountResponse> {
    let count = state.node.sync_all();
    info!("已广播 {count} 个用户");
    Json(CountResponse { count })
}

fn current_config(state: &AppState) -> ConfigResponse {
    let store = state.node.store();
    ConfigResponse {
        is_record: state.node.is_recording(),
        sim_threshold: store.threshold(),
        user_faces_size: store.capacity(),
        device_id: state.node.publisher().map(|p| p.device().to_string()),
    }
}

/// 获取运行时配置
#[utoipa::path(
    get,
    path = "/api/config",
    responses(
        (status = 200, body = ConfigResponse),
    )
)]
pub async fn config_handler(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    Json(current_config(&state))
}

/// 修改自动录入开关和匹配阈值
#[utoipa::path(
    post,
    path = "/api/record",
    request_body = RecordRequest,
    responses(
        (status = 200, body = ConfigResponse),
    )
)]
pub async fn record_handler(
    State(state): State<Arc<AppState>>,
    Json(data): Json<RecordRequest>,
) -> Result<Json<ConfigResponse>> {
    if let Some(threshold) = data.sim_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(AppError::bad_request(anyhow::anyhow!("阈值必须在 0 到 1 之间")));
        }
        state.node.store().set_threshold(threshold);
    }
    state.node.set_recording(data.is_record);
    Ok(Json(current_config(&state)))
}

/// 识别一张人脸
#[utoipa::path(
    post,
    path = "/api/predict",
    request_body(content = FaceForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = PredictResponse),
    )
)]
pub async fn predict_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<FaceRequest>,
) -> Result<Json<PredictResponse>> {
    let prediction = block_in_place(|| -> Result<_> {
        let vector = decode_upload(&data.image, &data.vector)?;
        Ok(state.node.predict(&data.image[..], &vector))
    })?;
    Ok(Json(PredictResponse {
        label: prediction.label().to_owned(),
        enrolled: matches!(prediction, Prediction::Enrolled(_)),
    }))
}

/// 列出误报库中的记录
#[utoipa::path(
    get,
    path = "/api/fake_persons",
    responses(
        (status = 200, body = Vec<String>),
    )
)]
pub async fn fake_list_handler(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.fake.keys())
}

/// 删除一条误报
#[utoipa::path(
    delete,
    path = "/api/fake_persons/{key}",
    params(("key" = String, Path, description = "误报 key")),
    responses(
        (status = 200, body = CountResponse),
    )
)]
pub async fn fake_delete_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<CountResponse>> {
    let deleted = recover(block_in_place(|| state.fake.delete(&key)), || false)?;
    Ok(Json(CountResponse { count: deleted as usize }))
}

/// 判断检测结果是否为已知误报
#[utoipa::path(
    post,
    path = "/api/fake_persons/predict",
    request_body(content = FakeForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = FakePredictResponse),
    )
)]
pub async fn fake_predict_handler(
    State(state): State<Arc<AppState>>,
    data: TypedMultipart<FakeRequest>,
) -> Result<Json<FakePredictResponse>> {
    let is_person = block_in_place(|| -> Result<_> {
        let vector = decode_upload(&data.image, &data.vector)?;
        Ok(state.fake.predict(&data.image[..], &vector, data.save.unwrap_or(false)))
    })?;
    Ok(Json(FakePredictResponse { is_person }))
}

/// prometheus 指标
#[utoipa::path(get, path = "/metrics")]
pub async fn metrics_handler() -> String {
    metrics::gather_text()
}
