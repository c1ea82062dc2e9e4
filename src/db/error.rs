use thiserror::Error;

/// 特征库操作错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 用户或特征库已达到容量上限
    #[error("capacity exceeded: {scope} holds {size} records (limit {limit})")]
    CapacityExceeded { scope: String, size: usize, limit: usize },

    /// 重命名的目标用户已存在
    #[error("identity {0} already exists")]
    Conflict(String),

    /// 用户名或记录 key 不能作为单级目录名
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// 特征维度与库中已有特征不一致
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 读写图片或特征文件失败
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 特征文件格式错误
    #[error("vector format error: {0}")]
    Format(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
