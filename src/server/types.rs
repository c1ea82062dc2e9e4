use axum::body::Bytes;
use axum_typed_multipart::TryFromMultipart;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// 上传一张人脸
#[derive(TryFromMultipart)]
pub struct FaceRequest {
    /// JPEG 图片
    pub image: Bytes,
    /// npy 格式的特征
    pub vector: Bytes,
}

/// 人脸表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct FaceForm {
    /// 人脸图片
    #[schema(format = Binary, content_media_type = "image/jpeg")]
    pub image: String,
    /// npy 格式的特征
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub vector: String,
}

/// 误报识别请求
#[derive(TryFromMultipart)]
pub struct FakeRequest {
    pub image: Bytes,
    pub vector: Bytes,
    pub save: Option<bool>,
}

/// 误报识别表单（用于API文档）
#[derive(Debug, ToSchema)]
#[allow(unused)]
pub struct FakeForm {
    /// 检测框图片
    #[schema(format = Binary, content_media_type = "image/jpeg")]
    pub image: String,
    /// npy 格式的特征
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub vector: String,
    /// 未命中时是否录入误报库
    pub save: Option<bool>,
}

/// 用户改名
#[derive(Debug, Deserialize, ToSchema)]
pub struct RemarkRequest {
    /// 新用户名
    pub remark_user_id: String,
    /// 原用户名
    pub old_user_id: String,
}

/// 移动人脸
#[derive(Debug, Deserialize, ToSchema)]
pub struct MoveRequest {
    /// 目标用户名
    pub dest_user_id: String,
}

/// 修改运行时配置
#[derive(Debug, Deserialize, ToSchema)]
pub struct RecordRequest {
    /// 是否自动录入陌生人
    pub is_record: bool,
    /// 人脸匹配阈值
    pub sim_threshold: Option<f32>,
}

/// 当前运行时配置
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConfigResponse {
    pub is_record: bool,
    pub sim_threshold: f32,
    pub user_faces_size: usize,
    /// 未启用 gossip 时为空
    pub device_id: Option<String>,
}

/// 人脸识别结果
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PredictResponse {
    /// 匹配到的用户名，未匹配时为 `UNKNOWN`
    pub label: String,
    /// 是否为本次新录入的用户
    pub enrolled: bool,
}

/// 保存人脸的结果
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EnrollResponse {
    /// 用户已满、未保存时为空
    pub face_key: Option<String>,
    /// 为 false 时表示人脸已存在或未保存
    pub created: bool,
}

/// 修改操作影响的记录数量
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CountResponse {
    pub count: usize,
}

/// 误报识别结果
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FakePredictResponse {
    /// 为 false 时表示命中已知误报
    pub is_person: bool,
}
