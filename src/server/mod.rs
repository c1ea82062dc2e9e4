mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::state::*;
pub use self::types::*;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::users_handler,
        api::remark_handler,
        api::enroll_handler,
        api::delete_user_handler,
        api::delete_face_handler,
        api::move_face_handler,
        api::sync_handler,
        api::config_handler,
        api::record_handler,
        api::predict_handler,
        api::fake_list_handler,
        api::fake_delete_handler,
        api::fake_predict_handler,
        api::metrics_handler,
    ),
    components(schemas(
        types::FaceForm,
        types::FakeForm,
        types::RemarkRequest,
        types::MoveRequest,
        types::RecordRequest,
        types::ConfigResponse,
        types::PredictResponse,
        types::EnrollResponse,
        types::CountResponse,
        types::FakePredictResponse,
    ))
)]
pub struct ApiDoc;

/// 构建API服务器
///
/// 同时提供两个特征库目录的静态文件服务，供其他设备同步时下载
pub fn create_app(state: Arc<AppState>) -> Router {
    let faces = ServeDir::new(state.node.store().root());
    let fake_persons = ServeDir::new(state.fake.store().root());
    Router::new()
        .route("/api/users", get(api::users_handler))
        .route("/api/users/remark", post(api::remark_handler))
        .route("/api/users/sync", get(api::sync_handler))
        .route(
            "/api/users/{user_id}/faces",
            post(api::enroll_handler).delete(api::delete_user_handler),
        )
        .route("/api/users/{user_id}/faces/{face_key}", delete(api::delete_face_handler))
        .route("/api/faces/{face_key}/move", post(api::move_face_handler))
        .route("/api/config", get(api::config_handler))
        .route("/api/record", post(api::record_handler))
        .route("/api/predict", post(api::predict_handler))
        .route("/api/fake_persons", get(api::fake_list_handler))
        .route("/api/fake_persons/predict", post(api::fake_predict_handler))
        .route("/api/fake_persons/{key}", delete(api::fake_delete_handler))
        .route("/metrics", get(api::metrics_handler))
        .nest_service("/static/faces", faces)
        .nest_service("/static/fake_persons", fake_persons)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        // 上传限制：10M
        .layer(RequestBodyLimitLayer::new(1024 * 1024 * 10))
        .with_state(state)
}
