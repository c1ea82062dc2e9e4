use std::sync::Arc;

use crate::db::FakeStore;
use crate::node::FaceNode;

/// 应用状态
pub struct AppState {
    /// 人脸库
    pub node: Arc<FaceNode>,
    /// 误报库
    pub fake: Arc<FakeStore>,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(node: Arc<FaceNode>, fake: Arc<FakeStore>) -> Arc<Self> {
        Arc::new(AppState { node, fake })
    }
}
