use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::bus::Inbound;
use super::fetch::BlobFetcher;
use super::message::{Envelope, FaceRef, GossipMessage, Op, Topics};
use crate::db::{EmbeddingStore, StoreError};
use crate::device::DeviceId;
use crate::{metrics, utils, vector};

/// gossip 消息落地的目标
pub trait ReplicaStore: Send + Sync + 'static {
    /// 保存一张人脸，key 已存在于同一用户下时不做任何操作
    fn put_face(&self, identity: &str, key: &str, image: &[u8], vector: &[f32])
    -> Result<(), StoreError>;

    /// 删除用户，返回删除的人脸数量
    fn drop_identity(&self, identity: &str) -> Result<usize, StoreError>;
}

impl ReplicaStore for EmbeddingStore {
    fn put_face(
        &self,
        identity: &str,
        key: &str,
        image: &[u8],
        vector: &[f32],
    ) -> Result<(), StoreError> {
        self.save(image, vector, Some(identity), Some(key)).map(|_| ())
    }

    fn drop_identity(&self, identity: &str) -> Result<usize, StoreError> {
        self.delete(identity)
    }
}

/// 处理一条入站消息的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// 自己发出的消息
    Echo,
    /// 无法解析
    Malformed,
    Done { op: Op, saved: usize, deleted: usize },
}

/// 接收其他设备的变更并应用到本机人脸库
///
/// 同一时间只应用一条消息，保证同一用户的变更按收到的顺序执行
pub struct GossipReplicator<S, F> {
    device: DeviceId,
    topics: Topics,
    store: Arc<S>,
    fetcher: F,
}

impl<S: ReplicaStore, F: BlobFetcher> GossipReplicator<S, F> {
    pub fn new(device: DeviceId, topics: Topics, store: Arc<S>, fetcher: F) -> Self {
        Self { device, topics, store, fetcher }
    }

    /// 逐条应用入站消息，直到发送端全部关闭
    pub async fn run(self, mut rx: mpsc::Receiver<Inbound>) {
        info!("gossip 同步已启动，设备 ID: {}", self.device);
        while let Some(inbound) = rx.recv().await {
            self.on_message(&inbound.topic, &inbound.payload).await;
        }
        info!("gossip 同步已停止");
    }

    pub async fn on_message(&self, topic: &str, payload: &[u8]) -> Applied {
        let envelope = match Envelope::decode(&self.topics, topic, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("忽略无法解析的消息 {topic}: {e}");
                metrics::inc_gossip("in", "unknown", "malformed");
                return Applied::Malformed;
            }
        };
        let op = envelope.message.op();
        if envelope.origin == self.device.as_str() {
            debug!("忽略自己发出的消息 {topic}");
            metrics::inc_gossip("in", op.as_str(), "echo");
            return Applied::Echo;
        }

        info!("应用来自 {} 的 {op} 消息", envelope.origin);
        let (saved, deleted) = match envelope.message {
            GossipMessage::Create { user_id, faces } => (self.create(&user_id, &faces).await, 0),
            GossipMessage::Move { src_user_id, dest_user_id, faces } => {
                let deleted = self.delete(&src_user_id).await;
                (self.create(&dest_user_id, &faces).await, deleted)
            }
            GossipMessage::Delete { user_id } => (0, self.delete(&user_id).await),
            GossipMessage::Sync { user_id, faces } => {
                let deleted = self.delete(&user_id).await;
                (self.create(&user_id, &faces).await, deleted)
            }
        };
        metrics::inc_gossip("in", op.as_str(), "applied");
        Applied::Done { op, saved, deleted }
    }

    async fn create(&self, identity: &str, faces: &[FaceRef]) -> usize {
        let mut saved = 0;
        for face in faces {
            match self.create_one(identity, face).await {
                Ok(()) => saved += 1,
                Err(e) => warn!("同步人脸 {identity}/{} 失败: {e:#}", face.face_key),
            }
        }
        saved
    }

    async fn create_one(&self, identity: &str, face: &FaceRef) -> Result<()> {
        let (image, vector) =
            tokio::try_join!(self.fetcher.fetch(&face.image), self.fetcher.fetch(&face.vector))?;
        let vector = vector::decode_npy(&vector).context("特征文件格式错误")?;

        let store = self.store.clone();
        let identity = identity.to_owned();
        let key = face.face_key.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            utils::imdecode(&image).context("图片格式错误")?;
            store.put_face(&identity, &key, &image, &vector)?;
            Ok(())
        })
        .await?
    }

    async fn delete(&self, identity: &str) -> usize {
        let store = self.store.clone();
        let name = identity.to_owned();
        let result = tokio::task::spawn_blocking(move || store.drop_identity(&name))
            .await
            .map_err(|e| anyhow!(e))
            .and_then(|r| r.map_err(Into::into));
        match result {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("删除用户 {identity} 失败: {e}");
                0
            }
        }
    }
}
