use std::sync::Arc;

use anyhow::{Result, anyhow};
use log::{debug, warn};
use reqwest::Url;

use super::bus::Bus;
use super::message::{FaceRef, GossipMessage, Topics};
use crate::db::blob::{IMAGE_EXT, VECTOR_EXT};
use crate::db::BlobStore;
use crate::device::DeviceId;
use crate::metrics;

/// 将本机人脸库的变更广播给其他设备
///
/// 消息中只携带文件 URL，对方收到后从本机的静态文件服务下载
pub struct Publisher {
    device: DeviceId,
    topics: Topics,
    public_url: Url,
    blobs: BlobStore,
    bus: Arc<dyn Bus>,
}

impl Publisher {
    /// # Arguments
    ///
    /// * `public_url` - 人脸库静态文件的根 URL，如 `http://192.168.1.10:8030/static/faces/`
    pub fn new(
        device: DeviceId,
        topics: Topics,
        public_url: Url,
        blobs: BlobStore,
        bus: Arc<dyn Bus>,
    ) -> Result<Self> {
        if public_url.cannot_be_a_base() {
            return Err(anyhow!("无效的静态文件地址: {public_url}"));
        }
        Ok(Self { device, topics, public_url, blobs, bus })
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// 新增的人脸
    pub fn create(&self, identity: &str, keys: &[String]) {
        self.publish(GossipMessage::Create {
            user_id: identity.to_owned(),
            faces: self.face_refs(identity, keys),
        });
    }

    /// 用户改名，keys 为改名后 `dest` 下的全部人脸
    pub fn moved(&self, src: &str, dest: &str, keys: &[String]) {
        self.publish(GossipMessage::Move {
            src_user_id: src.to_owned(),
            dest_user_id: dest.to_owned(),
            faces: self.face_refs(dest, keys),
        });
    }

    pub fn delete(&self, identity: &str) {
        self.publish(GossipMessage::Delete { user_id: identity.to_owned() });
    }

    /// 用户的全量状态，keys 为空时对方会删除该用户
    pub fn sync(&self, identity: &str, keys: &[String]) {
        self.publish(GossipMessage::Sync {
            user_id: identity.to_owned(),
            faces: self.face_refs(identity, keys),
        });
    }

    pub fn face_ref(&self, identity: &str, key: &str) -> FaceRef {
        FaceRef {
            face_key: key.to_owned(),
            image: self.url(identity, key, IMAGE_EXT),
            vector: self.url(identity, key, VECTOR_EXT),
        }
    }

    fn face_refs(&self, identity: &str, keys: &[String]) -> Vec<FaceRef> {
        keys.iter().map(|key| self.face_ref(identity, key)).collect()
    }

    fn url(&self, identity: &str, key: &str, ext: &str) -> String {
        let mut url = self.public_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(self.blobs.relative_segments(Some(identity), key, ext));
        }
        url.into()
    }

    fn publish(&self, message: GossipMessage) {
        let op = message.op();
        let topic = self.topics.topic(self.device.as_str(), op);
        let result = message
            .to_payload(self.device.as_str())
            .and_then(|payload| self.bus.publish(&topic, payload));
        match result {
            Ok(()) => {
                debug!("发送 {topic}");
                metrics::inc_gossip("out", op.as_str(), "ok");
            }
            Err(e) => {
                warn!("发送 {topic} 失败: {e}");
                metrics::inc_gossip("out", op.as_str(), "error");
            }
        }
    }
}
