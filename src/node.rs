use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use crate::db::{EmbeddingStore, Prediction, Result, Saved};
use crate::gossip::Publisher;
use crate::utils::Jpeg;

/// 人脸库节点
///
/// 对人脸库的每次成功修改都会通过 gossip 广播给其他设备。
/// 未配置 gossip 时只修改本机
pub struct FaceNode {
    store: Arc<EmbeddingStore>,
    publisher: Option<Publisher>,
    recording: AtomicBool,
}

impl FaceNode {
    pub fn new(store: Arc<EmbeddingStore>, publisher: Option<Publisher>) -> Self {
        Self { store, publisher, recording: AtomicBool::new(false) }
    }

    pub fn store(&self) -> &Arc<EmbeddingStore> {
        &self.store
    }

    pub fn publisher(&self) -> Option<&Publisher> {
        self.publisher.as_ref()
    }

    /// 是否自动录入陌生人
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub fn set_recording(&self, recording: bool) {
        info!("自动录入陌生人: {recording}");
        self.recording.store(recording, Ordering::Relaxed);
    }

    /// 识别人脸，开启自动录入时未匹配的人脸会保存为新用户
    pub fn predict<I: Jpeg + ?Sized>(&self, image: &I, vector: &[f32]) -> Prediction {
        let prediction = self.store.predict(image, vector, self.is_recording());
        if let Prediction::Enrolled(identity) = &prediction {
            let keys = self.store.faces(Some(identity.as_str()));
            self.publish(|p| p.create(identity, &keys));
        }
        prediction
    }

    /// 为指定用户添加一张人脸
    pub fn enroll(&self, identity: &str, image: &[u8], vector: &[f32]) -> Result<Saved> {
        let saved = self.store.save(image, vector, Some(identity), None)?;
        if saved.created {
            self.publish(|p| p.create(identity, std::slice::from_ref(&saved.key)));
        }
        Ok(saved)
    }

    /// 将 `old` 用户改名为 `new`
    pub fn rename(&self, new: &str, old: &str) -> Result<usize> {
        let moved = self.store.rename(new, old)?;
        if moved > 0 {
            let keys = self.store.faces(Some(new));
            self.publish(|p| p.moved(old, new, &keys));
        }
        Ok(moved)
    }

    /// 将一张人脸移动到另一个用户名下
    pub fn move_face(&self, key: &str, dest: &str) -> Result<bool> {
        let Some(src) = self.store.move_record(key, dest)? else {
            return Ok(false);
        };
        if src != dest {
            let remaining = self.store.faces(Some(src.as_str()));
            self.publish(|p| {
                p.sync(&src, &remaining);
                p.create(dest, &[key.to_owned()]);
            });
        }
        Ok(true)
    }

    /// 删除用户及其全部人脸
    pub fn delete_user(&self, identity: &str) -> Result<usize> {
        let deleted = self.store.delete(identity)?;
        if deleted > 0 {
            self.publish(|p| p.delete(identity));
        }
        Ok(deleted)
    }

    /// 删除用户的一张人脸
    pub fn delete_face(&self, identity: &str, key: &str) -> Result<bool> {
        let deleted = self.store.delete_record(Some(identity), key)?;
        if deleted {
            let remaining = self.store.faces(Some(identity));
            self.publish(|p| p.sync(identity, &remaining));
        }
        Ok(deleted)
    }

    /// 广播所有用户的全量状态，返回用户数量
    pub fn sync_all(&self) -> usize {
        let users = self.store.identities();
        self.publish(|p| {
            for (identity, keys) in &users {
                p.sync(identity, keys);
            }
        });
        users.len()
    }

    pub fn users(&self) -> BTreeMap<String, Vec<String>> {
        self.store.identities()
    }

    fn publish(&self, f: impl FnOnce(&Publisher)) {
        match &self.publisher {
            Some(publisher) => f(publisher),
            None => debug!("gossip 未启用，跳过广播"),
        }
    }
}
