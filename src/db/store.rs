use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::prelude::*;

use super::blob::{BlobStore, Layout, validate_name};
use super::error::{Result, StoreError};
use super::index::{Index, Record, Snapshot};
use crate::config::FaceDbOptions;
use crate::utils::{self, Jpeg};
use crate::{metrics, vector};

/// 未识别时返回的标签
pub const UNKNOWN: &str = "UNKNOWN";
/// 自动创建、等待人工标注的用户名前缀
pub const UNKNOWN_PREFIX: &str = "UNKNOWN_";

const KEY_LEN: usize = 8;

/// 一次成功的比对
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub key: String,
    pub identity: Option<String>,
    pub similarity: f32,
}

/// `predict` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prediction {
    /// 与库中已有用户匹配
    Known(String),
    /// 未匹配，已保存为新的 `UNKNOWN_<token>` 用户
    Enrolled(String),
    /// 未匹配且未保存
    Unknown,
}

impl Prediction {
    pub fn label(&self) -> &str {
        match self {
            Self::Known(identity) | Self::Enrolled(identity) => identity,
            Self::Unknown => UNKNOWN,
        }
    }
}

/// `save` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Saved {
    pub key: String,
    pub identity: Option<String>,
    /// 为 false 时表示 key 已存在，本次保存没有写入新数据
    pub created: bool,
}

/// 查询向量与快照中每条记录的相似度
pub struct Similarities {
    pub snapshot: Arc<Snapshot>,
    pub values: Array1<f32>,
}

/// 特征库
///
/// 启动时从磁盘扫描重建索引，之后所有变更同时作用于内存和磁盘。
/// 所有写操作通过 `writer` 串行执行，文件读写只在持有 `writer` 时进行；
/// 索引锁只在替换内存结构时短暂持有，`compare` 只读取快照
pub struct EmbeddingStore {
    name: &'static str,
    blobs: BlobStore,
    threshold: AtomicU32,
    capacity: usize,
    index: RwLock<Index>,
    writer: Mutex<()>,
}

impl EmbeddingStore {
    /// 创建一个空的特征库，需要调用 [`load`](Self::load) 读取磁盘上的数据
    ///
    /// # Arguments
    ///
    /// * `name` - 特征库名称，用于日志和指标
    /// * `root` - 根目录
    /// * `layout` - 目录结构
    /// * `threshold` - 匹配阈值
    /// * `capacity` - 容量上限，按用户目录结构时为每个用户的上限，平铺结构时为总上限
    pub fn new(
        name: &'static str,
        root: impl Into<PathBuf>,
        layout: Layout,
        threshold: f32,
        capacity: usize,
    ) -> Self {
        Self {
            name,
            blobs: BlobStore::new(root, layout),
            threshold: AtomicU32::new(threshold.to_bits()),
            capacity,
            index: RwLock::new(Index::default()),
            writer: Mutex::new(()),
        }
    }

    /// 打开按用户分目录的人脸库
    pub fn open(root: impl Into<PathBuf>, opts: &FaceDbOptions) -> Self {
        let store =
            Self::new("face", root, Layout::Identity, opts.sim_threshold, opts.user_faces_size);
        store.load();
        store
    }

    /// 扫描磁盘重建索引，返回加载的记录数量
    pub fn load(&self) -> usize {
        let _writer = self.lock_writer();
        info!("正在加载特征库: {}", self.blobs.root().display());

        let records = self.blobs.scan().into_iter().map(|blob| Record {
            key: blob.key,
            identity: blob.identity,
            vector: blob.vector.into(),
        });

        let mut index = Index::default();
        for record in index.extend(records) {
            warn!("跳过维度不一致或重复的记录: {}", record.key);
        }
        let total = index.len();
        *self.write() = index;

        info!("特征库 {} 加载完成，共 {} 条记录", self.name, total);
        metrics::set_store_size(self.name, total);
        total
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn root(&self) -> &Path {
        self.blobs.root()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn threshold(&self) -> f32 {
        f32::from_bits(self.threshold.load(Ordering::Relaxed))
    }

    pub fn set_threshold(&self, threshold: f32) {
        info!("特征库 {} 匹配阈值调整为 {threshold}", self.name);
        self.threshold.store(threshold.to_bits(), Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// 所有用户及其 key
    pub fn identities(&self) -> BTreeMap<String, Vec<String>> {
        self.read().identities()
    }

    /// 某个用户的全部 key，平铺结构下传入 None
    pub fn faces(&self, identity: Option<&str>) -> Vec<String> {
        self.read().keys_of(identity)
    }

    /// 所有 key，按插入顺序
    pub fn keys(&self) -> Vec<String> {
        self.read().keys()
    }

    /// 查找 key 所属的用户
    pub fn identity_of(&self, key: &str) -> Option<Option<String>> {
        self.read().get(key).map(|r| r.identity.clone())
    }

    /// 计算查询向量与所有记录的相似度
    ///
    /// 库为空或维度不一致时返回空数组
    pub fn similarities(&self, vector: &[f32]) -> Similarities {
        let snapshot = self.read().snapshot();
        let values = if snapshot.is_empty() || snapshot.matrix.ncols() != vector.len() {
            if !snapshot.is_empty() {
                warn!(
                    "查询特征维度 {} 与特征库 {} 的维度 {} 不一致",
                    vector.len(),
                    self.name,
                    snapshot.matrix.ncols()
                );
            }
            Array1::zeros(0)
        } else {
            vector::cosine_similarity(ArrayView1::from(vector), snapshot.matrix.view())
        };
        Similarities { snapshot, values }
    }

    /// 在库中查找最相似的记录，相似度超过阈值时返回
    pub fn compare(&self, vector: &[f32]) -> Option<Match> {
        let start = Instant::now();
        let sims = self.similarities(vector);
        let threshold = self.threshold();
        let result = vector::best_match(sims.values.view()).and_then(|(i, similarity)| {
            debug!("最相似记录 {} 相似度 {similarity:.4}", sims.snapshot.rows[i].0);
            (similarity > threshold).then(|| {
                let (key, identity) = sims.snapshot.rows[i].clone();
                Match { key, identity, similarity }
            })
        });
        metrics::inc_compare(self.name, result.is_some(), start.elapsed().as_secs_f32());
        result
    }

    /// 识别一个特征
    ///
    /// 匹配时返回匹配到的用户；未匹配且 `save` 为 true 时保存为新的
    /// `UNKNOWN_<token>` 用户；否则返回 [`Prediction::Unknown`]
    pub fn predict<I: Jpeg + ?Sized>(&self, image: &I, vector: &[f32], save: bool) -> Prediction {
        if let Some(m) = self.compare(vector) {
            return Prediction::Known(m.identity.unwrap_or(m.key));
        }
        if !save {
            return Prediction::Unknown;
        }
        let image = match image.to_jpeg() {
            Ok(image) => image,
            Err(e) => {
                warn!("图片编码失败: {e}");
                return Prediction::Unknown;
            }
        };
        match self.save(&image, vector, None, None) {
            Ok(saved) => Prediction::Enrolled(saved.identity.unwrap_or(saved.key)),
            Err(StoreError::CapacityExceeded { .. }) => Prediction::Unknown,
            Err(e) => {
                warn!("保存特征失败: {e}");
                Prediction::Unknown
            }
        }
    }

    /// 保存一条记录
    ///
    /// 未指定用户时自动创建 `UNKNOWN_<token>` 用户，未指定 key 时随机生成。
    /// 指定的 key 已存在时不会重复写入：用户相同时直接返回，用户不同时移动该记录
    ///
    /// # Arguments
    ///
    /// * `image` - JPEG 图片
    /// * `vector` - 特征向量
    /// * `identity` - 用户名，平铺结构下忽略
    /// * `key` - 记录 key
    pub fn save(
        &self,
        image: &[u8],
        vector: &[f32],
        identity: Option<&str>,
        key: Option<&str>,
    ) -> Result<Saved> {
        if let Some(identity) = identity {
            validate_name(identity)?;
        }
        if let Some(key) = key {
            validate_name(key)?;
        }

        let _writer = self.lock_writer();

        let (identity, key) = {
            let index = self.read();
            index.check_dim(vector)?;

            let identity = match self.blobs.layout() {
                Layout::Identity => {
                    Some(identity.map(str::to_owned).unwrap_or_else(|| mint_identity(&index)))
                }
                Layout::Flat => None,
            };

            if let Some(existing) = key.and_then(|key| index.get(key)) {
                let saved =
                    Saved { key: existing.key.clone(), identity: identity.clone(), created: false };
                if existing.identity == identity {
                    debug!("记录 {} 已存在，跳过", existing.key);
                    return Ok(saved);
                }
                self.check_capacity(&index, identity.as_deref())?;
                let from = existing.identity.clone();
                drop(index);
                self.relocate_locked(&saved.key, from.as_deref(), identity.as_deref())?;
                return Ok(saved);
            }

            self.check_capacity(&index, identity.as_deref())?;
            let key = key.map(str::to_owned).unwrap_or_else(|| mint_key(&index));
            (identity, key)
        };

        if let Err(e) = self.blobs.write(identity.as_deref(), &key, image, vector) {
            metrics::inc_save(self.name, "error");
            return Err(e);
        }

        let total = {
            let mut index = self.write();
            index.insert(Record {
                key: key.clone(),
                identity: identity.clone(),
                vector: vector.into(),
            })?;
            index.len()
        };

        info!("保存记录 {key} 到 {}", self.blobs.dir(identity.as_deref()).display());
        metrics::inc_save(self.name, "saved");
        metrics::set_store_size(self.name, total);
        Ok(Saved { key, identity, created: true })
    }

    /// 删除一个用户的所有记录及其目录，返回删除的记录数量
    pub fn delete(&self, identity: &str) -> Result<usize> {
        validate_name(identity)?;
        let _writer = self.lock_writer();

        let (removed, total) = {
            let mut index = self.write();
            let removed = index.remove_identity(identity);
            (removed.len(), index.len())
        };
        if removed == 0 {
            warn!("用户 {identity} 不存在");
        } else {
            info!("删除用户 {identity}，共 {removed} 条记录");
        }
        self.blobs.remove_dir(identity)?;
        metrics::set_store_size(self.name, total);
        Ok(removed)
    }

    /// 删除一条记录，identity 不为 None 时要求记录属于该用户
    pub fn delete_record(&self, identity: Option<&str>, key: &str) -> Result<bool> {
        let _writer = self.lock_writer();

        let (record, total) = {
            let mut index = self.write();
            let belongs = index
                .get(key)
                .is_some_and(|r| identity.is_none() || r.identity.as_deref() == identity);
            let record = if belongs { index.remove(key) } else { None };
            (record, index.len())
        };
        let Some(record) = record else {
            warn!("记录 {key} 不存在");
            return Ok(false);
        };

        self.blobs.remove(record.identity.as_deref(), key)?;
        if let (Layout::Identity, Some(identity)) = (self.blobs.layout(), &record.identity) {
            self.blobs.remove_dir_if_empty(identity);
        }
        info!("删除记录 {key}");
        metrics::set_store_size(self.name, total);
        Ok(true)
    }

    /// 将一条记录移动到另一个用户名下，返回原来的用户
    ///
    /// key 不存在时不做任何操作并返回 None
    pub fn move_record(&self, key: &str, dest: &str) -> Result<Option<String>> {
        validate_name(dest)?;
        if self.blobs.layout() == Layout::Flat {
            warn!("特征库 {} 没有用户，无法移动记录", self.name);
            return Ok(None);
        }
        let _writer = self.lock_writer();

        let from = {
            let index = self.read();
            let Some(record) = index.get(key) else {
                warn!("记录 {key} 不存在");
                return Ok(None);
            };
            let from = record.identity.clone().unwrap_or_default();
            if from != dest {
                self.check_capacity(&index, Some(dest))?;
            }
            from
        };
        if from != dest {
            self.relocate_locked(key, Some(&from), Some(dest))?;
        }
        Ok(Some(from))
    }

    /// 将 `old` 的全部记录改到 `new` 名下，返回移动的记录数量
    ///
    /// `new` 已有记录时返回 [`StoreError::Conflict`]，不会合并两个用户
    pub fn rename(&self, new: &str, old: &str) -> Result<usize> {
        validate_name(new)?;
        validate_name(old)?;
        let _writer = self.lock_writer();

        {
            let index = self.read();
            if index.count(Some(new)) > 0 {
                return Err(StoreError::Conflict(new.to_owned()));
            }
            if index.count(Some(old)) == 0 {
                warn!("用户 {old} 不存在");
                return Ok(0);
            }
        }

        self.blobs.rename_dir(old, new)?;
        let moved = self.write().reassign_identity(old, new);
        info!("用户 {old} 重命名为 {new}，共 {moved} 条记录");
        Ok(moved)
    }

    /// 用户（平铺结构下为整个库）已满时返回 [`StoreError::CapacityExceeded`]
    fn check_capacity(&self, index: &Index, identity: Option<&str>) -> Result<()> {
        let size = index.count(identity);
        if size < self.capacity {
            return Ok(());
        }
        let scope = identity.map_or_else(|| self.name.to_owned(), str::to_owned);
        warn!("{scope} 已有 {size} 条记录，达到上限 {}，放弃保存", self.capacity);
        metrics::inc_save(self.name, "capacity");
        Err(StoreError::CapacityExceeded { scope, size, limit: self.capacity })
    }

    /// 需要已持有 writer
    fn relocate_locked(&self, key: &str, from: Option<&str>, to: Option<&str>) -> Result<()> {
        self.blobs.relocate(key, from, to)?;
        self.write().reassign(key, to);
        if let Some(from) = from {
            self.blobs.remove_dir_if_empty(from);
        }
        info!("记录 {key} 从 {from:?} 移动到 {to:?}");
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().expect("failed to acquire rw lock")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().expect("failed to acquire rw lock")
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().expect("failed to acquire writer lock")
    }
}

fn mint_identity(index: &Index) -> String {
    loop {
        let identity = format!("{UNKNOWN_PREFIX}{}", utils::random_token(KEY_LEN));
        if index.count(Some(&identity)) == 0 {
            return identity;
        }
    }
}

fn mint_key(index: &Index) -> String {
    loop {
        let key = utils::random_token(KEY_LEN);
        if !index.contains_key(&key) {
            return key;
        }
    }
}
