use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{info, warn};

use super::blob::Layout;
use super::error::{Result, StoreError};
use super::store::EmbeddingStore;
use crate::config::FakeDbOptions;
use crate::utils::{self, Jpeg};
use crate::{metrics, vector};

/// 误报库
///
/// 保存曾被误检为人的图片特征，用于抑制重复报警。与人脸库不同，
/// 误报库没有用户概念，采用准入控制：达到容量上限后拒绝写入，从不淘汰旧数据
pub struct FakeStore {
    store: EmbeddingStore,
    opts: FakeDbOptions,
    last_key: AtomicU64,
}

impl FakeStore {
    pub fn open(root: impl Into<PathBuf>, opts: &FakeDbOptions) -> Self {
        let store = EmbeddingStore::new(
            "fake",
            root,
            Layout::Flat,
            opts.fake_sim_threshold,
            opts.fake_db_size,
        );
        store.load();
        let last_key = store.keys().iter().filter_map(|k| k.parse().ok()).max().unwrap_or(0);
        Self { store, opts: opts.clone(), last_key: AtomicU64::new(last_key) }
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// 所有记录的 key，按时间先后
    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        self.store.delete_record(None, key)
    }

    /// 返回是否匹配，以及相似度超过匹配阈值的记录数量
    pub fn compare(&self, vector: &[f32]) -> (bool, usize) {
        let count = self.count_above(vector, self.store.threshold());
        (count > 0, count)
    }

    /// 判断检测结果是否为真实的人，返回 false 表示命中了已知误报
    ///
    /// `save` 为 true 时使用更宽松的录入阈值：既决定返回结果，也用于统计相似记录数量。
    /// 相似记录数量达到 `fake_burst_limit` 时拒绝录入，即使没有任何一条记录超过匹配阈值
    pub fn predict<I: Jpeg + ?Sized>(&self, image: &I, vector: &[f32], save: bool) -> bool {
        let threshold =
            if save { self.opts.fake_insert_threshold } else { self.store.threshold() };
        let count = self.count_above(vector, threshold);
        if save {
            self.admit(image, vector, count);
        }
        count == 0
    }

    fn count_above(&self, vector: &[f32], threshold: f32) -> usize {
        let start = Instant::now();
        let sims = self.store.similarities(vector);
        let count = vector::count_above(sims.values.view(), threshold);
        metrics::inc_compare(self.store.name(), count > 0, start.elapsed().as_secs_f32());
        count
    }

    fn admit<I: Jpeg + ?Sized>(&self, image: &I, vector: &[f32], count: usize) {
        if count >= self.opts.fake_burst_limit {
            warn!("已有 {count} 条相似误报，达到上限 {}，放弃录入", self.opts.fake_burst_limit);
            metrics::inc_save(self.store.name(), "burst");
            return;
        }
        if self.store.len() >= self.opts.fake_db_size {
            warn!("误报库已满 ({} 条)，放弃录入", self.opts.fake_db_size);
            metrics::inc_save(self.store.name(), "capacity");
            return;
        }
        let image = match image.to_jpeg() {
            Ok(image) => image,
            Err(e) => {
                warn!("图片编码失败: {e}");
                return;
            }
        };
        let key = self.next_key().to_string();
        match self.store.save(&image, vector, None, Some(&key)) {
            Ok(_) => info!("录入误报 {key}"),
            Err(StoreError::CapacityExceeded { .. }) => {}
            Err(e) => warn!("录入误报失败: {e}"),
        }
    }

    /// 毫秒时间戳，保证严格递增
    fn next_key(&self) -> u64 {
        let now = utils::now_millis();
        let prev = self
            .last_key
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }
}
