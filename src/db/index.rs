use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use ndarray::prelude::*;

use super::error::{Result, StoreError};

/// 内存中的一条记录
#[derive(Debug, Clone)]
pub struct Record {
    pub key: String,
    pub identity: Option<String>,
    pub vector: Arc<[f32]>,
}

/// 只读快照，`compare` 在不持有任何锁的情况下使用它
#[derive(Debug, Default)]
pub struct Snapshot {
    /// 每一行对应的 (key, identity)，顺序即插入顺序
    pub rows: Vec<(String, Option<String>)>,
    /// n 行 d 列的特征矩阵
    pub matrix: Array2<f32>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// 记录的 arena 加上 identity 到记录的多重映射
///
/// 记录以递增的 id 存放在 BTreeMap 中，因此遍历顺序即插入顺序。
/// 每次结构变更后都会重建快照
#[derive(Debug, Default)]
pub struct Index {
    next_id: u64,
    dim: Option<usize>,
    records: BTreeMap<u64, Record>,
    by_key: HashMap<String, u64>,
    by_identity: BTreeMap<Option<String>, BTreeSet<u64>>,
    snapshot: Arc<Snapshot>,
}

impl Index {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.clone()
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.by_key.get(key).and_then(|id| self.records.get(id))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// 某个用户（平铺结构下为 None）的记录数量
    pub fn count(&self, identity: Option<&str>) -> usize {
        self.by_identity.get(&identity.map(str::to_owned)).map_or(0, BTreeSet::len)
    }

    /// 某个用户的全部 key，按插入顺序
    pub fn keys_of(&self, identity: Option<&str>) -> Vec<String> {
        self.by_identity
            .get(&identity.map(str::to_owned))
            .map(|ids| ids.iter().map(|id| self.records[id].key.clone()).collect())
            .unwrap_or_default()
    }

    /// 所有用户及其 key
    pub fn identities(&self) -> BTreeMap<String, Vec<String>> {
        self.by_identity
            .iter()
            .filter_map(|(identity, ids)| {
                let identity = identity.clone()?;
                let keys = ids.iter().map(|id| self.records[id].key.clone()).collect();
                Some((identity, keys))
            })
            .collect()
    }

    /// 所有 key，按插入顺序
    pub fn keys(&self) -> Vec<String> {
        self.records.values().map(|r| r.key.clone()).collect()
    }

    /// 检查特征维度是否与库中已有特征一致
    pub fn check_dim(&self, vector: &[f32]) -> Result<()> {
        match self.dim {
            Some(expected) if expected != vector.len() => {
                Err(StoreError::DimensionMismatch { expected, actual: vector.len() })
            }
            _ if vector.is_empty() => Err(StoreError::DimensionMismatch { expected: 0, actual: 0 }),
            _ => Ok(()),
        }
    }

    /// 批量插入，只在最后重建一次快照
    pub fn extend(&mut self, records: impl IntoIterator<Item = Record>) -> Vec<Record> {
        let mut rejected = vec![];
        for record in records {
            if self.check_dim(&record.vector).is_err() || self.by_key.contains_key(&record.key) {
                rejected.push(record);
                continue;
            }
            self.insert_raw(record);
        }
        self.rebuild();
        rejected
    }

    pub fn insert(&mut self, record: Record) -> Result<()> {
        self.check_dim(&record.vector)?;
        self.insert_raw(record);
        self.rebuild();
        Ok(())
    }

    fn insert_raw(&mut self, record: Record) {
        let id = self.next_id;
        self.next_id += 1;
        self.dim.get_or_insert(record.vector.len());
        self.by_key.insert(record.key.clone(), id);
        self.by_identity.entry(record.identity.clone()).or_default().insert(id);
        self.records.insert(id, record);
    }

    pub fn remove(&mut self, key: &str) -> Option<Record> {
        let record = self.remove_raw(key)?;
        self.rebuild();
        Some(record)
    }

    /// 删除某个用户的全部记录
    pub fn remove_identity(&mut self, identity: &str) -> Vec<Record> {
        let Some(ids) = self.by_identity.remove(&Some(identity.to_owned())) else {
            return vec![];
        };
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.records.remove(&id) {
                self.by_key.remove(&record.key);
                removed.push(record);
            }
        }
        self.rebuild();
        removed
    }

    fn remove_raw(&mut self, key: &str) -> Option<Record> {
        let id = self.by_key.remove(key)?;
        let record = self.records.remove(&id)?;
        if let Some(ids) = self.by_identity.get_mut(&record.identity) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_identity.remove(&record.identity);
            }
        }
        Some(record)
    }

    /// 修改一条记录所属的用户，保留其插入顺序
    pub fn reassign(&mut self, key: &str, identity: Option<&str>) -> bool {
        if !self.reassign_raw(key, identity) {
            return false;
        }
        self.rebuild();
        true
    }

    /// 将一个用户的全部记录改到另一个用户名下
    pub fn reassign_identity(&mut self, from: &str, to: &str) -> usize {
        let keys = self.keys_of(Some(from));
        for key in &keys {
            self.reassign_raw(key, Some(to));
        }
        self.rebuild();
        keys.len()
    }

    fn reassign_raw(&mut self, key: &str, identity: Option<&str>) -> bool {
        let Some(&id) = self.by_key.get(key) else {
            return false;
        };
        let record = self.records.get_mut(&id).expect("index out of sync");
        let old = std::mem::replace(&mut record.identity, identity.map(str::to_owned));
        if let Some(ids) = self.by_identity.get_mut(&old) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_identity.remove(&old);
            }
        }
        self.by_identity.entry(identity.map(str::to_owned)).or_default().insert(id);
        true
    }

    fn rebuild(&mut self) {
        // 库清空后允许新的维度
        if self.records.is_empty() {
            self.dim = None;
        }
        let dim = self.dim.unwrap_or(0);
        let mut rows = Vec::with_capacity(self.records.len());
        let mut data = Vec::with_capacity(self.records.len() * dim);
        for record in self.records.values() {
            rows.push((record.key.clone(), record.identity.clone()));
            data.extend_from_slice(&record.vector);
        }
        let matrix = Array2::from_shape_vec((rows.len(), dim), data)
            .expect("all vectors share the same dimension");
        self.snapshot = Arc::new(Snapshot { rows, matrix });
    }
}
