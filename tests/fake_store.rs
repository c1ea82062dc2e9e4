mod common;

use featuredb::config::FakeDbOptions;
use featuredb::db::FakeStore;
use rstest::*;
use tempfile::TempDir;

use common::unit;

const IMAGE: &[u8] = b"crop";

#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

/// n 个两两余弦相似度为 `cos` 的单位向量
fn pairwise(n: usize, cos: f32) -> Vec<Vec<f32>> {
    let (shared, own) = (cos.sqrt(), (1. - cos).sqrt());
    (1..=n)
        .map(|i| {
            let mut v = vec![0.; n + 1];
            v[0] = shared;
            v[i] = own;
            v
        })
        .collect()
}

#[rstest]
fn test_empty(temp_dir: TempDir) {
    let store = FakeStore::open(temp_dir.path(), &FakeDbOptions::default());
    assert_eq!(store.compare(&unit(4, 0)), (false, 0));
    assert!(store.predict(IMAGE, &unit(4, 0), false));
    assert!(store.is_empty());
}

#[rstest]
fn test_burst_limit(temp_dir: TempDir) {
    let opts = FakeDbOptions {
        fake_sim_threshold: 0.9,
        fake_insert_threshold: 0.8,
        fake_burst_limit: 10,
        fake_db_size: 1000,
    };
    let store = FakeStore::open(temp_dir.path(), &opts);

    let candidates = pairwise(16, 0.85);
    let results = candidates.iter().map(|v| store.predict(IMAGE, v, true)).collect::<Vec<_>>();

    assert_eq!(store.len(), 10);
    assert!(results[0], "first candidate has nothing similar yet");
    assert!(results[1..].iter().all(|&is_person| !is_person));

    // 匹配阈值比录入阈值更严格
    assert_eq!(store.compare(&candidates[15]), (false, 0));
}

#[rstest]
fn test_capacity(temp_dir: TempDir) {
    let opts = FakeDbOptions { fake_db_size: 3, ..FakeDbOptions::default() };
    let store = FakeStore::open(temp_dir.path(), &opts);
    for i in 0..5 {
        store.predict(IMAGE, &unit(8, i), true);
    }
    assert_eq!(store.len(), 3);
}

#[rstest]
fn test_keys_are_increasing(temp_dir: TempDir) {
    let store = FakeStore::open(temp_dir.path(), &FakeDbOptions::default());
    for i in 0..4 {
        store.predict(IMAGE, &unit(8, i), true);
    }
    let keys = store.keys().iter().map(|k| k.parse::<u64>().unwrap()).collect::<Vec<_>>();
    assert_eq!(keys.len(), 4);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert!(temp_dir.path().join(format!("{}.jpg", keys[0])).exists());

    // 重新打开后继续递增
    drop(store);
    let store = FakeStore::open(temp_dir.path(), &FakeDbOptions::default());
    store.predict(IMAGE, &unit(8, 5), true);
    let last = store.keys().last().unwrap().parse::<u64>().unwrap();
    assert!(last > keys[3]);
}

#[rstest]
fn test_delete(temp_dir: TempDir) {
    let store = FakeStore::open(temp_dir.path(), &FakeDbOptions::default());
    store.predict(IMAGE, &unit(8, 0), true);
    let key = store.keys()[0].clone();

    assert!(!store.predict(IMAGE, &unit(8, 0), false));
    assert!(store.delete(&key).unwrap());
    assert!(!store.delete(&key).unwrap());
    assert!(store.predict(IMAGE, &unit(8, 0), false));
    assert!(!temp_dir.path().join(format!("{key}.vec")).exists());
}
