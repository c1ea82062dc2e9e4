mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use featuredb::config::{FaceDbOptions, FakeDbOptions};
use featuredb::db::{EmbeddingStore, FakeStore, Prediction, StoreError};
use featuredb::device::DeviceId;
use featuredb::gossip::*;
use featuredb::node::FaceNode;
use featuredb::{server, vector};
use reqwest::Url;
use rstest::*;
use tempfile::TempDir;
use tokio::net::TcpListener;

use common::{MapFetcher, MemoryBus, jpeg, unit};

const BASE: &str = "aibox/gossip";
const DIM: usize = 8;

#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

fn device(id: &str) -> DeviceId {
    DeviceId::new(id).unwrap()
}

fn open(dir: &TempDir) -> Arc<EmbeddingStore> {
    Arc::new(EmbeddingStore::open(dir.path(), &FaceDbOptions::default()))
}

/// 记录调用次数，不做任何修改
#[derive(Default)]
struct SpyStore {
    calls: AtomicUsize,
}

impl ReplicaStore for SpyStore {
    fn put_face(&self, _: &str, _: &str, _: &[u8], _: &[f32]) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn drop_identity(&self, _: &str) -> Result<usize, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}

fn face_ref(peer: &str, identity: &str, key: &str) -> FaceRef {
    FaceRef {
        face_key: key.into(),
        image: format!("http://{peer}/static/faces/{identity}/{key}.jpg"),
        vector: format!("http://{peer}/static/faces/{identity}/{key}.vec"),
    }
}

/// 在 fetcher 中准备一张人脸的文件
fn serve_face(fetcher: &mut MapFetcher, face: &FaceRef, v: &[f32]) {
    fetcher.insert(&face.image, jpeg());
    fetcher.insert(&face.vector, vector::encode_npy(v).unwrap());
}

#[rstest]
#[tokio::test]
async fn test_ignore_own_messages() {
    let spy = Arc::new(SpyStore::default());
    let topics = Topics::new(BASE);
    let replicator =
        GossipReplicator::new(device("dev1"), topics.clone(), spy.clone(), MapFetcher::default());

    let messages = [
        GossipMessage::Create { user_id: "alice".into(), faces: vec![face_ref("p", "alice", "k")] },
        GossipMessage::Delete { user_id: "alice".into() },
        GossipMessage::Sync { user_id: "alice".into(), faces: vec![] },
    ];
    for msg in messages {
        // 即使 topic 中是其他设备，也以消息体中的设备 ID 为准
        let topic = topics.topic("dev9", msg.op());
        let applied = replicator.on_message(&topic, &msg.to_payload("dev1").unwrap()).await;
        assert_eq!(applied, Applied::Echo);
    }

    let applied = replicator
        .on_message(&topics.topic("dev1", Op::Delete), br#"{"user_id":"alice"}"#)
        .await;
    assert_eq!(applied, Applied::Echo);

    assert_eq!(spy.calls.load(Ordering::SeqCst), 0);
}

#[rstest]
#[tokio::test]
async fn test_remote_create(temp_dir: TempDir) {
    let store = open(&temp_dir);
    let (f1, f2) = (face_ref("peer", "alice", "k1"), face_ref("peer", "alice", "k2"));
    let mut fetcher = MapFetcher::default();
    serve_face(&mut fetcher, &f1, &unit(DIM, 1));
    serve_face(&mut fetcher, &f2, &unit(DIM, 2));

    let topics = Topics::new(BASE);
    let replicator = GossipReplicator::new(device("dev1"), topics.clone(), store.clone(), fetcher);
    let msg = GossipMessage::Create { user_id: "alice".into(), faces: vec![f1, f2] };
    let payload = msg.to_payload("dev2").unwrap();
    let topic = topics.topic("dev2", Op::Create);

    let applied = replicator.on_message(&topic, &payload).await;
    assert_eq!(applied, Applied::Done { op: Op::Create, saved: 2, deleted: 0 });
    assert_eq!(store.len(), 2);
    for i in [1, 2] {
        assert_eq!(store.predict(&jpeg(), &unit(DIM, i), false), Prediction::Known("alice".into()));
    }

    // 重复的消息不会重复保存
    replicator.on_message(&topic, &payload).await;
    assert_eq!(store.len(), 2);
    assert_eq!(store.faces(Some("alice")), vec!["k1".to_owned(), "k2".to_owned()]);
}

#[rstest]
#[tokio::test]
async fn test_bad_messages(temp_dir: TempDir) {
    let store = open(&temp_dir);
    let face = face_ref("peer", "alice", "k1");
    let mut fetcher = MapFetcher::default();
    // 只有图片，没有特征
    fetcher.insert(&face.image, jpeg());
    // 图片无法解码
    let broken = face_ref("peer", "alice", "k2");
    fetcher.insert(&broken.image, b"garbage".to_vec());
    fetcher.insert(&broken.vector, vector::encode_npy(&unit(DIM, 0)).unwrap());

    let topics = Topics::new(BASE);
    let replicator = GossipReplicator::new(device("dev1"), topics.clone(), store.clone(), fetcher);

    let applied = replicator.on_message(&topics.topic("dev2", Op::Create), b"not json").await;
    assert_eq!(applied, Applied::Malformed);
    let applied = replicator.on_message("aibox/gossip/faces/dev2/rename", b"{}").await;
    assert_eq!(applied, Applied::Malformed);

    let msg = GossipMessage::Create { user_id: "alice".into(), faces: vec![face, broken] };
    let applied = replicator
        .on_message(&topics.topic("dev2", Op::Create), &msg.to_payload("dev2").unwrap())
        .await;
    assert_eq!(applied, Applied::Done { op: Op::Create, saved: 0, deleted: 0 });
    assert!(store.is_empty());
}

#[rstest]
#[tokio::test]
async fn test_remote_delete_and_sync(temp_dir: TempDir) {
    let store = open(&temp_dir);
    store.save(&jpeg(), &unit(DIM, 0), Some("alice"), Some("old")).unwrap();
    store.save(&jpeg(), &unit(DIM, 1), Some("bob"), Some("b1")).unwrap();

    let new = face_ref("peer", "alice", "new");
    let mut fetcher = MapFetcher::default();
    serve_face(&mut fetcher, &new, &unit(DIM, 2));

    let topics = Topics::new(BASE);
    let replicator = GossipReplicator::new(device("dev1"), topics.clone(), store.clone(), fetcher);

    let msg = GossipMessage::Sync { user_id: "alice".into(), faces: vec![new] };
    let applied = replicator
        .on_message(&topics.topic("dev2", Op::Sync), &msg.to_payload("dev2").unwrap())
        .await;
    assert_eq!(applied, Applied::Done { op: Op::Sync, saved: 1, deleted: 1 });
    assert_eq!(store.faces(Some("alice")), vec!["new".to_owned()]);

    let msg = GossipMessage::Delete { user_id: "bob".into() };
    let payload = msg.to_payload("dev2").unwrap();
    for expected in [1, 0] {
        let applied = replicator.on_message(&topics.topic("dev2", Op::Delete), &payload).await;
        assert_eq!(applied, Applied::Done { op: Op::Delete, saved: 0, deleted: expected });
    }
    assert_eq!(store.identities().keys().collect::<Vec<_>>(), vec!["alice"]);
}

/// 每次请求都返回 500 或者一直不响应，返回 URL 和请求次数
async fn serve_failing(hang: bool) -> (String, Arc<AtomicUsize>) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let app = axum::Router::new().route(
        "/blob",
        axum::routing::get(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if hang {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/blob", listener.local_addr().unwrap());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (url, attempts)
}

#[rstest]
#[case::server_error(false, 2)]
#[case::no_response(true, 1)]
#[tokio::test]
async fn test_fetch_gives_up(#[case] hang: bool, #[case] retries: u32) {
    let timeout = Duration::from_millis(300);
    let (url, attempts) = serve_failing(hang).await;
    let fetcher = HttpFetcher::new(timeout, retries).unwrap();

    let start = Instant::now();
    assert!(fetcher.fetch(&url).await.is_err());
    let elapsed = start.elapsed();

    assert_eq!(attempts.load(Ordering::SeqCst), retries as usize + 1);
    // 第 n 次重试前等待 n * 500ms
    let backoff = (1..=retries).map(|n| Duration::from_millis(500) * n).sum::<Duration>();
    assert!(elapsed >= backoff, "{elapsed:?}");
    assert!(elapsed < timeout * (retries + 1) + backoff + Duration::from_secs(2), "{elapsed:?}");
}

/// 把 bus 上的消息交给 replicator 处理
async fn deliver<F: BlobFetcher>(
    bus: &MemoryBus,
    replicator: &GossipReplicator<EmbeddingStore, F>,
    expected: usize,
) {
    let sent = bus.take();
    assert_eq!(sent.len(), expected);
    for inbound in sent {
        let applied = replicator.on_message(&inbound.topic, &inbound.payload).await;
        assert!(matches!(applied, Applied::Done { .. }), "{applied:?}");
    }
}

/// 两个节点通过真实的 HTTP 静态文件服务同步
#[tokio::test(flavor = "multi_thread")]
async fn test_two_nodes_converge() {
    let (dir_a, fake_dir, dir_b) =
        (TempDir::new().unwrap(), TempDir::new().unwrap(), TempDir::new().unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let topics = Topics::new(BASE);

    let store_a = open(&dir_a);
    let bus = Arc::new(MemoryBus::default());
    let publisher = Publisher::new(
        device("dev-a"),
        topics.clone(),
        Url::parse(&format!("http://{addr}/static/faces/")).unwrap(),
        store_a.blobs().clone(),
        bus.clone(),
    )
    .unwrap();
    let node_a = Arc::new(FaceNode::new(store_a, Some(publisher)));
    let fake = Arc::new(FakeStore::open(fake_dir.path(), &FakeDbOptions::default()));
    let app = server::create_app(server::AppState::new(node_a.clone(), fake));
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let store_b = open(&dir_b);
    let fetcher = HttpFetcher::new(Duration::from_secs(5), 0).unwrap();
    let replicator = GossipReplicator::new(device("dev-b"), topics, store_b.clone(), fetcher);

    // 每一步之后立即同步，保证对方能下载到文件
    let k1 = node_a.enroll("alice", &jpeg(), &unit(DIM, 0)).unwrap().key;
    let k2 = node_a.enroll("alice", &jpeg(), &unit(DIM, 1)).unwrap().key;
    deliver(&bus, &replicator, 2).await;
    assert_eq!(store_b.identities(), node_a.users());
    assert_eq!(store_b.compare(&unit(DIM, 1)).unwrap().key, k2);

    assert_eq!(node_a.rename("bob", "alice").unwrap(), 2);
    deliver(&bus, &replicator, 1).await;
    assert_eq!(store_b.identities(), node_a.users());

    assert!(node_a.delete_face("bob", &k1).unwrap());
    deliver(&bus, &replicator, 1).await;
    assert_eq!(store_b.identities(), node_a.users());

    assert!(node_a.move_face(&k2, "carol").unwrap());
    deliver(&bus, &replicator, 2).await;
    assert_eq!(store_b.identities(), node_a.users());
    assert_eq!(store_b.identity_of(&k2), Some(Some("carol".into())));

    assert_eq!(node_a.delete_user("carol").unwrap(), 1);
    deliver(&bus, &replicator, 1).await;
    assert!(store_b.is_empty());

    // 没有生效的修改不会广播
    assert!(node_a.rename("dave", "nobody").is_ok_and(|n| n == 0));
    assert!(!node_a.move_face("missing", "dave").unwrap());
    assert!(bus.take().is_empty());
}
