//! 多设备之间的人脸库同步
//!
//! 每台设备把本机的变更发布到 MQTT，同时订阅其他设备的变更。
//! 消息只携带文件 URL，图片和特征由接收方通过 HTTP 下载

pub mod bus;
pub mod fetch;
pub mod message;
pub mod publisher;
pub mod replicator;

pub use bus::{Bus, Inbound, MqttBus, MqttDriver};
pub use fetch::{BlobFetcher, HttpFetcher};
pub use message::{Envelope, FaceRef, GossipMessage, Op, Topics};
pub use publisher::Publisher;
pub use replicator::{Applied, GossipReplicator, ReplicaStore};

/// 入站消息队列长度，队列满时丢弃新消息
pub const INBOUND_QUEUE: usize = 256;
