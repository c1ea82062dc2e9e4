use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use super::message::Topics;
use crate::config::GossipOptions;
use crate::device::DeviceId;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const CLIENT_CAPACITY: usize = 64;

/// 从总线收到的一条原始消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// 消息总线
///
/// `publish` 不等待发送完成，只负责把消息交给总线的发送队列
pub trait Bus: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// 基于 MQTT 的消息总线
pub struct MqttBus {
    client: AsyncClient,
}

/// 驱动 MQTT 连接，负责订阅和转发收到的消息
pub struct MqttDriver {
    client: AsyncClient,
    eventloop: EventLoop,
    filter: String,
}

impl MqttBus {
    /// 创建 MQTT 客户端，返回的 [`MqttDriver`] 需要在后台运行
    pub fn connect(opts: &GossipOptions, host: &str, device: &DeviceId) -> (Self, MqttDriver) {
        let mut mqtt = MqttOptions::new(format!("featuredb-{device}"), host, opts.mqtt_port);
        mqtt.set_keep_alive(KEEP_ALIVE);
        if let (Some(username), Some(password)) = (&opts.mqtt_username, &opts.mqtt_password) {
            mqtt.set_credentials(username, password);
        }
        let (client, eventloop) = AsyncClient::new(mqtt, CLIENT_CAPACITY);
        let filter = Topics::new(&opts.topic_base).filter();
        let driver = MqttDriver { client: client.clone(), eventloop, filter };
        (Self { client }, driver)
    }
}

impl Bus for MqttBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client.try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }
}

impl MqttDriver {
    /// 持续轮询连接，断线后自动重连
    ///
    /// 每次连接成功后重新订阅。入站队列已满时丢弃消息
    pub async fn run(mut self, tx: mpsc::Sender<Inbound>) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT 已连接，订阅 {}", self.filter);
                    if let Err(e) = self.client.try_subscribe(&self.filter, QoS::AtLeastOnce) {
                        error!("订阅 {} 失败: {e}", self.filter);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!("收到消息 {}", publish.topic);
                    let inbound = Inbound { topic: publish.topic, payload: publish.payload.to_vec() };
                    match tx.try_send(inbound) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(inbound)) => {
                            warn!("入站队列已满，丢弃消息 {}", inbound.topic);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            info!("入站队列已关闭，停止 MQTT 连接");
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT 连接错误: {e}");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}
