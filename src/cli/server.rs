use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{error, info, warn};
use prometheus::{BasicAuthentication, labels};
use reqwest::Url;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tokio::time::{Duration, sleep};

use crate::cli::SubCommandExtend;
use crate::config::{FaceDbOptions, FakeDbOptions, GossipOptions, Opts};
use crate::db::{EmbeddingStore, FakeStore};
use crate::device::DeviceId;
use crate::gossip::{
    GossipReplicator, HttpFetcher, INBOUND_QUEUE, MqttBus, Publisher, Topics,
};
use crate::node::FaceNode;
use crate::server;

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    #[command(flatten)]
    pub face: FaceDbOptions,
    #[command(flatten)]
    pub fake: FakeDbOptions,
    #[command(flatten)]
    pub gossip: GossipOptions,
    /// 监听地址
    #[arg(long, default_value = "127.0.0.1:8030")]
    pub addr: SocketAddr,
    /// 启动后立即开启陌生人自动录入
    #[arg(long)]
    pub record: bool,
    /// prometheus 主动推送地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 自定义 instance 标签值
    #[arg(long, value_name = "NAME")]
    pub prometheus_instance: Option<String>,
    /// prometheus 认证信息，格式为 username:password
    #[arg(long, value_name = "AUTH")]
    pub prometheus_auth: Option<String>,
}

impl ServerCommand {
    /// 其他设备下载人脸文件时使用的根 URL
    fn faces_url(&self) -> Result<Url> {
        let base = match &self.gossip.public_url {
            Some(url) => url.clone(),
            None if self.addr.ip().is_unspecified() || self.addr.ip().is_loopback() => {
                return Err(anyhow!("监听地址 {} 无法被其他设备访问，请指定 --public-url", self.addr));
            }
            None => format!("http://{}", self.addr),
        };
        let mut url = Url::parse(&base).with_context(|| format!("无效的地址: {base}"))?;
        if !url.path().ends_with('/') {
            url.set_path(&format!("{}/", url.path()));
        }
        Ok(url.join("static/faces/")?)
    }

    /// 连接 MQTT 并启动入站消息处理，返回出站广播使用的 [`Publisher`]
    fn start_gossip(&self, host: &str, store: &Arc<EmbeddingStore>) -> Result<Publisher> {
        let device = match &self.gossip.device_id {
            Some(id) => DeviceId::new(id.clone())?,
            None => DeviceId::detect()?,
        };
        let topics = Topics::new(&self.gossip.topic_base);
        let faces_url = self.faces_url()?;
        info!("gossip 设备 ID: {device}，人脸文件地址: {faces_url}");

        let (bus, driver) = MqttBus::connect(&self.gossip, host, &device);
        let fetcher = HttpFetcher::from_options(&self.gossip)?;
        let replicator =
            GossipReplicator::new(device.clone(), topics.clone(), store.clone(), fetcher);

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        tokio::spawn(driver.run(tx));
        tokio::spawn(replicator.run(rx));

        Publisher::new(device, topics, faces_url, store.blobs().clone(), Arc::new(bus))
    }

    fn start_prometheus_push(&self, url: String) -> Result<()> {
        let instance = self.prometheus_instance.clone().unwrap_or_else(|| self.addr.to_string());
        let auth = match &self.prometheus_auth {
            Some(s) => {
                let (username, password) =
                    s.split_once(':').ok_or_else(|| anyhow!("prometheus 认证信息格式错误"))?;
                Some((username.to_string(), password.to_string()))
            }
            None => None,
        };
        tokio::spawn(async move {
            loop {
                let metric_families = prometheus::gather();
                let url = url.clone();
                let instance = instance.clone();
                let auth = auth.clone();
                let r = spawn_blocking(move || {
                    prometheus::push_metrics(
                        "featuredb",
                        labels! {
                            "instance".to_string() => instance.clone(),
                        },
                        &url,
                        metric_families,
                        auth.map(|(username, password)| BasicAuthentication {
                            username,
                            password,
                        }),
                    )
                })
                .await;
                match r {
                    Ok(Err(e)) => error!("推送指标失败: {e}"),
                    Err(e) => error!("推送指标失败: {e}"),
                    Ok(Ok(())) => {}
                }
                sleep(Duration::from_secs(30)).await;
            }
        });
        Ok(())
    }
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let (dir, face_opts, fake_opts) =
            (opts.data_dir.clone(), self.face.clone(), self.fake.clone());
        let (face, fake) = spawn_blocking(move || {
            let face = EmbeddingStore::open(dir.faces(), &face_opts);
            let fake = FakeStore::open(dir.fake_persons(), &fake_opts);
            (Arc::new(face), Arc::new(fake))
        })
        .await?;

        let publisher = match &self.gossip.mqtt_host {
            Some(host) => Some(self.start_gossip(host, &face)?),
            None => {
                warn!("未指定 MQTT 服务器，gossip 同步已禁用");
                None
            }
        };

        let node = Arc::new(FaceNode::new(face, publisher));
        node.set_recording(self.record);

        // 创建应用状态
        let state = server::AppState::new(node, fake);

        // 创建应用
        let app = server::create_app(state);

        if let Some(url) = self.prometheus_push.clone() {
            self.start_prometheus_push(url)?;
        }

        // 启动服务器
        info!("服务器启动：http://{}", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
