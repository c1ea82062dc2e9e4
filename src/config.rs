use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;

use crate::cli::*;

static DATA_DIR: LazyLock<DataDir> = LazyLock::new(|| {
    let proj_dirs = ProjectDirs::from("", "aibox", "featuredb").expect("failed to get project dir");
    DataDir { path: proj_dirs.data_dir().to_path_buf() }
});

fn default_data_dir() -> &'static str {
    DATA_DIR.path().to_str().unwrap()
}

#[derive(Parser, Debug, Clone)]
pub struct FaceDbOptions {
    /// 人脸匹配的相似度阈值，超过该值才认为是同一个人
    #[arg(long, value_name = "SIM", default_value_t = 0.9)]
    pub sim_threshold: f32,
    /// 每个用户最多保存的人脸数量
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub user_faces_size: usize,
}

impl Default for FaceDbOptions {
    fn default() -> Self {
        Self { sim_threshold: 0.9, user_faces_size: 10 }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct FakeDbOptions {
    /// 误报库匹配阈值，超过该值认为是已知误报
    #[arg(long, value_name = "SIM", default_value_t = 0.9)]
    pub fake_sim_threshold: f32,
    /// 误报库录入时使用的阈值，应当比匹配阈值更宽松
    #[arg(long, value_name = "SIM", default_value_t = 0.8)]
    pub fake_insert_threshold: f32,
    /// 录入时相似记录数量达到该值则拒绝录入，防止同一场景刷满误报库
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub fake_burst_limit: usize,
    /// 误报库容量上限，达到上限后不再录入
    #[arg(long, value_name = "N", default_value_t = 1000)]
    pub fake_db_size: usize,
}

impl Default for FakeDbOptions {
    fn default() -> Self {
        Self {
            fake_sim_threshold: 0.9,
            fake_insert_threshold: 0.8,
            fake_burst_limit: 10,
            fake_db_size: 1000,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct GossipOptions {
    /// MQTT 服务器地址，不填则不启用 gossip 同步
    #[arg(long, value_name = "HOST")]
    pub mqtt_host: Option<String>,
    /// MQTT 服务器端口
    #[arg(long, value_name = "PORT", default_value_t = 1883)]
    pub mqtt_port: u16,
    /// MQTT 用户名
    #[arg(long, value_name = "NAME", requires = "mqtt_password")]
    pub mqtt_username: Option<String>,
    /// MQTT 密码
    #[arg(long, value_name = "PASSWORD")]
    pub mqtt_password: Option<String>,
    /// gossip topic 前缀
    #[arg(long, value_name = "TOPIC", default_value = "aibox/gossip")]
    pub topic_base: String,
    /// 设备 ID，不填则使用网卡 MAC 地址
    #[arg(long, value_name = "ID")]
    pub device_id: Option<String>,
    /// 其他设备访问本机静态文件的地址，如 http://192.168.1.10:8030
    /// 不填则根据监听地址推断
    #[arg(long, value_name = "URL", verbatim_doc_comment)]
    pub public_url: Option<String>,
    /// 从其他设备下载图片和特征的超时时间，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub fetch_timeout: u64,
    /// 下载失败后的重试次数
    #[arg(long, value_name = "N", default_value_t = 2)]
    pub fetch_retries: u32,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "featuredb", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 特征库数据目录
    #[arg(short, long, default_value = default_data_dir())]
    pub data_dir: DataDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 启动节点：加载特征库、启动 gossip 同步和 HTTP 服务
    Server(ServerCommand),
    /// 列出特征库中的记录
    List(ListCommand),
    /// 使用特征文件在特征库中搜索
    Search(SearchCommand),
}

/// 选择操作哪个特征库
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// 人脸库
    Face,
    /// 误报库
    Fake,
}

#[derive(Debug, Clone)]
pub struct DataDir {
    path: PathBuf,
}

impl DataDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回人脸库的根目录
    pub fn faces(&self) -> PathBuf {
        self.path.join("face")
    }

    /// 返回误报库的根目录
    pub fn fake_persons(&self) -> PathBuf {
        self.path.join("fake_person")
    }
}

impl FromStr for DataDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}
