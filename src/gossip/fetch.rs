use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::debug;

use crate::config::GossipOptions;

const BACKOFF: Duration = Duration::from_millis(500);

/// 下载其他设备上的图片和特征文件
pub trait BlobFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// 通过 HTTP 下载，失败后按线性退避重试
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: reqwest::Client,
    retries: u32,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, retries: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self { http, retries })
    }

    pub fn from_options(opts: &GossipOptions) -> Result<Self> {
        Self::new(Duration::from_secs(opts.fetch_timeout), opts.fetch_retries)
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            bail!("HTTP {}", resp.status());
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

impl BlobFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    debug!("下载 {url} 失败: {e}，第 {attempt} 次重试");
                    tokio::time::sleep(BACKOFF * attempt).await;
                }
                Err(e) => return Err(e.context(format!("下载 {url} 失败"))),
            }
        }
    }
}
