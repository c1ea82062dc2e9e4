#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use featuredb::gossip::{BlobFetcher, Bus, Inbound};
use opencv::core::{CV_8UC3, Mat, Scalar};
use opencv::prelude::*;

/// 第 i 个单位向量
pub fn unit(dim: usize, i: usize) -> Vec<f32> {
    let mut v = vec![0.; dim];
    v[i] = 1.;
    v
}

/// 与 e0 的余弦相似度为 `cos` 的单位向量，位于 e0 与 e_i 构成的平面上
pub fn with_cos(dim: usize, i: usize, cos: f32) -> Vec<f32> {
    let mut v = vec![0.; dim];
    v[0] = cos;
    v[i] = (1. - cos * cos).sqrt();
    v
}

/// 一张真实的 JPEG 图片
pub fn jpeg() -> Vec<u8> {
    let img = Mat::new_rows_cols_with_default(16, 16, CV_8UC3, Scalar::all(100.)).unwrap();
    featuredb::utils::imencode_jpeg(&img).unwrap()
}

/// 记录所有发出的消息
#[derive(Default)]
pub struct MemoryBus {
    sent: Mutex<Vec<Inbound>>,
}

impl MemoryBus {
    pub fn take(&self) -> Vec<Inbound> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl Bus for MemoryBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.sent.lock().unwrap().push(Inbound { topic: topic.to_owned(), payload });
        Ok(())
    }
}

/// 从内存中返回文件内容
#[derive(Default)]
pub struct MapFetcher {
    files: HashMap<String, Vec<u8>>,
}

impl MapFetcher {
    pub fn insert(&mut self, url: impl Into<String>, bytes: Vec<u8>) {
        self.files.insert(url.into(), bytes);
    }
}

impl BlobFetcher for MapFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.files.get(url).cloned().ok_or_else(|| anyhow!("404 {url}"))
    }
}
