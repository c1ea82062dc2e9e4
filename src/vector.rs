use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor};
use std::path::Path;

use anyhow::{Result, anyhow};
use ndarray::prelude::*;
use ndarray_npy::{ReadNpyExt, WriteNpyExt};

/// 计算查询向量与矩阵中每一行的余弦相似度
///
/// 参数：
/// - query: 维度为 d 的查询向量
/// - matrix: n 行 d 列的特征矩阵，每一行为一个已保存的特征
///
/// 返回长度为 n 的相似度数组。范数为 0 的向量得到的相似度为 NaN，
/// 调用方应将 NaN 视为不匹配，见 [`best_match`]
pub fn cosine_similarity(query: ArrayView1<f32>, matrix: ArrayView2<f32>) -> Array1<f32> {
    let dots = matrix.dot(&query);
    let query_norm = norm(query);
    let norms = matrix.map_axis(Axis(1), norm);
    dots / (norms * query_norm)
}

#[inline(always)]
fn norm(v: ArrayView1<f32>) -> f32 {
    v.dot(&v).sqrt()
}

/// 返回相似度最高的下标和相似度，NaN 永远不会被选中
///
/// 相似度相同时取下标最小者，即最早插入的记录
pub fn best_match(similarities: ArrayView1<f32>) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &s) in similarities.iter().enumerate() {
        if s.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if s <= b => {}
            _ => best = Some((i, s)),
        }
    }
    best
}

/// 统计相似度严格大于阈值的数量，NaN 不计入
pub fn count_above(similarities: ArrayView1<f32>, threshold: f32) -> usize {
    similarities.iter().filter(|&&s| s > threshold).count()
}

/// 将特征向量编码为 npy 格式
pub fn encode_npy(vector: &[f32]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(vector.len() * 4 + 128);
    ArrayView1::from(vector).write_npy(&mut buf)?;
    Ok(buf)
}

/// 从 npy 格式解码特征向量，任意形状都会被展平
pub fn decode_npy(bytes: &[u8]) -> Result<Vec<f32>> {
    let array = ArrayD::<f32>::read_npy(Cursor::new(bytes))?;
    flatten(array)
}

/// 从文件中读取特征向量
pub fn read_vector(path: impl AsRef<Path>) -> Result<Vec<f32>> {
    let reader = BufReader::new(File::open(path)?);
    let array = ArrayD::<f32>::read_npy(reader)?;
    flatten(array)
}

/// 将特征向量写入文件
pub fn write_vector(path: impl AsRef<Path>, vector: &[f32]) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    ArrayView1::from(vector).write_npy(writer)?;
    Ok(())
}

fn flatten(array: ArrayD<f32>) -> Result<Vec<f32>> {
    if array.is_empty() {
        return Err(anyhow!("特征向量为空"));
    }
    Ok(array.iter().copied().collect())
}
