use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;
use rand::distr::{Alphanumeric, SampleString};

/// 能够编码为 JPEG 的图片
///
/// 已经编码好的字节直接借用，OpenCV 的 `Mat` 只在真正需要保存时才编码
pub trait Jpeg {
    fn to_jpeg(&self) -> Result<Cow<'_, [u8]>>;
}

impl Jpeg for [u8] {
    fn to_jpeg(&self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(self))
    }
}

impl Jpeg for Vec<u8> {
    fn to_jpeg(&self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(self.as_slice()))
    }
}

impl Jpeg for Mat {
    fn to_jpeg(&self) -> Result<Cow<'_, [u8]>> {
        imencode_jpeg(self).map(Cow::Owned)
    }
}

/// 以 100 质量编码 JPEG
pub fn imencode_jpeg(image: &Mat) -> Result<Vec<u8>> {
    let params = Vector::<i32>::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, 100]);
    let mut buf = Vector::<u8>::new();
    if !imgcodecs::imencode(".jpg", image, &mut buf, &params)? {
        return Err(anyhow!("JPEG 编码失败"));
    }
    Ok(buf.to_vec())
}

/// 解码图片，用于检查收到的字节是否为有效图片
pub fn imdecode(bytes: &[u8]) -> Result<Mat> {
    let buf = Vector::<u8>::from_slice(bytes);
    let img = imgcodecs::imdecode(&buf, imgcodecs::IMREAD_COLOR)?;
    if img.empty() {
        return Err(anyhow!("无法解码图片"));
    }
    Ok(img)
}

/// 生成由小写字母和数字组成的随机字符串
pub fn random_token(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::rng(), len).to_ascii_lowercase()
}

/// 当前的毫秒级时间戳
pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use opencv::core::{CV_8UC3, Scalar};

    use super::*;

    #[test]
    fn test_jpeg_roundtrip() {
        let img = Mat::new_rows_cols_with_default(16, 8, CV_8UC3, Scalar::all(127.)).unwrap();
        let bytes = img.to_jpeg().unwrap();
        assert_eq!(&bytes[..2], &[0xff, 0xd8]);
        let decoded = imdecode(&bytes).unwrap();
        assert_eq!((decoded.rows(), decoded.cols()), (16, 8));
        assert!(imdecode(b"definitely not a jpeg").is_err());
    }

    #[test]
    fn test_random_token() {
        let token = random_token(8);
        assert_eq!(token.len(), 8);
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
