use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use rayon::prelude::*;
use walkdir::WalkDir;

use super::error::{Result, StoreError};
use crate::vector;

pub const IMAGE_EXT: &str = "jpg";
pub const VECTOR_EXT: &str = "vec";

/// 特征库在磁盘上的目录结构
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `<root>/<identity>/<key>.*`
    Identity,
    /// `<root>/<key>.*`
    Flat,
}

/// 启动时从磁盘扫描出的一条记录
#[derive(Debug)]
pub struct LoadedBlob {
    pub key: String,
    pub identity: Option<String>,
    pub vector: Vec<f32>,
}

/// 每条记录对应一张图片和一个特征文件
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    layout: Layout,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, layout: Layout) -> Self {
        Self { root: root.into(), layout }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// 返回记录所在目录，平铺结构下忽略 identity
    pub fn dir(&self, identity: Option<&str>) -> PathBuf {
        match (self.layout, identity) {
            (Layout::Identity, Some(identity)) => self.root.join(identity),
            _ => self.root.clone(),
        }
    }

    pub fn image_path(&self, identity: Option<&str>, key: &str) -> PathBuf {
        self.dir(identity).join(format!("{key}.{IMAGE_EXT}"))
    }

    pub fn vector_path(&self, identity: Option<&str>, key: &str) -> PathBuf {
        self.dir(identity).join(format!("{key}.{VECTOR_EXT}"))
    }

    /// 返回文件相对于根目录的路径片段，用于拼接静态文件 URL
    pub fn relative_segments(&self, identity: Option<&str>, key: &str, ext: &str) -> Vec<String> {
        let file = format!("{key}.{ext}");
        match (self.layout, identity) {
            (Layout::Identity, Some(identity)) => vec![identity.to_owned(), file],
            _ => vec![file],
        }
    }

    /// 写入图片和特征文件
    ///
    /// 特征写入失败时会删除已写入的图片，避免留下没有特征的孤立图片
    pub fn write(
        &self,
        identity: Option<&str>,
        key: &str,
        image: &[u8],
        vector: &[f32],
    ) -> Result<()> {
        fs::create_dir_all(self.dir(identity))?;
        let image_path = self.image_path(identity, key);
        fs::write(&image_path, image)?;
        if let Err(e) = vector::write_vector(self.vector_path(identity, key), vector) {
            let _ = fs::remove_file(&image_path);
            return Err(StoreError::Format(e.to_string()));
        }
        Ok(())
    }

    /// 删除一条记录的文件，文件不存在时忽略
    pub fn remove(&self, identity: Option<&str>, key: &str) -> Result<()> {
        remove_file(self.image_path(identity, key))?;
        remove_file(self.vector_path(identity, key))?;
        Ok(())
    }

    /// 将一条记录的文件从一个用户目录移动到另一个用户目录
    pub fn relocate(&self, key: &str, from: Option<&str>, to: Option<&str>) -> Result<()> {
        fs::create_dir_all(self.dir(to))?;
        fs::rename(self.image_path(from, key), self.image_path(to, key))?;
        fs::rename(self.vector_path(from, key), self.vector_path(to, key))?;
        Ok(())
    }

    /// 将整个用户目录重命名
    pub fn rename_dir(&self, from: &str, to: &str) -> Result<()> {
        let (src, dest) = (self.dir(Some(from)), self.dir(Some(to)));
        if !src.exists() {
            return Ok(());
        }
        if !dest.exists() {
            fs::rename(&src, &dest)?;
            return Ok(());
        }
        // 目标目录可能残留着空目录或无关文件，只能逐个移动
        for entry in fs::read_dir(&src)? {
            let entry = entry?;
            fs::rename(entry.path(), dest.join(entry.file_name()))?;
        }
        fs::remove_dir(&src)?;
        Ok(())
    }

    /// 删除整个用户目录，目录不存在时忽略
    pub fn remove_dir(&self, identity: &str) -> Result<()> {
        match fs::remove_dir_all(self.dir(Some(identity))) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// 用户目录为空时将其删除
    pub fn remove_dir_if_empty(&self, identity: &str) {
        let dir = self.dir(Some(identity));
        let empty = fs::read_dir(&dir).map(|mut it| it.next().is_none()).unwrap_or(false);
        if empty {
            let _ = fs::remove_dir(&dir);
        }
    }

    /// 扫描根目录，读取所有同时存在图片和特征文件的记录
    ///
    /// 缺失特征文件或特征文件损坏的记录会被跳过
    pub fn scan(&self) -> Vec<LoadedBlob> {
        if !self.root.exists() {
            return vec![];
        }
        let depth = match self.layout {
            Layout::Identity => 2,
            Layout::Flat => 1,
        };

        let candidates = WalkDir::new(&self.root)
            .min_depth(depth)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("扫描目录出错: {e}");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| self.candidate(entry.path()))
            .collect::<Vec<_>>();

        candidates
            .into_par_iter()
            .filter_map(|(key, identity, vector_path)| match vector::read_vector(&vector_path) {
                Ok(vector) => Some(LoadedBlob { key, identity, vector }),
                Err(e) => {
                    warn!("跳过损坏的特征文件 {}: {e}", vector_path.display());
                    None
                }
            })
            .collect()
    }

    fn candidate(&self, path: &Path) -> Option<(String, Option<String>, PathBuf)> {
        if path.extension().and_then(|s| s.to_str()) != Some(IMAGE_EXT) {
            return None;
        }
        let key = path.file_stem()?.to_str()?.to_owned();
        let identity = match self.layout {
            Layout::Identity => {
                let name = path.parent()?.file_name()?.to_str()?.to_owned();
                if validate_name(&name).is_err() {
                    warn!("跳过无效的用户目录: {name}");
                    return None;
                }
                Some(name)
            }
            Layout::Flat => None,
        };
        let vector_path = path.with_extension(VECTOR_EXT);
        if !vector_path.is_file() {
            warn!("跳过缺少特征文件的图片: {}", path.display());
            return None;
        }
        debug!("发现记录 {key} ({identity:?})");
        Some((key, identity, vector_path))
    }
}

/// 检查名称能否安全地作为单级目录名或文件名
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid { Err(StoreError::InvalidName(name.to_owned())) } else { Ok(()) }
}

fn remove_file(path: PathBuf) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("alice").is_ok());
        assert!(validate_name("UNKNOWN_ab12cd34").is_ok());
        assert!(validate_name("张三").is_ok());
        for name in ["", ".", "..", "a/b", "..\\x", "a\0"] {
            assert!(validate_name(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn test_scan_skips_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path(), Layout::Identity);
        blobs.write(Some("alice"), "k1", b"jpeg", &[1., 0.]).unwrap();
        blobs.write(Some("alice"), "k2", b"jpeg", &[0., 1.]).unwrap();
        // 只有图片没有特征
        fs::write(dir.path().join("alice").join("k3.jpg"), b"jpeg").unwrap();
        // 特征文件损坏
        fs::write(dir.path().join("alice").join("k4.jpg"), b"jpeg").unwrap();
        fs::write(dir.path().join("alice").join("k4.vec"), b"garbage").unwrap();
        // 根目录下的文件不属于任何用户
        fs::write(dir.path().join("k5.jpg"), b"jpeg").unwrap();

        let loaded = blobs.scan();
        let keys = loaded.iter().map(|b| b.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, ["k1", "k2"]);
        assert_eq!(loaded[0].identity.as_deref(), Some("alice"));
        assert_eq!(loaded[1].vector, vec![0., 1.]);
    }

    #[test]
    fn test_rename_dir_into_existing() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path(), Layout::Identity);
        blobs.write(Some("a"), "k1", b"jpeg", &[1.]).unwrap();
        fs::create_dir_all(blobs.dir(Some("b"))).unwrap();
        blobs.rename_dir("a", "b").unwrap();
        assert!(!blobs.dir(Some("a")).exists());
        assert!(blobs.image_path(Some("b"), "k1").exists());
        assert!(blobs.vector_path(Some("b"), "k1").exists());
    }
}
