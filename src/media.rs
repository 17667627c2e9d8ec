use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::{Builder, NamedTempFile};

use crate::registry::Modality;

/// 根据文件扩展名猜测 MIME 类型
pub fn guess_content_type(path: impl AsRef<Path>) -> Option<&'static str> {
    let ext = path.as_ref().extension()?.to_string_lossy().to_ascii_lowercase();
    let content_type = match ext.as_str() {
        "bmp" => "image/bmp",
        "jpg" | "jpeg" | "jpe" => "image/jpeg",
        "png" => "image/png",
        "tif" | "tiff" => "image/tiff",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" | "qt" => "video/quicktime",
        "mpg" | "mpeg" | "mpe" => "video/mpeg",
        "flv" => "video/x-flv",
        "wmv" => "video/x-ms-wmv",
        "ogv" => "video/ogg",
        "3gp" => "video/3gpp",
        _ => return None,
    };
    Some(content_type)
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/bmp" => ".bmp",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/tiff" => ".tiff",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/x-matroska" => ".mkv",
        "video/quicktime" => ".mov",
        "video/x-msvideo" => ".avi",
        "video/mpeg" => ".mpg",
        _ => "",
    }
}

#[derive(Debug, Clone)]
enum MediaSource {
    File(PathBuf),
    Bytes(Arc<[u8]>),
}

/// 一个以内容哈希标识的媒体文件
///
/// 只读取其内容，从不修改或删除原始数据
#[derive(Debug, Clone)]
pub struct MediaItem {
    hash: String,
    content_type: String,
    source: MediaSource,
}

impl MediaItem {
    /// 从本地文件创建，内容类型根据扩展名猜测
    pub fn from_file(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let content_type = guess_content_type(&path).unwrap_or("application/octet-stream");
        Self::from_file_with_type(path, content_type)
    }

    pub fn from_file_with_type(path: impl Into<PathBuf>, content_type: &str) -> io::Result<Self> {
        let path = path.into();
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut File::open(&path)?, &mut hasher)?;
        Ok(Self {
            hash: hasher.finalize().to_hex().to_string(),
            content_type: content_type.to_string(),
            source: MediaSource::File(path),
        })
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, content_type: &str) -> Self {
        let bytes = bytes.into();
        Self {
            hash: blake3::hash(&bytes).to_hex().to_string(),
            content_type: content_type.to_string(),
            source: MediaSource::Bytes(bytes),
        }
    }

    /// 内容哈希，同时作为条目的唯一标识
    pub fn content_hash(&self) -> &str {
        &self.hash
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// 原始文件路径，内存数据返回 None
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            MediaSource::File(path) => Some(path),
            MediaSource::Bytes(_) => None,
        }
    }

    pub fn modality(&self) -> Option<Modality> {
        [Modality::Image, Modality::Video].into_iter().find(|m| m.accepts(&self.content_type))
    }

    /// 获取一个可供外部程序读取的本地路径
    ///
    /// 内存中的数据会写入 `dir` 下的临时文件，返回值析构时自动删除
    pub fn local_copy(&self, dir: &Path) -> io::Result<LocalCopy> {
        match &self.source {
            MediaSource::File(path) => Ok(LocalCopy::Borrowed(path.clone())),
            MediaSource::Bytes(bytes) => {
                std::fs::create_dir_all(dir)?;
                let mut tmp = Builder::new()
                    .prefix(&self.hash[..self.hash.len().min(16)])
                    .suffix(extension_for(&self.content_type))
                    .tempfile_in(dir)?;
                tmp.write_all(bytes)?;
                tmp.flush()?;
                Ok(LocalCopy::Temp(tmp))
            }
        }
    }
}

/// 媒体文件的本地副本
pub enum LocalCopy {
    Borrowed(PathBuf),
    Temp(NamedTempFile),
}

impl LocalCopy {
    pub fn path(&self) -> &Path {
        match self {
            Self::Borrowed(path) => path,
            Self::Temp(tmp) => tmp.path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type("a/b.JPG"), Some("image/jpeg"));
        assert_eq!(guess_content_type("clip.mkv"), Some("video/x-matroska"));
        assert_eq!(guess_content_type("noext"), None);
    }

    #[test]
    fn test_hash_is_identity() {
        let a = MediaItem::from_bytes(b"hello".to_vec(), "image/png");
        let b = MediaItem::from_bytes(b"hello".to_vec(), "image/jpeg");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash(), blake3::hash(b"hello").to_hex().as_str());
        assert_eq!(a.modality(), Some(Modality::Image));
    }

    #[test]
    fn test_file_hash_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.png");
        std::fs::write(&path, b"pixels").unwrap();
        let item = MediaItem::from_file(&path).unwrap();
        assert_eq!(item.content_hash(), MediaItem::from_bytes(b"pixels".to_vec(), "").content_hash());
        assert_eq!(item.content_type(), "image/png");
        assert_eq!(item.local_copy(dir.path()).unwrap().path(), path);
    }

    #[test]
    fn test_temp_copy_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let item = MediaItem::from_bytes(b"video-bytes".to_vec(), "video/mp4");
        let copy = item.local_copy(dir.path()).unwrap();
        let path = copy.path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"video-bytes");
        assert_eq!(path.extension().unwrap(), "mp4");
        drop(copy);
        assert!(!path.exists());
    }
}
