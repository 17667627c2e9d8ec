use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::warn;
use ndarray::{Array, ArrayBase, Data, Dimension};
use ndarray_npy::{ReadNpyExt, ReadableElement, WritableElement, WriteNpyExt};
use tempfile::{Builder, NamedTempFile};

use crate::error::{DescriptorError, Result};
use crate::utils::partition_string;

/// 分片目录层数
const SHARD_DEPTH: usize = 2;
/// 每层目录名的字符数
const SHARD_WIDTH: usize = 2;

/// 检查点中保存的中间结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    /// 关键点信息矩阵，视频带帧号
    Info { frame: Option<usize> },
    /// 原始描述符矩阵，视频带帧号
    Descriptors { frame: Option<usize> },
    /// 量化后的直方图
    Histogram,
}

impl Artifact {
    fn file_name(&self, hash: &str) -> String {
        match self {
            Self::Info { frame: None } => format!("{hash}.info.npy"),
            Self::Info { frame: Some(frame) } => format!("{hash}.info.{frame}.npy"),
            Self::Descriptors { frame: None } => format!("{hash}.descriptors.npy"),
            Self::Descriptors { frame: Some(frame) } => format!("{hash}.descriptors.{frame}.npy"),
            Self::Histogram => format!("{hash}.feature.npy"),
        }
    }
}

/// 以内容哈希为键的持久化缓存
///
/// 目录结构为 `root/ab/cd/<hash>.<artifact>.npy`，写入先落到同目录临时文件再原子重命名，
/// 读者永远不会看到写了一半的文件。没有淘汰策略，文件一直保留到外部清理。
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 哈希对应的分片目录，不会创建目录
    pub fn shard_dir(&self, hash: &str) -> PathBuf {
        let mut dir = self.root.clone();
        dir.extend(partition_string(hash, SHARD_DEPTH, SHARD_WIDTH));
        dir
    }

    pub fn path(&self, hash: &str, artifact: Artifact) -> PathBuf {
        self.shard_dir(hash).join(artifact.file_name(hash))
    }

    /// 读取检查点，文件不存在返回 `Ok(None)`，文件损坏返回 `MalformedCheckpoint`
    pub fn load<A, D>(&self, hash: &str, artifact: Artifact) -> Result<Option<Array<A, D>>>
    where
        A: ReadableElement,
        D: Dimension,
    {
        let path = self.path(hash, artifact);
        if !path.is_file() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&path)?);
        Array::<A, D>::read_npy(reader)
            .map(Some)
            .map_err(|e| DescriptorError::malformed(&path, e))
    }

    /// 读取检查点，损坏的文件视为缓存未命中
    pub fn get<A, D>(&self, hash: &str, artifact: Artifact) -> Option<Array<A, D>>
    where
        A: ReadableElement,
        D: Dimension,
    {
        match self.load(hash, artifact) {
            Ok(array) => array,
            Err(e) => {
                warn!("忽略无法读取的检查点：{e}");
                None
            }
        }
    }

    /// 原子写入检查点，返回最终路径
    pub fn put<A, S, D>(&self, hash: &str, artifact: Artifact, array: &ArrayBase<S, D>) -> Result<PathBuf>
    where
        A: WritableElement,
        S: Data<Elem = A>,
        D: Dimension,
    {
        let path = self.path(hash, artifact);
        write_npy_atomic(&path, array)?;
        Ok(path)
    }
}

/// 先写入同目录下的临时文件，再重命名到目标路径
pub fn write_npy_atomic<A, S, D>(path: &Path, array: &ArrayBase<S, D>) -> Result<()>
where
    A: WritableElement,
    S: Data<Elem = A>,
    D: Dimension,
{
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = Builder::new().suffix(".npy.tmp").tempfile_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        array.write_npy(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// 原子写入任意字节
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}
