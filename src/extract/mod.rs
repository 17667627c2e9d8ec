mod color_descriptor;
mod ffmpeg;
pub mod koen;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

pub use color_descriptor::ColorDescriptorTool;
pub use ffmpeg::FfmpegFrameSampler;
use log::debug;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;

use crate::checkpoint::{Artifact, CheckpointStore};
use crate::error::{DescriptorError, Result};
use crate::matrix::{InfoTable, DescriptorTable, RawTables};
use crate::registry::{DescriptorKind, FrameSampling};

/// 从单张图片中提取原始局部描述符
pub trait DescriptorExtractor: Send + Sync {
    /// 失败时返回 `DescriptorError::Extraction`
    fn extract(&self, image: &Path, kind: DescriptorKind) -> Result<RawTables>;
}

/// 从视频中按给定参数抽取静态帧
pub trait FrameSampler: Send + Sync {
    /// 整个视频无法抽帧时返回 `DescriptorError::FrameExtraction`
    fn sample(&self, video: &Path, params: &FrameSampling, parallel: usize) -> Result<SampledFrames>;
}

/// 抽帧结果：帧号 -> 图片路径
///
/// 持有临时目录时，析构后所有帧图片随之删除
#[derive(Debug, Default)]
pub struct SampledFrames {
    frames: BTreeMap<usize, PathBuf>,
    _dir: Option<TempDir>,
}

impl SampledFrames {
    pub fn in_dir(dir: TempDir, frames: BTreeMap<usize, PathBuf>) -> Self {
        Self { frames, _dir: Some(dir) }
    }

    pub fn frames(&self) -> &BTreeMap<usize, PathBuf> {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// 检查点中一对原始矩阵的形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableShape {
    pub rows: usize,
    pub info_width: usize,
    pub descriptor_width: usize,
}

impl TableShape {
    fn of(tables: &RawTables) -> Self {
        Self {
            rows: tables.rows(),
            info_width: tables.info.ncols(),
            descriptor_width: tables.descriptors.ncols(),
        }
    }
}

/// 带检查点的原始描述符提取
///
/// 结果以 `(hash, frame)` 为键写入检查点，两个矩阵都能读取且行数一致时直接复用。
/// 设置了行数上限时，超出的部分按排序后的随机下采样裁剪，随机种子由内容哈希决定。
pub struct RawExtraction<'a> {
    extractor: &'a dyn DescriptorExtractor,
    store: &'a CheckpointStore,
    kind: DescriptorKind,
    row_limit: Option<usize>,
}

impl<'a> RawExtraction<'a> {
    pub fn new(extractor: &'a dyn DescriptorExtractor, store: &'a CheckpointStore, kind: DescriptorKind) -> Self {
        Self { extractor, store, kind, row_limit: None }
    }

    pub fn with_row_limit(mut self, row_limit: Option<usize>) -> Self {
        self.row_limit = row_limit;
        self
    }

    /// 确保检查点存在，返回矩阵形状
    pub fn ensure(&self, hash: &str, frame: Option<usize>, image: &Path) -> Result<TableShape> {
        if let Some(tables) = self.cached(hash, frame) {
            debug!("复用检查点 {hash} {frame:?}");
            return Ok(TableShape::of(&tables));
        }

        let mut tables = self.extractor.extract(image, self.kind)?;
        if !tables.is_aligned() {
            return Err(DescriptorError::extraction(
                image,
                format!("信息矩阵 {} 行，描述符矩阵 {} 行", tables.info.nrows(), tables.descriptors.nrows()),
            ));
        }
        if let Some(limit) = self.row_limit {
            tables = tables.limit_rows(limit, &mut StdRng::seed_from_u64(hash_seed(hash)));
        }

        self.store.put(hash, Artifact::Info { frame }, &tables.info)?;
        self.store.put(hash, Artifact::Descriptors { frame }, &tables.descriptors)?;
        Ok(TableShape::of(&tables))
    }

    /// 读取检查点中的一对矩阵
    pub fn load(&self, hash: &str, frame: Option<usize>) -> Result<RawTables> {
        let info = self.store.load::<f64, _>(hash, Artifact::Info { frame })?;
        let descriptors = self.store.load::<f32, _>(hash, Artifact::Descriptors { frame })?;
        match (info, descriptors) {
            (Some(info), Some(descriptors)) => {
                let tables = RawTables { info, descriptors };
                if !tables.is_aligned() {
                    return Err(DescriptorError::malformed(
                        self.store.path(hash, Artifact::Info { frame }),
                        "与描述符矩阵行数不一致",
                    ));
                }
                Ok(tables)
            }
            _ => Err(DescriptorError::malformed(
                self.store.path(hash, Artifact::Descriptors { frame }),
                "检查点缺失",
            )),
        }
    }

    fn cached(&self, hash: &str, frame: Option<usize>) -> Option<RawTables> {
        let info: InfoTable = self.store.get(hash, Artifact::Info { frame })?;
        let descriptors: DescriptorTable = self.store.get(hash, Artifact::Descriptors { frame })?;
        let tables = RawTables { info, descriptors };
        tables.is_aligned().then_some(tables)
    }
}

/// 取内容哈希的前 16 个十六进制字符作为随机种子
fn hash_seed(hash: &str) -> u64 {
    hash.get(..16).and_then(|s| u64::from_str_radix(s, 16).ok()).unwrap_or_default()
}

/// 运行外部程序，等待其退出或超时
///
/// 标准输出被丢弃，标准错误写入临时文件，失败时作为原因返回
pub(crate) fn run_tool(mut cmd: Command, timeout: Option<Duration>) -> std::result::Result<(), String> {
    let program = cmd.get_program().to_string_lossy().to_string();
    let mut stderr = tempfile::tempfile().map_err(|e| format!("无法创建临时文件: {e}"))?;
    let stderr_writer = stderr.try_clone().map_err(|e| e.to_string())?;
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::from(stderr_writer));

    debug!("运行 {cmd:?}");
    let mut child = cmd.spawn().map_err(|e| format!("无法启动 {program}: {e}"))?;
    let status = wait_with_timeout(&mut child, timeout).map_err(|e| format!("{program}: {e}"))?;
    if status.success() {
        return Ok(());
    }
    Err(format!("{program} 退出状态 {status}: {}", read_tail(&mut stderr)))
}

fn wait_with_timeout(child: &mut std::process::Child, timeout: Option<Duration>) -> std::io::Result<ExitStatus> {
    let Some(timeout) = timeout else {
        return child.wait();
    };
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("运行超过 {:.1}s，已终止", timeout.as_secs_f32()),
            ));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn read_tail(file: &mut File) -> String {
    let mut buf = String::new();
    if file.seek(SeekFrom::Start(0)).is_ok() {
        let _ = file.read_to_string(&mut buf);
    }
    let lines: Vec<_> = buf.lines().collect();
    lines[lines.len().saturating_sub(10)..].join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ndarray::Array2;

    use super::*;

    struct Fake {
        rows: usize,
        calls: AtomicUsize,
    }

    impl DescriptorExtractor for Fake {
        fn extract(&self, _image: &Path, _kind: DescriptorKind) -> Result<RawTables> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawTables {
                info: Array2::from_shape_fn((self.rows, 5), |(i, _)| i as f64),
                descriptors: Array2::from_shape_fn((self.rows, 4), |(i, _)| i as f32),
            })
        }
    }

    const HASH: &str = "00112233445566778899aabbccddeeff";

    #[test]
    fn test_ensure_reuses_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let fake = Fake { rows: 12, calls: AtomicUsize::new(0) };
        let raw = RawExtraction::new(&fake, &store, DescriptorKind::Sift);

        let shape = raw.ensure(HASH, None, Path::new("a.png")).unwrap();
        assert_eq!(shape, TableShape { rows: 12, info_width: 5, descriptor_width: 4 });
        raw.ensure(HASH, None, Path::new("a.png")).unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);

        // 不同帧是不同的键
        raw.ensure(HASH, Some(3), Path::new("a.png")).unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
        assert_eq!(raw.load(HASH, Some(3)).unwrap().rows(), 12);
    }

    #[test]
    fn test_row_limit_keeps_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let fake = Fake { rows: 100, calls: AtomicUsize::new(0) };
        let raw = RawExtraction::new(&fake, &store, DescriptorKind::Sift).with_row_limit(Some(10));

        assert_eq!(raw.ensure(HASH, None, Path::new("a.png")).unwrap().rows, 10);
        let tables = raw.load(HASH, None).unwrap();
        for (i, d) in tables.info.outer_iter().zip(tables.descriptors.outer_iter()) {
            assert_eq!(i[0] as f32, d[0]);
        }
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let fake = Fake { rows: 1, calls: AtomicUsize::new(0) };
        let raw = RawExtraction::new(&fake, &store, DescriptorKind::Sift);
        assert!(matches!(raw.load(HASH, None), Err(DescriptorError::MalformedCheckpoint { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_tool() {
        assert!(run_tool(Command::new("true"), None).is_ok());

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let err = run_tool(cmd, None).unwrap_err();
        assert!(err.contains("boom"), "{err}");

        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        assert!(run_tool(cmd, Some(Duration::from_millis(100))).is_err());
    }
}
