use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = DescriptorError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum DescriptorError {
    /// 外部特征提取工具失败，只影响单个图片或单帧
    #[error("特征提取失败 {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    /// 整个视频抽帧失败
    #[error("视频抽帧失败 {path}: {reason}")]
    FrameExtraction { path: PathBuf, reason: String },

    #[error("没有可用于生成码本的描述符")]
    EmptyDataset,

    #[error("模型不存在，请先生成模型文件\n码本: {codebook}\n索引: {index}")]
    NoModel { codebook: PathBuf, index: PathBuf },

    #[error("索引构建超时（{0:?}），请降低目标精度后重试")]
    IndexBuildTimeout(Duration),

    #[error("检查点文件损坏 {path}: {reason}")]
    MalformedCheckpoint { path: PathBuf, reason: String },

    #[error("维度不匹配：期望 {expected}，实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("样本数量 {samples} 少于聚类中心数量 {k}")]
    TooFewSamples { samples: usize, k: usize },

    #[error("未知的描述符类型: {0}")]
    UnknownKind(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("读取 npy 失败: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error("写入 npy 失败: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    #[error("索引序列化失败: {0}")]
    Bincode(#[from] bincode::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error("创建线程池失败: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl DescriptorError {
    /// 是否为可恢复的单项失败，聚合阶段遇到此类错误只跳过对应条目
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Extraction { .. } | Self::FrameExtraction { .. })
    }

    pub(crate) fn extraction(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Extraction { path: path.into(), reason: reason.to_string() }
    }

    pub(crate) fn frame_extraction(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::FrameExtraction { path: path.into(), reason: reason.to_string() }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::MalformedCheckpoint { path: path.into(), reason: reason.to_string() }
    }
}

impl From<tempfile::PersistError> for DescriptorError {
    fn from(err: tempfile::PersistError) -> Self {
        Self::Io(err.error)
    }
}
