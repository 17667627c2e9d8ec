use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;
use crate::extract::{ColorDescriptorTool, FfmpegFrameSampler};
use crate::kmeans::KMeansParams;
use crate::model::{ModelFiles, ModelParams};
use crate::registry::{DescriptorKind, DescriptorType, Modality};

static PROJECT_DIRS: LazyLock<WorkDirs> = LazyLock::new(|| match ProjectDirs::from("", "colordesc", "colordesc") {
    Some(dirs) => WorkDirs::new(dirs.data_dir().join("model"), dirs.cache_dir()),
    None => WorkDirs::new("model", "work"),
});

fn default_model_dir() -> PathBuf {
    PROJECT_DIRS.model_dir().to_path_buf()
}

fn default_work_dir() -> PathBuf {
    PROJECT_DIRS.work_dir().to_path_buf()
}

#[derive(Parser, Debug, Clone)]
#[command(name = "colordesc", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 码本和索引所在目录
    #[arg(short, long, global = true, value_name = "DIR", default_value_os_t = default_model_dir())]
    pub model_dir: PathBuf,
    /// 检查点、聚类用描述符矩阵和临时文件所在目录
    #[arg(short, long, global = true, value_name = "DIR", default_value_os_t = default_work_dir())]
    pub work_dir: PathBuf,
}

impl Opts {
    pub fn dirs(&self) -> WorkDirs {
        WorkDirs::new(&self.model_dir, &self.work_dir)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 从一组图片或视频生成码本和索引
    Train(TrainCommand),
    /// 计算图片或视频在码本上的直方图
    Quantize(QuantizeCommand),
    /// 提取原始描述符并导出合并后的矩阵
    Extract(ExtractCommand),
    /// 列出所有描述符类型
    Kinds(KindsCommand),
}

/// 模型目录和工作目录的布局
#[derive(Debug, Clone)]
pub struct WorkDirs {
    model: PathBuf,
    work: PathBuf,
}

impl WorkDirs {
    pub fn new(model: impl Into<PathBuf>, work: impl Into<PathBuf>) -> Self {
        Self { model: model.into(), work: work.into() }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model
    }

    pub fn work_dir(&self) -> &Path {
        &self.work
    }

    /// 返回描述符类型的检查点目录
    pub fn checkpoints(&self, dtype: DescriptorType) -> PathBuf {
        self.work.join("checkpoints").join(dtype.kind.as_str())
    }

    /// 返回临时文件目录
    pub fn temp(&self) -> PathBuf {
        self.work.join("temp")
    }

    pub fn model_files(&self, dtype: DescriptorType) -> ModelFiles {
        ModelFiles::new(&self.model, &self.work, dtype)
    }
}

/// 选择描述符类型
#[derive(Parser, Debug, Clone)]
pub struct TypeOptions {
    /// 特征类型，例如 sift、csift、rgbhistogram
    #[arg(short = 'K', long, value_name = "KIND", value_parser = parse_kind)]
    pub kind: DescriptorKind,
    /// 媒体类型
    #[arg(short = 'M', long, value_enum, default_value_t = Modality::Image)]
    pub modality: Modality,
}

impl TypeOptions {
    pub fn descriptor_type(&self) -> DescriptorType {
        DescriptorType::new(self.kind, self.modality)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ModelOptions {
    /// 码本大小，即聚类中心数量
    #[arg(short = 'k', long, value_name = "K", default_value_t = 1024)]
    pub kmeans_k: usize,
    /// 索引自动调优的目标精度，最大 0.99
    #[arg(long, value_name = "P", default_value_t = 0.90)]
    pub target_precision: f32,
    /// 索引自动调优时使用的中心比例
    #[arg(long, value_name = "F", default_value_t = 0.75)]
    pub sample_fraction: f32,
    /// 随机种子，指定后聚类、下采样和索引构建都可复现
    #[arg(long)]
    pub seed: Option<u64>,
    /// k-means 最大迭代轮数
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub kmeans_max_iter: usize,
    /// k-means 每个批次的样本数
    #[arg(long, value_name = "SIZE", default_value_t = 1024)]
    pub kmeans_batch_size: usize,
    /// 索引构建超时秒数，0 表示不限制
    #[arg(long, value_name = "SECONDS", default_value_t = 600)]
    pub index_timeout: u64,
}

impl From<&ModelOptions> for ModelParams {
    fn from(opts: &ModelOptions) -> Self {
        Self {
            kmeans: KMeansParams {
                k: opts.kmeans_k,
                max_iter: opts.kmeans_max_iter,
                batch_size: opts.kmeans_batch_size,
                seed: opts.seed,
            },
            target_precision: opts.target_precision,
            sample_fraction: opts.sample_fraction,
            index_timeout: seconds(opts.index_timeout),
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ParallelOptions {
    /// 提取描述符的并发数
    #[arg(short = 'j', long, value_name = "N", default_value_t = num_cpus::get())]
    pub parallel: usize,
    /// 合并矩阵时拷贝的并发数
    #[arg(long, value_name = "N", default_value_t = num_cpus::get() * 2)]
    pub copy_parallel: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct ExtractorOptions {
    /// colorDescriptor 可执行文件
    #[arg(long, value_name = "EXE", default_value = "colorDescriptor")]
    pub color_descriptor: PathBuf,
    /// 关键点检测器
    #[arg(long, default_value = "densesampling")]
    pub detector: String,
    /// 密集采样的间距
    #[arg(long, value_name = "PIXELS", default_value_t = 6)]
    pub ds_spacing: u32,
    /// ffmpeg 可执行文件
    #[arg(long, value_name = "EXE", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,
    /// ffprobe 可执行文件
    #[arg(long, value_name = "EXE", default_value = "ffprobe")]
    pub ffprobe: PathBuf,
    /// 外部程序的超时秒数，0 或不指定时等待其自行退出
    #[arg(long, value_name = "SECONDS")]
    pub tool_timeout: Option<u64>,
    /// 每张图片或每帧最多保留的描述符行数
    #[arg(long, value_name = "ROWS")]
    pub row_limit: Option<usize>,
}

impl ExtractorOptions {
    pub fn extractor(&self, temp_dir: &Path) -> Arc<ColorDescriptorTool> {
        let tool = ColorDescriptorTool::new(&self.color_descriptor, temp_dir)
            .detector(&self.detector, self.ds_spacing)
            .timeout(self.tool_timeout.and_then(seconds));
        Arc::new(tool)
    }

    pub fn sampler(&self, temp_dir: &Path) -> Arc<FfmpegFrameSampler> {
        let sampler = FfmpegFrameSampler::new(temp_dir)
            .programs(&self.ffmpeg, &self.ffprobe)
            .timeout(self.tool_timeout.and_then(seconds));
        Arc::new(sampler)
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn parse_kind(s: &str) -> Result<DescriptorKind, String> {
    s.parse().map_err(|_| format!("无效的特征类型: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_options() {
        let opts = Opts::parse_from(["colordesc", "-m", "/m", "-w", "/w", "train", "-K", "csift", "--seed", "7", "/data"]);
        let SubCommand::Train(train) = &opts.subcmd else { panic!("应解析为 train") };
        assert_eq!(train.ty.descriptor_type(), DescriptorType::new(DescriptorKind::CSift, Modality::Image));

        let params = ModelParams::from(&train.model);
        assert_eq!(params.kmeans.k, 1024);
        assert_eq!(params.kmeans.seed, Some(7));
        assert_eq!(params.index_timeout, Some(Duration::from_secs(600)));
        assert_eq!(opts.dirs().checkpoints(train.ty.descriptor_type()), PathBuf::from("/w/checkpoints/csift"));
    }

    #[test]
    fn test_zero_timeout_disables() {
        let opts = Opts::parse_from(["colordesc", "train", "-K", "sift", "--index-timeout", "0", "/data"]);
        let SubCommand::Train(train) = &opts.subcmd else { panic!("应解析为 train") };
        assert_eq!(ModelParams::from(&train.model).index_timeout, None);
    }

    #[test]
    fn test_unknown_kind() {
        assert!(Opts::try_parse_from(["colordesc", "train", "-K", "surf", "/data"]).is_err());
    }
}
