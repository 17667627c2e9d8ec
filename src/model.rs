use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, bounded};
use log::{Level, info, warn};
use ndarray::Array2;
use ndarray_npy::ReadNpyExt;

use crate::checkpoint::write_npy_atomic;
use crate::error::{DescriptorError, Result};
use crate::index::{AutotuneParams, IndexParams, NearestCentroid, NeighborIndex, autotune};
use crate::kmeans::{KMeansParams, minibatch_kmeans};
use crate::registry::DescriptorType;
use crate::utils::SimpleTimer;

/// 目标精度上限，过于接近 1 时索引调优可能无法结束
pub const MAX_TARGET_PRECISION: f32 = 0.99;

/// 一个描述符类型的模型文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub codebook: PathBuf,
    pub index: PathBuf,
    pub params: PathBuf,
    /// 用于聚类的描述符矩阵，中断后重新生成模型时复用
    pub model_descriptors: PathBuf,
}

impl ModelFiles {
    pub fn new(model_dir: &Path, work_dir: &Path, dtype: DescriptorType) -> Self {
        let kind = dtype.kind;
        Self {
            codebook: model_dir.join(format!("{kind}.codebook.npy")),
            index: model_dir.join(format!("{kind}.index.bin")),
            params: model_dir.join(format!("{kind}.index.json")),
            model_descriptors: work_dir.join(format!("{}.{kind}.model_descriptors.npy", dtype.modality)),
        }
    }

    /// 码本、索引、索引参数三个文件都存在
    pub fn has_model(&self) -> bool {
        self.codebook.is_file() && self.index.is_file() && self.params.is_file()
    }
}

/// 生成模型的参数
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub kmeans: KMeansParams,
    pub target_precision: f32,
    pub sample_fraction: f32,
    /// 索引构建的超时时间，None 表示不限制
    pub index_timeout: Option<Duration>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            kmeans: KMeansParams::default(),
            target_precision: 0.90,
            sample_fraction: 0.75,
            index_timeout: Some(Duration::from_secs(600)),
        }
    }
}

impl ModelParams {
    fn autotune_params(&self) -> AutotuneParams {
        let mut target_precision = self.target_precision;
        if target_precision > MAX_TARGET_PRECISION {
            warn!("目标精度 {target_precision} 过高，调整为 {MAX_TARGET_PRECISION}");
            target_precision = MAX_TARGET_PRECISION;
        }
        AutotuneParams {
            target_precision,
            sample_fraction: self.sample_fraction.clamp(f32::EPSILON, 1.0),
            seed: self.kmeans.seed,
        }
    }
}

/// 已加载的码本和索引，只读，可在多个线程间共享
#[derive(Debug)]
pub struct Model {
    pub codebook: Array2<f32>,
    pub index: NeighborIndex,
    pub params: IndexParams,
}

impl Model {
    pub fn load(files: &ModelFiles) -> Result<Self> {
        if !files.has_model() {
            return Err(DescriptorError::NoModel { codebook: files.codebook.clone(), index: files.index.clone() });
        }
        let codebook = read_matrix(&files.codebook)?;
        let index = NeighborIndex::load(&files.index)?;
        let params = IndexParams::load(&files.params)?;
        if index.len() != codebook.nrows() || index.dim() != codebook.ncols() {
            return Err(DescriptorError::malformed(
                &files.index,
                format!("索引形状 {}x{} 与码本 {:?} 不一致", index.len(), index.dim(), codebook.dim()),
            ));
        }
        info!("加载模型 {}，{} 个中心，算法 {:?}", files.codebook.display(), codebook.nrows(), params.algorithm);
        Ok(Self { codebook, index, params })
    }

    /// 码本大小，即直方图的长度
    pub fn k(&self) -> usize {
        self.codebook.nrows()
    }

    pub fn dim(&self) -> usize {
        self.codebook.ncols()
    }
}

fn read_matrix(path: &Path) -> Result<Array2<f32>> {
    let reader = BufReader::new(File::open(path)?);
    Array2::<f32>::read_npy(reader).map_err(|e| DescriptorError::malformed(path, e))
}

/// 生成模型的结果
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// 模型已存在，什么也没做
    Existing,
    Built(IndexParams),
}

/// 生成码本和索引
///
/// 模型已存在时只打印警告。码本存在时跳过聚类，只构建索引；
/// 聚类用的描述符矩阵优先从工作目录读取，没有时才调用 `descriptors` 生成。
pub fn build_model<F>(files: &ModelFiles, params: &ModelParams, descriptors: F) -> Result<BuildOutcome>
where
    F: FnOnce() -> Result<Array2<f32>>,
{
    if files.has_model() {
        warn!("模型已存在，不会覆盖：{}", files.codebook.display());
        return Ok(BuildOutcome::Existing);
    }

    let codebook = match files.codebook.is_file().then(|| read_matrix(&files.codebook)) {
        Some(Ok(codebook)) => {
            info!("复用已有的码本 {}", files.codebook.display());
            codebook
        }
        reused => {
            if let Some(Err(e)) = reused {
                warn!("码本无法读取，重新生成：{e}");
            }
            let data = model_descriptors(files, descriptors)?;
            let _timer = SimpleTimer::new(format!("对 {} 个描述符聚类", data.nrows()), Level::Info);
            let state = minibatch_kmeans(data.view(), &params.kmeans)?;
            write_npy_atomic(&files.codebook, &state.centroids)?;
            state.centroids
        }
    };

    let (index, index_params) = build_index(codebook, params.autotune_params(), params.index_timeout)?;
    let _timer = SimpleTimer::new("保存索引", Level::Info);
    index.save(&files.index)?;
    // 参数文件最后写入，三个文件齐全才算模型存在
    index_params.save(&files.params)?;
    Ok(BuildOutcome::Built(index_params))
}

fn model_descriptors<F>(files: &ModelFiles, descriptors: F) -> Result<Array2<f32>>
where
    F: FnOnce() -> Result<Array2<f32>>,
{
    if files.model_descriptors.is_file() {
        match read_matrix(&files.model_descriptors) {
            Ok(data) if data.nrows() > 0 => {
                info!("复用描述符矩阵 {}", files.model_descriptors.display());
                return Ok(data);
            }
            Ok(_) => {}
            Err(e) => warn!("描述符矩阵无法读取，重新生成：{e}"),
        }
    }

    let data = descriptors()?;
    if data.nrows() == 0 {
        return Err(DescriptorError::EmptyDataset);
    }
    write_npy_atomic(&files.model_descriptors, &data)?;
    Ok(data)
}

/// 在后台线程中自动调优并构建索引，超时后不再等待
fn build_index(
    codebook: Array2<f32>,
    params: AutotuneParams,
    timeout: Option<Duration>,
) -> Result<(NeighborIndex, IndexParams)> {
    let _timer = SimpleTimer::new(format!("为 {} 个中心构建索引", codebook.nrows()), Level::Info);
    let (tx, rx) = bounded(1);
    std::thread::Builder::new().name("index-build".to_string()).spawn(move || {
        let _ = tx.send(autotune(codebook.view(), &params));
    })?;

    let aborted = || DescriptorError::Io(std::io::Error::other("索引构建线程异常退出"));
    match timeout {
        Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => DescriptorError::IndexBuildTimeout(timeout),
            RecvTimeoutError::Disconnected => aborted(),
        }),
        None => rx.recv().map_err(|_| aborted()),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;
    use crate::registry::{DescriptorKind, Modality};

    fn files(dir: &Path) -> ModelFiles {
        ModelFiles::new(&dir.join("model"), &dir.join("work"), DescriptorType::new(DescriptorKind::Sift, Modality::Image))
    }

    fn small_params() -> ModelParams {
        ModelParams {
            kmeans: KMeansParams { k: 4, max_iter: 5, batch_size: 16, seed: Some(3) },
            ..Default::default()
        }
    }

    #[test]
    fn test_paths() {
        let files = files(Path::new("/x"));
        assert_eq!(files.codebook, PathBuf::from("/x/model/sift.codebook.npy"));
        assert_eq!(files.params, PathBuf::from("/x/model/sift.index.json"));
        assert_eq!(files.model_descriptors, PathBuf::from("/x/work/image.sift.model_descriptors.npy"));
    }

    #[test]
    fn test_empty_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());
        let result = build_model(&files, &small_params(), || Ok(Array2::zeros((0, 8))));
        assert!(matches!(result, Err(DescriptorError::EmptyDataset)));
        assert!(!files.has_model());
    }

    #[test]
    fn test_reuse_codebook() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());
        let codebook = Array2::from_shape_fn((4, 3), |(i, j)| (i * 3 + j) as f32);
        write_npy_atomic(&files.codebook, &codebook).unwrap();

        let outcome = build_model(&files, &small_params(), || panic!("不应重新聚类")).unwrap();
        assert!(matches!(outcome, BuildOutcome::Built(_)));
        let model = Model::load(&files).unwrap();
        assert_eq!(model.codebook, codebook);
        assert_eq!(model.k(), 4);
    }

    #[test]
    fn test_reuse_model_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());
        let data = Array2::from_shape_fn((40, 3), |(i, j)| ((i % 4) * 10 + j) as f32);
        write_npy_atomic(&files.model_descriptors, &data).unwrap();

        build_model(&files, &small_params(), || panic!("不应重新提取")).unwrap();
        assert!(files.has_model());
    }

    #[test]
    fn test_index_build_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path());
        let codebook = Array2::from_shape_fn((1200, 16), |(i, j)| ((i * 17 + j * 5) % 97) as f32);
        write_npy_atomic(&files.codebook, &codebook).unwrap();

        let params = ModelParams { index_timeout: Some(Duration::from_nanos(1)), ..small_params() };
        let result = build_model(&files, &params, || panic!("不应重新聚类"));
        assert!(matches!(result, Err(DescriptorError::IndexBuildTimeout(_))));
        assert!(!files.has_model());
        assert!(!files.index.exists());
        assert!(files.codebook.is_file());
    }

    #[test]
    fn test_precision_clamped() {
        let params = ModelParams { target_precision: 1.0, ..Default::default() };
        assert_eq!(params.autotune_params().target_precision, MAX_TARGET_PRECISION);
    }
}
