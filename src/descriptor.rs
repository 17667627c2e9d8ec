use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use indicatif::{ParallelProgressIterator, ProgressBar};
use log::info;
use ndarray::Array1;
use rayon::prelude::*;

use crate::checkpoint::CheckpointStore;
use crate::config::WorkDirs;
use crate::error::Result;
use crate::extract::{ColorDescriptorTool, DescriptorExtractor, FfmpegFrameSampler, FrameSampler};
use crate::media::MediaItem;
use crate::model::{BuildOutcome, ModelFiles, ModelParams, build_model};
use crate::orchestrator::{CombinedMatrix, Orchestrator};
use crate::quantizer::Quantizer;
use crate::registry::DescriptorType;
use crate::utils::{build_pool, pb_style};

pub struct ColorDescriptorBuilder {
    dtype: DescriptorType,
    dirs: WorkDirs,
    extractor: Option<Arc<dyn DescriptorExtractor>>,
    sampler: Option<Arc<dyn FrameSampler>>,
    model_params: ModelParams,
    parallel: usize,
    copy_parallel: usize,
    row_limit: Option<usize>,
}

impl ColorDescriptorBuilder {
    pub fn new(dtype: DescriptorType, model_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        let cpus = num_cpus::get();
        Self {
            dtype,
            dirs: WorkDirs::new(model_dir, work_dir),
            extractor: None,
            sampler: None,
            model_params: ModelParams::default(),
            parallel: cpus,
            copy_parallel: cpus * 2,
            row_limit: None,
        }
    }

    /// 替换默认的 colorDescriptor 提取器
    pub fn extractor(mut self, extractor: Arc<dyn DescriptorExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// 替换默认的 ffmpeg 抽帧器
    pub fn sampler(mut self, sampler: Arc<dyn FrameSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn model_params(mut self, params: ModelParams) -> Self {
        self.model_params = params;
        self
    }

    pub fn parallel(mut self, parallel: usize, copy_parallel: usize) -> Self {
        self.parallel = parallel;
        self.copy_parallel = copy_parallel;
        self
    }

    pub fn row_limit(mut self, row_limit: Option<usize>) -> Self {
        self.row_limit = row_limit;
        self
    }

    pub fn open(self) -> Result<ColorDescriptor> {
        let temp = self.dirs.temp();
        std::fs::create_dir_all(self.dirs.model_dir())?;
        std::fs::create_dir_all(&temp)?;

        let store = CheckpointStore::new(self.dirs.checkpoints(self.dtype));
        let files = self.dirs.model_files(self.dtype);
        let extractor = self.extractor.unwrap_or_else(|| Arc::new(ColorDescriptorTool::new("colorDescriptor", &temp)));
        let sampler = self.sampler.unwrap_or_else(|| Arc::new(FfmpegFrameSampler::new(&temp)));

        let orchestrator = Orchestrator::new(self.dtype, extractor, sampler, store.clone(), temp)
            .parallel(self.parallel, self.copy_parallel)
            .seed(self.model_params.kmeans.seed)
            .row_limit(self.row_limit);
        let quantizer = Quantizer::new(store, files.clone());

        Ok(ColorDescriptor {
            dtype: self.dtype,
            files,
            orchestrator,
            quantizer,
            model_params: self.model_params,
            parallel: self.parallel,
        })
    }
}

/// 一种描述符类型的完整流程：提取、生成模型、量化
pub struct ColorDescriptor {
    dtype: DescriptorType,
    files: ModelFiles,
    orchestrator: Orchestrator,
    quantizer: Quantizer,
    model_params: ModelParams,
    parallel: usize,
}

impl ColorDescriptor {
    pub fn descriptor_type(&self) -> DescriptorType {
        self.dtype
    }

    pub fn model_files(&self) -> &ModelFiles {
        &self.files
    }

    pub fn quantizer(&self) -> &Quantizer {
        &self.quantizer
    }

    pub fn has_model(&self) -> bool {
        self.files.has_model()
    }

    /// 提取所有条目的描述符并合并，`limit` 为总行数上限
    pub fn generate_matrix(&self, items: &[MediaItem], limit: Option<usize>) -> Result<CombinedMatrix> {
        self.orchestrator.generate(items, limit)
    }

    /// 用给定的条目生成码本和索引，模型已存在时什么也不做
    pub fn generate_model(&self, items: &[MediaItem], limit: Option<usize>) -> Result<BuildOutcome> {
        let outcome = build_model(&self.files, &self.model_params, || {
            self.generate_matrix(items, limit).map(|m| m.descriptors)
        })?;
        if let BuildOutcome::Built(params) = &outcome {
            info!("{} 模型生成完成，算法 {:?}，精度 {:.3}", self.dtype, params.algorithm, params.precision);
            self.quantizer.reload();
        }
        Ok(outcome)
    }

    /// 计算单个条目的直方图，提取失败时返回错误
    pub fn compute_descriptor(&self, item: &MediaItem) -> Result<Array1<f64>> {
        self.quantizer
            .quantize(item.content_hash(), || self.orchestrator.item_tables(item).map(|t| t.descriptors))
    }

    /// 批量计算直方图，按内容哈希排序，每个条目的错误单独返回
    ///
    /// 在 `parallel` 个线程的线程池中运行，只有线程池创建失败时整体返回错误
    pub fn compute_descriptors(&self, items: &[MediaItem]) -> Result<BTreeMap<String, Result<Array1<f64>>>> {
        let items: BTreeMap<&str, &MediaItem> = items.iter().map(|item| (item.content_hash(), item)).collect();
        // 先加载一次模型，避免每个线程各自等待
        if self.has_model() {
            let _ = self.quantizer.model();
        }
        let pool = build_pool(self.parallel, "quantize")?;
        let pb = ProgressBar::new(items.len() as u64).with_style(pb_style());
        let results = pool.install(|| {
            items
                .into_par_iter()
                .progress_with(pb.clone())
                .map(|(hash, item)| (hash.to_string(), self.compute_descriptor(item)))
                .collect()
        });
        pb.finish_and_clear();
        Ok(results)
    }
}
