use std::sync::{Arc, PoisonError, RwLock};

use log::debug;
use ndarray::{Array1, ArrayView2};

use crate::checkpoint::{Artifact, CheckpointStore};
use crate::error::{DescriptorError, Result};
use crate::index::NearestCentroid;
use crate::matrix::DescriptorTable;
use crate::model::{Model, ModelFiles};

/// 统计每个中心被分到的次数并归一化，结果之和为 1
///
/// 没有任何描述符时返回全零向量
pub fn occupancy_histogram(assignments: &[usize], k: usize) -> Array1<f64> {
    let mut hist = Array1::<f64>::zeros(k);
    if assignments.is_empty() {
        return hist;
    }
    for &c in assignments {
        hist[c] += 1.0;
    }
    hist /= assignments.len() as f64;
    hist
}

/// 把条目的原始描述符映射为码本上的直方图
///
/// 直方图以内容哈希为键缓存，同一个条目只计算一次
pub struct Quantizer {
    store: CheckpointStore,
    files: ModelFiles,
    model: RwLock<Option<Arc<Model>>>,
}

impl Quantizer {
    pub fn new(store: CheckpointStore, files: ModelFiles) -> Self {
        Self { store, files, model: RwLock::new(None) }
    }

    pub fn has_model(&self) -> bool {
        self.files.has_model()
    }

    /// 首次使用时从磁盘加载模型，之后共享同一份
    pub fn model(&self) -> Result<Arc<Model>> {
        if let Some(model) = self.model.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return Ok(model.clone());
        }
        let mut guard = self.model.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(model) = guard.as_ref() {
            return Ok(model.clone());
        }
        let model = Arc::new(Model::load(&self.files)?);
        *guard = Some(model.clone());
        Ok(model)
    }

    /// 丢弃已加载的模型，下次使用时重新读取
    pub fn reload(&self) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// 已缓存的直方图
    pub fn cached(&self, hash: &str) -> Option<Array1<f64>> {
        self.store.get(hash, Artifact::Histogram)
    }

    /// 计算一组描述符的直方图
    pub fn histogram(&self, descriptors: ArrayView2<f32>) -> Result<Array1<f64>> {
        let model = self.model()?;
        if descriptors.nrows() == 0 {
            return Ok(occupancy_histogram(&[], model.k()));
        }
        if descriptors.ncols() != model.dim() {
            return Err(DescriptorError::DimensionMismatch { expected: model.dim(), actual: descriptors.ncols() });
        }
        let assignments = model.index.nearest_batch(descriptors);
        Ok(occupancy_histogram(&assignments, model.k()))
    }

    /// 计算条目的直方图，已缓存时直接返回，不会调用 `extract`
    pub fn quantize<F>(&self, hash: &str, extract: F) -> Result<Array1<f64>>
    where
        F: FnOnce() -> Result<DescriptorTable>,
    {
        if let Some(hist) = self.cached(hash) {
            debug!("直方图缓存命中 {hash}");
            return Ok(hist);
        }
        if !self.has_model() {
            return Err(DescriptorError::NoModel { codebook: self.files.codebook.clone(), index: self.files.index.clone() });
        }

        let descriptors = extract()?;
        let hist = self.histogram(descriptors.view())?;
        self.store.put(hash, Artifact::Histogram, &hist)?;
        Ok(hist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_normalized() {
        let hist = occupancy_histogram(&[0, 2, 2, 3], 5);
        assert_eq!(hist.to_vec(), vec![0.25, 0.0, 0.5, 0.25, 0.0]);
        assert!((hist.sum() - 1.0).abs() < 1e-12);

        // 浮点除法，不会被截断为 0
        let hist = occupancy_histogram(&[1, 1, 0], 2);
        assert!((hist[0] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_histogram_empty() {
        let hist = occupancy_histogram(&[], 8);
        assert_eq!(hist.len(), 8);
        assert_eq!(hist.sum(), 0.0);
    }
}
