//! 码本上的最近邻索引
//!
//! 距离固定为卡方距离，构建和查询时使用同一个函数

mod autotune;
pub mod distance;
mod kdtree;
mod kmeans_tree;
mod linear;

use std::cmp::Ordering;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub use autotune::{AutotuneParams, autotune};
pub use distance::chi_square;
pub use kdtree::KdForest;
pub use kmeans_tree::KMeansTree;
pub use linear::LinearIndex;
use ndarray::ArrayView2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::checkpoint::write_bytes_atomic;
use crate::error::{DescriptorError, Result};

const INDEX_VERSION: u32 = 1;
pub const DISTANCE_NAME: &str = "chi_square";

/// 行优先存储的点集
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Points {
    data: Vec<f32>,
    dim: usize,
}

impl Points {
    pub fn from_array(array: ArrayView2<f32>) -> Self {
        let dim = array.ncols();
        Self { data: array.iter().copied().collect(), dim }
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 { 0 } else { self.data.len() / self.dim }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// 只保留给定序号的点
    pub fn select(&self, rows: &[usize]) -> Self {
        let mut data = Vec::with_capacity(rows.len() * self.dim);
        for &i in rows {
            data.extend_from_slice(self.row(i));
        }
        Self { data, dim: self.dim }
    }

    /// 在给定的候选中找最近点，距离相同时取序号较小者
    fn nearest_among(&self, query: &[f32], candidates: impl IntoIterator<Item = usize>) -> (usize, f32) {
        let mut best = Best::new();
        for i in candidates {
            best.offer(i, chi_square(query, self.row(i)));
        }
        (best.id, best.distance)
    }
}

/// 优先队列中待探索的分支，距离下界越小越先弹出
#[derive(Debug, Clone, Copy)]
struct Branch {
    bound: f32,
    tree: usize,
    node: usize,
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Branch {}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Branch {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .bound
            .total_cmp(&self.bound)
            .then_with(|| other.tree.cmp(&self.tree))
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// 记录一次查询的当前最优结果，距离相同时取序号较小者
#[derive(Debug, Clone, Copy)]
struct Best {
    id: usize,
    distance: f32,
}

impl Best {
    fn new() -> Self {
        Self { id: 0, distance: f32::INFINITY }
    }

    fn offer(&mut self, id: usize, distance: f32) {
        if distance < self.distance || (distance == self.distance && id < self.id) {
            *self = Self { id, distance };
        }
    }
}

/// 查询最近的聚类中心
pub trait NearestCentroid: Send + Sync {
    /// 返回最近点的序号和距离，`evals` 累加本次查询计算距离的次数
    fn search(&self, query: &[f32], evals: &mut usize) -> (usize, f32);

    /// 索引中的点
    fn points(&self) -> &Points;

    fn nearest(&self, query: &[f32]) -> (usize, f32) {
        self.search(query, &mut 0)
    }

    /// 并行查询多行，结果顺序与输入一致
    fn nearest_batch(&self, queries: ArrayView2<f32>) -> Vec<usize> {
        (0..queries.nrows())
            .into_par_iter()
            .map(|i| {
                let row = queries.row(i);
                match row.as_slice() {
                    Some(q) => self.nearest(q).0,
                    None => self.nearest(&row.to_vec()).0,
                }
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.points().len()
    }

    fn dim(&self) -> usize {
        self.points().dim()
    }
}

/// 索引算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Linear,
    KdTree,
    KMeans,
}

/// 持久化的最近邻索引
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NeighborIndex {
    Linear(LinearIndex),
    KdTree(KdForest),
    KMeans(KMeansTree),
}

#[derive(Serialize, Deserialize)]
struct IndexFile<I> {
    version: u32,
    npoints: usize,
    dim: usize,
    index: I,
}

impl NeighborIndex {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Linear(_) => Algorithm::Linear,
            Self::KdTree(_) => Algorithm::KdTree,
            Self::KMeans(_) => Algorithm::KMeans,
        }
    }

    fn inner(&self) -> &dyn NearestCentroid {
        match self {
            Self::Linear(index) => index,
            Self::KdTree(index) => index,
            Self::KMeans(index) => index,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = IndexFile { version: INDEX_VERSION, npoints: self.len(), dim: self.dim(), index: self };
        write_bytes_atomic(path, &bincode::serialize(&file)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let file: IndexFile<NeighborIndex> = bincode::deserialize_from(reader)?;
        if file.version != INDEX_VERSION {
            return Err(DescriptorError::malformed(path, format!("不支持的索引版本 {}", file.version)));
        }
        if file.npoints != file.index.len() || file.dim != file.index.dim() {
            return Err(DescriptorError::malformed(path, "索引头与内容不一致"));
        }
        Ok(file.index)
    }
}

impl NearestCentroid for NeighborIndex {
    fn search(&self, query: &[f32], evals: &mut usize) -> (usize, f32) {
        self.inner().search(query, evals)
    }

    fn points(&self) -> &Points {
        self.inner().points()
    }
}

/// 索引构建参数和自动调优的结果，保存为 JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexParams {
    pub algorithm: Algorithm,
    pub target_precision: f32,
    pub sample_fraction: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
    pub distance: String,
    /// 每次查询最多计算距离的次数
    pub checks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trees: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branching: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<usize>,
    /// 调优时测得的精度
    pub precision: f32,
    /// 相对暴力搜索的加速比
    pub speedup: f32,
}

impl IndexParams {
    pub fn save(&self, path: &Path) -> Result<()> {
        write_bytes_atomic(path, serde_json::to_string_pretty(self)?.as_bytes())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_points() {
        let points = Points::from_array(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]].view());
        assert_eq!(points.len(), 3);
        assert_eq!(points.row(1), &[3.0, 4.0]);
        assert_eq!(points.select(&[2, 0]).row(0), &[5.0, 6.0]);
        assert_eq!(points.nearest_among(&[3.1, 4.1], 0..3).0, 1);
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sift.index.bin");
        let points = Points::from_array(array![[1.0, 0.0], [0.0, 1.0]].view());
        let index = NeighborIndex::Linear(LinearIndex::new(points));
        index.save(&path).unwrap();

        let loaded = NeighborIndex::load(&path).unwrap();
        assert_eq!(loaded.algorithm(), Algorithm::Linear);
        assert_eq!(loaded.nearest(&[0.1, 0.9]).0, 1);

        std::fs::write(&path, b"junk").unwrap();
        assert!(NeighborIndex::load(&path).is_err());
    }

    #[test]
    fn test_params_json() {
        let params = IndexParams {
            algorithm: Algorithm::KdTree,
            target_precision: 0.9,
            sample_fraction: 0.75,
            random_seed: None,
            distance: DISTANCE_NAME.to_string(),
            checks: 64,
            trees: Some(4),
            branching: None,
            iterations: None,
            precision: 0.93,
            speedup: 12.5,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["algorithm"], "kdtree");
        assert_eq!(json["distance"], "chi_square");
        assert!(json.get("random_seed").is_none());
        assert!(json.get("branching").is_none());
        assert_eq!(serde_json::from_value::<IndexParams>(json).unwrap(), params);
    }
}
