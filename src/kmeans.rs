use kmeans::{EuclideanDistance, KMeans, KMeansConfig};
use log::{debug, info};
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::error::{DescriptorError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansParams {
    /// 聚类中心数量
    pub k: usize,
    /// 最大迭代轮数，每轮约处理一遍全部数据
    pub max_iter: usize,
    /// 每个批次的样本数量
    pub batch_size: usize,
    /// 随机种子，固定后结果完全可复现
    pub seed: Option<u64>,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self { k: 1024, max_iter: 100, batch_size: 1024, seed: None }
    }
}

#[derive(Debug, Clone)]
pub struct KMeansState {
    /// 聚类中心，k 行
    pub centroids: Array2<f32>,
    /// 每个聚类中心包含的向量数量
    pub centroid_frequency: Vec<usize>,
    /// 所有向量到最近中心的距离平方和
    pub inertia: f64,
}

pub fn imbalance_factor(hist: &[usize]) -> f32 {
    let (mut tot, mut uf) = (0.0, 0.0);
    for h in hist {
        let h = *h as f32;
        tot += h;
        uf += h.powf(2.0);
    }
    if tot == 0.0 {
        return 0.0;
    }
    uf * hist.len() as f32 / tot.powf(2.0)
}

fn sq_euclidean(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// 返回最近的聚类中心序号及距离平方，距离相同时取序号较小者
fn nearest(point: ArrayView1<f32>, centroids: ArrayView2<f32>) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (j, c) in centroids.outer_iter().enumerate() {
        let d = sq_euclidean(point, c);
        if d < best.1 {
            best = (j, d);
        }
    }
    best
}

/// 小批量 k-means 聚类
///
/// 每轮迭代约处理一遍全部数据，所以实际的批次数为 `max_iter * ceil(n / batch_size)`。
/// 聚类结束后再对全部数据分配一次，统计每个中心的向量数量和总距离。
pub fn minibatch_kmeans(data: ArrayView2<f32>, params: &KMeansParams) -> Result<KMeansState> {
    let (n, d) = data.dim();
    let k = params.k;
    if k == 0 || n < k {
        return Err(DescriptorError::TooFewSamples { samples: n, k });
    }

    let batch_size = params.batch_size.clamp(1, n);
    let batches = params.max_iter.max(1) * n.div_ceil(batch_size);
    info!("对 {n} 组向量进行小批量聚类，中心点数量 = {k}，维度 = {d}，批次 = {batches}");

    let samples: Vec<f32> = data.iter().copied().collect();
    let km: KMeans<_, 8, _> = KMeans::new(&samples, n, d, EuclideanDistance);

    let init_done = |_s: &kmeans::KMeansState<f32>| info!("KMeans 初始化完成");
    let iteration_done = |s: &kmeans::KMeansState<f32>, nr: usize, new_distsum: f32| {
        let line = format!(
            "第 {} 批 - 不平衡度：{:.2} | 距离和变化：{:+.2}",
            nr,
            imbalance_factor(&s.centroid_frequency),
            new_distsum - s.distsum
        );
        match nr % 100 {
            0 => info!("{line}"),
            _ => debug!("{line}"),
        }
    };
    let mut conf = KMeansConfig::build().init_done(&init_done).iteration_done(&iteration_done);
    if let Some(seed) = params.seed {
        conf = conf.random_generator(<rand08::rngs::StdRng as rand08::SeedableRng>::seed_from_u64(seed));
    }
    let conf = conf.build();

    // NOTE: init_kmeanplusplus 在所有样本重合时会 panic
    let result = km.kmeans_minibatch(batch_size, k, batches, KMeans::init_random_sample, &conf);

    let flat_centroids = result.centroids.to_vec();
    let stride = flat_centroids.len() / k;
    let centroids = Array2::from_shape_fn((k, d), |(i, j)| flat_centroids[i * stride + j]);

    let assignments: Vec<(usize, f32)> =
        (0..n).into_par_iter().map(|i| nearest(data.row(i), centroids.view())).collect();
    let mut centroid_frequency = vec![0; k];
    for &(c, _) in &assignments {
        centroid_frequency[c] += 1;
    }
    let inertia = assignments.iter().map(|&(_, d)| d as f64).sum();
    info!(
        "聚类完成，总距离：{inertia:.2}，不平衡度：{:.2}，空中心：{}",
        imbalance_factor(&centroid_frequency),
        centroid_frequency.iter().filter(|&&f| f == 0).count()
    );

    Ok(KMeansState { centroids, centroid_frequency, inertia })
}

/// 返回每个点所属的聚类中心序号
pub fn predict(data: ArrayView2<f32>, centroids: ArrayView2<f32>) -> Vec<usize> {
    (0..data.nrows()).into_par_iter().map(|i| nearest(data.row(i), centroids).0).collect()
}
