use log::{debug, info};
use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::{
    Algorithm, DISTANCE_NAME, IndexParams, KMeansTree, KdForest, LinearIndex, NearestCentroid, NeighborIndex, Points,
};

/// 点数少于该值时直接使用暴力搜索
const LINEAR_THRESHOLD: usize = 1000;
const MIN_CHECKS: usize = 16;
const KDTREE_TREES: [usize; 5] = [1, 4, 8, 16, 32];
const KMEANS_BRANCHING: [usize; 3] = [16, 32, 64];
const KMEANS_ITERATIONS: [usize; 2] = [1, 5];
/// 查询点相对原始点的扰动幅度
const JITTER: f32 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub struct AutotuneParams {
    pub target_precision: f32,
    pub sample_fraction: f32,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum Candidate {
    KdTree { trees: usize },
    KMeans { branching: usize, iterations: usize },
}

impl Candidate {
    fn build(self, points: Points, checks: usize, seed: u64) -> NeighborIndex {
        match self {
            Self::KdTree { trees } => NeighborIndex::KdTree(KdForest::build(points, trees, checks, seed)),
            Self::KMeans { branching, iterations } => {
                NeighborIndex::KMeans(KMeansTree::build(points, branching, iterations, checks, seed))
            }
        }
    }

    fn all() -> impl Iterator<Item = Self> {
        let kd = KDTREE_TREES.into_iter().map(|trees| Self::KdTree { trees });
        let km = KMEANS_BRANCHING.into_iter().flat_map(|branching| {
            KMEANS_ITERATIONS.into_iter().map(move |iterations| Self::KMeans { branching, iterations })
        });
        kd.chain(km)
    }
}

fn set_checks(index: &mut NeighborIndex, checks: usize) {
    match index {
        NeighborIndex::Linear(_) => {}
        NeighborIndex::KdTree(forest) => forest.set_checks(checks),
        NeighborIndex::KMeans(tree) => tree.set_checks(checks),
    }
}

/// 一组查询及其精确的最近邻
struct TestSet {
    queries: Vec<Vec<f32>>,
    truth: Vec<usize>,
}

impl TestSet {
    fn new(points: &Points, count: usize, rng: &mut StdRng) -> Self {
        let picks = index::sample(rng, points.len(), count.min(points.len()));
        let queries: Vec<Vec<f32>> = picks
            .into_iter()
            .map(|i| points.row(i).iter().map(|&x| x * (1.0 + JITTER * (rng.random::<f32>() - 0.5))).collect())
            .collect();
        let exact = LinearIndex::new(points.clone());
        let truth = queries.par_iter().map(|q| exact.nearest(q).0).collect();
        Self { queries, truth }
    }

    /// 返回 (精度, 平均每次查询计算距离的次数)
    fn evaluate(&self, index: &dyn NearestCentroid) -> (f32, f32) {
        let results: Vec<(usize, usize)> = self
            .queries
            .par_iter()
            .map(|q| {
                let mut evals = 0;
                let (id, _) = index.search(q, &mut evals);
                (id, evals)
            })
            .collect();
        let correct = results.iter().zip(&self.truth).filter(|((id, _), t)| id == *t).count();
        let evals: usize = results.iter().map(|(_, e)| e).sum();
        let n = self.queries.len().max(1) as f32;
        (correct as f32 / n, evals as f32 / n)
    }
}

/// 逐步加倍 checks，返回第一个达到目标精度的 (checks, 精度, 代价)
fn tune_checks(index: &mut NeighborIndex, tests: &TestSet, target: f32, max_checks: usize) -> Option<(usize, f32, f32)> {
    let mut checks = MIN_CHECKS.min(max_checks);
    loop {
        set_checks(index, checks);
        let (precision, cost) = tests.evaluate(&*index);
        if precision >= target {
            return Some((checks, precision, cost));
        }
        if checks >= max_checks {
            return None;
        }
        checks = (checks * 2).min(max_checks);
    }
}

fn linear_params(n: usize, params: &AutotuneParams) -> IndexParams {
    IndexParams {
        algorithm: Algorithm::Linear,
        target_precision: params.target_precision,
        sample_fraction: params.sample_fraction,
        random_seed: params.seed,
        distance: DISTANCE_NAME.to_string(),
        checks: n,
        trees: None,
        branching: None,
        iterations: None,
        precision: 1.0,
        speedup: 1.0,
    }
}

/// 自动选择索引结构和参数
///
/// 在 `sample_fraction` 比例的点上构建各种候选索引，代价为每次查询计算距离的平均次数，
/// 选出达到目标精度且代价最小的一个，再在全部点上构建。没有候选优于暴力搜索时使用暴力搜索。
pub fn autotune(codebook: ArrayView2<f32>, params: &AutotuneParams) -> (NeighborIndex, IndexParams) {
    let points = Points::from_array(codebook);
    let n = points.len();
    if n < LINEAR_THRESHOLD {
        info!("码本只有 {n} 个中心，使用暴力搜索");
        return (NeighborIndex::Linear(LinearIndex::new(points)), linear_params(n, params));
    }

    let seed = params.seed.unwrap_or_else(|| rand::rng().random());
    let mut rng = StdRng::seed_from_u64(seed);

    let sample_n = ((n as f32 * params.sample_fraction).round() as usize).clamp(1, n);
    let mut sample_idx = index::sample(&mut rng, n, sample_n).into_vec();
    sample_idx.sort_unstable();
    let sample = points.select(&sample_idx);
    let tests = TestSet::new(&sample, (sample_n / 10).clamp(10, 1000), &mut rng);
    info!("使用 {sample_n} 个中心、{} 个查询进行自动调优，目标精度 {}", tests.queries.len(), params.target_precision);

    let mut best: Option<(Candidate, usize, f32, f32)> = None;
    for candidate in Candidate::all() {
        let mut index = candidate.build(sample.clone(), sample_n, seed);
        match tune_checks(&mut index, &tests, params.target_precision, sample_n) {
            Some((checks, precision, cost)) => {
                debug!("{candidate:?}: checks = {checks}, 精度 = {precision:.3}, 代价 = {cost:.1}");
                if cost < sample_n as f32 && best.is_none_or(|b| cost < b.3) {
                    best = Some((candidate, checks, precision, cost));
                }
            }
            None => debug!("{candidate:?}: 无法达到目标精度"),
        }
    }

    let Some((candidate, checks, _, _)) = best else {
        info!("没有比暴力搜索更快的索引，使用暴力搜索");
        return (NeighborIndex::Linear(LinearIndex::new(points)), linear_params(n, params));
    };

    // 采样点越少每次查询需要检查的比例越低，按采样比例放大
    let checks = ((checks as f32 / params.sample_fraction).ceil() as usize).clamp(1, n);
    let index = candidate.build(points.clone(), checks, seed);
    let full_tests = TestSet::new(&points, (n / 10).clamp(10, 1000), &mut rng);
    let (precision, cost) = full_tests.evaluate(&index);
    let speedup = n as f32 / cost.max(1.0);
    info!("选择 {:?}，checks = {checks}，精度 {precision:.3}，加速比 {speedup:.2}", index.algorithm());

    let (trees, branching, iterations) = match candidate {
        Candidate::KdTree { trees } => (Some(trees), None, None),
        Candidate::KMeans { branching, iterations } => (None, Some(branching), Some(iterations)),
    };
    let params = IndexParams {
        algorithm: index.algorithm(),
        target_precision: params.target_precision,
        sample_fraction: params.sample_fraction,
        random_seed: params.seed,
        distance: DISTANCE_NAME.to_string(),
        checks,
        trees,
        branching,
        iterations,
        precision,
        speedup,
    };
    (index, params)
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    fn params() -> AutotuneParams {
        AutotuneParams { target_precision: 0.9, sample_fraction: 0.75, seed: Some(11) }
    }

    #[test]
    fn test_small_codebook_is_linear() {
        let codebook = Array2::<f32>::ones((64, 4));
        let (index, p) = autotune(codebook.view(), &params());
        assert_eq!(index.algorithm(), Algorithm::Linear);
        assert_eq!(p.algorithm, Algorithm::Linear);
        assert_eq!(p.random_seed, Some(11));
    }

    #[test]
    fn test_autotune_deterministic() {
        let mut rng = StdRng::seed_from_u64(1);
        let codebook = Array2::from_shape_fn((1200, 8), |_| rng.random::<f32>());
        let (a, pa) = autotune(codebook.view(), &params());
        let (b, pb) = autotune(codebook.view(), &params());
        assert_eq!(pa, pb);
        assert_eq!(a.len(), 1200);
        for i in (0..1200).step_by(97) {
            let q = codebook.row(i).to_vec();
            assert_eq!(a.nearest(&q), b.nearest(&q));
        }
        if pa.algorithm != Algorithm::Linear {
            assert!(pa.precision > 0.5);
            assert!(pa.checks <= 1200);
        }
    }
}
