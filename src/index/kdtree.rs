use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::distance::{chi_square, chi_square_term};
use super::{Best, Branch, NearestCentroid, Points};

/// 计算均值和方差时最多使用的点数
const SAMPLE_MEAN: usize = 100;
/// 从方差最大的几个维度中随机选择分割维度
const RAND_DIM: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf(u32),
    Split { dim: u32, value: f32, left: u32, right: u32 },
}

/// 随机 kd 树森林
///
/// 每棵树在方差最大的几个维度中随机选择分割维度，以均值分割。
/// 查询时所有树共享一个优先队列，最多检查 `checks` 个叶子。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdForest {
    points: Points,
    nodes: Vec<Vec<Node>>,
    roots: Vec<u32>,
    checks: usize,
}

impl KdForest {
    pub fn build(points: Points, trees: usize, checks: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut nodes = vec![];
        let mut roots = vec![];
        for _ in 0..trees.max(1) {
            let mut tree = vec![];
            let mut ind: Vec<usize> = (0..points.len()).collect();
            if !ind.is_empty() {
                roots.push(build_node(&points, &mut ind, &mut tree, &mut rng));
            }
            nodes.push(tree);
        }
        Self { points, nodes, roots, checks }
    }

    pub fn set_checks(&mut self, checks: usize) {
        self.checks = checks;
    }

    #[allow(clippy::too_many_arguments)]
    fn descend(
        &self,
        query: &[f32],
        tree: usize,
        mut node: usize,
        bound: f32,
        heap: &mut BinaryHeap<Branch>,
        visited: &mut [bool],
        best: &mut Best,
        checks: &mut usize,
        evals: &mut usize,
    ) {
        loop {
            match self.nodes[tree][node] {
                Node::Leaf(id) => {
                    let id = id as usize;
                    if !visited[id] {
                        visited[id] = true;
                        *checks += 1;
                        *evals += 1;
                        best.offer(id, chi_square(query, self.points.row(id)));
                    }
                    return;
                }
                Node::Split { dim, value, left, right } => {
                    let v = query[dim as usize];
                    let (near, far) = if v < value { (left, right) } else { (right, left) };
                    heap.push(Branch { bound: bound + chi_square_term(v, value), tree, node: far as usize });
                    node = near as usize;
                }
            }
        }
    }
}

fn build_node(points: &Points, ind: &mut [usize], nodes: &mut Vec<Node>, rng: &mut StdRng) -> u32 {
    if ind.len() == 1 {
        nodes.push(Node::Leaf(ind[0] as u32));
        return (nodes.len() - 1) as u32;
    }

    let (dim, value) = choose_split(points, ind, rng);
    let mut lim = 0;
    for j in 0..ind.len() {
        if points.row(ind[j])[dim] < value {
            ind.swap(j, lim);
            lim += 1;
        }
    }
    // 所有点在该维度上都相同，按位置对半分
    if lim == 0 || lim == ind.len() {
        lim = ind.len() / 2;
    }

    let (l, r) = ind.split_at_mut(lim);
    let left = build_node(points, l, nodes, rng);
    let right = build_node(points, r, nodes, rng);
    nodes.push(Node::Split { dim: dim as u32, value, left, right });
    (nodes.len() - 1) as u32
}

fn choose_split(points: &Points, ind: &[usize], rng: &mut StdRng) -> (usize, f32) {
    let d = points.dim();
    let sample = &ind[..ind.len().min(SAMPLE_MEAN)];
    let n = sample.len() as f64;

    let mut mean = vec![0f64; d];
    for &i in sample {
        for (m, &x) in mean.iter_mut().zip(points.row(i)) {
            *m += x as f64;
        }
    }
    mean.iter_mut().for_each(|m| *m /= n);

    let mut var = vec![0f64; d];
    for &i in sample {
        for ((v, &m), &x) in var.iter_mut().zip(&mean).zip(points.row(i)) {
            *v += (x as f64 - m).powi(2);
        }
    }

    let mut dims: Vec<usize> = (0..d).collect();
    dims.sort_by(|&a, &b| var[b].total_cmp(&var[a]).then(a.cmp(&b)));
    let dim = dims[rng.random_range(0..RAND_DIM.min(d).max(1))];
    (dim, mean[dim] as f32)
}

impl NearestCentroid for KdForest {
    fn search(&self, query: &[f32], evals: &mut usize) -> (usize, f32) {
        let mut visited = vec![false; self.points.len()];
        let mut heap = BinaryHeap::new();
        let mut best = Best::new();
        let mut checks = 0;

        for (tree, &root) in self.roots.iter().enumerate() {
            self.descend(query, tree, root as usize, 0.0, &mut heap, &mut visited, &mut best, &mut checks, evals);
        }
        while checks < self.checks {
            let Some(branch) = heap.pop() else { break };
            self.descend(
                query,
                branch.tree,
                branch.node,
                branch.bound,
                &mut heap,
                &mut visited,
                &mut best,
                &mut checks,
                evals,
            );
        }
        (best.id, best.distance)
    }

    fn points(&self) -> &Points {
        &self.points
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    fn random_points(n: usize, d: usize) -> Points {
        let mut rng = StdRng::seed_from_u64(3);
        Points::from_array(Array2::from_shape_fn((n, d), |_| rng.random::<f32>()).view())
    }

    #[test]
    fn test_exact_with_unlimited_checks() {
        let points = random_points(200, 8);
        let forest = KdForest::build(points.clone(), 4, usize::MAX, 0);
        for i in (0..200).step_by(17) {
            assert_eq!(forest.nearest(points.row(i)), (i, 0.0));
        }
    }

    #[test]
    fn test_checks_limit_evals() {
        let points = random_points(500, 8);
        let forest = KdForest::build(points.clone(), 1, 16, 0);
        let mut evals = 0;
        forest.search(points.row(0), &mut evals);
        assert!(evals <= 32, "{evals}");
    }

    #[test]
    fn test_duplicate_points() {
        let points = Points::from_array(Array2::<f32>::ones((10, 3)).view());
        let forest = KdForest::build(points, 2, usize::MAX, 0);
        assert_eq!(forest.nearest(&[1.0, 1.0, 1.0]), (0, 0.0));
    }
}
