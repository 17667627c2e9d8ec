use std::collections::BinaryHeap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

use super::distance::chi_square;
use super::{Best, Branch, NearestCentroid, Points};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf(Vec<u32>),
    Inner { centers: Points, children: Vec<u32> },
}

/// 层次 k-means 树
///
/// 每个节点把点聚成 `branching` 类，点数不超过 `branching` 时成为叶子。
/// 查询时沿最近的中心下降，其余分支按到中心的距离进入优先队列。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KMeansTree {
    points: Points,
    nodes: Vec<Node>,
    root: u32,
    checks: usize,
}

impl KMeansTree {
    pub fn build(points: Points, branching: usize, iterations: usize, checks: usize, seed: u64) -> Self {
        let branching = branching.max(2);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut nodes = vec![];
        let ind: Vec<usize> = (0..points.len()).collect();
        let root = build_node(&points, ind, branching, iterations, &mut nodes, &mut rng);
        Self { points, nodes, root, checks }
    }

    pub fn set_checks(&mut self, checks: usize) {
        self.checks = checks;
    }

    #[allow(clippy::too_many_arguments)]
    fn descend(
        &self,
        query: &[f32],
        mut node: usize,
        heap: &mut BinaryHeap<Branch>,
        best: &mut Best,
        checks: &mut usize,
        evals: &mut usize,
    ) {
        loop {
            match &self.nodes[node] {
                Node::Leaf(ids) => {
                    for &id in ids {
                        let id = id as usize;
                        best.offer(id, chi_square(query, self.points.row(id)));
                    }
                    *checks += ids.len();
                    *evals += ids.len();
                    return;
                }
                Node::Inner { centers, children } => {
                    *evals += centers.len();
                    let dists: Vec<f32> = (0..centers.len()).map(|c| chi_square(query, centers.row(c))).collect();
                    let nearest = (0..dists.len()).min_by(|&a, &b| dists[a].total_cmp(&dists[b])).unwrap_or(0);
                    for (c, &child) in children.iter().enumerate() {
                        if c != nearest {
                            heap.push(Branch { bound: dists[c], tree: 0, node: child as usize });
                        }
                    }
                    node = children[nearest] as usize;
                }
            }
        }
    }
}

fn leaf(ind: Vec<usize>, nodes: &mut Vec<Node>) -> u32 {
    nodes.push(Node::Leaf(ind.into_iter().map(|i| i as u32).collect()));
    (nodes.len() - 1) as u32
}

fn nearest_center(point: &[f32], centers: &Points) -> usize {
    let mut best = Best::new();
    for c in 0..centers.len() {
        best.offer(c, chi_square(point, centers.row(c)));
    }
    best.id
}

fn build_node(
    points: &Points,
    ind: Vec<usize>,
    branching: usize,
    iterations: usize,
    nodes: &mut Vec<Node>,
    rng: &mut StdRng,
) -> u32 {
    if ind.len() <= branching {
        return leaf(ind, nodes);
    }

    let d = points.dim();
    let init: Vec<usize> = index::sample(rng, ind.len(), branching).into_iter().map(|i| ind[i]).collect();
    let mut centers = points.select(&init);
    let mut assignment: Vec<usize> = ind.iter().map(|&i| nearest_center(points.row(i), &centers)).collect();

    for _ in 0..iterations {
        let mut sums = vec![0f64; branching * d];
        let mut counts = vec![0usize; branching];
        for (&i, &c) in ind.iter().zip(&assignment) {
            counts[c] += 1;
            for (s, &x) in sums[c * d..(c + 1) * d].iter_mut().zip(points.row(i)) {
                *s += x as f64;
            }
        }
        let mut next = Vec::with_capacity(branching * d);
        for c in 0..branching {
            if counts[c] == 0 {
                // 空簇保留原来的中心
                next.extend_from_slice(centers.row(c));
            } else {
                next.extend(sums[c * d..(c + 1) * d].iter().map(|&s| (s / counts[c] as f64) as f32));
            }
        }
        centers = Points { data: next, dim: d };

        let updated: Vec<usize> = ind.iter().map(|&i| nearest_center(points.row(i), &centers)).collect();
        if updated == assignment {
            break;
        }
        assignment = updated;
    }

    let mut groups = vec![vec![]; branching];
    for (&i, &c) in ind.iter().zip(&assignment) {
        groups[c].push(i);
    }
    let non_empty: Vec<usize> = (0..branching).filter(|&c| !groups[c].is_empty()).collect();
    // 无法继续划分（例如所有点都相同）
    if non_empty.len() <= 1 {
        return leaf(ind, nodes);
    }

    let centers = centers.select(&non_empty);
    let children = non_empty
        .into_iter()
        .map(|c| build_node(points, std::mem::take(&mut groups[c]), branching, iterations, nodes, rng))
        .collect();
    nodes.push(Node::Inner { centers, children });
    (nodes.len() - 1) as u32
}

impl NearestCentroid for KMeansTree {
    fn search(&self, query: &[f32], evals: &mut usize) -> (usize, f32) {
        let mut heap = BinaryHeap::new();
        let mut best = Best::new();
        let mut checks = 0;

        self.descend(query, self.root as usize, &mut heap, &mut best, &mut checks, evals);
        while checks < self.checks {
            let Some(branch) = heap.pop() else { break };
            self.descend(query, branch.node, &mut heap, &mut best, &mut checks, evals);
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
    use rand::Rng;

    use super::*;

    fn random_points(n: usize, d: usize) -> Points {
        let mut rng = StdRng::seed_from_u64(5);
        Points::from_array(Array2::from_shape_fn((n, d), |_| rng.random::<f32>()).view())
    }

    #[test]
    fn test_exact_with_unlimited_checks() {
        let points = random_points(300, 6);
        let tree = KMeansTree::build(points.clone(), 8, 5, usize::MAX, 0);
        for i in (0..300).step_by(23) {
            assert_eq!(tree.nearest(points.row(i)), (i, 0.0));
        }
    }

    #[test]
    fn test_deterministic() {
        let points = random_points(200, 4);
        let a = KMeansTree::build(points.clone(), 4, 3, 32, 9);
        let b = KMeansTree::build(points.clone(), 4, 3, 32, 9);
        for i in 0..20 {
            assert_eq!(a.nearest(points.row(i)), b.nearest(points.row(i)));
        }
    }

    #[test]
    fn test_small_is_leaf() {
        let points = random_points(5, 2);
        let tree = KMeansTree::build(points.clone(), 16, 5, 1, 0);
        let mut evals = 0;
        assert_eq!(tree.search(points.row(3), &mut evals).0, 3);
        assert_eq!(evals, 5);
    }
}
