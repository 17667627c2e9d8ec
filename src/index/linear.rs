use serde::{Deserialize, Serialize};

use super::{NearestCentroid, Points};

/// 暴力搜索，结果总是精确的
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearIndex {
    points: Points,
}

impl LinearIndex {
    pub fn new(points: Points) -> Self {
        Self { points }
    }
}

impl NearestCentroid for LinearIndex {
    fn search(&self, query: &[f32], evals: &mut usize) -> (usize, f32) {
        *evals += self.points.len();
        self.points.nearest_among(query, 0..self.points.len())
    }

    fn points(&self) -> &Points {
        &self.points
    }
}
