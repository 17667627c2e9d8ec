use ndarray::{Array2, ArrayView2, Axis, concatenate};
use rand::Rng;
use rand::seq::index;

use crate::error::Result;

/// 关键点信息矩阵：x, y, scale, orientation, cornerness
pub type InfoTable = Array2<f64>;
/// 原始描述符矩阵，每行一个局部描述符
pub type DescriptorTable = Array2<f32>;

/// 关键点信息矩阵的列数
pub const INFO_WIDTH: usize = 5;
/// 尚未得到任何结果时使用的描述符宽度
pub const DEFAULT_DESCRIPTOR_WIDTH: usize = 384;

/// 一对逐行对齐的信息矩阵与描述符矩阵
#[derive(Debug, Clone, PartialEq)]
pub struct RawTables {
    pub info: InfoTable,
    pub descriptors: DescriptorTable,
}

impl RawTables {
    pub fn empty(descriptor_width: usize) -> Self {
        Self {
            info: Array2::zeros((0, INFO_WIDTH)),
            descriptors: Array2::zeros((0, descriptor_width)),
        }
    }

    pub fn rows(&self) -> usize {
        self.descriptors.nrows()
    }

    pub fn is_aligned(&self) -> bool {
        self.info.nrows() == self.descriptors.nrows()
    }

    /// 按给定的行号同时选取两个矩阵的对应行
    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            info: self.info.select(Axis(0), rows),
            descriptors: self.descriptors.select(Axis(0), rows),
        }
    }

    /// 行数超过 limit 时随机下采样
    pub fn limit_rows<R: Rng + ?Sized>(self, limit: usize, rng: &mut R) -> Self {
        match subsample_indices(self.rows(), limit, rng) {
            Some(keep) => self.select(&keep),
            None => self,
        }
    }
}

/// 从 `0..rows` 中不放回地随机选取 `limit` 个行号，并升序排列
///
/// 行数不超过 limit 时返回 None，表示保留全部行。
/// 排序保证信息矩阵和描述符矩阵按同样的顺序取行，始终保持对齐。
pub fn subsample_indices<R: Rng + ?Sized>(rows: usize, limit: usize, rng: &mut R) -> Option<Vec<usize>> {
    if rows <= limit {
        return None;
    }
    let mut keep = index::sample(rng, rows, limit).into_vec();
    keep.sort_unstable();
    Some(keep)
}

/// 将多个矩阵纵向拼接，列数必须一致
pub fn vstack<A: Clone>(parts: &[ArrayView2<'_, A>], width: usize) -> Result<Array2<A>> {
    if parts.is_empty() {
        return Ok(Array2::from_shape_vec((0, width), vec![])?);
    }
    Ok(concatenate(Axis(0), parts)?)
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn test_subsample_sorted_unique() {
        let mut rng = StdRng::seed_from_u64(7);
        let keep = subsample_indices(2000, 400, &mut rng).unwrap();
        assert_eq!(keep.len(), 400);
        assert!(keep.windows(2).all(|w| w[0] < w[1]));
        assert!(keep.iter().all(|&i| i < 2000));

        assert!(subsample_indices(100, 400, &mut rng).is_none());
        assert!(subsample_indices(400, 400, &mut rng).is_none());
    }

    #[test]
    fn test_subsample_deterministic() {
        let a = subsample_indices(1000, 10, &mut StdRng::seed_from_u64(1));
        let b = subsample_indices(1000, 10, &mut StdRng::seed_from_u64(1));
        assert_eq!(a, b);
    }

    #[test]
    fn test_limit_rows_keeps_pairs() {
        let rows = 50;
        let info = Array2::from_shape_fn((rows, INFO_WIDTH), |(i, _)| i as f64);
        let descriptors = Array2::from_shape_fn((rows, 3), |(i, j)| (i * 10 + j) as f32);
        let tables = RawTables { info, descriptors };

        let limited = tables.limit_rows(8, &mut StdRng::seed_from_u64(3));
        assert_eq!(limited.rows(), 8);
        assert!(limited.is_aligned());
        for (i, d) in limited.info.outer_iter().zip(limited.descriptors.outer_iter()) {
            assert_eq!(i[0] as f32 * 10.0, d[0]);
        }
    }

    #[test]
    fn test_vstack() {
        let a = array![[1.0f32, 2.0]];
        let b = array![[3.0f32, 4.0], [5.0, 6.0]];
        let c = vstack(&[a.view(), b.view()], 2).unwrap();
        assert_eq!(c, array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        assert_eq!(vstack::<f32>(&[], 7).unwrap().dim(), (0, 7));
    }
}
