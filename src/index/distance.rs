/// 卡方距离：`sum((a - b)^2 / (a + b))`，跳过 `a + b <= 0` 的分量
pub fn chi_square(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| chi_square_term(x, y)).sum()
}

/// 单个分量上的卡方距离，也用作树索引中到分割面的距离下界
#[inline]
pub fn chi_square_term(x: f32, y: f32) -> f32 {
    let sum = x + y;
    if sum > 0.0 {
        let diff = x - y;
        diff * diff / sum
    } else {
        0.0
    }
}
