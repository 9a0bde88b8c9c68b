//! # 统计工具
//!
//! 步态特征计算用到的基础统计量（总体标准差）

/// 算术平均值（空序列为 0）
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// 总体标准差（空序列为 0）
pub fn std_dev(values: &[f64]) -> f64 {
    mean_std(values).1
}

/// 同时计算均值和总体标准差
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }

    let avg = mean(values);
    let variance = values
        .iter()
        .map(|&x| {
            let diff = x - avg;
            diff * diff
        })
        .sum::<f64>()
        / values.len() as f64;

    (avg, variance.sqrt())
}

/// 相邻元素差分
pub fn diffs(values: &[usize]) -> Vec<f64> {
    values.windows(2).map(|w| w[1] as f64 - w[0] as f64).collect()
}
