/*
 * @Description  : 梯度检验：用中心差分求数值梯度，与反向传播得到的解析梯度比较
 */

/// 中心差分求数值梯度
///
/// # 参数
/// - `f`: 以参数值为输入、返回标量的函数
/// - `point`: 求梯度的位置
/// - `eps`: 差分步长（f32 下宜取 1e-3 ~ 1e-2）
///
/// # 返回
/// `[∂f/∂x_0, ∂f/∂x_1, ...]`
pub fn numerical_gradient<F>(mut f: F, point: &[f32], eps: f32) -> Vec<f32>
where
    F: FnMut(&[f32]) -> f32,
{
    let mut perturbed = point.to_vec();
    (0..point.len())
        .map(|i| {
            perturbed[i] = point[i] + eps;
            let f_plus = f(&perturbed);
            perturbed[i] = point[i] - eps;
            let f_minus = f(&perturbed);
            perturbed[i] = point[i];
            (f_plus - f_minus) / (2.0 * eps)
        })
        .collect()
}

/// 两组梯度之间的最大相对误差，分母不小于 1（梯度接近 0 时退化为绝对误差）
pub fn max_relative_error(analytic: &[f32], numeric: &[f32]) -> f32 {
    assert_eq!(analytic.len(), numeric.len(), "两组梯度的长度须相同");
    analytic
        .iter()
        .zip(numeric)
        .map(|(a, n)| (a - n).abs() / a.abs().max(n.abs()).max(1.0))
        .fold(0.0, f32::max)
}

/// 以固定系数对输出加权求和，作为梯度检验用的标量损失：`L = Σ y_i * r_i`，故`∂L/∂y = r`
pub fn weighted_sum(output: &[f32], weights: &[f32]) -> f32 {
    output.iter().zip(weights).map(|(y, r)| y * r).sum()
}
