/*
 * @Description  : 损失函数
 *
 * 损失函数不是 Function：它只读取最终输出的值，计算标量损失，
 * 并把 ∂L/∂y 直接写入（覆盖）输出张量的 grad，之后即可对 FunctionStack 调用 backward。
 */

use crate::errors::GraphError;
use crate::nn::{Graph, TensorId};
use crate::tensor::NdArray;

pub trait Loss {
    /// 计算全部输出的损失之和，并设置各输出的梯度
    ///
    /// # 参数
    /// - `outputs`: 网络的最终输出
    /// - `targets`: 与`outputs`一一对应的目标值
    ///
    /// # 返回
    /// 各输出损失之和
    fn evaluate(&self, graph: &mut Graph, outputs: &[TensorId], targets: &[NdArray]) -> Result<f32, GraphError> {
        if outputs.len() != targets.len() {
            return Err(GraphError::DimensionMismatch {
                expected: outputs.len(),
                got: targets.len(),
                message: "输出与目标值的个数须相同".to_string(),
            });
        }
        let mut total = 0.0;
        for (&output, target) in outputs.iter().zip(targets) {
            let (loss, grad) = self.loss_and_grad(graph.get(output)?, target)?;
            graph.set_grad(output, &grad)?;
            total += loss;
        }
        Ok(total)
    }

    /// 单个输出的损失及其对输出的梯度
    fn loss_and_grad(&self, output: &NdArray, target: &NdArray) -> Result<(f32, Vec<f32>), GraphError>;
}

/// 均方误差：`L = mean((y - t)²)`，均值取遍全部样本的全部元素
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredError;

impl Loss for MeanSquaredError {
    fn loss_and_grad(&self, output: &NdArray, target: &NdArray) -> Result<(f32, Vec<f32>), GraphError> {
        if output.data().len() != target.data().len() {
            return Err(GraphError::ShapeMismatch {
                expected: output.full_shape(),
                got: target.full_shape(),
                message: "均方误差的目标值须与输出形状一致".to_string(),
            });
        }
        let n = output.data().len().max(1) as f32;
        let mut loss = 0.0;
        let grad = output
            .data()
            .iter()
            .zip(target.data())
            .map(|(&y, &t)| {
                let diff = y - t;
                loss += diff * diff;
                2.0 * diff / n
            })
            .collect();
        Ok((loss / n, grad))
    }
}

/// Softmax + 交叉熵
///
/// 目标值为每个样本一个类别下标（以 f32 存放，形状`[1]`，批大小与输出相同）。
///
/// ## 数值稳定计算
/// ```text
/// softmax(x)_i = exp(x_i - max(x)) / Σ exp(x_j - max(x))
/// L = -mean_b log softmax(x_b)[label_b]
/// ∂L/∂x_b = (softmax(x_b) - onehot(label_b)) / B
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftmaxCrossEntropy;

impl SoftmaxCrossEntropy {
    /// 数值稳定的 softmax
    pub fn softmax(logits: &[f32]) -> Vec<f32> {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        exps.into_iter().map(|e| e / sum).collect()
    }

    fn label_of(value: f32, classes: usize) -> Result<usize, GraphError> {
        let label = value.round();
        if value < 0.0 || label >= classes as f32 || (value - label).abs() > f32::EPSILON {
            return Err(GraphError::ShapeMismatch {
                expected: vec![classes],
                got: vec![label.max(0.0) as usize],
                message: format!("类别下标{value}不在[0, {classes})内"),
            });
        }
        Ok(label as usize)
    }
}

impl Loss for SoftmaxCrossEntropy {
    fn loss_and_grad(&self, output: &NdArray, target: &NdArray) -> Result<(f32, Vec<f32>), GraphError> {
        let (batch, classes) = (output.batch_count(), output.length());
        if target.data().len() != batch {
            return Err(GraphError::ShapeMismatch {
                expected: vec![batch],
                got: target.full_shape(),
                message: "交叉熵的目标值须为每个样本一个类别下标".to_string(),
            });
        }
        let scale = 1.0 / batch.max(1) as f32;
        let mut loss = 0.0;
        let mut grad = Vec::with_capacity(output.data().len());
        for (logits, &target) in output.data().chunks(classes.max(1)).zip(target.data()) {
            let label = Self::label_of(target, classes)?;
            let probs = Self::softmax(logits);
            loss -= probs[label].max(f32::MIN_POSITIVE).ln();
            grad.extend(probs.iter().enumerate().map(|(c, &p)| {
                let onehot = if c == label { 1.0 } else { 0.0 };
                (p - onehot) * scale
            }));
        }
        Ok((loss * scale, grad))
    }
}
