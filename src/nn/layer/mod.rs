/*
 * @Description  : 带参数的层（Linear / Convolution2D / Deconvolution2D / LSTM）
 *
 * 数值层都实现两遍：CPU 参考循环，以及向 GPU 内核的调度。两条路径的结果须在浮点误差内一致。
 */

mod conv2d;
mod deconv2d;
mod geometry;
mod linear;
mod lstm;

pub use conv2d::Convolution2D;
pub use deconv2d::Deconvolution2D;
pub use geometry::ConvGeometry;
pub use linear::Linear;
pub use lstm::LSTM;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::errors::GraphError;
use crate::nn::{Activation, Graph, TensorId, TraitActivation};
use crate::tensor::NdArray;

/// 一次反向传播得到的全部梯度（先暂存，全部算完后再一次性累加）
#[derive(Debug, Clone, PartialEq)]
pub struct LayerGrads {
    pub weight: Vec<f32>,
    pub bias: Option<Vec<f32>>,
    pub input: Vec<f32>,
}

impl LayerGrads {
    /// 累加到参数与输入的梯度上
    fn commit(
        self,
        weight: &mut NdArray,
        bias: Option<&mut NdArray>,
        graph: &mut Graph,
        input: TensorId,
    ) -> Result<(), GraphError> {
        weight.accumulate_gradient_slice(&self.weight)?;
        if let (Some(bias), Some(grad)) = (bias, self.bias.as_deref()) {
            bias.accumulate_gradient_slice(grad)?;
        }
        graph.accumulate_grad_slice(input, &self.input)
    }
}

/// 层只接受单个输入
fn single_input(inputs: &[TensorId], name: &str) -> Result<TensorId, GraphError> {
    match inputs {
        [input] => Ok(*input),
        _ => Err(GraphError::DimensionMismatch {
            expected: 1,
            got: inputs.len(),
            message: format!("{name}只接受一个输入"),
        }),
    }
}

/// 读取输出梯度；若层带激活，先逐点乘上激活的导数
fn output_gradient(
    graph: &Graph,
    output: TensorId,
    activation: Option<Activation>,
) -> Result<Vec<f32>, GraphError> {
    let y = graph.get(output)?;
    let grad = y.grad_or_zeros();
    Ok(match activation {
        Some(act) => act.gradient(&grad, y.data()),
        None => grad,
    })
}

/// 按通道加偏置并做激活
///
/// 每一支的结果都与“先加偏置（缺省为 0）再激活（缺省为恒等）”相同。
fn finish_outputs(
    output: &mut [f32],
    plane: usize,
    channels: usize,
    bias: Option<&[f32]>,
    activation: Option<Activation>,
) {
    let channel_of = |index: usize| (index / plane) % channels;
    match (bias, activation) {
        (Some(bias), Some(act)) => {
            for (index, v) in output.iter_mut().enumerate() {
                *v = act.forward(*v + bias[channel_of(index)]);
            }
        }
        (Some(bias), None) => {
            for (index, v) in output.iter_mut().enumerate() {
                *v += bias[channel_of(index)];
            }
        }
        (None, Some(act)) => {
            for v in output.iter_mut() {
                *v = act.forward(*v);
            }
        }
        (None, None) => {}
    }
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// GPU 路径没有偏置时传入的全零偏置
fn bias_or_zeros(bias: Option<&NdArray>, channels: usize) -> Vec<f32> {
    bias.map_or_else(|| vec![0.0; channels], |b| b.data().to_vec())
}
