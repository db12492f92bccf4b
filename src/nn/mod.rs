/*
 * @Description  : 负责神经网络（neural network）的构建
 *
 * 计算图是 Function 组成的线性链（可嵌套为树），张量存放在 `Graph` 竞技场中：
 * 前向时各 Function 产出新张量并记录生产者，反向时按前向的逆序回放。
 */

mod activation;
mod function;
mod function_stack;
mod graph;
mod init;
pub mod layer;
mod loss;
mod model_state;
pub mod optimizer;

pub use crate::errors::GraphError;
pub use activation::{
    Activation, ActivationFunction, LeakyReLU, ReLU, Sigmoid, Tanh, TraitActivation,
};
pub use function::{ForwardRecord, Function, FunctionId, History};
pub use function_stack::FunctionStack;
pub use graph::{Graph, TensorId};
pub use init::Init;
pub use layer::{ConvGeometry, Convolution2D, Deconvolution2D, LSTM, LayerGrads, Linear};
pub use loss::{Loss, MeanSquaredError, SoftmaxCrossEntropy};
pub use model_state::{FunctionSnapshot, ModelSnapshot, ParameterSnapshot};
pub use optimizer::{Adam, MomentumSGD, Optimizer, SGD};

#[cfg(test)]
mod tests;
