/*
 * @Description  : 逐元素激活函数
 *
 * 激活函数集合是封闭的（编译期确定），既可作为 Linear/卷积层融合的最后一步，
 * 也可通过 `ActivationFunction` 作为无参数的独立 Function 放入 FunctionStack。
 * 反向传播一律以“前向输出 y”表达导数，这样融合激活的层无需保留激活前的值。
 */

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::errors::GraphError;
use crate::nn::{Function, FunctionId, Graph, History, TensorId};
use crate::tensor::NdArray;

#[enum_dispatch]
pub trait TraitActivation {
    fn name(&self) -> &'static str;

    fn forward(&self, x: f32) -> f32;

    /// 由上游梯度与前向输出 y 求对输入的梯度
    fn backward(&self, grad: f32, y: f32) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sigmoid;

impl TraitActivation for Sigmoid {
    fn name(&self) -> &'static str {
        "sigmoid"
    }

    fn forward(&self, x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }

    fn backward(&self, grad: f32, y: f32) -> f32 {
        grad * y * (1.0 - y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tanh;

impl TraitActivation for Tanh {
    fn name(&self) -> &'static str {
        "tanh"
    }

    fn forward(&self, x: f32) -> f32 {
        x.tanh()
    }

    fn backward(&self, grad: f32, y: f32) -> f32 {
        grad * (1.0 - y * y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReLU;

impl TraitActivation for ReLU {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn forward(&self, x: f32) -> f32 {
        x.max(0.0)
    }

    fn backward(&self, grad: f32, y: f32) -> f32 {
        if y > 0.0 { grad } else { 0.0 }
    }
}

/// 负半轴斜率须为正，才能由输出符号还原输入符号
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakyReLU {
    pub slope: f32,
}

impl TraitActivation for LeakyReLU {
    fn name(&self) -> &'static str {
        "leaky_relu"
    }

    fn forward(&self, x: f32) -> f32 {
        if x > 0.0 { x } else { self.slope * x }
    }

    fn backward(&self, grad: f32, y: f32) -> f32 {
        if y > 0.0 { grad } else { grad * self.slope }
    }
}

#[enum_dispatch(TraitActivation)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    Sigmoid(Sigmoid),
    Tanh(Tanh),
    ReLU(ReLU),
    LeakyReLU(LeakyReLU),
}

impl Activation {
    pub const fn sigmoid() -> Self {
        Self::Sigmoid(Sigmoid)
    }

    pub const fn tanh() -> Self {
        Self::Tanh(Tanh)
    }

    pub const fn relu() -> Self {
        Self::ReLU(ReLU)
    }

    pub const fn leaky_relu(slope: f32) -> Self {
        Self::LeakyReLU(LeakyReLU { slope })
    }

    /// 原地对整段数据做前向
    pub fn apply(&self, data: &mut [f32]) {
        data.iter_mut().for_each(|x| *x = self.forward(*x));
    }

    /// 由上游梯度与前向输出求对激活前的梯度（新分配）
    pub fn gradient(&self, grad: &[f32], output: &[f32]) -> Vec<f32> {
        grad.iter()
            .zip(output)
            .map(|(&g, &y)| self.backward(g, y))
            .collect()
    }
}

/// 独立的激活函数（无参数 Function）
pub struct ActivationFunction {
    id: FunctionId,
    name: String,
    activation: Activation,
    history: History,
}

impl ActivationFunction {
    pub fn new(activation: Activation, name: &str) -> Self {
        Self {
            id: FunctionId::next(),
            name: name.to_string(),
            activation,
            history: History::new(),
        }
    }

    pub const fn activation(&self) -> Activation {
        self.activation
    }
}

impl Function for ActivationFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> FunctionId {
        self.id
    }

    fn parameters(&self) -> Vec<&NdArray> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut NdArray> {
        Vec::new()
    }

    fn forward(&mut self, graph: &mut Graph, inputs: &[TensorId]) -> Result<Vec<TensorId>, GraphError> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for &input in inputs {
            let x = graph.get(input)?;
            let (shape, batch_count) = (x.shape().to_vec(), x.batch_count());
            let mut data = x.data().to_vec();
            self.activation.apply(&mut data);
            outputs.push(graph.wrap(data, &shape, batch_count, self.id)?);
        }
        self.history.push(graph, inputs, &outputs)?;
        Ok(outputs)
    }

    fn backward(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError> {
        let inputs = self.history.top_matching(graph, outputs)?.inputs.clone();
        for (&input, &output) in inputs.iter().zip(outputs) {
            let y = graph.get(output)?;
            let grad = self.activation.gradient(&y.grad_or_zeros(), y.data());
            graph.accumulate_grad_slice(input, &grad)?;
        }
        self.history.complete(graph)?;
        Ok(())
    }

    fn pending_backward(&self) -> usize {
        self.history.len()
    }

    fn discard(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError> {
        self.history.discard(graph, outputs)
    }

    fn drop_pending(&mut self, graph: &mut Graph) -> Result<(), GraphError> {
        self.history.drop_all(graph)
    }
}
