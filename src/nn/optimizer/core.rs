/*
 * @Description  : 优化器：逐参数更新接口及 SGD / MomentumSGD / Adam
 *
 * FunctionStack::update 按参数枚举顺序对每个参数张量调用一次 `update(index, value, grad)`，
 * 之后清零梯度。有状态的优化器以枚举序号保存每个参数的动量。
 */

use std::collections::HashMap;

use crate::errors::GraphError;

/// 优化器核心 trait
pub trait Optimizer {
    /// 一次整体更新开始前调用（Adam 据此推进时间步）
    fn begin_step(&mut self) {}

    /// 更新单个参数
    ///
    /// # 参数
    /// - `index`: 参数在模型中的枚举序号
    /// - `value`: 参数值（原地修改）
    /// - `grad`: 该参数累加好的梯度，与`value`等长
    fn update(&mut self, index: usize, value: &mut [f32], grad: &[f32]) -> Result<(), GraphError>;

    /// 获取学习率
    fn learning_rate(&self) -> f32;

    /// 设置学习率
    fn set_learning_rate(&mut self, lr: f32);

    /// 重置累积状态（如动量）
    fn reset(&mut self);
}

fn check_len(value: &[f32], grad: &[f32]) -> Result<(), GraphError> {
    if value.len() != grad.len() {
        return Err(GraphError::ShapeMismatch {
            expected: vec![value.len()],
            got: vec![grad.len()],
            message: "参数与梯度的长度须一致".to_string(),
        });
    }
    Ok(())
}

/// 取出（必要时新建）某参数的状态缓冲
fn state_for(states: &mut HashMap<usize, Vec<f32>>, index: usize, len: usize) -> &mut Vec<f32> {
    let state = states.entry(index).or_default();
    if state.len() != len {
        *state = vec![0.0; len];
    }
    state
}

/// SGD 优化器
///
/// 随机梯度下降：θ = θ - α * ∇θ
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f32,
}

impl SGD {
    pub const fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for SGD {
    fn update(&mut self, _index: usize, value: &mut [f32], grad: &[f32]) -> Result<(), GraphError> {
        check_len(value, grad)?;
        value
            .iter_mut()
            .zip(grad)
            .for_each(|(w, g)| *w -= self.lr * g);
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn reset(&mut self) {
        // SGD 无状态
    }
}

/// 带动量的 SGD
///
/// - v = μ * v - α * g
/// - θ = θ + v
#[derive(Debug, Clone)]
pub struct MomentumSGD {
    lr: f32,
    momentum: f32,
    /// 速度（按参数枚举序号索引）
    velocity: HashMap<usize, Vec<f32>>,
}

impl MomentumSGD {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocity: HashMap::new(),
        }
    }

    pub const fn momentum(&self) -> f32 {
        self.momentum
    }

    /// 获取指定参数的速度状态
    pub fn get_velocity(&self, index: usize) -> Option<&[f32]> {
        self.velocity.get(&index).map(Vec::as_slice)
    }
}

impl Optimizer for MomentumSGD {
    fn update(&mut self, index: usize, value: &mut [f32], grad: &[f32]) -> Result<(), GraphError> {
        check_len(value, grad)?;
        let v = state_for(&mut self.velocity, index, value.len());
        for ((w, g), v) in value.iter_mut().zip(grad).zip(v.iter_mut()) {
            *v = self.momentum * *v - self.lr * g;
            *w += *v;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }
}

/// Adam 优化器
///
/// Adam: Adaptive Moment Estimation
/// - m = β1 * m + (1 - β1) * g
/// - v = β2 * v + (1 - β2) * g²
/// - θ = θ - α * `m_hat` / (√`v_hat` + ε)
#[derive(Debug, Clone)]
pub struct Adam {
    /// 学习率
    lr: f32,
    /// β1 (一阶矩衰减)
    beta1: f32,
    /// β2 (二阶矩衰减)
    beta2: f32,
    /// 数值稳定项
    epsilon: f32,
    /// 一阶矩估计（按参数枚举序号索引）
    m: HashMap<usize, Vec<f32>>,
    /// 二阶矩估计（按参数枚举序号索引）
    v: HashMap<usize, Vec<f32>>,
    /// 时间步
    t: usize,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self::new_with_config(lr, 0.9, 0.999, 1e-8)
    }

    /// 创建带完整配置的 Adam 优化器
    pub fn new_with_config(lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }
    }

    /// 获取当前时间步
    pub const fn timestep(&self) -> usize {
        self.t
    }
}

impl Optimizer for Adam {
    fn begin_step(&mut self) {
        self.t += 1;
    }

    fn update(&mut self, index: usize, value: &mut [f32], grad: &[f32]) -> Result<(), GraphError> {
        check_len(value, grad)?;
        // 未经 begin_step 直接调用时按第一步处理
        let t = self.t.max(1) as i32;
        let correction1 = 1.0 - self.beta1.powi(t);
        let correction2 = 1.0 - self.beta2.powi(t);

        let m = state_for(&mut self.m, index, value.len());
        let v = state_for(&mut self.v, index, value.len());
        for (((w, g), m), v) in value.iter_mut().zip(grad).zip(m.iter_mut()).zip(v.iter_mut()) {
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *w -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn reset(&mut self) {
        self.m.clear();
        self.v.clear();
        self.t = 0;
    }
}
