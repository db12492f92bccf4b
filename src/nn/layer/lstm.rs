/*
 * @Description  : LSTM 层（有状态的循环 Function，仅 CPU 路径）
 *
 * 公式:
 *   i_t = σ(W_xi x_t + W_hi h_{t-1} + b_i)   # 输入门
 *   f_t = σ(W_xf x_t + W_hf h_{t-1} + b_f)   # 遗忘门
 *   g_t = tanh(W_xg x_t + W_hg h_{t-1} + b_g) # 候选细胞
 *   o_t = σ(W_xo x_t + W_ho h_{t-1} + b_o)   # 输出门
 *   c_t = f_t ⊙ c_{t-1} + i_t ⊙ g_t          # 细胞状态
 *   h_t = o_t ⊙ tanh(c_t)                    # 隐藏状态
 *
 * 权重布局：四个门按 i, f, g, o 的顺序纵向拼接
 * - weight_x: [4*hidden, input]
 * - weight_h: [4*hidden, hidden]
 * - bias: [4*hidden]
 *
 * 每次前向调用推进一个时间步并保留该步的门激活；反向须按时间步逆序逐个调用，
 * 对 h_{t-1}、c_{t-1} 的梯度在相邻两次反向调用之间传递。
 * 不同序列之间必须调用 `reset_state`。
 */

use crate::errors::GraphError;
use crate::nn::{Function, FunctionId, Graph, History, Init, TensorId};
use crate::tensor::NdArray;

use super::{rng_from, single_input};

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 一个时间步前向的中间量
#[derive(Debug, Clone)]
struct StepCache {
    x: Vec<f32>,
    h_prev: Vec<f32>,
    c_prev: Vec<f32>,
    /// 四个门的激活值，按样本排布，每个样本 [i, f, g, o] 各 hidden 个
    gates: Vec<f32>,
    tanh_c: Vec<f32>,
}

#[derive(Debug)]
pub struct LSTM {
    id: FunctionId,
    name: String,
    input_size: usize,
    hidden_size: usize,
    weight_x: NdArray,
    weight_h: NdArray,
    bias: NdArray,
    h: Vec<f32>,
    c: Vec<f32>,
    batch: Option<usize>,
    caches: Vec<StepCache>,
    /// 由后一时间步传回的 dL/dh_{t}、dL/dc_{t}
    dh_carry: Vec<f32>,
    dc_carry: Vec<f32>,
    history: History,
}

impl LSTM {
    pub fn new(input_size: usize, hidden_size: usize, name: &str) -> Self {
        Self::with_seed(input_size, hidden_size, None, name)
    }

    pub fn new_seeded(input_size: usize, hidden_size: usize, name: &str, seed: u64) -> Self {
        Self::with_seed(input_size, hidden_size, Some(seed), name)
    }

    fn with_seed(input_size: usize, hidden_size: usize, seed: Option<u64>, name: &str) -> Self {
        let mut rng = rng_from(seed);
        let rows = 4 * hidden_size;
        let weight_x = Init::Xavier.generate(&[rows, input_size], input_size, hidden_size, &mut rng);
        let weight_h = Init::Xavier.generate(&[rows, hidden_size], hidden_size, hidden_size, &mut rng);
        // 遗忘门偏置初始化为 1
        let mut bias = NdArray::new(&[rows], 1);
        bias.data_mut()[hidden_size..2 * hidden_size]
            .iter_mut()
            .for_each(|b| *b = 1.0);
        Self {
            id: FunctionId::next(),
            name: name.to_string(),
            input_size,
            hidden_size,
            weight_x,
            weight_h,
            bias,
            h: Vec::new(),
            c: Vec::new(),
            batch: None,
            caches: Vec::new(),
            dh_carry: Vec::new(),
            dc_carry: Vec::new(),
            history: History::new(),
        }
    }

    pub const fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// 当前隐藏状态 h_t（尚未前向时为空）
    pub fn hidden(&self) -> &[f32] {
        &self.h
    }

    /// 当前细胞状态 c_t
    pub fn cell(&self) -> &[f32] {
        &self.c
    }

    /// 单个时间步的前向，只计算门激活与 tanh(c_t)
    fn step(&self, x: &[f32], h_prev: &[f32], c_prev: &[f32], batch: usize) -> StepCache {
        let (n_in, n_h) = (self.input_size, self.hidden_size);
        let rows = 4 * n_h;
        let (wx, wh, bias) = (self.weight_x.data(), self.weight_h.data(), self.bias.data());
        let mut gates = vec![0.0; batch * rows];
        let mut tanh_c = vec![0.0; batch * n_h];

        for b in 0..batch {
            let xb = &x[b * n_in..(b + 1) * n_in];
            let hb = &h_prev[b * n_h..(b + 1) * n_h];
            let gb = &mut gates[b * rows..(b + 1) * rows];
            for r in 0..rows {
                let mut z = bias[r];
                z += xb.iter().zip(&wx[r * n_in..(r + 1) * n_in]).map(|(a, w)| a * w).sum::<f32>();
                z += hb.iter().zip(&wh[r * n_h..(r + 1) * n_h]).map(|(a, w)| a * w).sum::<f32>();
                gb[r] = if (2 * n_h..3 * n_h).contains(&r) { z.tanh() } else { sigmoid(z) };
            }
            for j in 0..n_h {
                let (i, f, g) = (gb[j], gb[n_h + j], gb[2 * n_h + j]);
                let c = f * c_prev[b * n_h + j] + i * g;
                tanh_c[b * n_h + j] = c.tanh();
            }
        }

        StepCache {
            x: x.to_vec(),
            h_prev: h_prev.to_vec(),
            c_prev: c_prev.to_vec(),
            gates,
            tanh_c,
        }
    }

    fn ensure_state(&mut self, batch: usize) -> Result<(), GraphError> {
        match self.batch {
            Some(current) if current != batch => Err(GraphError::ShapeMismatch {
                expected: vec![current],
                got: vec![batch],
                message: format!("{}在同一序列内的批大小须保持不变（需先 reset_state）", self.name),
            }),
            Some(_) => Ok(()),
            None => {
                self.batch = Some(batch);
                self.h = vec![0.0; batch * self.hidden_size];
                self.c = vec![0.0; batch * self.hidden_size];
                Ok(())
            }
        }
    }
}

impl Function for LSTM {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> FunctionId {
        self.id
    }

    fn parameters(&self) -> Vec<&NdArray> {
        vec![&self.weight_x, &self.weight_h, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut NdArray> {
        vec![&mut self.weight_x, &mut self.weight_h, &mut self.bias]
    }

    fn forward(&mut self, graph: &mut Graph, inputs: &[TensorId]) -> Result<Vec<TensorId>, GraphError> {
        let input = single_input(inputs, &self.name)?;
        let x = graph.get(input)?;
        if x.length() != self.input_size {
            return Err(GraphError::ShapeMismatch {
                expected: vec![self.input_size],
                got: x.shape().to_vec(),
                message: format!("{}的输入长度须为{}", self.name, self.input_size),
            });
        }
        let batch = x.batch_count();
        let x = x.data().to_vec();
        self.ensure_state(batch)?;

        let n_h = self.hidden_size;
        let cache = self.step(&x, &self.h, &self.c, batch);
        let mut h = vec![0.0; batch * n_h];
        let mut c = vec![0.0; batch * n_h];
        for b in 0..batch {
            let gb = &cache.gates[b * 4 * n_h..(b + 1) * 4 * n_h];
            for j in 0..n_h {
                let k = b * n_h + j;
                c[k] = gb[n_h + j] * cache.c_prev[k] + gb[j] * gb[2 * n_h + j];
                h[k] = gb[3 * n_h + j] * cache.tanh_c[k];
            }
        }
        self.h.clone_from(&h);
        self.c = c;
        self.caches.push(cache);

        let output = graph.wrap(h, &[n_h], batch, self.id)?;
        self.history.push(graph, &[input], &[output])?;
        Ok(vec![output])
    }

    fn backward(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError> {
        let input = self.history.top_matching(graph, outputs)?.inputs[0];
        let cache = self.caches.last().ok_or_else(|| {
            GraphError::InvalidOperation(format!("{}的时间步缓存为空（是否在反向前调用了 reset_state？）", self.name))
        })?;
        let y = graph.get(outputs[0])?;
        let (grad_h, batch) = (y.grad_or_zeros(), y.batch_count());

        let (n_in, n_h) = (self.input_size, self.hidden_size);
        let rows = 4 * n_h;
        let (wx, wh) = (self.weight_x.data(), self.weight_h.data());
        if self.dh_carry.len() != grad_h.len() {
            self.dh_carry = vec![0.0; grad_h.len()];
            self.dc_carry = vec![0.0; grad_h.len()];
        }

        let mut dz = vec![0.0; batch * rows];
        let mut dc_prev = vec![0.0; batch * n_h];
        for b in 0..batch {
            let gb = &cache.gates[b * rows..(b + 1) * rows];
            for j in 0..n_h {
                let k = b * n_h + j;
                let (i, f, g, o) = (gb[j], gb[n_h + j], gb[2 * n_h + j], gb[3 * n_h + j]);
                let tc = cache.tanh_c[k];
                let dh = grad_h[k] + self.dh_carry[k];
                let dc = dh * o * (1.0 - tc * tc) + self.dc_carry[k];
                let dzb = &mut dz[b * rows..(b + 1) * rows];
                dzb[j] = dc * g * i * (1.0 - i);
                dzb[n_h + j] = dc * cache.c_prev[k] * f * (1.0 - f);
                dzb[2 * n_h + j] = dc * i * (1.0 - g * g);
                dzb[3 * n_h + j] = dh * tc * o * (1.0 - o);
                dc_prev[k] = dc * f;
            }
        }

        let mut grad_wx = vec![0.0; rows * n_in];
        let mut grad_wh = vec![0.0; rows * n_h];
        let mut grad_b = vec![0.0; rows];
        let mut grad_x = vec![0.0; batch * n_in];
        let mut dh_prev = vec![0.0; batch * n_h];
        for b in 0..batch {
            for r in 0..rows {
                let d = dz[b * rows + r];
                grad_b[r] += d;
                for i in 0..n_in {
                    grad_wx[r * n_in + i] += d * cache.x[b * n_in + i];
                    grad_x[b * n_in + i] += d * wx[r * n_in + i];
                }
                for j in 0..n_h {
                    grad_wh[r * n_h + j] += d * cache.h_prev[b * n_h + j];
                    dh_prev[b * n_h + j] += d * wh[r * n_h + j];
                }
            }
        }

        self.weight_x.accumulate_gradient_slice(&grad_wx)?;
        self.weight_h.accumulate_gradient_slice(&grad_wh)?;
        self.bias.accumulate_gradient_slice(&grad_b)?;
        graph.accumulate_grad_slice(input, &grad_x)?;
        self.history.complete(graph)?;
        self.caches.pop();

        if self.caches.is_empty() {
            // 序列首步已反向完毕，传递的梯度归零
            self.dh_carry.iter_mut().for_each(|v| *v = 0.0);
            self.dc_carry.iter_mut().for_each(|v| *v = 0.0);
        } else {
            self.dh_carry = dh_prev;
            self.dc_carry = dc_prev;
        }
        Ok(())
    }

    fn reset_state(&mut self) {
        self.h.clear();
        self.c.clear();
        self.batch = None;
        self.caches.clear();
        self.dh_carry.clear();
        self.dc_carry.clear();
    }

    fn pending_backward(&self) -> usize {
        self.history.len()
    }

    fn discard(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError> {
        self.history.discard(graph, outputs)?;
        self.caches.pop();
        Ok(())
    }

    fn drop_pending(&mut self, graph: &mut Graph) -> Result<(), GraphError> {
        self.history.drop_all(graph)?;
        self.caches.clear();
        self.dh_carry.clear();
        self.dc_carry.clear();
        Ok(())
    }
}
