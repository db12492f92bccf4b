/*
 * @Description  : NdArray：带梯度缓冲与生产者回链的张量
 *
 * - `data`：扁平值缓冲，长度恒为 `length * batch_count`（通道优先的紧凑排布）
 * - `grad`：首次累加时才分配，分配后与 `data` 等长
 * - `shape`：单个样本的形状（不含 batch 维）
 * - `parent`：产生本张量的 Function（叶子节点——输入与参数——为 None）
 * - `use_count`：尚未完成反向传播的消费者数量
 */

use rand::Rng;
use rand::distributions::{Distribution, Uniform};

use crate::errors::GraphError;
use crate::nn::FunctionId;

mod print;
mod property;
mod shape;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    data: Vec<f32>,
    grad: Option<Vec<f32>>,
    shape: Vec<usize>,
    batch_count: usize,
    length: usize,
    parent: Option<FunctionId>,
    use_count: usize,
}

impl NdArray {
    /// 创建全零张量（叶子节点）
    ///
    /// `shape`为单个样本的形状，如图像为`[C, H, W]`，向量为`[n]`
    pub fn new(shape: &[usize], batch_count: usize) -> Self {
        let length = shape.iter().product::<usize>();
        Self {
            data: vec![0.0; length * batch_count],
            grad: None,
            shape: shape.to_vec(),
            batch_count,
            length,
            parent: None,
            use_count: 0,
        }
    }

    /// 由已有数据创建单样本张量（会复制数据）
    pub fn from_data(data: &[f32], shape: &[usize]) -> Result<Self, GraphError> {
        Self::wrap(data.to_vec(), shape, 1, None)
    }

    /// 由已有数据创建多样本张量（会复制数据），`data`按样本依次紧凑排布
    pub fn from_batch(data: &[f32], shape: &[usize], batch_count: usize) -> Result<Self, GraphError> {
        Self::wrap(data.to_vec(), shape, batch_count, None)
    }

    /// 直接接管已有缓冲区（不复制），并设置其生产者
    pub fn wrap(
        buffer: Vec<f32>,
        shape: &[usize],
        batch_count: usize,
        parent: Option<FunctionId>,
    ) -> Result<Self, GraphError> {
        let length = shape.iter().product::<usize>();
        if buffer.len() != length * batch_count {
            return Err(GraphError::ShapeMismatch {
                expected: vec![length * batch_count],
                got: vec![buffer.len()],
                message: format!(
                    "缓冲区长度须等于单样本长度{length}×批大小{batch_count}（形状{shape:?}）"
                ),
            });
        }
        Ok(Self {
            data: buffer,
            grad: None,
            shape: shape.to_vec(),
            batch_count,
            length,
            parent,
            use_count: 0,
        })
    }

    /// 创建一个服从正态分布的随机张量（Box-Muller 变换）
    pub fn normal_with_rng<R: Rng + ?Sized>(
        mean: f32,
        std_dev: f32,
        shape: &[usize],
        rng: &mut R,
    ) -> Self {
        let mut array = Self::new(shape, 1);
        let data_len = array.data.len();
        let unit = Uniform::new(f32::EPSILON, 1.0);
        let mut data = Vec::with_capacity(data_len);

        while data.len() < data_len {
            let u1: f32 = unit.sample(rng);
            let u2: f32 = unit.sample(rng);
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            let z0 = mean + std_dev * r * theta.cos();
            let z1 = mean + std_dev * r * theta.sin();

            if z0.is_finite() {
                data.push(z0);
            }
            if data.len() < data_len && z1.is_finite() {
                data.push(z1);
            }
        }

        array.data = data;
        array
    }

    /// 创建一个随机张量，其值在[min, max]的闭区间
    pub fn uniform_with_rng<R: Rng + ?Sized>(min: f32, max: f32, shape: &[usize], rng: &mut R) -> Self {
        let mut array = Self::new(shape, 1);
        let dist = Uniform::from(min..=max);
        array.data.iter_mut().for_each(|x| *x = dist.sample(rng));
        array
    }
}

/*↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓梯度↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓*/
impl NdArray {
    pub fn grad(&self) -> Option<&[f32]> {
        self.grad.as_deref()
    }

    /// 获取可写的梯度缓冲（未分配时以全零分配）
    pub fn grad_mut(&mut self) -> &mut [f32] {
        let len = self.data.len();
        self.grad.get_or_insert_with(|| vec![0.0; len])
    }

    /// 同时借出可写的值与只读的梯度（梯度未分配时以全零分配），供优化器更新参数
    pub fn data_mut_and_grad(&mut self) -> (&mut [f32], &[f32]) {
        let len = self.data.len();
        let grad = self.grad.get_or_insert_with(|| vec![0.0; len]);
        (&mut self.data, grad)
    }

    /// 累加梯度：`grad[index] += value`
    ///
    /// 加法满足交换律，多个消费者以任意顺序累加的结果一致
    pub fn accumulate_gradient(&mut self, index: usize, value: f32) -> Result<(), GraphError> {
        let len = self.data.len();
        if index >= len {
            return Err(GraphError::ShapeMismatch {
                expected: vec![len],
                got: vec![index],
                message: "梯度下标越界".to_string(),
            });
        }
        self.grad_mut()[index] += value;
        Ok(())
    }

    /// 逐元素累加一整段梯度
    pub fn accumulate_gradient_slice(&mut self, values: &[f32]) -> Result<(), GraphError> {
        if values.len() != self.data.len() {
            return Err(GraphError::ShapeMismatch {
                expected: vec![self.data.len()],
                got: vec![values.len()],
                message: format!("累加到形状{:?}的梯度长度不符", self.shape),
            });
        }
        self.grad_mut()
            .iter_mut()
            .zip(values)
            .for_each(|(g, v)| *g += v);
        Ok(())
    }

    /// 梯度清零（未分配时保持未分配）
    pub fn clear_grad(&mut self) {
        if let Some(grad) = self.grad.as_mut() {
            grad.iter_mut().for_each(|g| *g = 0.0);
        }
    }

    /// 整体替换梯度缓冲（含未分配状态），用于撤销一次未完成的反向传播
    pub(crate) fn replace_grad(&mut self, grad: Option<Vec<f32>>) {
        self.grad = grad;
    }

    /// 取出梯度；未分配时返回全零
    pub fn grad_or_zeros(&self) -> Vec<f32> {
        self.grad
            .clone()
            .unwrap_or_else(|| vec![0.0; self.data.len()])
    }
}
/*↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑梯度↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑*/

/*↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓计算图相关↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓*/
impl NdArray {
    pub const fn parent(&self) -> Option<FunctionId> {
        self.parent
    }

    /// 无生产者即为叶子（输入或参数），不参与按引用计数的释放
    pub const fn is_leaf(&self) -> bool {
        self.parent.is_none()
    }

    pub const fn use_count(&self) -> usize {
        self.use_count
    }

    pub(crate) fn add_use(&mut self) {
        self.use_count += 1;
    }

    /// 一个消费者完成反向传播，返回剩余的消费者数
    pub(crate) fn finish_use(&mut self) -> Result<usize, GraphError> {
        self.use_count = self.use_count.checked_sub(1).ok_or_else(|| {
            GraphError::InvalidOperation(
                "张量的消费者计数已为0，反向传播次数多于前向传播次数".to_string(),
            )
        })?;
        Ok(self.use_count)
    }
}
/*↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑计算图相关↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑*/
