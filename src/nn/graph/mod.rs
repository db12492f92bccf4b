/*
 * @Description  : 张量竞技场（arena）
 *
 * 所有参与前向/反向传播的中间张量都存放在 Graph 的槽位里，按 `TensorId` 寻址。
 * - 张量的生产者以 `FunctionId` 记录（叶子节点为 None），不存在指针环
 * - 消费者计数（use_count）归零后，非叶子张量才可被释放；释放即回收槽位
 * - 回收后槽位的“代数”（generation）加一，旧句柄随即失效，访问时返回 `TensorNotFound`
 */

mod tensor_id;

pub use tensor_id::TensorId;

use log::trace;

use crate::errors::GraphError;
use crate::nn::FunctionId;
use crate::tensor::NdArray;

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    array: Option<NdArray>,
}

#[derive(Debug, Default)]
pub struct Graph {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

// ========== 基础 ==========
impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建全零的叶子张量
    pub fn create(&mut self, shape: &[usize], batch_count: usize) -> TensorId {
        self.insert(NdArray::new(shape, batch_count))
    }

    /// 放入一个现成的张量
    pub fn insert(&mut self, array: NdArray) -> TensorId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.array = Some(array);
            TensorId::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                array: Some(array),
            });
            TensorId::new(index, 0)
        }
    }

    /// 接管缓冲区（不复制）并记录生产者，供各 Function 的前向传播产出结果
    pub fn wrap(
        &mut self,
        buffer: Vec<f32>,
        shape: &[usize],
        batch_count: usize,
        producer: FunctionId,
    ) -> Result<TensorId, GraphError> {
        let array = NdArray::wrap(buffer, shape, batch_count, Some(producer))?;
        Ok(self.insert(array))
    }

    pub fn get(&self, id: TensorId) -> Result<&NdArray, GraphError> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.array.as_ref())
            .ok_or(GraphError::TensorNotFound(id))
    }

    pub fn get_mut(&mut self, id: TensorId) -> Result<&mut NdArray, GraphError> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.array.as_mut())
            .ok_or(GraphError::TensorNotFound(id))
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.get(id).is_ok()
    }

    /// 当前存活的张量数
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

// ========== 梯度 ==========
impl Graph {
    pub fn accumulate_grad(&mut self, id: TensorId, index: usize, value: f32) -> Result<(), GraphError> {
        self.get_mut(id)?.accumulate_gradient(index, value)
    }

    pub fn accumulate_grad_slice(&mut self, id: TensorId, values: &[f32]) -> Result<(), GraphError> {
        self.get_mut(id)?.accumulate_gradient_slice(values)
    }

    /// 直接设定梯度（通常由损失函数对最终输出调用）
    pub fn set_grad(&mut self, id: TensorId, values: &[f32]) -> Result<(), GraphError> {
        let array = self.get_mut(id)?;
        array.clear_grad();
        array.accumulate_gradient_slice(values)
    }

    pub fn zero_grad(&mut self, id: TensorId) -> Result<(), GraphError> {
        self.get_mut(id)?.clear_grad();
        Ok(())
    }
}

// ========== 消费者计数与释放 ==========
impl Graph {
    /// 登记一个消费者（前向传播时由消费该张量的 Function 调用）
    pub fn add_consumer(&mut self, id: TensorId) -> Result<(), GraphError> {
        self.get_mut(id)?.add_use();
        Ok(())
    }

    /// 一个消费者完成了反向传播，返回剩余消费者数
    pub fn visit(&mut self, id: TensorId) -> Result<usize, GraphError> {
        self.get_mut(id)?.finish_use()
    }

    /// 释放张量并回收槽位
    ///
    /// # 返回
    /// - 叶子节点：空操作，返回`Ok(false)`
    /// - 仍有消费者未访问：`PendingConsumers`错误
    /// - 其余：回收槽位，返回`Ok(true)`
    pub fn release(&mut self, id: TensorId) -> Result<bool, GraphError> {
        let array = self.get(id)?;
        if array.is_leaf() {
            return Ok(false);
        }
        if array.use_count() > 0 {
            return Err(GraphError::PendingConsumers {
                id,
                remaining: array.use_count(),
            });
        }
        self.reclaim(id);
        Ok(true)
    }

    /// 由调用方取走张量（通常是用完的输入叶子）；仍被消费时不可取走
    pub fn take(&mut self, id: TensorId) -> Result<NdArray, GraphError> {
        let remaining = self.get(id)?.use_count();
        if remaining > 0 {
            return Err(GraphError::PendingConsumers { id, remaining });
        }
        self.reclaim(id)
            .ok_or(GraphError::TensorNotFound(id))
    }

    fn reclaim(&mut self, id: TensorId) -> Option<NdArray> {
        let slot = &mut self.slots[id.index() as usize];
        let array = slot.array.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        trace!("回收张量槽位{id}，新代数{}", slot.generation);
        array
    }
}
