/*
 * @Description  : Function（运算单元）的统一契约
 *
 * 一个 Function 有名字、零个或多个可学习参数，以及前向/反向两个入口：
 * - forward：由输入计算输出，输出的 parent 指向本 Function，并登记为输入的消费者
 * - backward：读取输出的 grad，累加（而非覆盖）参数梯度与输入梯度，然后访问输入、释放输出
 *
 * backward 可能对同一参数被调用多次（循环层按时间步逆序反复调用），全零梯度须产生全零更新。
 */

use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::GraphError;
use crate::nn::{Graph, TensorId};
use crate::tensor::NdArray;

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的 Function 编号，作为张量的生产者记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u64);

impl FunctionId {
    pub fn next() -> Self {
        Self(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

pub trait Function {
    fn name(&self) -> &str;

    fn id(&self) -> FunctionId;

    /// 可学习参数（权重在前，偏置在后），顺序即持久化与优化器使用的枚举顺序
    fn parameters(&self) -> Vec<&NdArray>;

    fn parameters_mut(&mut self) -> Vec<&mut NdArray>;

    fn gpu_enabled(&self) -> bool {
        false
    }

    fn forward(&mut self, graph: &mut Graph, inputs: &[TensorId]) -> Result<Vec<TensorId>, GraphError>;

    /// 反向传播：`outputs`须是最近一次尚未反向传播的前向调用的输出
    fn backward(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError>;

    /// 清空循环层等有状态 Function 保留的逐步历史；无状态时为空操作
    fn reset_state(&mut self) {}

    /// 尚未反向传播的前向调用次数
    fn pending_backward(&self) -> usize;

    /// 撤销最近一次前向调用（不计算梯度），`outputs`须是该次调用的输出
    fn discard(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError>;

    /// 放弃所有未反向传播的前向记录（不计算梯度），用于中止的训练步
    fn drop_pending(&mut self, graph: &mut Graph) -> Result<(), GraphError>;

    /// 以外部数据覆盖参数值（持久化加载时使用），形状须一致
    fn set_parameter_values(&mut self, values: &[Vec<f32>]) -> Result<(), GraphError> {
        let name = self.name().to_string();
        let mut params = self.parameters_mut();
        if params.len() != values.len() {
            return Err(GraphError::DimensionMismatch {
                expected: params.len(),
                got: values.len(),
                message: format!("{name}的参数个数不符"),
            });
        }
        for (param, value) in params.iter_mut().zip(values) {
            if param.data().len() != value.len() {
                return Err(GraphError::ShapeMismatch {
                    expected: vec![param.data().len()],
                    got: vec![value.len()],
                    message: format!("{name}的参数（形状{:?}）长度不符", param.shape()),
                });
            }
        }
        for (param, value) in params.into_iter().zip(values) {
            param.data_mut().copy_from_slice(value);
        }
        Ok(())
    }

    fn clear_grads(&mut self) {
        for param in self.parameters_mut() {
            param.clear_grad();
        }
    }
}

/// 一次前向调用的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRecord {
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

/// 前向记录栈：反向传播须按前向的逆序进行
#[derive(Debug, Default)]
pub struct History {
    records: Vec<ForwardRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次前向调用，并登记为各输入的消费者
    pub fn push(
        &mut self,
        graph: &mut Graph,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<(), GraphError> {
        for &input in inputs {
            graph.add_consumer(input)?;
        }
        self.records.push(ForwardRecord {
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        Ok(())
    }

    /// 取栈顶记录并校验：输出须一致，且输出已无未完成的下游消费者
    ///
    /// 记录只在`complete`时出栈，中途失败时调用方可重试或放弃。
    pub fn top_matching(&self, graph: &Graph, outputs: &[TensorId]) -> Result<&ForwardRecord, GraphError> {
        let record = self.records.last().ok_or_else(|| {
            GraphError::InvalidOperation("没有与之对应的前向调用，不能反向传播".to_string())
        })?;
        if record.outputs != outputs {
            return Err(GraphError::InvalidOperation(format!(
                "反向传播须按前向的逆序进行：期望输出{:?}，实际{:?}",
                record.outputs, outputs
            )));
        }
        for &output in outputs {
            let remaining = graph.get(output)?.use_count();
            if remaining > 0 {
                return Err(GraphError::PendingConsumers {
                    id: output,
                    remaining,
                });
            }
        }
        Ok(record)
    }

    /// 栈顶记录出栈：访问输入，释放输出
    pub fn complete(&mut self, graph: &mut Graph) -> Result<ForwardRecord, GraphError> {
        let record = self.records.pop().ok_or_else(|| {
            GraphError::InvalidOperation("前向记录栈为空".to_string())
        })?;
        for &input in &record.inputs {
            graph.visit(input)?;
        }
        for &output in &record.outputs {
            graph.release(output)?;
        }
        Ok(record)
    }

    /// 校验并撤销栈顶记录
    pub fn discard(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError> {
        self.top_matching(graph, outputs)?;
        self.complete(graph)?;
        Ok(())
    }

    /// 逆序放弃全部记录
    pub fn drop_all(&mut self, graph: &mut Graph) -> Result<(), GraphError> {
        while !self.records.is_empty() {
            self.complete(graph)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
