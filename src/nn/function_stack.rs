/*
 * @Description  : FunctionStack：按顺序组合 Function 的线性计算图
 *
 * - forward：依次调用各 Function，记录每一环的输出
 * - backward：按相反顺序调用各 Function 的 backward（按顺序回放，而非任意拓扑遍历）
 * - update：对每个参数调用优化器，然后清零梯度
 *
 * FunctionStack 本身也实现 Function，因此可以嵌套：对嵌套栈的 backward 会递归进入它自己的逆序回放。
 */

use log::warn;

use crate::errors::GraphError;
use crate::nn::{Function, FunctionId, Graph, Optimizer, TensorId};
use crate::tensor::NdArray;

/// 一次前向调用在各环上的输出
#[derive(Debug, Clone)]
struct StackRecord {
    outputs: Vec<TensorId>,
    chain: Vec<Vec<TensorId>>,
}

pub struct FunctionStack {
    id: FunctionId,
    name: String,
    functions: Vec<Box<dyn Function>>,
    records: Vec<StackRecord>,
}

impl FunctionStack {
    pub fn new(name: &str) -> Self {
        Self {
            id: FunctionId::next(),
            name: name.to_string(),
            functions: Vec::new(),
            records: Vec::new(),
        }
    }

    /// 追加一个 Function（链式构建）
    pub fn with<F: Function + 'static>(mut self, function: F) -> Self {
        self.push(Box::new(function));
        self
    }

    pub fn push(&mut self, function: Box<dyn Function>) {
        self.functions.push(function);
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn functions(&self) -> &[Box<dyn Function>] {
        &self.functions
    }

    pub fn functions_mut(&mut self) -> &mut [Box<dyn Function>] {
        &mut self.functions
    }

    /// 用优化器更新全部参数，然后清零梯度
    ///
    /// # 前置条件
    /// 自上次更新以来的每次前向调用都应已完成反向传播。
    /// 此条件不做强制：仍有未反向的前向记录时只记录一条警告，更新照常进行，
    /// 尚未反向的那部分梯度不会计入本次更新。循环层的截断 BPTT 正是先多次 backward 再一次 update。
    /// 可用 `pending_backward()` 自行检查。
    pub fn update(&mut self, optimizer: &mut dyn Optimizer) -> Result<(), GraphError> {
        let pending = self.pending_backward();
        if pending > 0 {
            warn!(
                "{}仍有{pending}次前向调用尚未反向传播，本次更新不包含其梯度",
                self.name
            );
        }
        optimizer.begin_step();
        for (index, param) in self.parameters_mut().into_iter().enumerate() {
            let (value, grad) = param.data_mut_and_grad();
            optimizer.update(index, value, grad)?;
            param.clear_grad();
        }
        Ok(())
    }

    /// 推理：前向后把结果复制出来（不含回链的叶子张量），并撤销本次前向记录
    pub fn predict(&mut self, graph: &mut Graph, inputs: &[TensorId]) -> Result<Vec<NdArray>, GraphError> {
        let outputs = self.forward(graph, inputs)?;
        let results = outputs
            .iter()
            .map(|&id| {
                let y = graph.get(id)?;
                NdArray::from_batch(y.data(), y.shape(), y.batch_count())
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.discard(graph, &outputs)?;
        Ok(results)
    }

    fn top_matching(&self, outputs: &[TensorId]) -> Result<&StackRecord, GraphError> {
        let record = self.records.last().ok_or_else(|| {
            GraphError::InvalidOperation(format!("{}没有与之对应的前向调用", self.name))
        })?;
        if record.outputs != outputs {
            return Err(GraphError::InvalidOperation(format!(
                "{}的反向传播须按前向的逆序进行：期望输出{:?}，实际{:?}",
                self.name, record.outputs, outputs
            )));
        }
        Ok(record)
    }
}

fn saved_grads(function: &dyn Function) -> Vec<Option<Vec<f32>>> {
    function
        .parameters()
        .iter()
        .map(|param| param.grad().map(<[f32]>::to_vec))
        .collect()
}

fn restore_grads(function: &mut dyn Function, saved: Vec<Option<Vec<f32>>>) {
    for (param, grad) in function.parameters_mut().into_iter().zip(saved) {
        param.replace_grad(grad);
    }
}

impl Function for FunctionStack {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> FunctionId {
        self.id
    }

    fn parameters(&self) -> Vec<&NdArray> {
        self.functions.iter().flat_map(|f| f.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut NdArray> {
        self.functions
            .iter_mut()
            .flat_map(|f| f.parameters_mut())
            .collect()
    }

    fn gpu_enabled(&self) -> bool {
        self.functions.iter().any(|f| f.gpu_enabled())
    }

    /// 依次前向；某一环失败时，之前各环的记录保留，调用方应以`drop_pending`放弃本步
    fn forward(&mut self, graph: &mut Graph, inputs: &[TensorId]) -> Result<Vec<TensorId>, GraphError> {
        let mut current = inputs.to_vec();
        let mut chain = Vec::with_capacity(self.functions.len());
        for function in &mut self.functions {
            current = function.forward(graph, &current)?;
            chain.push(current.clone());
        }
        self.records.push(StackRecord {
            outputs: current.clone(),
            chain,
        });
        Ok(current)
    }

    /// 逆序回放各环的反向传播
    ///
    /// 某一环失败时，该环及已回放各环的参数梯度恢复为本次调用前的值，错误原样返回；
    /// 本步的前向记录无法再反向传播，调用方应以`drop_pending`放弃本步。
    fn backward(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError> {
        let chain = self.top_matching(outputs)?.chain.clone();
        let mut replayed = Vec::with_capacity(chain.len());
        for (index, outputs) in chain.iter().enumerate().rev() {
            let function = &mut self.functions[index];
            let saved = saved_grads(&**function);
            if let Err(e) = function.backward(graph, outputs) {
                replayed.push((index, saved));
                for (index, saved) in replayed {
                    restore_grads(&mut *self.functions[index], saved);
                }
                return Err(e);
            }
            replayed.push((index, saved));
        }
        self.records.pop();
        Ok(())
    }

    fn reset_state(&mut self) {
        for function in &mut self.functions {
            function.reset_state();
        }
    }

    fn pending_backward(&self) -> usize {
        self.records.len()
    }

    fn discard(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError> {
        let chain = self.top_matching(outputs)?.chain.clone();
        for (function, outputs) in self.functions.iter_mut().zip(&chain).rev() {
            function.discard(graph, outputs)?;
        }
        self.records.pop();
        Ok(())
    }

    fn drop_pending(&mut self, graph: &mut Graph) -> Result<(), GraphError> {
        for function in self.functions.iter_mut().rev() {
            function.drop_pending(graph)?;
        }
        self.records.clear();
        Ok(())
    }
}
