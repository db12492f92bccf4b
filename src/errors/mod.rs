/*
 * @Description  : 全 crate 统一的错误类型
 *
 * - GraphError：前向/反向/更新过程中的所有错误，均通过 Result 向调用方传播，内部不重试
 * - BackendError：GPU 后端错误，用“错误种类 + 后端状态码”表示，不再是每个状态码一个异常类型
 */

mod backend;

pub use backend::{BackendError, BackendErrorKind};

use crate::nn::TensorId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// 形状与层配置不一致（前向调用时检测，不可恢复）
    #[error("形状不匹配：期望 {expected:?}，实际 {got:?}。{message}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
        message: String,
    },

    #[error("维度不匹配：期望 {expected}，实际 {got}。{message}")]
    DimensionMismatch {
        expected: usize,
        got: usize,
        message: String,
    },

    /// 句柄指向的槽位不存在或已被回收
    #[error("张量{0}不存在（可能已被释放）")]
    TensorNotFound(TensorId),

    /// 仍有消费者尚未完成反向传播，不能释放
    #[error("张量{id}仍有{remaining}个消费者未完成反向传播，不能释放")]
    PendingConsumers { id: TensorId, remaining: usize },

    #[error("无效操作：{0}")]
    InvalidOperation(String),

    #[error("计算错误：{0}")]
    ComputationError(String),

    #[error("读写错误：{0}")]
    Io(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<std::io::Error> for GraphError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
