/*
 * @Description  : GPU 后端协作者接口
 *
 * 核心只依赖以下四类能力，满足“参数顺序约定”的任何后端都可互换：
 * 1. 由主机数组创建缓冲区（只读/只写/读写）
 * 2. 按位置绑定内核参数
 * 3. 同步执行并等待完成
 * 4. 把缓冲区读回主机数组
 *
 * 上下文（`GpuContext`）是显式句柄，须逐层传入，不存在进程级的隐式上下文。
 */

mod dispatch;
pub mod host;

pub use dispatch::{Arg, Kernel};
pub use host::{HostDevice, HostDeviceConfig};

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use crate::errors::BackendError;
use crate::nn::Activation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFlags {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub u64);

/// 按位置绑定的内核参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(BufferId),
    Int(i32),
}

/// 内核的封闭集合
///
/// 参数顺序：先是缓冲区（最后一个缓冲区为输出），再是整型标量。
/// - Linear：`batch, in, out`
/// - 卷积/反卷积：`batch, in_ch, in_h, in_w, out_ch, out_h, out_w, k_h, k_w, s_h, s_w, p_h, p_w`
///   （反卷积的 s 为 sub-sample，p 为 trim）
///
/// | 内核 | 缓冲区 | 全局工作尺寸 |
/// |------|--------|--------------|
/// | LinearForward | input, weight, bias, output | `[batch, out, 1]` |
/// | LinearBackwardWeight | input, grad_output, grad_weight | `[out, in, 1]` |
/// | LinearBackwardInput | weight, grad_output, grad_input | `[batch, in, 1]` |
/// | Conv2d/Deconv2dForward | input, weight, bias, output | `[batch*out_ch, out_h, out_w]` |
/// | Conv2d/Deconv2dBackwardWeight | input, grad_output, grad_weight | `[out_ch*in_ch, k_h, k_w]` |
/// | Conv2d/Deconv2dBackwardInput | weight, grad_output, grad_input | `[batch*in_ch, in_h, in_w]` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    LinearForward,
    LinearBackwardWeight,
    LinearBackwardInput,
    Conv2dForward,
    Conv2dBackwardWeight,
    Conv2dBackwardInput,
    Deconv2dForward,
    Deconv2dBackwardWeight,
    Deconv2dBackwardInput,
}

impl KernelKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::LinearForward => "linear_forward",
            Self::LinearBackwardWeight => "linear_backward_weight",
            Self::LinearBackwardInput => "linear_backward_input",
            Self::Conv2dForward => "conv2d_forward",
            Self::Conv2dBackwardWeight => "conv2d_backward_weight",
            Self::Conv2dBackwardInput => "conv2d_backward_input",
            Self::Deconv2dForward => "deconv2d_forward",
            Self::Deconv2dBackwardWeight => "deconv2d_backward_weight",
            Self::Deconv2dBackwardInput => "deconv2d_backward_input",
        }
    }

    pub const fn is_forward(&self) -> bool {
        matches!(
            self,
            Self::LinearForward | Self::Conv2dForward | Self::Deconv2dForward
        )
    }

    pub const fn buffer_count(&self) -> usize {
        if self.is_forward() { 4 } else { 3 }
    }

    pub const fn int_count(&self) -> usize {
        match self {
            Self::LinearForward | Self::LinearBackwardWeight | Self::LinearBackwardInput => 3,
            _ => 13,
        }
    }

    pub const fn arity(&self) -> usize {
        self.buffer_count() + self.int_count()
    }

    /// 输出缓冲区的参数位置
    pub const fn output_arg(&self) -> usize {
        self.buffer_count() - 1
    }
}

/// 内核“源码”：内核种类 + 编译期选定的激活变体
///
/// 激活只改变前向内核的最后一步逐元素运算，不改变累加循环；反向内核不接受激活。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelSource {
    pub kind: KernelKind,
    pub activation: Option<Activation>,
}

impl KernelSource {
    pub const fn new(kind: KernelKind) -> Self {
        Self {
            kind,
            activation: None,
        }
    }

    pub const fn with_activation(kind: KernelKind, activation: Option<Activation>) -> Self {
        Self { kind, activation }
    }
}

pub trait ComputeBackend: Send + Sync {
    fn device_name(&self) -> &str;

    /// 由主机数组创建缓冲区（数据被复制到设备）
    fn create_buffer(&self, flags: MemoryFlags, host: &[f32]) -> Result<BufferId, BackendError>;

    /// 编译内核
    fn build_kernel(&self, source: &KernelSource) -> Result<KernelId, BackendError>;

    /// 按位置绑定参数
    fn set_arg(&self, kernel: KernelId, index: usize, arg: KernelArg) -> Result<(), BackendError>;

    /// 执行内核并阻塞等待队列清空
    fn execute_and_wait(&self, kernel: KernelId, global: [usize; 3]) -> Result<(), BackendError>;

    /// 把缓冲区读回主机数组，`out`的长度须与缓冲区一致
    fn read_buffer(&self, buffer: BufferId, out: &mut [f32]) -> Result<(), BackendError>;

    fn release_buffer(&self, buffer: BufferId) -> Result<(), BackendError>;

    fn release_kernel(&self, kernel: KernelId) -> Result<(), BackendError>;
}

/// GPU 上下文句柄（可廉价克隆，多个层共享同一后端）
#[derive(Clone)]
pub struct GpuContext {
    backend: Arc<dyn ComputeBackend>,
}

impl GpuContext {
    pub fn new<B: ComputeBackend + 'static>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// 以默认配置创建一个主机参考设备的上下文
    pub fn host() -> Result<Self, BackendError> {
        Ok(Self::new(HostDevice::new(HostDeviceConfig::default())?))
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    pub fn device_name(&self) -> &str {
        self.backend.device_name()
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("device", &self.device_name())
            .finish()
    }
}
