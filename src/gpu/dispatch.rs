/*
 * @Description  : 各层共用的 GPU 调度胶水
 *
 * 每次调用：分配缓冲区 → 按位置绑定参数 → 执行并等待 → 读回输出 → 释放缓冲区。
 * 相邻两次调用之间不重叠，也不复用设备缓冲区。
 */

use log::{debug, warn};

use super::{BufferId, GpuContext, KernelArg, KernelId, KernelSource, MemoryFlags};
use crate::errors::{BackendError, BackendErrorKind};

/// 一次调用的参数
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    /// 只读输入缓冲区
    Input(&'a [f32]),
    /// 只写输出缓冲区（给出长度）
    Output(usize),
    /// 整型标量
    Int(usize),
}

/// 已编译的内核，随层的生命周期存在，析构时释放
#[derive(Debug)]
pub struct Kernel {
    id: KernelId,
    source: KernelSource,
    context: GpuContext,
}

impl Kernel {
    pub fn build(context: &GpuContext, source: KernelSource) -> Result<Self, BackendError> {
        let id = context.backend().build_kernel(&source)?;
        debug!(
            "在设备{}上编译内核{}（激活：{:?}）",
            context.device_name(),
            source.kind.name(),
            source.activation
        );
        Ok(Self {
            id,
            source,
            context: context.clone(),
        })
    }

    pub const fn source(&self) -> &KernelSource {
        &self.source
    }

    pub const fn context(&self) -> &GpuContext {
        &self.context
    }

    /// 同步执行一次内核，返回输出缓冲区的内容
    ///
    /// 无论成功与否，本次分配的缓冲区都会被释放。
    pub fn launch(&self, args: &[Arg<'_>], global: [usize; 3]) -> Result<Vec<f32>, BackendError> {
        debug!("调度内核{}，全局工作尺寸{global:?}", self.source.kind.name());
        let mut buffers = Vec::with_capacity(args.len());
        let result = self.bind_and_run(args, global, &mut buffers);
        for buffer in buffers {
            if let Err(e) = self.context.backend().release_buffer(buffer) {
                warn!("释放缓冲区{buffer:?}失败：{e}");
            }
        }
        result
    }

    fn bind_and_run(
        &self,
        args: &[Arg<'_>],
        global: [usize; 3],
        buffers: &mut Vec<BufferId>,
    ) -> Result<Vec<f32>, BackendError> {
        let backend = self.context.backend();
        let mut output = None;
        for (index, arg) in args.iter().enumerate() {
            let bound = match *arg {
                Arg::Input(data) => {
                    let buffer = backend.create_buffer(MemoryFlags::ReadOnly, data)?;
                    buffers.push(buffer);
                    KernelArg::Buffer(buffer)
                }
                Arg::Output(len) => {
                    let buffer = backend.create_buffer(MemoryFlags::WriteOnly, &vec![0.0; len])?;
                    buffers.push(buffer);
                    output = Some((buffer, len));
                    KernelArg::Buffer(buffer)
                }
                Arg::Int(value) => KernelArg::Int(to_int(value)?),
            };
            backend.set_arg(self.id, index, bound)?;
        }
        let (buffer, len) = output.ok_or_else(|| {
            BackendError::new(BackendErrorKind::InvalidKernelArgs, "调用缺少输出缓冲区")
        })?;

        backend.execute_and_wait(self.id, global)?;

        let mut host = vec![0.0; len];
        backend.read_buffer(buffer, &mut host)?;
        Ok(host)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Err(e) = self.context.backend().release_kernel(self.id) {
            warn!("释放内核{}失败：{e}", self.source.kind.name());
        }
    }
}

fn to_int(value: usize) -> Result<i32, BackendError> {
    i32::try_from(value).map_err(|_| {
        BackendError::new(
            BackendErrorKind::InvalidArgValue,
            format!("标量参数{value}超出 i32 范围"),
        )
    })
}
