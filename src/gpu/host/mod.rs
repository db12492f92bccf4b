/*
 * @Description  : 主机参考设备
 *
 * 在不依赖任何厂商驱动的前提下实现 `ComputeBackend`：
 * 缓冲区就是主机内存，内核按工作项逐个执行（用 rayon 在全局工作尺寸上并行），
 * 错误码沿用 OpenCL 编号。它使 CPU/GPU 双路径的一致性可以在任意机器上验证。
 */

mod kernels;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use log::debug;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{BufferId, ComputeBackend, KernelArg, KernelId, KernelSource, MemoryFlags};
use crate::errors::{BackendError, BackendErrorKind};
use kernels::Invocation;

/// 参考设备的配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceConfig {
    /// 执行内核的工作线程数，0 表示由 rayon 按 CPU 核数决定
    pub worker_threads: usize,
    /// 同时存活的缓冲区上限，超出时返回`OutOfResources`
    pub max_buffers: usize,
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            max_buffers: 1024,
        }
    }
}

struct HostBuffer {
    flags: MemoryFlags,
    data: Vec<f32>,
}

struct HostKernel {
    source: KernelSource,
    args: Vec<Option<KernelArg>>,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    buffers: HashMap<BufferId, HostBuffer>,
    kernels: HashMap<KernelId, HostKernel>,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct HostDevice {
    config: HostDeviceConfig,
    pool: ThreadPool,
    state: Mutex<HostState>,
}

impl HostDevice {
    pub fn new(config: HostDeviceConfig) -> Result<Self, BackendError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .build()
            .map_err(|e| {
                BackendError::new(
                    BackendErrorKind::OutOfResources,
                    format!("无法创建工作线程池：{e}"),
                )
            })?;
        debug!(
            "创建主机参考设备：{}个工作线程，缓冲区上限{}",
            pool.current_num_threads(),
            config.max_buffers
        );
        Ok(Self {
            config,
            pool,
            state: Mutex::new(HostState::default()),
        })
    }

    pub const fn config(&self) -> &HostDeviceConfig {
        &self.config
    }

    /// 当前存活的缓冲区数
    pub fn live_buffers(&self) -> usize {
        self.lock().map(|state| state.buffers.len()).unwrap_or(0)
    }

    /// 当前存活的内核数
    pub fn live_kernels(&self) -> usize {
        self.lock().map(|state| state.kernels.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HostState>, BackendError> {
        self.state.lock().map_err(|_| {
            BackendError::new(BackendErrorKind::Unknown, "设备状态锁已中毒")
        })
    }
}

impl ComputeBackend for HostDevice {
    fn device_name(&self) -> &str {
        "host"
    }

    fn create_buffer(&self, flags: MemoryFlags, host: &[f32]) -> Result<BufferId, BackendError> {
        let mut state = self.lock()?;
        if state.buffers.len() >= self.config.max_buffers {
            return Err(BackendError::new(
                BackendErrorKind::OutOfResources,
                format!("缓冲区数已达上限{}", self.config.max_buffers),
            ));
        }
        let id = BufferId(state.next_id());
        state.buffers.insert(
            id,
            HostBuffer {
                flags,
                data: host.to_vec(),
            },
        );
        Ok(id)
    }

    fn build_kernel(&self, source: &KernelSource) -> Result<KernelId, BackendError> {
        if source.activation.is_some() && !source.kind.is_forward() {
            return Err(BackendError::new(
                BackendErrorKind::BuildProgramFailure,
                format!("反向内核{}不接受激活变体", source.kind.name()),
            ));
        }
        let mut state = self.lock()?;
        let id = KernelId(state.next_id());
        state.kernels.insert(
            id,
            HostKernel {
                source: *source,
                args: vec![None; source.kind.arity()],
            },
        );
        Ok(id)
    }

    fn set_arg(&self, kernel: KernelId, index: usize, arg: KernelArg) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        if let KernelArg::Buffer(buffer) = arg {
            if !state.buffers.contains_key(&buffer) {
                return Err(BackendError::new(
                    BackendErrorKind::InvalidMemObject,
                    format!("缓冲区{buffer:?}不存在"),
                ));
            }
        }
        let host_kernel = state.kernels.get_mut(&kernel).ok_or_else(|| {
            BackendError::new(BackendErrorKind::InvalidKernel, format!("内核{kernel:?}不存在"))
        })?;
        let kind = host_kernel.source.kind;
        let slot = host_kernel.args.get_mut(index).ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::InvalidArgIndex,
                format!("内核{}只有{}个参数，没有第{index}个", kind.name(), kind.arity()),
            )
        })?;
        let expects_buffer = index < kind.buffer_count();
        match (expects_buffer, arg) {
            (true, KernelArg::Buffer(_)) => {}
            (false, KernelArg::Int(value)) if value >= 0 => {}
            _ => {
                return Err(BackendError::new(
                    BackendErrorKind::InvalidArgValue,
                    format!("内核{}第{index}个参数的类型或取值不符：{arg:?}", kind.name()),
                ));
            }
        }
        *slot = Some(arg);
        Ok(())
    }

    fn execute_and_wait(&self, kernel: KernelId, global: [usize; 3]) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        let host_kernel = state.kernels.get(&kernel).ok_or_else(|| {
            BackendError::new(BackendErrorKind::InvalidKernel, format!("内核{kernel:?}不存在"))
        })?;
        let source = host_kernel.source;
        let kind = source.kind;

        let mut buffer_ids = Vec::with_capacity(kind.buffer_count());
        let mut ints = Vec::with_capacity(kind.int_count());
        for (index, arg) in host_kernel.args.iter().enumerate() {
            match arg {
                Some(KernelArg::Buffer(id)) => buffer_ids.push(*id),
                Some(KernelArg::Int(value)) => ints.push(*value as usize),
                None => {
                    return Err(BackendError::new(
                        BackendErrorKind::InvalidKernelArgs,
                        format!("内核{}的第{index}个参数未绑定", kind.name()),
                    ));
                }
            }
        }

        // 输出缓冲区暂时移出，以便与输入缓冲区同时借用
        let output_id = buffer_ids[kind.output_arg()];
        let mut output = state.buffers.remove(&output_id).ok_or_else(|| {
            BackendError::new(BackendErrorKind::InvalidMemObject, "输出缓冲区已被释放")
        })?;

        let result = (|| {
            if output.flags == MemoryFlags::ReadOnly {
                return Err(BackendError::new(
                    BackendErrorKind::InvalidMemObject,
                    "输出缓冲区是只读的",
                ));
            }
            let mut inputs = Vec::with_capacity(kind.buffer_count() - 1);
            for id in &buffer_ids[..kind.output_arg()] {
                let buffer = state.buffers.get(id).ok_or_else(|| {
                    BackendError::new(
                        BackendErrorKind::InvalidMemObject,
                        format!("输入缓冲区{id:?}已被释放"),
                    )
                })?;
                inputs.push(buffer.data.as_slice());
            }
            let invocation = Invocation { inputs, ints };
            kernels::validate(kind, &invocation, output.data.len(), global)?;

            let [_, g1, g2] = global;
            self.pool.install(|| {
                output
                    .data
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(index, out)| {
                        let gid = [index / (g1 * g2), (index / g2) % g1, index % g2];
                        *out = kernels::element(kind, source.activation, &invocation, gid);
                    });
            });
            Ok(())
        })();

        state.buffers.insert(output_id, output);
        result
    }

    fn read_buffer(&self, buffer: BufferId, out: &mut [f32]) -> Result<(), BackendError> {
        let state = self.lock()?;
        let host_buffer = state.buffers.get(&buffer).ok_or_else(|| {
            BackendError::new(BackendErrorKind::InvalidMemObject, format!("缓冲区{buffer:?}不存在"))
        })?;
        if host_buffer.data.len() != out.len() {
            return Err(BackendError::new(
                BackendErrorKind::InvalidArgValue,
                format!(
                    "读回长度{}与缓冲区长度{}不一致",
                    out.len(),
                    host_buffer.data.len()
                ),
            ));
        }
        out.copy_from_slice(&host_buffer.data);
        Ok(())
    }

    fn release_buffer(&self, buffer: BufferId) -> Result<(), BackendError> {
        self.lock()?
            .buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or_else(|| {
                BackendError::new(BackendErrorKind::InvalidMemObject, format!("缓冲区{buffer:?}不存在"))
            })
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<(), BackendError> {
        self.lock()?
            .kernels
            .remove(&kernel)
            .map(|_| ())
            .ok_or_else(|| {
                BackendError::new(BackendErrorKind::InvalidKernel, format!("内核{kernel:?}不存在"))
            })
    }
}
