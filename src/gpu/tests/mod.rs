/*
 * @Description  : GPU 协作者接口的单元测试（以主机参考设备为后端）
 */


use std::sync::Arc;

use crate::errors::BackendError;
use crate::gpu::{BufferId, ComputeBackend, HostDevice, HostDeviceConfig, KernelArg, KernelId, KernelSource, MemoryFlags};

/// 与测试共享同一个主机设备，以便在调度前后检查存活的缓冲区与内核
struct SharedDevice(Arc<HostDevice>);

impl ComputeBackend for SharedDevice {
    fn device_name(&self) -> &str {
        self.0.device_name()
    }

    fn create_buffer(&self, flags: MemoryFlags, host: &[f32]) -> Result<BufferId, BackendError> {
        self.0.create_buffer(flags, host)
    }

    fn build_kernel(&self, source: &KernelSource) -> Result<KernelId, BackendError> {
        self.0.build_kernel(source)
    }

    fn set_arg(&self, kernel: KernelId, index: usize, arg: KernelArg) -> Result<(), BackendError> {
        self.0.set_arg(kernel, index, arg)
    }

    fn execute_and_wait(&self, kernel: KernelId, global: [usize; 3]) -> Result<(), BackendError> {
        self.0.execute_and_wait(kernel, global)
    }

    fn read_buffer(&self, buffer: BufferId, out: &mut [f32]) -> Result<(), BackendError> {
        self.0.read_buffer(buffer, out)
    }

    fn release_buffer(&self, buffer: BufferId) -> Result<(), BackendError> {
        self.0.release_buffer(buffer)
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<(), BackendError> {
        self.0.release_kernel(kernel)
    }
}

fn device(max_buffers: usize) -> HostDevice {
    HostDevice::new(HostDeviceConfig {
        worker_threads: 2,
        max_buffers,
    })
    .unwrap()
}
