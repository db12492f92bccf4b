use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use approx::assert_abs_diff_eq;

use super::{check_gradients, random_array};
use crate::assert_err;
use crate::errors::{BackendError, BackendErrorKind};
use crate::gpu::{
    BufferId, ComputeBackend, GpuContext, HostDevice, HostDeviceConfig, KernelArg, KernelId,
    KernelSource, MemoryFlags,
};
use crate::nn::{Activation, Function, Graph, GraphError, Init, Linear, TraitActivation};
use crate::tensor::NdArray;

#[test]
fn test_linear_forward_values() {
    let mut graph = Graph::new();
    let mut fc = Linear::from_parameters(3, 2, &[1., 0., -1., 2., 1., 0.], Some(&[0.5, -1.0]), "fc")
        .unwrap();
    let x = graph.insert(NdArray::from_batch(&[1., 2., 3., 0., 1., 0.], &[3], 2).unwrap());
    let y = fc.forward(&mut graph, &[x]).unwrap()[0];
    let out = graph.get(y).unwrap();
    assert_eq!(out.shape(), &[2]);
    assert_eq!(out.data(), &[-1.5, 3.0, 0.5, 0.0]);
}

#[test]
fn test_linear_accepts_any_input_shape_with_matching_length() {
    let mut graph = Graph::new();
    let mut fc = Linear::new_seeded(4, 1, true, "fc", 1);
    let x = graph.create(&[2, 2], 3);
    let y = fc.forward(&mut graph, &[x]).unwrap()[0];
    assert_eq!(graph.get(y).unwrap().full_shape(), vec![3, 1]);
}

#[test]
fn test_linear_rejects_wrong_input_length() {
    let mut graph = Graph::new();
    let mut fc = Linear::new_seeded(4, 1, true, "fc", 1);
    let x = graph.create(&[3], 1);
    assert_err!(
        fc.forward(&mut graph, &[x]),
        GraphError::ShapeMismatch([4], [3], "fc的输入长度须为4")
    );
    assert_eq!(fc.pending_backward(), 0);
    assert_err!(
        fc.forward(&mut graph, &[x, x]),
        GraphError::DimensionMismatch { expected: 1, got: 2, .. }
    );
}

#[test]
fn test_linear_seeded_is_reproducible() {
    let a = Linear::new_seeded(5, 3, true, "a", 42);
    let b = Linear::new_seeded(5, 3, true, "b", 42);
    assert!(a.weight().same_values(b.weight()));
    assert_eq!(a.bias().unwrap().data(), &[0.0; 3]);

    let c = Linear::with_init(5, 3, false, Init::Constant(0.25), None, "c");
    assert_eq!(c.weight().data(), &[0.25; 15]);
    assert!(c.bias().is_none());
    assert_eq!(c.parameters().len(), 1);
}

#[test]
fn test_linear_gradients() {
    let input = random_array(&[4], 3, 1);
    let mut fc = Linear::new_seeded(4, 3, true, "fc", 7);
    check_gradients(&mut fc, &input, 1e-2);

    let mut fc = Linear::new_seeded(4, 3, false, "fc", 8).with_activation(Activation::sigmoid());
    check_gradients(&mut fc, &input, 1e-2);

    let mut fc = Linear::new_seeded(4, 2, true, "fc", 9).with_activation(Activation::tanh());
    check_gradients(&mut fc, &input, 1e-2);
}

/// 四种“偏置/激活”组合的结果都等于：无偏置无激活的输出 + 偏置（缺省 0），再激活（缺省恒等）
#[test]
fn test_bias_activation_branches_match_naive_formula() {
    let weight = random_array(&[3 * 4], 1, 2).into_data();
    let bias = [0.3, -0.2, 0.9];
    let x = random_array(&[4], 2, 3);
    let plain = Linear::from_parameters(4, 3, &weight, None, "plain")
        .unwrap()
        .forward_cpu(x.data(), 2);

    for use_bias in [false, true] {
        for activation in [None, Some(Activation::tanh())] {
            let mut fc = Linear::from_parameters(4, 3, &weight, use_bias.then_some(&bias[..]), "fc")
                .unwrap();
            if let Some(act) = activation {
                fc = fc.with_activation(act);
            }
            let got = fc.forward_cpu(x.data(), 2);
            let expected: Vec<f32> = plain
                .iter()
                .enumerate()
                .map(|(i, &v)| {
                    let z = v + if use_bias { bias[i % 3] } else { 0.0 };
                    activation.map_or(z, |act| act.forward(z))
                })
                .collect();
            assert_abs_diff_eq!(got.as_slice(), expected.as_slice(), epsilon = 1e-6);
        }
    }
}

#[test]
fn test_linear_gpu_matches_cpu() {
    let context = GpuContext::host().unwrap();
    let weight = random_array(&[5 * 6], 1, 4).into_data();
    let bias = random_array(&[5], 1, 5).into_data();
    let x = random_array(&[6], 3, 6);
    let grad_out = random_array(&[5], 3, 7);

    let cpu = Linear::from_parameters(6, 5, &weight, Some(&bias), "cpu")
        .unwrap()
        .with_activation(Activation::sigmoid());
    let gpu = Linear::from_parameters(6, 5, &weight, Some(&bias), "gpu")
        .unwrap()
        .with_activation(Activation::sigmoid())
        .with_gpu(&context)
        .unwrap();
    assert!(gpu.gpu_enabled());
    assert!(!cpu.gpu_enabled());

    let y_cpu = cpu.forward_cpu(x.data(), 3);
    let y_gpu = gpu.forward_gpu(x.data(), 3).unwrap();
    assert_abs_diff_eq!(y_cpu.as_slice(), y_gpu.as_slice(), epsilon = 1e-5);

    let g_cpu = cpu.backward_cpu(x.data(), grad_out.data(), 3);
    let g_gpu = gpu.backward_gpu(x.data(), grad_out.data(), 3).unwrap();
    assert_abs_diff_eq!(g_cpu.weight.as_slice(), g_gpu.weight.as_slice(), epsilon = 1e-5);
    assert_abs_diff_eq!(g_cpu.input.as_slice(), g_gpu.input.as_slice(), epsilon = 1e-5);
    assert_abs_diff_eq!(
        g_cpu.bias.unwrap().as_slice(),
        g_gpu.bias.unwrap().as_slice(),
        epsilon = 1e-5
    );
}

#[test]
fn test_linear_cpu_path_refuses_gpu_calls() {
    let fc = Linear::new_seeded(2, 2, true, "fc", 0);
    assert_err!(fc.forward_gpu(&[0.0, 0.0], 1), GraphError::InvalidOperation(_));
}

/// 执行阶段可被“拨动”失败的设备，其余行为委托给主机参考设备
struct FlakyDevice {
    inner: HostDevice,
    fail_execute: Arc<AtomicBool>,
}

impl ComputeBackend for FlakyDevice {
    fn device_name(&self) -> &str {
        "flaky"
    }

    fn create_buffer(&self, flags: MemoryFlags, host: &[f32]) -> Result<BufferId, BackendError> {
        self.inner.create_buffer(flags, host)
    }

    fn build_kernel(&self, source: &KernelSource) -> Result<KernelId, BackendError> {
        self.inner.build_kernel(source)
    }

    fn set_arg(&self, kernel: KernelId, index: usize, arg: KernelArg) -> Result<(), BackendError> {
        self.inner.set_arg(kernel, index, arg)
    }

    fn execute_and_wait(&self, kernel: KernelId, global: [usize; 3]) -> Result<(), BackendError> {
        if self.fail_execute.load(Ordering::SeqCst) {
            return Err(BackendError::from_code(-5, "模拟的资源耗尽"));
        }
        self.inner.execute_and_wait(kernel, global)
    }

    fn read_buffer(&self, buffer: BufferId, out: &mut [f32]) -> Result<(), BackendError> {
        self.inner.read_buffer(buffer, out)
    }

    fn release_buffer(&self, buffer: BufferId) -> Result<(), BackendError> {
        self.inner.release_buffer(buffer)
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<(), BackendError> {
        self.inner.release_kernel(kernel)
    }
}

#[test]
fn test_failed_gpu_backward_leaves_gradients_untouched() {
    let fail = Arc::new(AtomicBool::new(false));
    let context = GpuContext::new(FlakyDevice {
        inner: HostDevice::new(HostDeviceConfig::default()).unwrap(),
        fail_execute: Arc::clone(&fail),
    });
    let mut fc = Linear::new_seeded(3, 2, true, "fc", 3).with_gpu(&context).unwrap();
    let mut graph = Graph::new();
    let x = graph.insert(random_array(&[3], 2, 8));
    let y = fc.forward(&mut graph, &[x]).unwrap()[0];
    graph.set_grad(y, &[1.0; 4]).unwrap();

    fail.store(true, Ordering::SeqCst);
    let result = fc.backward(&mut graph, &[y]);
    assert_err!(
        result,
        GraphError::Backend(e) if e.kind == BackendErrorKind::OutOfResources && e.code == -5
    );
    assert!(fc.weight().grad().is_none());
    assert!(fc.bias().unwrap().grad().is_none());
    assert!(graph.get(x).unwrap().grad().is_none());
    assert_eq!(fc.pending_backward(), 1);

    // 设备恢复后可以重试
    fail.store(false, Ordering::SeqCst);
    fc.backward(&mut graph, &[y]).unwrap();
    assert!(fc.weight().grad().is_some());
    assert_eq!(fc.pending_backward(), 0);
}
