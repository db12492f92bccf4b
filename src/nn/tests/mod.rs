/*
 * @Description  : nn 模块的单元测试及共用的梯度检验工具
 */

mod graph;
mod layer_deconv2d;
mod layer_linear;
mod layer_lstm;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::nn::{Function, Graph};
use crate::tensor::NdArray;
use crate::utils::grad_check::{max_relative_error, numerical_gradient, weighted_sum};

/// 固定种子的 [-1, 1] 均匀随机张量
pub(super) fn random_array(shape: &[usize], batch: usize, seed: u64) -> NdArray {
    let length = shape.iter().product::<usize>();
    let mut rng = StdRng::seed_from_u64(seed);
    let flat = NdArray::uniform_with_rng(-1.0, 1.0, &[length * batch], &mut rng);
    NdArray::from_batch(flat.data(), shape, batch).unwrap()
}

/// 以`L = Σ y·r`为损失做一次前向 + 反向，返回（各参数梯度，输入梯度）
pub(super) fn analytic_gradients(
    function: &mut dyn Function,
    input: &NdArray,
    r: &[f32],
) -> (Vec<Vec<f32>>, Vec<f32>) {
    let mut graph = Graph::new();
    let x = graph.insert(input.clone());
    let y = function.forward(&mut graph, &[x]).unwrap()[0];
    graph.set_grad(y, r).unwrap();
    function.backward(&mut graph, &[y]).unwrap();
    let params = function
        .parameters()
        .iter()
        .map(|p| p.grad_or_zeros())
        .collect();
    (params, graph.get(x).unwrap().grad_or_zeros())
}

/// 只做前向求`L = Σ y·r`，然后撤销本次前向
pub(super) fn weighted_loss(function: &mut dyn Function, input: &NdArray, r: &[f32]) -> f32 {
    let mut graph = Graph::new();
    let x = graph.insert(input.clone());
    let y = function.forward(&mut graph, &[x]).unwrap()[0];
    let loss = weighted_sum(graph.get(y).unwrap().data(), r);
    function.discard(&mut graph, &[y]).unwrap();
    loss
}

/// 单个 Function 的输出总长度
pub(super) fn output_len(function: &mut dyn Function, input: &NdArray) -> usize {
    let mut graph = Graph::new();
    let x = graph.insert(input.clone());
    let y = function.forward(&mut graph, &[x]).unwrap()[0];
    let len = graph.get(y).unwrap().data().len();
    function.discard(&mut graph, &[y]).unwrap();
    len
}

/// 比较解析梯度与中心差分梯度（参数与输入）
pub(super) fn check_gradients(function: &mut dyn Function, input: &NdArray, tolerance: f32) {
    let r = random_array(&[output_len(function, input)], 1, 99).into_data();
    function.clear_grads();
    let (param_grads, input_grad) = analytic_gradients(function, input, &r);

    for (k, analytic) in param_grads.iter().enumerate() {
        let original = function.parameters()[k].data().to_vec();
        let numeric = numerical_gradient(
            |v| {
                function.parameters_mut()[k].data_mut().copy_from_slice(v);
                weighted_loss(function, input, &r)
            },
            &original,
            1e-2,
        );
        function.parameters_mut()[k].data_mut().copy_from_slice(&original);
        let error = max_relative_error(analytic, &numeric);
        assert!(error < tolerance, "第{k}个参数的梯度误差过大：{error}");
    }

    let numeric = numerical_gradient(
        |v| {
            let x = NdArray::from_batch(v, input.shape(), input.batch_count()).unwrap();
            weighted_loss(function, &x, &r)
        },
        input.data(),
        1e-2,
    );
    let error = max_relative_error(&input_grad, &numeric);
    assert!(error < tolerance, "输入梯度误差过大：{error}");
}
