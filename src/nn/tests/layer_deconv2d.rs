use approx::assert_abs_diff_eq;

use super::{check_gradients, random_array};
use crate::assert_err;
use crate::gpu::GpuContext;
use crate::nn::{Activation, ConvGeometry, Convolution2D, Deconvolution2D, Function, Graph, GraphError, Init};

/// 卷积权重 [och, ich, kH, kW] 转置成反卷积权重 [ich, och, kH, kW]
fn transpose_channels(weight: &[f32], och: usize, ich: usize, area: usize) -> Vec<f32> {
    let mut out = vec![0.0; weight.len()];
    for o in 0..och {
        for i in 0..ich {
            for k in 0..area {
                out[(i * och + o) * area + k] = weight[(o * ich + i) * area + k];
            }
        }
    }
    out
}

#[test]
fn test_output_size_law() {
    // (in, k, sub_sample, trim) -> out = (in - 1) * s + k - 2 * trim
    let cases = [(3, 3, 2, 1, 5), (4, 4, 2, 1, 8), (2, 3, 1, 0, 4), (1, 2, 3, 0, 2)];
    for (input, k, s, t, expected) in cases {
        assert_eq!(ConvGeometry::deconv_output_size(input, k, s, t), Some(expected));
    }
    assert_eq!(ConvGeometry::deconv_output_size(1, 1, 1, 1), None);
    assert_eq!(ConvGeometry::deconv_output_size(0, 3, 1, 0), None);
}

#[test]
fn test_forward_shape_and_empty_output() {
    let mut graph = Graph::new();
    let mut deconv = Deconvolution2D::new_seeded(3, 2, (4, 4), (2, 2), (1, 1), true, "deconv", 1).unwrap();
    let x = graph.create(&[3, 4, 5], 2);
    let y = deconv.forward(&mut graph, &[x]).unwrap()[0];
    assert_eq!(graph.get(y).unwrap().full_shape(), vec![2, 2, 8, 10]);

    let mut deconv = Deconvolution2D::new_seeded(1, 1, (1, 1), (1, 1), (1, 1), true, "deconv", 1).unwrap();
    let x = graph.create(&[1, 1, 1], 1);
    assert_err!(deconv.forward(&mut graph, &[x]), GraphError::ShapeMismatch { .. });
}

/// 反卷积是卷积的伴随：反卷积前向 = 卷积对输入的反向，反卷积对输入的反向 = 卷积前向
#[test]
fn test_deconvolution_is_adjoint_of_convolution() {
    let (och, ich) = (3, 2);
    let conv = Convolution2D::with_init(ich, och, (3, 3), (2, 2), (1, 1), false, Init::Normal { mean: 0.0, std: 1.0 }, Some(30), "conv")
        .unwrap();
    let mut deconv =
        Deconvolution2D::with_init(och, ich, (3, 3), (2, 2), (1, 1), false, Init::Zeros, None, "deconv").unwrap();
    deconv
        .set_parameter_values(&[transpose_channels(conv.weight().data(), och, ich, 9)])
        .unwrap();

    let x = random_array(&[ich, 5, 7], 2, 31);
    let conv_geo = conv.geometry(x.shape(), 2).unwrap();
    assert_eq!(conv_geo.output_shape(), [och, 3, 4]);
    let g = random_array(&[och, 3, 4], 2, 32);
    let deconv_geo = deconv.geometry(g.shape(), 2).unwrap();
    assert_eq!(deconv_geo.output_shape(), [ich, 5, 7]);

    let conv_grads = conv.backward_cpu(&conv_geo, x.data(), g.data());
    let deconv_out = deconv.forward_cpu(&deconv_geo, g.data());
    assert_abs_diff_eq!(conv_grads.input.as_slice(), deconv_out.as_slice(), epsilon = 1e-5);

    let conv_out = conv.forward_cpu(&conv_geo, x.data());
    let deconv_grads = deconv.backward_cpu(&deconv_geo, g.data(), x.data());
    assert_abs_diff_eq!(deconv_grads.input.as_slice(), conv_out.as_slice(), epsilon = 1e-5);
}

#[test]
fn test_deconv_gradients() {
    let input = random_array(&[2, 3, 2], 2, 33);
    let mut deconv = Deconvolution2D::new_seeded(2, 2, (3, 2), (2, 1), (1, 0), true, "deconv", 34)
        .unwrap()
        .with_activation(Activation::sigmoid());
    check_gradients(&mut deconv, &input, 1e-2);

    let mut deconv = Deconvolution2D::new_seeded(2, 1, (2, 2), (1, 1), (0, 0), false, "deconv", 35).unwrap();
    check_gradients(&mut deconv, &input, 1e-2);
}

#[test]
fn test_deconv_gpu_matches_cpu() {
    let context = GpuContext::host().unwrap();
    let input = random_array(&[3, 4, 3], 2, 36);
    let cpu = Deconvolution2D::new_seeded(3, 2, (4, 3), (2, 2), (1, 1), true, "deconv", 37)
        .unwrap()
        .with_activation(Activation::leaky_relu(0.1));
    let gpu = Deconvolution2D::new_seeded(3, 2, (4, 3), (2, 2), (1, 1), true, "deconv", 37)
        .unwrap()
        .with_activation(Activation::leaky_relu(0.1))
        .with_gpu(&context)
        .unwrap();
    let geo = cpu.geometry(input.shape(), input.batch_count()).unwrap();
    let grad_out = random_array(&[geo.output_len()], 1, 38).into_data();

    let y_cpu = cpu.forward_cpu(&geo, input.data());
    let y_gpu = gpu.forward_gpu(&geo, input.data()).unwrap();
    assert_abs_diff_eq!(y_cpu.as_slice(), y_gpu.as_slice(), epsilon = 1e-5);

    let g_cpu = cpu.backward_cpu(&geo, input.data(), &grad_out);
    let g_gpu = gpu.backward_gpu(&geo, input.data(), &grad_out).unwrap();
    assert_abs_diff_eq!(g_cpu.weight.as_slice(), g_gpu.weight.as_slice(), epsilon = 1e-4);
    assert_abs_diff_eq!(g_cpu.input.as_slice(), g_gpu.input.as_slice(), epsilon = 1e-4);
}
