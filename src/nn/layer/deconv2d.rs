/*
 * @Description  : Deconvolution2D（二维反卷积 / 转置卷积）层
 *
 * 它是 Convolution2D 的伴随运算：输出尺寸 = (in - 1) * sub_sample + k - 2 * trim。
 * 输出位置 oy 与输入位置 iy 满足 `oy = iy * sub_sample + ky - trim`。
 * - 前向（聚集式）：对每个 oy，反解出能够触及它的 iy 区间
 * - 反向：与卷积的前向关系相同，在裁剪后的核窗口上遍历
 */

use num_integer::Integer;

use crate::errors::GraphError;
use crate::gpu::{GpuContext, KernelKind};
use crate::nn::{Activation, Function, FunctionId, Graph, History, Init, TensorId};
use crate::tensor::NdArray;

use super::conv2d::{ConvKernels, channel_sums, check_hyper_parameters};
use super::geometry::clipped_window;
use super::{ConvGeometry, LayerGrads, bias_or_zeros, finish_outputs, output_gradient, rng_from, single_input};

/// 反卷积中，对输出位置`o`反解出有贡献的输入位置区间`[lo, hi)`
///
/// 满足 `o + trim - (k - 1) <= i * s <= o + trim` 且 `0 <= i < in_size`。
fn contributing_inputs(o: usize, sub_sample: usize, trim: usize, kernel: usize, in_size: usize) -> (usize, usize) {
    let top = (o + trim) as isize;
    let s = sub_sample as isize;
    let lo = -Integer::div_floor(&-(top - kernel as isize + 1), &s);
    let hi = Integer::div_floor(&top, &s) + 1;
    let lo = lo.max(0) as usize;
    let hi = (hi.max(0) as usize).min(in_size);
    (lo, hi.max(lo))
}

/// Deconvolution2D 层
///
/// # 参数形状
/// - 权重：[out_channels, in_channels, kH, kW]
/// - 偏置：[out_channels]（可选）
#[derive(Debug)]
pub struct Deconvolution2D {
    id: FunctionId,
    name: String,
    in_channels: usize,
    out_channels: usize,
    kernel_size: (usize, usize),
    sub_sample: (usize, usize),
    trim: (usize, usize),
    weight: NdArray,
    bias: Option<NdArray>,
    activation: Option<Activation>,
    gpu: Option<ConvKernels>,
    history: History,
}

impl Deconvolution2D {
    /// 创建新的 Deconvolution2D 层（权重 Kaiming 初始化，偏置零初始化）
    ///
    /// # 参数
    /// - `sub_sample`: 上采样倍数（即对应卷积的步长），须为正
    /// - `trim`: 从输出四周裁掉的宽度（即对应卷积的填充）
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        sub_sample: (usize, usize),
        trim: (usize, usize),
        use_bias: bool,
        name: &str,
    ) -> Result<Self, GraphError> {
        Self::with_init(
            in_channels,
            out_channels,
            kernel_size,
            sub_sample,
            trim,
            use_bias,
            Init::Kaiming,
            None,
            name,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_seeded(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        sub_sample: (usize, usize),
        trim: (usize, usize),
        use_bias: bool,
        name: &str,
        seed: u64,
    ) -> Result<Self, GraphError> {
        Self::with_init(
            in_channels,
            out_channels,
            kernel_size,
            sub_sample,
            trim,
            use_bias,
            Init::Kaiming,
            Some(seed),
            name,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_init(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        sub_sample: (usize, usize),
        trim: (usize, usize),
        use_bias: bool,
        init: Init,
        seed: Option<u64>,
        name: &str,
    ) -> Result<Self, GraphError> {
        check_hyper_parameters(kernel_size, sub_sample, name)?;
        let (k_h, k_w) = kernel_size;
        let mut rng = rng_from(seed);
        let weight = init.generate(
            &[out_channels, in_channels, k_h, k_w],
            in_channels * k_h * k_w,
            out_channels * k_h * k_w,
            &mut rng,
        );
        let bias = use_bias.then(|| NdArray::new(&[out_channels], 1));
        Ok(Self {
            id: FunctionId::next(),
            name: name.to_string(),
            in_channels,
            out_channels,
            kernel_size,
            sub_sample,
            trim,
            weight,
            bias,
            activation: None,
            gpu: None,
            history: History::new(),
        })
    }

    /// 融合一个激活函数作为输出的最后一步（须在`with_gpu`之前调用）
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn with_gpu(mut self, context: &GpuContext) -> Result<Self, GraphError> {
        self.gpu = Some(ConvKernels::build(
            context,
            [
                KernelKind::Deconv2dForward,
                KernelKind::Deconv2dBackwardWeight,
                KernelKind::Deconv2dBackwardInput,
            ],
            self.activation,
        )?);
        Ok(self)
    }

    pub const fn weight(&self) -> &NdArray {
        &self.weight
    }

    pub const fn bias(&self) -> Option<&NdArray> {
        self.bias.as_ref()
    }

    pub const fn sub_sample(&self) -> (usize, usize) {
        self.sub_sample
    }

    pub const fn trim(&self) -> (usize, usize) {
        self.trim
    }

    pub fn geometry(&self, input_shape: &[usize], batch: usize) -> Result<ConvGeometry, GraphError> {
        let &[c, h, w] = input_shape else {
            return Err(GraphError::DimensionMismatch {
                expected: 3,
                got: input_shape.len(),
                message: format!("{}的输入须为 [C, H, W]", self.name),
            });
        };
        if c != self.in_channels {
            return Err(GraphError::ShapeMismatch {
                expected: vec![self.in_channels, h, w],
                got: input_shape.to_vec(),
                message: format!("{}的输入通道数须为{}", self.name, self.in_channels),
            });
        }
        ConvGeometry::for_deconv(
            batch,
            (c, h, w),
            self.out_channels,
            self.kernel_size,
            self.sub_sample,
            self.trim,
        )
    }

    // ========== CPU 参考路径 ==========

    pub fn forward_cpu(&self, geo: &ConvGeometry, input: &[f32]) -> Vec<f32> {
        let weight = self.weight.data();
        let (k_h, k_w) = geo.kernel;
        let (s_h, s_w) = geo.stride;
        let (t_h, t_w) = geo.pad;
        let mut output = vec![0.0; geo.output_len()];

        for b in 0..geo.batch {
            for och in 0..geo.out_channels {
                for oy in 0..geo.out_h {
                    let (iy_lo, iy_hi) = contributing_inputs(oy, s_h, t_h, k_h, geo.in_h);
                    for ox in 0..geo.out_w {
                        let (ix_lo, ix_hi) = contributing_inputs(ox, s_w, t_w, k_w, geo.in_w);
                        let mut sum = 0.0;
                        for ich in 0..geo.in_channels {
                            for iy in iy_lo..iy_hi {
                                let ky = oy + t_h - iy * s_h;
                                for ix in ix_lo..ix_hi {
                                    let kx = ox + t_w - ix * s_w;
                                    sum += weight[geo.weight_at(och, ich, ky, kx)]
                                        * input[geo.input_at(b, ich, iy, ix)];
                                }
                            }
                        }
                        output[geo.output_at(b, och, oy, ox)] = sum;
                    }
                }
            }
        }

        finish_outputs(
            &mut output,
            geo.output_plane(),
            geo.out_channels,
            self.bias.as_ref().map(NdArray::data),
            self.activation,
        );
        output
    }

    /// 反向：遍历输入位置，在裁剪后的核窗口上聚集输出梯度（即卷积的前向关系）
    pub fn backward_cpu(&self, geo: &ConvGeometry, input: &[f32], grad_output: &[f32]) -> LayerGrads {
        let weight = self.weight.data();
        let (k_h, k_w) = geo.kernel;
        let (s_h, s_w) = geo.stride;
        let (t_h, t_w) = geo.pad;
        let mut grad_weight = vec![0.0; geo.weight_len()];
        let mut grad_input = vec![0.0; geo.input_len()];

        for b in 0..geo.batch {
            for ich in 0..geo.in_channels {
                for iy in 0..geo.in_h {
                    let (ky_start, ky_end) = clipped_window(iy, s_h, t_h, k_h, geo.out_h);
                    for ix in 0..geo.in_w {
                        let (kx_start, kx_end) = clipped_window(ix, s_w, t_w, k_w, geo.out_w);
                        let i_idx = geo.input_at(b, ich, iy, ix);
                        let x = input[i_idx];
                        let mut sum = 0.0;
                        for och in 0..geo.out_channels {
                            for ky in ky_start..ky_end {
                                let oy = iy * s_h + ky - t_h;
                                for kx in kx_start..kx_end {
                                    let ox = ix * s_w + kx - t_w;
                                    let w_idx = geo.weight_at(och, ich, ky, kx);
                                    let g = grad_output[geo.output_at(b, och, oy, ox)];
                                    grad_weight[w_idx] += x * g;
                                    sum += weight[w_idx] * g;
                                }
                            }
                        }
                        grad_input[i_idx] = sum;
                    }
                }
            }
        }

        LayerGrads {
            weight: grad_weight,
            bias: self
                .bias
                .as_ref()
                .map(|_| channel_sums(grad_output, geo.out_channels, geo.output_plane())),
            input: grad_input,
        }
    }

    // ========== GPU 路径 ==========

    fn kernels(&self) -> Result<&ConvKernels, GraphError> {
        self.gpu.as_ref().ok_or_else(|| {
            GraphError::InvalidOperation(format!("{}未启用 GPU 路径", self.name))
        })
    }

    pub fn forward_gpu(&self, geo: &ConvGeometry, input: &[f32]) -> Result<Vec<f32>, GraphError> {
        let bias = bias_or_zeros(self.bias.as_ref(), self.out_channels);
        self.kernels()?
            .forward(geo, input, self.weight.data(), &bias)
    }

    pub fn backward_gpu(
        &self,
        geo: &ConvGeometry,
        input: &[f32],
        grad_output: &[f32],
    ) -> Result<LayerGrads, GraphError> {
        let (grad_weight, grad_input) =
            self.kernels()?
                .backward(geo, input, self.weight.data(), grad_output)?;
        Ok(LayerGrads {
            weight: grad_weight,
            bias: self
                .bias
                .as_ref()
                .map(|_| channel_sums(grad_output, geo.out_channels, geo.output_plane())),
            input: grad_input,
        })
    }
}

impl Function for Deconvolution2D {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> FunctionId {
        self.id
    }

    fn parameters(&self) -> Vec<&NdArray> {
        std::iter::once(&self.weight).chain(self.bias.as_ref()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut NdArray> {
        std::iter::once(&mut self.weight)
            .chain(self.bias.as_mut())
            .collect()
    }

    fn gpu_enabled(&self) -> bool {
        self.gpu.is_some()
    }

    fn forward(&mut self, graph: &mut Graph, inputs: &[TensorId]) -> Result<Vec<TensorId>, GraphError> {
        let input = single_input(inputs, &self.name)?;
        let x = graph.get(input)?;
        let geo = self.geometry(x.shape(), x.batch_count())?;
        let data = if self.gpu_enabled() {
            self.forward_gpu(&geo, x.data())?
        } else {
            self.forward_cpu(&geo, x.data())
        };
        let output = graph.wrap(data, &geo.output_shape(), geo.batch, self.id)?;
        self.history.push(graph, &[input], &[output])?;
        Ok(vec![output])
    }

    fn backward(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError> {
        let input = self.history.top_matching(graph, outputs)?.inputs[0];
        let grad_output = output_gradient(graph, outputs[0], self.activation)?;
        let x = graph.get(input)?;
        let geo = self.geometry(x.shape(), x.batch_count())?;
        let grads = if self.gpu_enabled() {
            self.backward_gpu(&geo, x.data(), &grad_output)?
        } else {
            self.backward_cpu(&geo, x.data(), &grad_output)
        };
        grads.commit(&mut self.weight, self.bias.as_mut(), graph, input)?;
        self.history.complete(graph)?;
        Ok(())
    }

    fn pending_backward(&self) -> usize {
        self.history.len()
    }

    fn discard(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError> {
        self.history.discard(graph, outputs)
    }

    fn drop_pending(&mut self, graph: &mut Graph) -> Result<(), GraphError> {
        self.history.drop_all(graph)
    }
}
