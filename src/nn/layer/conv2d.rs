/*
 * @Description  : Convolution2D（二维卷积）层
 *
 * 输入 [C_in, H, W]，输出 [C_out, H', W']，其中 H' = floor((H - kH + 2*pH) / sH) + 1。
 * 填充不通过复制出补零的输入实现，而是把核窗口的循环边界裁剪到有效输入范围内。
 */

use crate::errors::GraphError;
use crate::gpu::{Arg, GpuContext, Kernel, KernelKind, KernelSource};
use crate::nn::{Activation, Function, FunctionId, Graph, History, Init, Linear, TensorId};
use crate::tensor::NdArray;

use super::geometry::clipped_window;
use super::{
    ConvGeometry, LayerGrads, bias_or_zeros, finish_outputs, output_gradient, rng_from, single_input,
};

#[derive(Debug)]
pub(super) struct ConvKernels {
    pub forward: Kernel,
    pub backward_weight: Kernel,
    pub backward_input: Kernel,
}

impl ConvKernels {
    pub fn build(
        context: &GpuContext,
        kinds: [KernelKind; 3],
        activation: Option<Activation>,
    ) -> Result<Self, GraphError> {
        Ok(Self {
            forward: Kernel::build(context, KernelSource::with_activation(kinds[0], activation))?,
            backward_weight: Kernel::build(context, KernelSource::new(kinds[1]))?,
            backward_input: Kernel::build(context, KernelSource::new(kinds[2]))?,
        })
    }

    /// 前向：并行维度为 (batch×out_ch, out_h, out_w)
    pub fn forward(
        &self,
        geo: &ConvGeometry,
        input: &[f32],
        weight: &[f32],
        bias: &[f32],
    ) -> Result<Vec<f32>, GraphError> {
        let args = geo.kernel_args(&[
            Arg::Input(input),
            Arg::Input(weight),
            Arg::Input(bias),
            Arg::Output(geo.output_len()),
        ]);
        let global = [geo.batch * geo.out_channels, geo.out_h, geo.out_w];
        Ok(self.forward.launch(&args, global)?)
    }

    /// 反向：先算权重梯度再算输入梯度，任何一个失败都不返回部分结果
    pub fn backward(
        &self,
        geo: &ConvGeometry,
        input: &[f32],
        weight: &[f32],
        grad_output: &[f32],
    ) -> Result<(Vec<f32>, Vec<f32>), GraphError> {
        let args = geo.kernel_args(&[
            Arg::Input(input),
            Arg::Input(grad_output),
            Arg::Output(geo.weight_len()),
        ]);
        let global = [geo.out_channels * geo.in_channels, geo.kernel.0, geo.kernel.1];
        let grad_weight = self.backward_weight.launch(&args, global)?;

        let args = geo.kernel_args(&[
            Arg::Input(weight),
            Arg::Input(grad_output),
            Arg::Output(geo.input_len()),
        ]);
        let global = [geo.batch * geo.in_channels, geo.in_h, geo.in_w];
        let grad_input = self.backward_input.launch(&args, global)?;
        Ok((grad_weight, grad_input))
    }
}

/// 偏置梯度：按输出通道对所有样本与空间位置求和
pub(super) fn channel_sums(grad_output: &[f32], channels: usize, plane: usize) -> Vec<f32> {
    let mut sums = vec![0.0; channels];
    for (index, g) in grad_output.iter().enumerate() {
        sums[(index / plane) % channels] += g;
    }
    sums
}

/// Convolution2D 层
///
/// # 参数形状
/// - 权重：[out_channels, in_channels, kH, kW]
/// - 偏置：[out_channels]（可选）
#[derive(Debug)]
pub struct Convolution2D {
    id: FunctionId,
    name: String,
    in_channels: usize,
    out_channels: usize,
    kernel_size: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    weight: NdArray,
    bias: Option<NdArray>,
    activation: Option<Activation>,
    gpu: Option<ConvKernels>,
    history: History,
}

impl Convolution2D {
    /// 创建新的 Convolution2D 层（权重 Kaiming 初始化，偏置零初始化）
    ///
    /// # 参数
    /// - `in_channels`/`out_channels`: 输入/输出通道数
    /// - `kernel_size`: (kH, kW)
    /// - `stride`: (sH, sW)，须为正
    /// - `padding`: (pH, pW)
    /// - `use_bias`: 是否使用偏置
    /// - `name`: 层名称
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        use_bias: bool,
        name: &str,
    ) -> Result<Self, GraphError> {
        Self::with_init(
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
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
        stride: (usize, usize),
        padding: (usize, usize),
        use_bias: bool,
        name: &str,
        seed: u64,
    ) -> Result<Self, GraphError> {
        Self::with_init(
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
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
        stride: (usize, usize),
        padding: (usize, usize),
        use_bias: bool,
        init: Init,
        seed: Option<u64>,
        name: &str,
    ) -> Result<Self, GraphError> {
        check_hyper_parameters(kernel_size, stride, name)?;
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
            stride,
            padding,
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

    /// 启用 GPU 路径：编译本层的三个内核
    pub fn with_gpu(mut self, context: &GpuContext) -> Result<Self, GraphError> {
        self.gpu = Some(ConvKernels::build(
            context,
            [
                KernelKind::Conv2dForward,
                KernelKind::Conv2dBackwardWeight,
                KernelKind::Conv2dBackwardInput,
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

    pub const fn kernel_size(&self) -> (usize, usize) {
        self.kernel_size
    }

    pub const fn stride(&self) -> (usize, usize) {
        self.stride
    }

    pub const fn padding(&self) -> (usize, usize) {
        self.padding
    }

    /// 由单样本输入形状 [C_in, H, W] 推导本次调用的几何参数
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
        ConvGeometry::for_conv(
            batch,
            (c, h, w),
            self.out_channels,
            self.kernel_size,
            self.stride,
            self.padding,
        )
    }

    // ========== CPU 参考路径 ==========

    pub fn forward_cpu(&self, geo: &ConvGeometry, input: &[f32]) -> Vec<f32> {
        let weight = self.weight.data();
        let (k_h, k_w) = geo.kernel;
        let (s_h, s_w) = geo.stride;
        let (p_h, p_w) = geo.pad;
        let mut output = vec![0.0; geo.output_len()];

        for b in 0..geo.batch {
            for och in 0..geo.out_channels {
                for oy in 0..geo.out_h {
                    let (ky_start, ky_end) = clipped_window(oy, s_h, p_h, k_h, geo.in_h);
                    for ox in 0..geo.out_w {
                        let (kx_start, kx_end) = clipped_window(ox, s_w, p_w, k_w, geo.in_w);
                        let mut sum = 0.0;
                        for ich in 0..geo.in_channels {
                            for ky in ky_start..ky_end {
                                let iy = oy * s_h + ky - p_h;
                                for kx in kx_start..kx_end {
                                    let ix = ox * s_w + kx - p_w;
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

    /// 反向（散射式）：遍历输出位置，把梯度沿同一裁剪窗口分别散射到权重与输入
    ///
    /// `grad_output`须已乘过激活的导数。
    pub fn backward_cpu(&self, geo: &ConvGeometry, input: &[f32], grad_output: &[f32]) -> LayerGrads {
        let weight = self.weight.data();
        let (k_h, k_w) = geo.kernel;
        let (s_h, s_w) = geo.stride;
        let (p_h, p_w) = geo.pad;
        let mut grad_weight = vec![0.0; geo.weight_len()];
        let mut grad_input = vec![0.0; geo.input_len()];

        for b in 0..geo.batch {
            for och in 0..geo.out_channels {
                for oy in 0..geo.out_h {
                    let (ky_start, ky_end) = clipped_window(oy, s_h, p_h, k_h, geo.in_h);
                    for ox in 0..geo.out_w {
                        let (kx_start, kx_end) = clipped_window(ox, s_w, p_w, k_w, geo.in_w);
                        let g = grad_output[geo.output_at(b, och, oy, ox)];
                        for ich in 0..geo.in_channels {
                            for ky in ky_start..ky_end {
                                let iy = oy * s_h + ky - p_h;
                                for kx in kx_start..kx_end {
                                    let ix = ox * s_w + kx - p_w;
                                    let w_idx = geo.weight_at(och, ich, ky, kx);
                                    let i_idx = geo.input_at(b, ich, iy, ix);
                                    grad_weight[w_idx] += input[i_idx] * g;
                                    grad_input[i_idx] += weight[w_idx] * g;
                                }
                            }
                        }
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

pub(super) fn check_hyper_parameters(
    kernel_size: (usize, usize),
    stride: (usize, usize),
    name: &str,
) -> Result<(), GraphError> {
    if kernel_size.0 == 0 || kernel_size.1 == 0 || stride.0 == 0 || stride.1 == 0 {
        return Err(GraphError::InvalidOperation(format!(
            "{name}的卷积核尺寸{kernel_size:?}与步长{stride:?}都须为正"
        )));
    }
    Ok(())
}

/// Linear 等价于 1×1 卷积：只改权重的形状元数据，不复制数据
///
/// 原 Linear 已启用 GPU 时，在同一设备上重新编译卷积内核，编译失败返回`GraphError::Backend`。
impl TryFrom<Linear> for Convolution2D {
    type Error = GraphError;

    fn try_from(linear: Linear) -> Result<Self, Self::Error> {
        let (in_features, out_features) = (linear.in_features(), linear.out_features());
        let (weight, bias, activation, name, context) = linear.into_parts();
        let conv = Self {
            id: FunctionId::next(),
            name,
            in_channels: in_features,
            out_channels: out_features,
            kernel_size: (1, 1),
            stride: (1, 1),
            padding: (0, 0),
            weight: weight.reshape(&[out_features, in_features, 1, 1])?,
            bias,
            activation,
            gpu: None,
            history: History::new(),
        };
        match context {
            Some(context) => conv.with_gpu(&context),
            None => Ok(conv),
        }
    }
}

impl Function for Convolution2D {
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
