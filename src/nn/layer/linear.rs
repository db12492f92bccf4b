/*
 * @Description  : Linear (全连接) 层
 *
 * `output[b,o] = bias[o] + Σ_i input[b,i] * weight[o,i]`，可选地再经过激活。
 * 输入可以是任意形状，按单样本长度展平后须等于`in_features`。
 */

use crate::errors::GraphError;
use crate::gpu::{Arg, GpuContext, Kernel, KernelKind, KernelSource};
use crate::nn::{Activation, Function, FunctionId, Graph, History, Init, TensorId};
use crate::tensor::NdArray;

use super::{LayerGrads, bias_or_zeros, finish_outputs, output_gradient, rng_from, single_input};

#[derive(Debug)]
struct LinearKernels {
    forward: Kernel,
    backward_weight: Kernel,
    backward_input: Kernel,
}

/// Linear (全连接) 层
///
/// # 参数形状
/// - 权重：[out_features, in_features]
/// - 偏置：[out_features]（可选）
///
/// # 使用示例
/// ```ignore
/// let fc = Linear::new(784, 128, true, "fc1").with_activation(Activation::relu());
/// let y = fc.forward(&mut graph, &[x])?;
/// ```
#[derive(Debug)]
pub struct Linear {
    id: FunctionId,
    name: String,
    in_features: usize,
    out_features: usize,
    weight: NdArray,
    bias: Option<NdArray>,
    activation: Option<Activation>,
    gpu: Option<LinearKernels>,
    history: History,
}

impl Linear {
    /// 创建新的 Linear 层（权重 Kaiming 初始化，偏置零初始化）
    ///
    /// # 参数
    /// - `in_features`: 输入特征维度
    /// - `out_features`: 输出特征维度
    /// - `use_bias`: 是否使用偏置
    /// - `name`: 层名称
    pub fn new(in_features: usize, out_features: usize, use_bias: bool, name: &str) -> Self {
        Self::with_init(in_features, out_features, use_bias, Init::Kaiming, None, name)
    }

    /// 使用固定种子创建（可复现）
    pub fn new_seeded(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        name: &str,
        seed: u64,
    ) -> Self {
        Self::with_init(in_features, out_features, use_bias, Init::Kaiming, Some(seed), name)
    }

    pub fn with_init(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        init: Init,
        seed: Option<u64>,
        name: &str,
    ) -> Self {
        let mut rng = rng_from(seed);
        let weight = init.generate(&[out_features, in_features], in_features, out_features, &mut rng);
        let bias = use_bias.then(|| NdArray::new(&[out_features], 1));
        Self::assemble(in_features, out_features, weight, bias, name)
    }

    /// 以给定的参数值创建
    pub fn from_parameters(
        in_features: usize,
        out_features: usize,
        weight: &[f32],
        bias: Option<&[f32]>,
        name: &str,
    ) -> Result<Self, GraphError> {
        let weight = NdArray::from_data(weight, &[out_features, in_features])?;
        let bias = bias
            .map(|b| NdArray::from_data(b, &[out_features]))
            .transpose()?;
        Ok(Self::assemble(in_features, out_features, weight, bias, name))
    }

    fn assemble(
        in_features: usize,
        out_features: usize,
        weight: NdArray,
        bias: Option<NdArray>,
        name: &str,
    ) -> Self {
        Self {
            id: FunctionId::next(),
            name: name.to_string(),
            in_features,
            out_features,
            weight,
            bias,
            activation: None,
            gpu: None,
            history: History::new(),
        }
    }

    /// 融合一个激活函数作为输出的最后一步（须在`with_gpu`之前调用）
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    /// 启用 GPU 路径：编译本层的三个内核
    pub fn with_gpu(mut self, context: &GpuContext) -> Result<Self, GraphError> {
        self.gpu = Some(LinearKernels {
            forward: Kernel::build(
                context,
                KernelSource::with_activation(KernelKind::LinearForward, self.activation),
            )?,
            backward_weight: Kernel::build(context, KernelSource::new(KernelKind::LinearBackwardWeight))?,
            backward_input: Kernel::build(context, KernelSource::new(KernelKind::LinearBackwardInput))?,
        });
        Ok(self)
    }

    pub const fn in_features(&self) -> usize {
        self.in_features
    }

    pub const fn out_features(&self) -> usize {
        self.out_features
    }

    pub const fn weight(&self) -> &NdArray {
        &self.weight
    }

    pub const fn bias(&self) -> Option<&NdArray> {
        self.bias.as_ref()
    }

    pub const fn activation(&self) -> Option<Activation> {
        self.activation
    }

    /// 拆出权重、偏置、激活、名称，以及启用 GPU 时所在的设备
    pub(crate) fn into_parts(self) -> (NdArray, Option<NdArray>, Option<Activation>, String, Option<GpuContext>) {
        let context = self.gpu.map(|kernels| kernels.forward.context().clone());
        (self.weight, self.bias, self.activation, self.name, context)
    }

    fn check_input(&self, input: &NdArray) -> Result<(), GraphError> {
        if input.length() != self.in_features {
            return Err(GraphError::ShapeMismatch {
                expected: vec![self.in_features],
                got: input.shape().to_vec(),
                message: format!("{}的输入长度须为{}", self.name, self.in_features),
            });
        }
        Ok(())
    }

    // ========== CPU 参考路径 ==========

    pub fn forward_cpu(&self, input: &[f32], batch: usize) -> Vec<f32> {
        let (n_in, n_out) = (self.in_features, self.out_features);
        let weight = self.weight.data();
        let mut output = vec![0.0; batch * n_out];
        for b in 0..batch {
            let x = &input[b * n_in..(b + 1) * n_in];
            for o in 0..n_out {
                let w = &weight[o * n_in..(o + 1) * n_in];
                output[b * n_out + o] = x.iter().zip(w).map(|(xi, wi)| xi * wi).sum();
            }
        }
        finish_outputs(
            &mut output,
            1,
            n_out,
            self.bias.as_ref().map(NdArray::data),
            self.activation,
        );
        output
    }

    /// `grad_output`须已乘过激活的导数
    pub fn backward_cpu(&self, input: &[f32], grad_output: &[f32], batch: usize) -> LayerGrads {
        let (n_in, n_out) = (self.in_features, self.out_features);
        let weight = self.weight.data();
        let mut grad_weight = vec![0.0; n_out * n_in];
        let mut grad_input = vec![0.0; batch * n_in];
        let mut grad_bias = self.bias.as_ref().map(|_| vec![0.0; n_out]);

        for b in 0..batch {
            for o in 0..n_out {
                let g = grad_output[b * n_out + o];
                if let Some(gb) = grad_bias.as_mut() {
                    gb[o] += g;
                }
                for i in 0..n_in {
                    grad_weight[o * n_in + i] += input[b * n_in + i] * g;
                    grad_input[b * n_in + i] += weight[o * n_in + i] * g;
                }
            }
        }
        LayerGrads {
            weight: grad_weight,
            bias: grad_bias,
            input: grad_input,
        }
    }

    // ========== GPU 路径 ==========

    fn kernels(&self) -> Result<&LinearKernels, GraphError> {
        self.gpu.as_ref().ok_or_else(|| {
            GraphError::InvalidOperation(format!("{}未启用 GPU 路径", self.name))
        })
    }

    pub fn forward_gpu(&self, input: &[f32], batch: usize) -> Result<Vec<f32>, GraphError> {
        let kernels = self.kernels()?;
        let bias = bias_or_zeros(self.bias.as_ref(), self.out_features);
        let output = kernels.forward.launch(
            &[
                Arg::Input(input),
                Arg::Input(self.weight.data()),
                Arg::Input(&bias),
                Arg::Output(batch * self.out_features),
                Arg::Int(batch),
                Arg::Int(self.in_features),
                Arg::Int(self.out_features),
            ],
            [batch, self.out_features, 1],
        )?;
        Ok(output)
    }

    /// 偏置梯度在主机上求和，权重与输入梯度由两个内核分别计算
    pub fn backward_gpu(&self, input: &[f32], grad_output: &[f32], batch: usize) -> Result<LayerGrads, GraphError> {
        let kernels = self.kernels()?;
        let (n_in, n_out) = (self.in_features, self.out_features);
        let scalars = [Arg::Int(batch), Arg::Int(n_in), Arg::Int(n_out)];

        let mut args = vec![
            Arg::Input(input),
            Arg::Input(grad_output),
            Arg::Output(n_out * n_in),
        ];
        args.extend(scalars);
        let grad_weight = kernels.backward_weight.launch(&args, [n_out, n_in, 1])?;

        let mut args = vec![
            Arg::Input(self.weight.data()),
            Arg::Input(grad_output),
            Arg::Output(batch * n_in),
        ];
        args.extend(scalars);
        let grad_input = kernels.backward_input.launch(&args, [batch, n_in, 1])?;

        let grad_bias = self.bias.as_ref().map(|_| {
            let mut gb = vec![0.0; n_out];
            for row in grad_output.chunks(n_out) {
                gb.iter_mut().zip(row).for_each(|(acc, g)| *acc += g);
            }
            gb
        });
        Ok(LayerGrads {
            weight: grad_weight,
            bias: grad_bias,
            input: grad_input,
        })
    }
}

impl Function for Linear {
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
        self.check_input(x)?;
        let batch = x.batch_count();
        let data = if self.gpu_enabled() {
            self.forward_gpu(x.data(), batch)?
        } else {
            self.forward_cpu(x.data(), batch)
        };
        let output = graph.wrap(data, &[self.out_features], batch, self.id)?;
        self.history.push(graph, &[input], &[output])?;
        Ok(vec![output])
    }

    fn backward(&mut self, graph: &mut Graph, outputs: &[TensorId]) -> Result<(), GraphError> {
        let input = self.history.top_matching(graph, outputs)?.inputs[0];
        let grad_output = output_gradient(graph, outputs[0], self.activation)?;
        let x = graph.get(input)?;
        let batch = x.batch_count();
        let grads = if self.gpu_enabled() {
            self.backward_gpu(x.data(), &grad_output, batch)?
        } else {
            self.backward_cpu(x.data(), &grad_output, batch)
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
