/*
 * @Description  : 主机参考设备上的内核实现
 *
 * 每个工作项只写一个输出元素（聚集式），工作项按全局尺寸行优先展开后恰为输出下标。
 * 这与 CPU 参考路径（卷积反向为散射式）是两套独立的下标推导，二者结果一致即说明推导正确。
 */

use crate::errors::{BackendError, BackendErrorKind};
use crate::gpu::KernelKind;
use crate::nn::{Activation, TraitActivation};

/// 一次执行所需的全部实参（缓冲区按参数顺序，输出除外）
pub(super) struct Invocation<'a> {
    pub inputs: Vec<&'a [f32]>,
    pub ints: Vec<usize>,
}

/// 卷积/反卷积内核共用的 13 个标量
#[derive(Debug, Clone, Copy)]
struct ConvScalars {
    batch: usize,
    in_ch: usize,
    in_h: usize,
    in_w: usize,
    out_ch: usize,
    out_h: usize,
    out_w: usize,
    k_h: usize,
    k_w: usize,
    s_h: usize,
    s_w: usize,
    p_h: usize,
    p_w: usize,
}

impl ConvScalars {
    fn parse(ints: &[usize]) -> Self {
        Self {
            batch: ints[0],
            in_ch: ints[1],
            in_h: ints[2],
            in_w: ints[3],
            out_ch: ints[4],
            out_h: ints[5],
            out_w: ints[6],
            k_h: ints[7],
            k_w: ints[8],
            s_h: ints[9],
            s_w: ints[10],
            p_h: ints[11],
            p_w: ints[12],
        }
    }

    const fn input_len(&self) -> usize {
        self.batch * self.in_ch * self.in_h * self.in_w
    }

    const fn output_len(&self) -> usize {
        self.batch * self.out_ch * self.out_h * self.out_w
    }

    const fn weight_len(&self) -> usize {
        self.out_ch * self.in_ch * self.k_h * self.k_w
    }

    const fn input_at(&self, b: usize, c: usize, y: usize, x: usize) -> usize {
        ((b * self.in_ch + c) * self.in_h + y) * self.in_w + x
    }

    const fn output_at(&self, b: usize, c: usize, y: usize, x: usize) -> usize {
        ((b * self.out_ch + c) * self.out_h + y) * self.out_w + x
    }

    const fn weight_at(&self, och: usize, ich: usize, ky: usize, kx: usize) -> usize {
        ((och * self.in_ch + ich) * self.k_h + ky) * self.k_w + kx
    }
}

/// 执行前校验：标量、缓冲区长度与全局工作尺寸是否自洽
pub(super) fn validate(
    kind: KernelKind,
    inv: &Invocation<'_>,
    output_len: usize,
    global: [usize; 3],
) -> Result<(), BackendError> {
    let (expected_global, expected): ([usize; 3], Vec<usize>) = match kind {
        KernelKind::LinearForward => {
            let (batch, n_in, n_out) = (inv.ints[0], inv.ints[1], inv.ints[2]);
            (
                [batch, n_out, 1],
                vec![batch * n_in, n_out * n_in, n_out, batch * n_out],
            )
        }
        KernelKind::LinearBackwardWeight => {
            let (batch, n_in, n_out) = (inv.ints[0], inv.ints[1], inv.ints[2]);
            (
                [n_out, n_in, 1],
                vec![batch * n_in, batch * n_out, n_out * n_in],
            )
        }
        KernelKind::LinearBackwardInput => {
            let (batch, n_in, n_out) = (inv.ints[0], inv.ints[1], inv.ints[2]);
            (
                [batch, n_in, 1],
                vec![n_out * n_in, batch * n_out, batch * n_in],
            )
        }
        _ => {
            let c = ConvScalars::parse(&inv.ints);
            if c.s_h == 0 || c.s_w == 0 {
                return Err(BackendError::new(
                    BackendErrorKind::InvalidArgValue,
                    "步长必须为正",
                ));
            }
            match kind {
                KernelKind::Conv2dForward | KernelKind::Deconv2dForward => (
                    [c.batch * c.out_ch, c.out_h, c.out_w],
                    vec![c.input_len(), c.weight_len(), c.out_ch, c.output_len()],
                ),
                KernelKind::Conv2dBackwardWeight | KernelKind::Deconv2dBackwardWeight => (
                    [c.out_ch * c.in_ch, c.k_h, c.k_w],
                    vec![c.input_len(), c.output_len(), c.weight_len()],
                ),
                _ => (
                    [c.batch * c.in_ch, c.in_h, c.in_w],
                    vec![c.weight_len(), c.output_len(), c.input_len()],
                ),
            }
        }
    };

    if global != expected_global {
        return Err(BackendError::new(
            BackendErrorKind::InvalidWorkSize,
            format!(
                "内核{}的全局工作尺寸应为{expected_global:?}，实际{global:?}",
                kind.name()
            ),
        ));
    }
    let (input_lens, out_expected) = expected.split_at(expected.len() - 1);
    for (index, (buffer, &len)) in inv.inputs.iter().zip(input_lens).enumerate() {
        if buffer.len() < len {
            return Err(BackendError::new(
                BackendErrorKind::InvalidArgValue,
                format!("第{index}个缓冲区长度{}不足{len}", buffer.len()),
            ));
        }
    }
    if output_len != out_expected[0] {
        return Err(BackendError::new(
            BackendErrorKind::InvalidWorkSize,
            format!("输出缓冲区长度{output_len}应为{}", out_expected[0]),
        ));
    }
    Ok(())
}

/// 计算第`gid`个工作项的输出值
pub(super) fn element(
    kind: KernelKind,
    activation: Option<Activation>,
    inv: &Invocation<'_>,
    gid: [usize; 3],
) -> f32 {
    let value = match kind {
        KernelKind::LinearForward => linear_forward(inv, gid),
        KernelKind::LinearBackwardWeight => linear_backward_weight(inv, gid),
        KernelKind::LinearBackwardInput => linear_backward_input(inv, gid),
        KernelKind::Conv2dForward => conv2d_forward(inv, gid),
        KernelKind::Conv2dBackwardWeight => conv2d_backward_weight(inv, gid),
        KernelKind::Conv2dBackwardInput => conv2d_backward_input(inv, gid),
        KernelKind::Deconv2dForward => deconv2d_forward(inv, gid),
        KernelKind::Deconv2dBackwardWeight => deconv2d_backward_weight(inv, gid),
        KernelKind::Deconv2dBackwardInput => deconv2d_backward_input(inv, gid),
    };
    match activation {
        Some(act) => act.forward(value),
        None => value,
    }
}

// ========== Linear ==========

fn linear_forward(inv: &Invocation<'_>, [b, o, _]: [usize; 3]) -> f32 {
    let (input, weight, bias) = (inv.inputs[0], inv.inputs[1], inv.inputs[2]);
    let n_in = inv.ints[1];
    let mut sum = bias[o];
    for i in 0..n_in {
        sum += input[b * n_in + i] * weight[o * n_in + i];
    }
    sum
}

fn linear_backward_weight(inv: &Invocation<'_>, [o, i, _]: [usize; 3]) -> f32 {
    let (input, grad_output) = (inv.inputs[0], inv.inputs[1]);
    let (batch, n_in, n_out) = (inv.ints[0], inv.ints[1], inv.ints[2]);
    (0..batch)
        .map(|b| input[b * n_in + i] * grad_output[b * n_out + o])
        .sum()
}

fn linear_backward_input(inv: &Invocation<'_>, [b, i, _]: [usize; 3]) -> f32 {
    let (weight, grad_output) = (inv.inputs[0], inv.inputs[1]);
    let (n_in, n_out) = (inv.ints[1], inv.ints[2]);
    (0..n_out)
        .map(|o| weight[o * n_in + i] * grad_output[b * n_out + o])
        .sum()
}

// ========== Convolution2D ==========

/// 卷积关系 `o*s + k - p = i` 中由 i 反求 o：不能整除或越界时为 None
fn solve_conv(i: usize, k: usize, s: usize, p: usize, out_size: usize) -> Option<usize> {
    let t = (i + p).checked_sub(k)?;
    (t % s == 0 && t / s < out_size).then_some(t / s)
}

/// 卷积关系 `o*s + k - p = i` 中由 o 正求 i：越界时为 None
fn forward_index(o: usize, k: usize, s: usize, p: usize, in_size: usize) -> Option<usize> {
    let i = (o * s + k).checked_sub(p)?;
    (i < in_size).then_some(i)
}

fn conv2d_forward(inv: &Invocation<'_>, [bc, oy, ox]: [usize; 3]) -> f32 {
    let c = ConvScalars::parse(&inv.ints);
    let (input, weight, bias) = (inv.inputs[0], inv.inputs[1], inv.inputs[2]);
    let (b, och) = (bc / c.out_ch, bc % c.out_ch);
    let mut sum = 0.0;
    for ich in 0..c.in_ch {
        for ky in 0..c.k_h {
            let Some(iy) = forward_index(oy, ky, c.s_h, c.p_h, c.in_h) else {
                continue;
            };
            for kx in 0..c.k_w {
                let Some(ix) = forward_index(ox, kx, c.s_w, c.p_w, c.in_w) else {
                    continue;
                };
                sum += weight[c.weight_at(och, ich, ky, kx)] * input[c.input_at(b, ich, iy, ix)];
            }
        }
    }
    sum + bias[och]
}

fn conv2d_backward_weight(inv: &Invocation<'_>, [oi, ky, kx]: [usize; 3]) -> f32 {
    let c = ConvScalars::parse(&inv.ints);
    let (input, grad_output) = (inv.inputs[0], inv.inputs[1]);
    let (och, ich) = (oi / c.in_ch, oi % c.in_ch);
    let mut sum = 0.0;
    for b in 0..c.batch {
        for oy in 0..c.out_h {
            let Some(iy) = forward_index(oy, ky, c.s_h, c.p_h, c.in_h) else {
                continue;
            };
            for ox in 0..c.out_w {
                let Some(ix) = forward_index(ox, kx, c.s_w, c.p_w, c.in_w) else {
                    continue;
                };
                sum += input[c.input_at(b, ich, iy, ix)] * grad_output[c.output_at(b, och, oy, ox)];
            }
        }
    }
    sum
}

fn conv2d_backward_input(inv: &Invocation<'_>, [bc, iy, ix]: [usize; 3]) -> f32 {
    let c = ConvScalars::parse(&inv.ints);
    let (weight, grad_output) = (inv.inputs[0], inv.inputs[1]);
    let (b, ich) = (bc / c.in_ch, bc % c.in_ch);
    let mut sum = 0.0;
    for och in 0..c.out_ch {
        for ky in 0..c.k_h {
            let Some(oy) = solve_conv(iy, ky, c.s_h, c.p_h, c.out_h) else {
                continue;
            };
            for kx in 0..c.k_w {
                let Some(ox) = solve_conv(ix, kx, c.s_w, c.p_w, c.out_w) else {
                    continue;
                };
                sum += weight[c.weight_at(och, ich, ky, kx)] * grad_output[c.output_at(b, och, oy, ox)];
            }
        }
    }
    sum
}

// ========== Deconvolution2D ==========
// 反卷积关系：`o = i*s + k - trim`，即卷积关系中输入与输出互换

fn deconv2d_forward(inv: &Invocation<'_>, [bc, oy, ox]: [usize; 3]) -> f32 {
    let c = ConvScalars::parse(&inv.ints);
    let (input, weight, bias) = (inv.inputs[0], inv.inputs[1], inv.inputs[2]);
    let (b, och) = (bc / c.out_ch, bc % c.out_ch);
    let mut sum = 0.0;
    for ich in 0..c.in_ch {
        for ky in 0..c.k_h {
            let Some(iy) = solve_conv(oy, ky, c.s_h, c.p_h, c.in_h) else {
                continue;
            };
            for kx in 0..c.k_w {
                let Some(ix) = solve_conv(ox, kx, c.s_w, c.p_w, c.in_w) else {
                    continue;
                };
                sum += weight[c.weight_at(och, ich, ky, kx)] * input[c.input_at(b, ich, iy, ix)];
            }
        }
    }
    sum + bias[och]
}

fn deconv2d_backward_weight(inv: &Invocation<'_>, [oi, ky, kx]: [usize; 3]) -> f32 {
    let c = ConvScalars::parse(&inv.ints);
    let (input, grad_output) = (inv.inputs[0], inv.inputs[1]);
    let (och, ich) = (oi / c.in_ch, oi % c.in_ch);
    let mut sum = 0.0;
    for b in 0..c.batch {
        for iy in 0..c.in_h {
            let Some(oy) = forward_index(iy, ky, c.s_h, c.p_h, c.out_h) else {
                continue;
            };
            for ix in 0..c.in_w {
                let Some(ox) = forward_index(ix, kx, c.s_w, c.p_w, c.out_w) else {
                    continue;
                };
                sum += input[c.input_at(b, ich, iy, ix)] * grad_output[c.output_at(b, och, oy, ox)];
            }
        }
    }
    sum
}

fn deconv2d_backward_input(inv: &Invocation<'_>, [bc, iy, ix]: [usize; 3]) -> f32 {
    let c = ConvScalars::parse(&inv.ints);
    let (weight, grad_output) = (inv.inputs[0], inv.inputs[1]);
    let (b, ich) = (bc / c.in_ch, bc % c.in_ch);
    let mut sum = 0.0;
    for och in 0..c.out_ch {
        for ky in 0..c.k_h {
            let Some(oy) = forward_index(iy, ky, c.s_h, c.p_h, c.out_h) else {
                continue;
            };
            for kx in 0..c.k_w {
                let Some(ox) = forward_index(ix, kx, c.s_w, c.p_w, c.out_w) else {
                    continue;
                };
                sum += weight[c.weight_at(och, ich, ky, kx)] * grad_output[c.output_at(b, och, oy, ox)];
            }
        }
    }
    sum
}
