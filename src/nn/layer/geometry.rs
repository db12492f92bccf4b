use crate::errors::GraphError;
use crate::gpu::Arg;

/// 一次卷积/反卷积调用的完整几何参数
///
/// 对反卷积而言，`stride`即 sub-sample，`pad`即 trim。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_channels: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub pad: (usize, usize),
}

impl ConvGeometry {
    /// 卷积的输出尺寸：`floor((in - k + 2*pad) / stride) + 1`
    pub fn conv_output_size(input: usize, kernel: usize, stride: usize, pad: usize) -> Option<usize> {
        (input + 2 * pad)
            .checked_sub(kernel)
            .map(|span| span / stride + 1)
    }

    /// 反卷积的输出尺寸：`(in - 1) * sub_sample + k - 2*trim`
    pub fn deconv_output_size(input: usize, kernel: usize, sub_sample: usize, trim: usize) -> Option<usize> {
        ((input.checked_sub(1)?) * sub_sample + kernel)
            .checked_sub(2 * trim)
            .filter(|&size| size > 0)
    }

    /// 按卷积关系推导输出尺寸
    pub fn for_conv(
        batch: usize,
        (in_channels, in_h, in_w): (usize, usize, usize),
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        pad: (usize, usize),
    ) -> Result<Self, GraphError> {
        let out_h = Self::conv_output_size(in_h, kernel.0, stride.0, pad.0);
        let out_w = Self::conv_output_size(in_w, kernel.1, stride.1, pad.1);
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            return Err(GraphError::ShapeMismatch {
                expected: vec![kernel.0, kernel.1],
                got: vec![in_h + 2 * pad.0, in_w + 2 * pad.1],
                message: "填充后的输入尺寸不能小于卷积核尺寸".to_string(),
            });
        };
        Ok(Self {
            batch,
            in_channels,
            in_h,
            in_w,
            out_channels,
            out_h,
            out_w,
            kernel,
            stride,
            pad,
        })
    }

    /// 按反卷积关系推导输出尺寸
    pub fn for_deconv(
        batch: usize,
        (in_channels, in_h, in_w): (usize, usize, usize),
        out_channels: usize,
        kernel: (usize, usize),
        sub_sample: (usize, usize),
        trim: (usize, usize),
    ) -> Result<Self, GraphError> {
        let out_h = Self::deconv_output_size(in_h, kernel.0, sub_sample.0, trim.0);
        let out_w = Self::deconv_output_size(in_w, kernel.1, sub_sample.1, trim.1);
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            return Err(GraphError::ShapeMismatch {
                expected: vec![2 * trim.0 + 1, 2 * trim.1 + 1],
                got: vec![in_h, in_w],
                message: "反卷积的裁剪量过大，输出尺寸为空".to_string(),
            });
        };
        Ok(Self {
            batch,
            in_channels,
            in_h,
            in_w,
            out_channels,
            out_h,
            out_w,
            kernel,
            stride: sub_sample,
            pad: trim,
        })
    }

    pub const fn input_plane(&self) -> usize {
        self.in_h * self.in_w
    }

    pub const fn output_plane(&self) -> usize {
        self.out_h * self.out_w
    }

    pub const fn input_len(&self) -> usize {
        self.batch * self.in_channels * self.input_plane()
    }

    pub const fn output_len(&self) -> usize {
        self.batch * self.out_channels * self.output_plane()
    }

    pub const fn weight_len(&self) -> usize {
        self.out_channels * self.in_channels * self.kernel.0 * self.kernel.1
    }

    pub const fn output_shape(&self) -> [usize; 3] {
        [self.out_channels, self.out_h, self.out_w]
    }

    #[inline]
    pub const fn input_at(&self, b: usize, c: usize, y: usize, x: usize) -> usize {
        ((b * self.in_channels + c) * self.in_h + y) * self.in_w + x
    }

    #[inline]
    pub const fn output_at(&self, b: usize, c: usize, y: usize, x: usize) -> usize {
        ((b * self.out_channels + c) * self.out_h + y) * self.out_w + x
    }

    #[inline]
    pub const fn weight_at(&self, och: usize, ich: usize, ky: usize, kx: usize) -> usize {
        ((och * self.in_channels + ich) * self.kernel.0 + ky) * self.kernel.1 + kx
    }

    /// 内核标量参数，顺序固定
    pub const fn kernel_scalars(&self) -> [Arg<'static>; 13] {
        [
            Arg::Int(self.batch),
            Arg::Int(self.in_channels),
            Arg::Int(self.in_h),
            Arg::Int(self.in_w),
            Arg::Int(self.out_channels),
            Arg::Int(self.out_h),
            Arg::Int(self.out_w),
            Arg::Int(self.kernel.0),
            Arg::Int(self.kernel.1),
            Arg::Int(self.stride.0),
            Arg::Int(self.stride.1),
            Arg::Int(self.pad.0),
            Arg::Int(self.pad.1),
        ]
    }

    /// 以缓冲区参数开头、标量参数结尾拼出完整的参数表
    pub fn kernel_args<'a>(&self, buffers: &[Arg<'a>]) -> Vec<Arg<'a>> {
        let mut args = buffers.to_vec();
        args.extend(self.kernel_scalars());
        args
    }
}

/// 卷积关系`i = o*s + k - p`下，对给定输出位置裁剪出有效的核偏移区间`[start, end)`
///
/// 用收紧循环边界代替对输入做零填充。
#[inline]
pub(super) fn clipped_window(o: usize, stride: usize, pad: usize, kernel: usize, in_size: usize) -> (usize, usize) {
    let base = o * stride;
    let start = pad.saturating_sub(base);
    let end = kernel.min((in_size + pad).saturating_sub(base));
    (start, end.max(start))
}
