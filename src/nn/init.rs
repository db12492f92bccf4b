use rand::rngs::StdRng;

use crate::tensor::NdArray;

// ==================== Init 枚举 ====================

/// 参数初始化策略
#[derive(Debug, Clone, PartialEq)]
pub enum Init {
    /// 常数初始化
    Constant(f32),
    /// 全零
    Zeros,
    /// 正态分布
    Normal { mean: f32, std: f32 },
    /// Kaiming/He 初始化（适用于 `ReLU`）
    Kaiming,
    /// Xavier/Glorot 初始化（适用于 Sigmoid/Tanh）
    Xavier,
}

impl Init {
    /// 生成初始化后的参数
    ///
    /// # 参数
    /// - `shape`: 参数形状
    /// - `fan_in`/`fan_out`: 每个输出/输入单元所连接的单元数（卷积为 通道数×核面积）
    /// - `rng`: 随机数生成器，固定种子即可复现
    pub fn generate(&self, shape: &[usize], fan_in: usize, fan_out: usize, rng: &mut StdRng) -> NdArray {
        match self {
            Self::Constant(v) => {
                let mut array = NdArray::new(shape, 1);
                array.data_mut().iter_mut().for_each(|x| *x = *v);
                array
            }
            Self::Zeros => NdArray::new(shape, 1),
            Self::Normal { mean, std } => NdArray::normal_with_rng(*mean, *std, shape, rng),
            Self::Kaiming => {
                let std = (2.0 / fan_in.max(1) as f32).sqrt();
                NdArray::normal_with_rng(0.0, std, shape, rng)
            }
            Self::Xavier => {
                let std = (2.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                NdArray::normal_with_rng(0.0, std, shape, rng)
            }
        }
    }
}
