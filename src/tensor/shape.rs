use super::NdArray;
use crate::errors::GraphError;

impl NdArray {
    /// 原地修改单样本形状（只改元数据，不复制数据）
    pub fn reshape_mut(&mut self, shape: &[usize]) -> Result<(), GraphError> {
        let new_length = shape.iter().product::<usize>();
        if new_length != self.length {
            return Err(GraphError::ShapeMismatch {
                expected: self.shape.clone(),
                got: shape.to_vec(),
                message: format!("重塑前后元素个数须一致：{} vs {new_length}", self.length),
            });
        }
        self.shape = shape.to_vec();
        Ok(())
    }

    /// 消耗自身并以新形状返回（数据缓冲被移动而非复制）
    pub fn reshape(mut self, shape: &[usize]) -> Result<Self, GraphError> {
        self.reshape_mut(shape)?;
        Ok(self)
    }

    /// 判断两个张量的单样本形状是否严格一致。如：形状为 [1, 4] 和 [4] 是不一致的
    pub fn is_same_shape(&self, other: &Self) -> bool {
        self.shape == other.shape
    }
}
