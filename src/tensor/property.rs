/*
 * @Description  : 本文件仅包含一些属性方法，不包含任何运算方法
 */

use super::NdArray;
use crate::errors::GraphError;
use ndarray::{ArrayViewD, IxDyn};

impl NdArray {
    /*↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓快照/view↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓↓*/
    /// 以`[batch, ...shape]`的形状查看数据
    pub fn view(&self) -> Result<ArrayViewD<'_, f32>, GraphError> {
        let full_shape = self.full_shape();
        ArrayViewD::from_shape(IxDyn(&full_shape), &self.data).map_err(|e| {
            GraphError::ComputationError(format!("无法以形状{full_shape:?}查看数据：{e}"))
        })
    }
    /*↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑快照/view↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑↑*/

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// 单个样本的形状（不含 batch 维）
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// 含 batch 维的完整形状
    pub fn full_shape(&self) -> Vec<usize> {
        let mut full = Vec::with_capacity(self.shape.len() + 1);
        full.push(self.batch_count);
        full.extend_from_slice(&self.shape);
        full
    }

    pub const fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// 单个样本的元素个数，即`shape`各维之积
    pub const fn length(&self) -> usize {
        self.length
    }

    /// 阶数（不含 batch 维）
    pub fn dimension(&self) -> usize {
        self.shape.len()
    }

    /// 第`batch`个样本的数据
    pub fn sample(&self, batch: usize) -> &[f32] {
        &self.data[batch * self.length..(batch + 1) * self.length]
    }

    /// 值与形状是否一致（不比较梯度与回链）
    pub fn same_values(&self, other: &Self) -> bool {
        self.shape == other.shape && self.batch_count == other.batch_count && self.data == other.data
    }
}
