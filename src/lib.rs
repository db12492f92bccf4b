//! # Dual Torch
//!
//! `dual_torch`是一个以 Function 为单位、按前向逆序回放求梯度的小型神经网络训练库。
//! 数值层（Linear、二维卷积/反卷积）各有两条路径：CPU 参考实现，以及向
//! [`gpu::ComputeBackend`]派发的内核；两条路径的结果在浮点误差内一致。
//!

pub mod errors;
pub mod gpu;
pub mod nn;
pub mod tensor;
pub mod utils;
