/*
 * @Description  : 优化器模块：逐参数的梯度更新算法
 */

mod core;

pub use core::{Adam, MomentumSGD, Optimizer, SGD};
