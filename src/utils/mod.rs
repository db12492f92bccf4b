//! # 常用接口模块
//!
//! 本模块提供单元测试用的断言宏，以及梯度检验用的数值微分工具

pub mod grad_check;
