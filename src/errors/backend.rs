use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::fmt::{self, Display};
use thiserror::Error;

/// GPU 后端错误的种类
///
/// 状态码沿用 OpenCL 的编号，任何满足参数顺序约定的后端都应按此映射自己的错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
pub enum BackendErrorKind {
    OutOfResources = -5,
    BuildProgramFailure = -11,
    InvalidMemObject = -38,
    InvalidKernel = -48,
    InvalidArgIndex = -49,
    InvalidArgValue = -50,
    InvalidKernelArgs = -52,
    InvalidWorkSize = -54,
    Unknown = -9999,
}

impl BackendErrorKind {
    /// 由后端状态码得到错误种类，无法识别的状态码归为 `Unknown`
    pub fn from_code(code: i32) -> Self {
        Self::from_i32(code).unwrap_or(Self::Unknown)
    }

    pub const fn code(&self) -> i32 {
        *self as i32
    }
}

impl Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OutOfResources => "资源不足",
            Self::BuildProgramFailure => "内核构建失败",
            Self::InvalidMemObject => "无效的缓冲区",
            Self::InvalidKernel => "无效的内核",
            Self::InvalidArgIndex => "无效的参数序号",
            Self::InvalidArgValue => "无效的参数值",
            Self::InvalidKernelArgs => "内核参数未全部绑定",
            Self::InvalidWorkSize => "无效的工作项尺寸",
            Self::Unknown => "未知错误",
        };
        write!(f, "{name}")
    }
}

/// GPU 后端错误：种类 + 后端原始状态码 + 诊断信息
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("GPU 后端错误[{kind}，状态码 {code}]：{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub code: i32,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code(),
            message: message.into(),
        }
    }

    /// 由后端返回的原始状态码构造（保留原始码，即便它不在已知种类里）
    pub fn from_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::from_code(code),
            code,
            message: message.into(),
        }
    }
}
