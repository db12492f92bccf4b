/*
 * @Description  : 模型参数的快照与持久化
 *
 * 快照按 FunctionStack 的顶层 Function 逐个记录：名称、各参数的形状与扁平值。
 * - JSON（serde_json）：便于查看与比对
 * - 二进制（bincode）：文件头为魔数 + 版本号，其后是 bincode 编码的快照
 *
 * 加载只覆盖参数的值；Function 个数、名称或任一参数形状不符时整体拒绝，不做部分写入。
 */

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::GraphError;
use crate::nn::{Function, FunctionStack};

/// 单个参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// 单个 Function 的全部参数（按`parameters()`的枚举顺序）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSnapshot {
    pub name: String,
    pub parameters: Vec<ParameterSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub name: String,
    pub functions: Vec<FunctionSnapshot>,
}

impl ModelSnapshot {
    /// 参数文件魔数
    const PARAMS_MAGIC: &'static [u8; 4] = b"DTPR";
    /// 参数文件版本
    const PARAMS_VERSION: u32 = 1;

    pub fn capture(stack: &FunctionStack) -> Self {
        let functions = stack
            .functions()
            .iter()
            .map(|function| FunctionSnapshot {
                name: function.name().to_string(),
                parameters: function
                    .parameters()
                    .into_iter()
                    .map(|param| ParameterSnapshot {
                        shape: param.shape().to_vec(),
                        values: param.data().to_vec(),
                    })
                    .collect(),
            })
            .collect();
        Self {
            name: stack.name().to_string(),
            functions,
        }
    }

    /// 把快照中的参数值写回`stack`
    pub fn apply(&self, stack: &mut FunctionStack) -> Result<(), GraphError> {
        self.check_compatible(stack)?;
        for (function, snapshot) in stack.functions_mut().iter_mut().zip(&self.functions) {
            let values: Vec<Vec<f32>> = snapshot
                .parameters
                .iter()
                .map(|param| param.values.clone())
                .collect();
            function.set_parameter_values(&values)?;
        }
        Ok(())
    }

    fn check_compatible(&self, stack: &FunctionStack) -> Result<(), GraphError> {
        if stack.len() != self.functions.len() {
            return Err(GraphError::DimensionMismatch {
                expected: stack.len(),
                got: self.functions.len(),
                message: format!("快照中的 Function 个数与{}不符", stack.name()),
            });
        }
        for (function, snapshot) in stack.functions().iter().zip(&self.functions) {
            if function.name() != snapshot.name {
                return Err(GraphError::InvalidOperation(format!(
                    "快照中的 Function 名称不符：期望{}，实际{}",
                    function.name(),
                    snapshot.name
                )));
            }
            let params = function.parameters();
            if params.len() != snapshot.parameters.len() {
                return Err(GraphError::DimensionMismatch {
                    expected: params.len(),
                    got: snapshot.parameters.len(),
                    message: format!("{}的参数个数不符", function.name()),
                });
            }
            for (param, saved) in params.iter().zip(&snapshot.parameters) {
                if param.shape() != saved.shape.as_slice() || param.data().len() != saved.values.len() {
                    return Err(GraphError::ShapeMismatch {
                        expected: param.shape().to_vec(),
                        got: saved.shape.clone(),
                        message: format!("{}的参数形状不符", function.name()),
                    });
                }
            }
        }
        Ok(())
    }

    // ========== JSON ==========

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), GraphError> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(writer, self)
            .map_err(|e| GraphError::Io(format!("写入 JSON 参数文件失败: {e}")))
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, GraphError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        serde_json::from_reader(reader)
            .map_err(|e| GraphError::Io(format!("解析 JSON 参数文件失败: {e}")))
    }

    // ========== 二进制 ==========

    pub fn to_bytes(&self) -> Result<Vec<u8>, GraphError> {
        let body = bincode::serialize(self)
            .map_err(|e| GraphError::Io(format!("参数编码失败: {e}")))?;
        let mut bytes = Vec::with_capacity(body.len() + 8);
        bytes.extend_from_slice(Self::PARAMS_MAGIC);
        bytes.extend_from_slice(&Self::PARAMS_VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GraphError> {
        if bytes.len() < 8 || &bytes[..4] != Self::PARAMS_MAGIC {
            return Err(GraphError::Io(
                "无效的参数文件：这不是 dual_torch 格式的参数文件".to_string(),
            ));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != Self::PARAMS_VERSION {
            return Err(GraphError::Io(format!("不支持的参数文件版本: {version}")));
        }
        bincode::deserialize(&bytes[8..]).map_err(|e| GraphError::Io(format!("参数解码失败: {e}")))
    }

    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> Result<(), GraphError> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        writer.write_all(&self.to_bytes()?)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<Self, GraphError> {
        let mut bytes = Vec::new();
        BufReader::new(File::open(path.as_ref())?).read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

impl FunctionStack {
    /// 保存全部参数到二进制文件
    pub fn save_params<P: AsRef<Path>>(&self, path: P) -> Result<(), GraphError> {
        ModelSnapshot::capture(self).save_binary(path)
    }

    /// 从二进制文件加载参数
    pub fn load_params<P: AsRef<Path>>(&mut self, path: P) -> Result<(), GraphError> {
        ModelSnapshot::load_binary(path)?.apply(self)
    }
}
