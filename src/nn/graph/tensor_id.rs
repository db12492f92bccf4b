use std::fmt;

/// Graph 中张量的句柄：槽位下标 + 代数
///
/// 槽位被回收后代数加一，持有旧代数的句柄不会误指向新张量。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId {
    index: u32,
    generation: u32,
}

impl TensorId {
    pub(in crate::nn::graph) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub const fn index(&self) -> u32 {
        self.index
    }

    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}
