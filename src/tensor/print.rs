use super::NdArray;
use std::fmt;

impl NdArray {
    pub fn print(&self) {
        println!("{self}");
    }
}

impl fmt::Display for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn display_row<'a>(f: &mut fmt::Formatter, row: impl ExactSizeIterator<Item = &'a f32>) -> fmt::Result {
            write!(f, "[")?;
            let len = row.len();
            for (i, x) in row.enumerate() {
                if len > 6 && (3..len - 3).contains(&i) {
                    if i == 3 {
                        write!(f, "   ..  ")?;
                    }
                    continue;
                }
                write!(f, "{x:8.4} ")?;
            }
            write!(f, "]")
        }

        let view = self.view().map_err(|_| fmt::Error)?;
        let rank = self.shape.len();
        if rank > 1 {
            writeln!(
                f,
                "<对于阶数大于一（rank>1）的样本（形状：{:?}）仅展示扁平数据>",
                self.shape
            )?;
        }
        let max_rows = self.batch_count.min(6);
        for sample in view.outer_iter().take(max_rows) {
            display_row(f, sample.iter())?;
            writeln!(f)?;
        }
        if self.batch_count > max_rows {
            writeln!(f, " ..  （共{}个样本）", self.batch_count)?;
        }
        writeln!(f, "形状: {:?}, 批大小: {}", self.shape, self.batch_count)
    }
}
