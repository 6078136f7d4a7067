//! 操作参数与结果类型

use fpu_driver::{FpuStatus, GridState, GridSummary};
use std::ops::Range;

/// 操作针对的 FPU 集合
///
/// `All` 表示网格中所有未锁定的 FPU（锁定的 FPU 不参与群体操作）；
/// 显式列出的锁定 FPU 会让需要运动的操作返回 `Locked` 错误。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FpuSelection {
    #[default]
    All,
    Only(Vec<u16>),
}

impl FpuSelection {
    pub fn is_all(&self) -> bool {
        matches!(self, FpuSelection::All)
    }
}

impl From<u16> for FpuSelection {
    fn from(fpu: u16) -> Self {
        FpuSelection::Only(vec![fpu])
    }
}

impl From<Vec<u16>> for FpuSelection {
    fn from(fpus: Vec<u16>) -> Self {
        FpuSelection::Only(fpus)
    }
}

impl From<&[u16]> for FpuSelection {
    fn from(fpus: &[u16]) -> Self {
        FpuSelection::Only(fpus.to_vec())
    }
}

impl<const N: usize> From<[u16; N]> for FpuSelection {
    fn from(fpus: [u16; N]) -> Self {
        FpuSelection::Only(fpus.to_vec())
    }
}

impl From<Range<u16>> for FpuSelection {
    fn from(fpus: Range<u16>) -> Self {
        FpuSelection::Only(fpus.collect())
    }
}

/// 操作结果：结束时的网格快照、汇总状态，以及是否已经完成
///
/// `finished == false` 表示等待截止时间先到，命令仍在进行中；
/// 调用方可以继续等待或重新查看快照。
#[derive(Debug, Clone)]
pub struct OpOutcome {
    pub grid: GridState,
    pub summary: GridSummary,
    pub finished: bool,
}

impl OpOutcome {
    pub(crate) fn new(grid: GridState, finished: bool) -> Self {
        let summary = grid.summary();
        Self {
            grid,
            summary,
            finished,
        }
    }

    /// 单个 FPU 的状态
    pub fn fpu(&self, fpu: u16) -> Option<&FpuStatus> {
        self.grid.fpus.get(fpu as usize)
    }
}
