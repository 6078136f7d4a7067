//! 网格状态类型
//!
//! [`GridState`] 是整个网格的可克隆快照：每个 FPU 的 [`FpuStatus`]、
//! 各生命周期状态的计数、连接状态以及若干全局计数器。
//!
//! 不变量：
//! - `counts` 之和等于 FPU 数量，每个 FPU 恰好计入一个状态桶
//!   （状态迁移只能通过 [`GridState::set_fpu_state`]）；
//! - `count_pending == 0 && num_queued == 0` 时没有任何 FPU 有在途命令。

use fpu_protocol::{
    CommandKind, FirmwareVersion, FpuState, NUM_FPU_STATES, ResponseStatus, SerialNumber,
};
use smallvec::SmallVec;
use std::time::Instant;

/// 驱动与网关之间的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InterfaceState {
    /// 从未连接
    #[default]
    Uninitialized,
    /// 未连接（主动断开或对端关闭）
    Unconnected,
    Connected,
    /// 不可恢复的错误
    Fatal,
}

/// 在途命令记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    pub kind: CommandKind,
    /// 发送时分配的序列号
    pub seq: u8,
    /// 截止刻度（见 [`TimeoutTracker`](crate::timeout::TimeoutTracker)）
    pub deadline: u64,
}

/// 单个 FPU 的状态
#[derive(Debug, Clone, Default)]
pub struct FpuStatus {
    pub state: FpuState,
    /// 锁定前的状态（仅在 `Locked` 时有值）
    pub locked_underlying: Option<FpuState>,
    pub alpha_steps: i32,
    pub beta_steps: i32,
    pub alpha_referenced: bool,
    pub beta_referenced: bool,
    pub alpha_limit: bool,
    pub beta_collision: bool,
    pub waveform_valid: bool,
    pub waveform_ready: bool,
    pub waveform_reversed: bool,
    /// 最近一次发送的命令
    pub last_command: Option<CommandKind>,
    /// 最近一次响应的状态码（超时记为 `TimedOut`）
    pub last_status: ResponseStatus,
    pub pending: SmallVec<[PendingCommand; 4]>,
    pub firmware: Option<FirmwareVersion>,
    pub serial: Option<SerialNumber>,
    pub register_value: Option<u8>,
    pub crc32: Option<u32>,
    pub last_updated: Option<Instant>,
    /// 该 FPU 的累计超时次数
    pub timeout_count: u32,
}

impl FpuStatus {
    pub fn has_pending(&self, kind: CommandKind) -> bool {
        self.pending.iter().any(|p| p.kind == kind)
    }

    /// 在途命令中最早的截止刻度
    pub fn earliest_deadline(&self) -> Option<u64> {
        self.pending.iter().map(|p| p.deadline).min()
    }

    pub fn is_locked(&self) -> bool {
        self.state == FpuState::Locked
    }

    /// 两个臂是否都已寻零
    pub fn is_referenced(&self) -> bool {
        self.alpha_referenced && self.beta_referenced
    }
}

/// 网格汇总状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridSummary {
    Unconnected,
    Fatal,
    /// 网格中的主导状态
    State(FpuState),
}

/// 汇总时的状态优先级（靠前者主导）
const SUMMARY_PRECEDENCE: [FpuState; 11] = [
    FpuState::ObstacleError,
    FpuState::Aborted,
    FpuState::Unknown,
    FpuState::Uninitialized,
    FpuState::DatumSearch,
    FpuState::Moving,
    FpuState::Loading,
    FpuState::ReadyReverse,
    FpuState::ReadyForward,
    FpuState::Resting,
    FpuState::AtDatum,
];

/// 网格状态快照
#[derive(Debug, Clone)]
pub struct GridState {
    pub fpus: Vec<FpuStatus>,
    /// 各状态的 FPU 数（按 `FpuState::index` 索引）
    pub counts: [u32; NUM_FPU_STATES],
    pub interface_state: InterfaceState,
    /// 命令超时计数（回绕）
    pub count_timeout: u32,
    /// CAN 缓冲区溢出计数（回绕）
    pub count_can_overflow: u32,
    /// 在途命令总数
    pub count_pending: u32,
    /// 已入队尚未发送的命令数
    pub num_queued: u32,
}

impl GridState {
    pub fn new(num_fpus: usize) -> Self {
        let mut counts = [0u32; NUM_FPU_STATES];
        counts[FpuState::Unknown.index()] = num_fpus as u32;
        Self {
            fpus: vec![FpuStatus::default(); num_fpus],
            counts,
            interface_state: InterfaceState::Uninitialized,
            count_timeout: 0,
            count_can_overflow: 0,
            count_pending: 0,
            num_queued: 0,
        }
    }

    pub fn num_fpus(&self) -> usize {
        self.fpus.len()
    }

    pub fn count(&self, state: FpuState) -> u32 {
        self.counts[state.index()]
    }

    /// 迁移 FPU 状态并维护计数，返回状态是否变化
    pub fn set_fpu_state(&mut self, fpu: usize, new: FpuState) -> bool {
        let Some(status) = self.fpus.get_mut(fpu) else {
            return false;
        };
        let old = status.state;
        if old == new {
            return false;
        }
        status.state = new;
        self.counts[old.index()] -= 1;
        self.counts[new.index()] += 1;
        true
    }

    /// 计数是否与各 FPU 的状态一致
    pub fn counts_consistent(&self) -> bool {
        let mut recount = [0u32; NUM_FPU_STATES];
        for fpu in &self.fpus {
            recount[fpu.state.index()] += 1;
        }
        recount == self.counts
            && self.count_pending as usize == self.fpus.iter().map(|f| f.pending.len()).sum::<usize>()
    }

    /// 没有排队或在途的命令
    pub fn is_idle(&self) -> bool {
        self.count_pending == 0 && self.num_queued == 0
    }

    pub fn is_connected(&self) -> bool {
        self.interface_state == InterfaceState::Connected
    }

    /// 计算网格汇总状态
    pub fn summary(&self) -> GridSummary {
        match self.interface_state {
            InterfaceState::Connected => {},
            InterfaceState::Fatal => return GridSummary::Fatal,
            InterfaceState::Uninitialized | InterfaceState::Unconnected => {
                return GridSummary::Unconnected;
            },
        }
        SUMMARY_PRECEDENCE
            .iter()
            .copied()
            .find(|&s| self.count(s) > 0)
            .map(GridSummary::State)
            .unwrap_or_else(|| {
                if self.count(FpuState::Locked) > 0 {
                    GridSummary::State(FpuState::Locked)
                } else {
                    GridSummary::State(FpuState::Unknown)
                }
            })
    }

    /// 网格中最低的固件版本（只统计已查询过的 FPU）
    pub fn min_firmware(&self) -> Option<FirmwareVersion> {
        self.fpus.iter().filter_map(|f| f.firmware).min()
    }
}

/// 常用的等待条件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitTarget {
    /// 所有命令都已完成或超时
    NoMorePending,
    /// 没有 FPU 仍在寻零
    DatumFinished,
    /// 没有 FPU 仍在装载波形
    ReadyToMove,
    /// 没有 FPU 仍在运动
    MovementFinished,
}

impl WaitTarget {
    pub fn is_satisfied(self, grid: &GridState) -> bool {
        if !grid.is_idle() {
            return false;
        }
        match self {
            WaitTarget::NoMorePending => true,
            WaitTarget::DatumFinished => grid.count(FpuState::DatumSearch) == 0,
            WaitTarget::ReadyToMove => grid.count(FpuState::Loading) == 0,
            WaitTarget::MovementFinished => grid.count(FpuState::Moving) == 0,
        }
    }
}

/// 等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitStatus {
    /// 条件已满足
    Satisfied,
    /// 截止时间已到，条件仍未满足（正常结果，调用方可以继续等待）
    Cancelled,
    /// 连接已断开
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(num_fpus: usize) -> GridState {
        let mut grid = GridState::new(num_fpus);
        grid.interface_state = InterfaceState::Connected;
        grid
    }

    #[test]
    fn test_new_grid_counts() {
        let grid = GridState::new(10);
        assert_eq!(grid.count(FpuState::Unknown), 10);
        assert!(grid.counts_consistent());
        assert_eq!(grid.summary(), GridSummary::Unconnected);
    }

    #[test]
    fn test_set_fpu_state_moves_bucket() {
        let mut grid = connected(3);
        assert!(grid.set_fpu_state(1, FpuState::AtDatum));
        assert!(!grid.set_fpu_state(1, FpuState::AtDatum));
        assert!(!grid.set_fpu_state(99, FpuState::AtDatum));
        assert_eq!(grid.count(FpuState::Unknown), 2);
        assert_eq!(grid.count(FpuState::AtDatum), 1);
        assert!(grid.counts_consistent());
    }

    #[test]
    fn test_summary_precedence() {
        let mut grid = connected(3);
        for fpu in 0..3 {
            grid.set_fpu_state(fpu, FpuState::AtDatum);
        }
        assert_eq!(grid.summary(), GridSummary::State(FpuState::AtDatum));

        grid.set_fpu_state(0, FpuState::Resting);
        assert_eq!(grid.summary(), GridSummary::State(FpuState::Resting));

        grid.set_fpu_state(1, FpuState::ObstacleError);
        assert_eq!(grid.summary(), GridSummary::State(FpuState::ObstacleError));

        // 锁定的 FPU 不参与，除非全部锁定
        let mut grid = connected(2);
        grid.set_fpu_state(0, FpuState::Locked);
        grid.set_fpu_state(1, FpuState::ReadyForward);
        assert_eq!(grid.summary(), GridSummary::State(FpuState::ReadyForward));
        grid.set_fpu_state(1, FpuState::Locked);
        assert_eq!(grid.summary(), GridSummary::State(FpuState::Locked));

        grid.interface_state = InterfaceState::Fatal;
        assert_eq!(grid.summary(), GridSummary::Fatal);
    }

    #[test]
    fn test_wait_targets() {
        let mut grid = connected(2);
        grid.set_fpu_state(0, FpuState::DatumSearch);
        assert!(WaitTarget::NoMorePending.is_satisfied(&grid));
        assert!(!WaitTarget::DatumFinished.is_satisfied(&grid));
        assert!(WaitTarget::MovementFinished.is_satisfied(&grid));

        grid.num_queued = 1;
        assert!(!WaitTarget::NoMorePending.is_satisfied(&grid));
    }

    #[test]
    fn test_min_firmware() {
        let mut grid = GridState::new(3);
        assert_eq!(grid.min_firmware(), None);
        grid.fpus[0].firmware = Some(FirmwareVersion::new(2, 1, 0));
        grid.fpus[2].firmware = Some(FirmwareVersion::new(1, 4, 3));
        assert_eq!(grid.min_firmware(), Some(FirmwareVersion::new(1, 4, 3)));
    }
}
