//! 网格状态存储
//!
//! 接收线程、发送线程和调用方线程共享的状态中心。内部有两把锁，
//! 加锁顺序固定为 网格状态 → 超时跟踪器。
//!
//! 等待者在以下情况被唤醒：FPU 状态迁移、在途/排队计数归零、连接
//! 状态变化、命令超时。打开 `trace_wakeups` 后每个事件都会唤醒。

use crate::state::{
    FpuStatus, GridState, InterfaceState, PendingCommand, WaitStatus, WaitTarget,
};
use crate::timeout::TimeoutTracker;
use fpu_protocol::{
    CommandKind, FPUS_PER_BUS, FPUS_PER_GATEWAY, FpuAddress, FpuState, GatewayFrame,
    MAX_PENDING_PER_FPU, MessageCode, Notification, ProtocolError, Response, ResponseData,
    ResponseStatus,
};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 登记在途命令失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// 该 FPU 的在途命令已达上限，命令应留在队首稍后重试
    PendingFull { fpu: usize },
    /// FPU 编号超出网格
    InvalidFpu { fpu: usize },
}

/// 响应的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMatch {
    /// 完成了一条在途命令
    Completed(CommandKind),
    /// 长时命令的中间确认（命令仍在途）
    Acknowledged(CommandKind),
    /// 没有对应的在途命令（状态仍然生效）
    Unsolicited,
}

/// 会改变设备生命周期状态的命令：超时后设备状态视为未知
fn changes_state_on_timeout(kind: CommandKind) -> bool {
    matches!(
        kind,
        CommandKind::FindDatum
            | CommandKind::ExecuteMotion
            | CommandKind::ConfigMotion
            | CommandKind::RepeatMotion
            | CommandKind::ReverseMotion
    )
}

/// 网格状态存储
#[derive(Debug)]
pub struct GridStateStore {
    grid: Mutex<GridState>,
    changed: Condvar,
    tracker: Mutex<TimeoutTracker>,
    trace_wakeups: bool,
}

impl GridStateStore {
    pub fn new(num_fpus: usize, granularity: Duration, trace_wakeups: bool) -> Self {
        Self {
            grid: Mutex::new(GridState::new(num_fpus)),
            changed: Condvar::new(),
            tracker: Mutex::new(TimeoutTracker::new(num_fpus, granularity)),
            trace_wakeups,
        }
    }

    pub fn num_fpus(&self) -> usize {
        self.grid.lock().num_fpus()
    }

    /// 获取完整快照
    pub fn snapshot(&self) -> GridState {
        self.grid.lock().clone()
    }

    /// 在锁内读取，避免克隆整个网格
    pub fn with_grid<R>(&self, f: impl FnOnce(&GridState) -> R) -> R {
        f(&self.grid.lock())
    }

    /// 读取单个 FPU 的状态
    pub fn fpu(&self, fpu: usize) -> Option<FpuStatus> {
        self.grid.lock().fpus.get(fpu).cloned()
    }

    pub fn interface_state(&self) -> InterfaceState {
        self.grid.lock().interface_state
    }

    pub fn set_interface_state(&self, state: InterfaceState) {
        {
            let mut grid = self.grid.lock();
            if grid.interface_state != state {
                debug!("Interface state {:?} -> {:?}", grid.interface_state, state);
            }
            grid.interface_state = state;
        }
        self.changed.notify_all();
    }

    pub fn add_queued(&self, n: u32) {
        self.grid.lock().num_queued += n;
    }

    pub fn sub_queued(&self, n: u32) {
        let idle = {
            let mut grid = self.grid.lock();
            grid.num_queued = grid.num_queued.saturating_sub(n);
            grid.num_queued == 0
        };
        if idle || self.trace_wakeups {
            self.changed.notify_all();
        }
    }

    /// 连接建立前清空在途记录（保留设备缓存）
    ///
    /// `queued` 为队列中跨越断线保留下来的命令数，排队计数与之对齐。
    pub fn reset(&self, queued: u32) {
        let mut grid = self.grid.lock();
        let mut tracker = self.tracker.lock();
        Self::clear_pending(&mut grid, &mut tracker);
        grid.num_queued = queued;
    }

    /// 断线：清空在途记录，切换连接状态并唤醒所有等待者
    ///
    /// 排队计数不变，队列中的命令在重连后继续发送。
    pub fn on_disconnect(&self, state: InterfaceState) {
        {
            let mut grid = self.grid.lock();
            let mut tracker = self.tracker.lock();
            Self::clear_pending(&mut grid, &mut tracker);
            grid.interface_state = state;
        }
        self.changed.notify_all();
    }

    fn clear_pending(grid: &mut GridState, tracker: &mut TimeoutTracker) {
        for fpu in grid.fpus.iter_mut() {
            fpu.pending.clear();
        }
        grid.count_pending = 0;
        tracker.clear_all();
    }

    // ============================================================
    // 发送侧登记
    // ============================================================

    /// 登记单播命令（在字节写出之前调用）
    ///
    /// 成功时该命令从排队计数移到在途计数（如需响应）。
    pub fn register_sent_single(
        &self,
        fpu: usize,
        kind: CommandKind,
        seq: u8,
        deadline: Instant,
        expects_response: bool,
    ) -> Result<(), RegisterError> {
        let mut grid = self.grid.lock();
        let Some(status) = grid.fpus.get_mut(fpu) else {
            return Err(RegisterError::InvalidFpu { fpu });
        };
        if expects_response && status.pending.len() >= MAX_PENDING_PER_FPU {
            return Err(RegisterError::PendingFull { fpu });
        }
        status.last_command = Some(kind);
        if expects_response {
            let mut tracker = self.tracker.lock();
            let tick = tracker.quantize(deadline);
            status.pending.push(PendingCommand {
                kind,
                seq,
                deadline: tick,
            });
            if let Some(earliest) = status.earliest_deadline() {
                tracker.set_raw(fpu, earliest);
            }
            grid.count_pending += 1;
        }
        grid.num_queued = grid.num_queued.saturating_sub(1);
        let idle = grid.is_idle();
        drop(grid);
        if idle || self.trace_wakeups {
            self.changed.notify_all();
        }
        Ok(())
    }

    /// 登记广播命令：在一把锁内覆盖该网关所有未锁定的 FPU
    ///
    /// 返回需要发送的总线位掩码（没有参与者时为 0，命令直接丢弃）。
    pub fn register_sent_broadcast(
        &self,
        gateway: usize,
        kind: CommandKind,
        seq: u8,
        deadline: Instant,
        expects_response: bool,
    ) -> Result<u8, RegisterError> {
        let mut grid = self.grid.lock();
        let first = gateway * FPUS_PER_GATEWAY;
        let last = (first + FPUS_PER_GATEWAY).min(grid.num_fpus());
        let range = first.min(last)..last;

        if expects_response
            && let Some(fpu) = range.clone().find(|&i| {
                let f = &grid.fpus[i];
                !f.is_locked() && f.pending.len() >= MAX_PENDING_PER_FPU
            })
        {
            return Err(RegisterError::PendingFull { fpu });
        }

        let mut tracker = self.tracker.lock();
        let tick = tracker.quantize(deadline);
        let mut bus_mask = 0u8;
        let mut added = 0u32;
        for fpu in range {
            let status = &mut grid.fpus[fpu];
            if status.is_locked() {
                continue;
            }
            bus_mask |= 1 << ((fpu - first) / FPUS_PER_BUS);
            status.last_command = Some(kind);
            if expects_response {
                status.pending.push(PendingCommand {
                    kind,
                    seq,
                    deadline: tick,
                });
                if let Some(earliest) = status.earliest_deadline() {
                    tracker.set_raw(fpu, earliest);
                }
                added += 1;
            }
        }
        drop(tracker);
        grid.count_pending += added;
        grid.num_queued = grid.num_queued.saturating_sub(1);
        let idle = grid.is_idle();
        drop(grid);
        if idle || self.trace_wakeups {
            self.changed.notify_all();
        }
        Ok(bus_mask)
    }

    // ============================================================
    // 接收侧更新
    // ============================================================

    /// 应用一帧响应
    ///
    /// 设备上报的状态字是权威的；在途记录按消息码匹配，同码多条时
    /// 优先匹配序列号相同的一条。
    pub fn apply_response(
        &self,
        gateway: usize,
        frame: &GatewayFrame,
    ) -> Result<ResponseMatch, ProtocolError> {
        let response = Response::try_from(*frame)?;
        let address = FpuAddress::from_frame_fields(gateway as u8, response.bus, response.busid)?;
        let fpu = address.fpu_id() as usize;

        let mut grid = self.grid.lock();
        if fpu >= grid.num_fpus() {
            return Err(ProtocolError::ValueOutOfRange {
                field: "fpu_id",
                value: fpu as i64,
            });
        }
        let mut notify = self.trace_wakeups;
        let pending_before = grid.fpus[fpu].pending.len();
        let old_state = grid.fpus[fpu].state;

        // 1. 匹配在途命令
        let acked = |status: ResponseStatus| status == ResponseStatus::Ok;
        let report_status = response.report.map(|r| r.status);
        let outcome = {
            let status = &mut grid.fpus[fpu];
            match response.code {
                MessageCode::Command(kind @ (CommandKind::FindDatum | CommandKind::ExecuteMotion)) => {
                    if report_status.is_some_and(acked) {
                        if status.has_pending(kind) {
                            ResponseMatch::Acknowledged(kind)
                        } else {
                            ResponseMatch::Unsolicited
                        }
                    } else {
                        // 被拒绝：不会再有完成通知
                        Self::take_pending(status, kind, response.seq)
                    }
                },
                MessageCode::Command(CommandKind::AbortMotion) => {
                    Self::cancel_long_running(status);
                    Self::take_pending(status, CommandKind::AbortMotion, response.seq)
                },
                MessageCode::Command(kind) => Self::take_pending(status, kind, response.seq),
                MessageCode::Notification(Notification::FinishedDatum) => {
                    Self::take_pending(status, CommandKind::FindDatum, response.seq)
                },
                MessageCode::Notification(Notification::FinishedMotion) => {
                    Self::take_pending(status, CommandKind::ExecuteMotion, response.seq)
                },
                MessageCode::Notification(
                    Notification::WarnCollisionBeta
                    | Notification::WarnLimitAlpha
                    | Notification::WarnTimeoutDatum,
                ) => match Self::cancel_long_running(status) {
                    Some(kind) => ResponseMatch::Completed(kind),
                    None => ResponseMatch::Unsolicited,
                },
                MessageCode::Notification(Notification::WarnCanOverflow) => ResponseMatch::Unsolicited,
            }
        };
        let removed = (pending_before - grid.fpus[fpu].pending.len()) as u32;
        grid.count_pending -= removed;

        // 2. 状态字
        let mut new_state = old_state;
        if let Some(report) = response.report {
            let status = &mut grid.fpus[fpu];
            status.alpha_referenced = report.alpha_referenced;
            status.beta_referenced = report.beta_referenced;
            status.alpha_limit = report.alpha_limit;
            status.beta_collision = report.beta_collision;
            status.waveform_valid = report.waveform_valid;
            status.waveform_ready = report.waveform_ready;
            status.last_status = report.status;
            new_state = report.state;
        } else {
            grid.fpus[fpu].last_status = ResponseStatus::Ok;
        }

        // 3. 附加数据
        {
            let status = &mut grid.fpus[fpu];
            match response.data {
                ResponseData::Position {
                    alpha_steps,
                    beta_steps,
                } => {
                    status.alpha_steps = alpha_steps as i32;
                    status.beta_steps = beta_steps as i32;
                },
                ResponseData::Register { value } => status.register_value = Some(value),
                ResponseData::Firmware(version) => status.firmware = Some(version),
                ResponseData::Integrity { crc32 } => status.crc32 = Some(crc32),
                ResponseData::Serial(serial) => status.serial = Some(serial),
                ResponseData::None => {},
            }
            status.last_updated = Some(Instant::now());
        }

        // 4. 告警
        match response.code {
            MessageCode::Notification(Notification::WarnCollisionBeta) => {
                grid.fpus[fpu].beta_collision = true;
                new_state = FpuState::ObstacleError;
                warn!("FPU {}: beta arm collision", fpu);
            },
            MessageCode::Notification(Notification::WarnLimitAlpha) => {
                grid.fpus[fpu].alpha_limit = true;
                new_state = FpuState::ObstacleError;
                warn!("FPU {}: alpha limit switch breached", fpu);
            },
            MessageCode::Notification(Notification::WarnTimeoutDatum) => {
                new_state = FpuState::Aborted;
                warn!("FPU {}: datum search timed out", fpu);
            },
            MessageCode::Notification(Notification::WarnCanOverflow) => {
                grid.count_can_overflow = grid.count_can_overflow.wrapping_add(1);
                warn!("FPU {}: CAN buffer overflow reported", fpu);
                notify = true;
            },
            _ => {},
        }

        // 5. 锁定记录
        {
            let status = &mut grid.fpus[fpu];
            if new_state == FpuState::Locked {
                if old_state != FpuState::Locked {
                    status.locked_underlying = Some(old_state);
                }
            } else {
                status.locked_underlying = None;
            }
            match new_state {
                FpuState::ReadyReverse => status.waveform_reversed = true,
                FpuState::ReadyForward => status.waveform_reversed = false,
                _ => {},
            }
        }
        if grid.set_fpu_state(fpu, new_state) {
            trace!("FPU {}: {:?} -> {:?}", fpu, old_state, new_state);
            notify = true;
        }

        // 6. 超时跟踪
        if removed > 0 {
            let mut tracker = self.tracker.lock();
            match grid.fpus[fpu].earliest_deadline() {
                Some(earliest) => tracker.set_raw(fpu, earliest),
                None => tracker.clear(fpu),
            }
            if grid.count_pending == 0 {
                notify = true;
            }
        }

        drop(grid);
        if notify {
            self.changed.notify_all();
        }
        Ok(outcome)
    }

    /// 移除一条在途命令（优先匹配序列号）
    fn take_pending(status: &mut FpuStatus, kind: CommandKind, seq: u8) -> ResponseMatch {
        let index = status
            .pending
            .iter()
            .position(|p| p.kind == kind && p.seq == seq)
            .or_else(|| status.pending.iter().position(|p| p.kind == kind));
        match index {
            Some(i) => {
                status.pending.remove(i);
                ResponseMatch::Completed(kind)
            },
            None => ResponseMatch::Unsolicited,
        }
    }

    /// 取消寻零和运动的在途记录，返回被取消的命令种类
    fn cancel_long_running(status: &mut FpuStatus) -> Option<CommandKind> {
        let mut cancelled = None;
        status.pending.retain(|p| {
            let long_running = matches!(p.kind, CommandKind::FindDatum | CommandKind::ExecuteMotion);
            if long_running {
                cancelled.get_or_insert(p.kind);
            }
            !long_running
        });
        cancelled
    }

    /// 处理到期的在途命令，返回超时的命令条数
    pub fn apply_timeout_sweep(&self, now: Instant) -> usize {
        let mut grid = self.grid.lock();
        let mut tracker = self.tracker.lock();
        let now_tick = tracker.tick_floor(now);
        let mut expired_total = 0usize;

        while let Some((fpu, _)) = tracker.pop_expired(now) {
            let Some(status) = grid.fpus.get_mut(fpu) else {
                continue;
            };
            let before = status.pending.len();
            let mut state_lost = false;
            status.pending.retain(|p| {
                if p.deadline <= now_tick {
                    state_lost |= changes_state_on_timeout(p.kind);
                    false
                } else {
                    true
                }
            });
            let expired = before - status.pending.len();
            if expired > 0 {
                warn!(
                    "FPU {}: {} command(s) timed out (last {:?})",
                    fpu, expired, status.last_command
                );
                status.last_status = ResponseStatus::TimedOut;
                status.timeout_count = status.timeout_count.wrapping_add(expired as u32);
            }
            if let Some(earliest) = status.earliest_deadline() {
                tracker.set_raw(fpu, earliest);
            }
            grid.count_pending -= expired as u32;
            grid.count_timeout = grid.count_timeout.wrapping_add(expired as u32);
            if state_lost {
                grid.set_fpu_state(fpu, FpuState::Unknown);
            }
            expired_total += expired;
        }
        drop(tracker);
        drop(grid);
        if expired_total > 0 {
            self.changed.notify_all();
        }
        expired_total
    }

    /// 最早的命令截止时间
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tracker.lock().next_deadline_instant()
    }

    // ============================================================
    // 等待
    // ============================================================

    /// 等待直到条件满足、连接断开或截止时间到达
    ///
    /// `deadline` 为 `None` 时一直等待。
    pub fn wait_until(
        &self,
        mut predicate: impl FnMut(&GridState) -> bool,
        deadline: Option<Instant>,
    ) -> (GridState, WaitStatus) {
        let mut grid = self.grid.lock();
        loop {
            if let Some(status) = Self::check(&grid, &mut predicate) {
                return (grid.clone(), status);
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut grid, deadline).timed_out() {
                        let status = Self::check(&grid, &mut predicate).unwrap_or(WaitStatus::Cancelled);
                        return (grid.clone(), status);
                    }
                },
                None => self.changed.wait(&mut grid),
            }
        }
    }

    /// 等待常用条件
    pub fn wait_for(&self, target: WaitTarget, deadline: Option<Instant>) -> (GridState, WaitStatus) {
        self.wait_until(|grid| target.is_satisfied(grid), deadline)
    }

    fn check(
        grid: &GridState,
        predicate: &mut impl FnMut(&GridState) -> bool,
    ) -> Option<WaitStatus> {
        if grid.interface_state != InterfaceState::Connected {
            return Some(WaitStatus::Disconnected);
        }
        predicate(grid).then_some(WaitStatus::Satisfied)
    }
}
