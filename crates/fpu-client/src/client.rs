//! 网格操作层
//!
//! [`GridClient`] 把驱动的异步命令提交封装成同步操作。每个操作的流程：
//!
//! 1. 取快照并检查连接；
//! 2. 检查目标 FPU 的前置条件（失败时立即返回，不发出任何命令）；
//! 3. 逐个 FPU 入队，或在覆盖整个网格时每个网关一条广播；
//! 4. 可选地等待完成，并用超时/溢出计数器的差值区分
//!    "仍在进行"、"缓冲区溢出" 和 "成功"。
//!
//! 寻零与运动执行分为 `*_start` / `*_wait` 两步，也可以一次完成。

use crate::error::GridError;
use crate::types::{FpuSelection, OpOutcome};
use crate::waveform::{WaveformTable, firmware_semver, ruleset_for_firmware, validate};
use fpu_driver::{
    DriverConfig, FpuStatus, GridDriver, GridState, Target, WaitStatus, WaitTarget,
    WaveformRuleset,
};
use fpu_protocol::{
    Command, CommandKind, DatumSearch, FpuState, MAX_TICKS_PER_SEGMENT, MotionSegment,
    RecoveryDirection, ResponseStatus, SerialNumber, VALID_USTEP_LEVELS,
};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 等待预算在命令超时之外的余量
const WAIT_MARGIN: Duration = Duration::from_secs(1);

/// 结果类型别名
pub type Result<T> = std::result::Result<T, GridError>;

/// 超时与溢出计数器（用于前后差值）
#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    timeouts: u32,
    overflows: u32,
}

impl Counters {
    fn of(grid: &GridState) -> Self {
        Self {
            timeouts: grid.count_timeout,
            overflows: grid.count_can_overflow,
        }
    }

    /// 与之后的快照比较（计数器回绕）
    fn check(self, after: &GridState) -> Result<()> {
        let overflows = after.count_can_overflow.wrapping_sub(self.overflows);
        if overflows > 0 {
            return Err(GridError::CanOverflow { count: overflows });
        }
        let timeouts = after.count_timeout.wrapping_sub(self.timeouts);
        if timeouts > 0 {
            return Err(GridError::CommandTimeout { count: timeouts });
        }
        Ok(())
    }
}

/// 已启动、尚未等待完成的长时操作
#[derive(Debug)]
struct InFlight {
    counters: Counters,
    targets: Vec<u16>,
}

// ============================================================================
// 前置条件
// ============================================================================

fn not_locked(fpu: u16, status: &FpuStatus) -> Result<()> {
    if status.is_locked() {
        return Err(GridError::Locked { fpu });
    }
    Ok(())
}

fn not_moving(fpu: u16, status: &FpuStatus) -> Result<()> {
    if matches!(status.state, FpuState::Moving | FpuState::DatumSearch) {
        return Err(GridError::InvalidState {
            fpu,
            state: status.state,
        });
    }
    Ok(())
}

fn no_unresolved_fault(fpu: u16, status: &FpuStatus) -> Result<()> {
    if status.state == FpuState::ObstacleError || status.beta_collision || status.alpha_limit {
        return Err(GridError::UnresolvedCollision { fpu });
    }
    Ok(())
}

fn not_aborted(fpu: u16, status: &FpuStatus) -> Result<()> {
    if status.state == FpuState::Aborted {
        return Err(GridError::InAbortedState { fpu });
    }
    Ok(())
}

/// 可以开始运动的 FPU
fn movable(fpu: u16, status: &FpuStatus) -> Result<()> {
    not_locked(fpu, status)?;
    no_unresolved_fault(fpu, status)?;
    not_aborted(fpu, status)?;
    not_moving(fpu, status)
}

/// 网格操作客户端
pub struct GridClient {
    driver: GridDriver,
    datum: Mutex<Option<InFlight>>,
    motion: Mutex<Option<InFlight>>,
}

impl GridClient {
    pub fn new(config: DriverConfig) -> Result<Self> {
        Ok(Self::from_driver(GridDriver::new(config)?))
    }

    pub fn from_driver(driver: GridDriver) -> Self {
        Self {
            driver,
            datum: Mutex::new(None),
            motion: Mutex::new(None),
        }
    }

    pub fn driver(&self) -> &GridDriver {
        &self.driver
    }

    pub fn config(&self) -> &DriverConfig {
        self.driver.config()
    }

    pub fn num_fpus(&self) -> usize {
        self.driver.num_fpus()
    }

    pub fn snapshot(&self) -> GridState {
        self.driver.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.driver.is_connected()
    }

    // ============================================================
    // 连接
    // ============================================================

    /// 连接所有网关，并探测每个 FPU 的状态和固件版本
    ///
    /// 探测失败（部分 FPU 无响应）只记录告警，连接本身仍然成功。
    pub fn connect(&self) -> Result<OpOutcome> {
        self.driver.connect()?;
        *self.datum.lock() = None;
        *self.motion.lock() = None;
        info!("Grid connected, probing {} FPUs", self.num_fpus());

        if let Err(e) = self.ping(FpuSelection::All) {
            warn!("Initial ping incomplete: {}", e);
        }
        if let Err(e) = self.get_firmware_version(FpuSelection::All) {
            warn!("Firmware query incomplete: {}", e);
        }
        Ok(OpOutcome::new(self.snapshot(), true))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.driver.disconnect()?;
        *self.datum.lock() = None;
        *self.motion.lock() = None;
        Ok(())
    }

    // ============================================================
    // 通用流程
    // ============================================================

    fn connected_snapshot(&self) -> Result<GridState> {
        let grid = self.driver.snapshot();
        if !grid.is_connected() {
            return Err(GridError::NotConnected);
        }
        Ok(grid)
    }

    /// 解析目标集合（去重、排序、检查编号）
    fn resolve(&self, selection: &FpuSelection, grid: &GridState) -> Result<Vec<u16>> {
        match selection {
            FpuSelection::All => Ok((0..grid.num_fpus() as u16)
                .filter(|&id| !grid.fpus[id as usize].is_locked())
                .collect()),
            FpuSelection::Only(ids) => {
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                if let Some(&bad) = ids.iter().find(|&&id| id as usize >= grid.num_fpus()) {
                    return Err(GridError::InvalidFpuId {
                        fpu: bad as usize,
                        num_fpus: grid.num_fpus(),
                    });
                }
                Ok(ids)
            },
        }
    }

    fn require(
        grid: &GridState,
        ids: &[u16],
        check: impl Fn(u16, &FpuStatus) -> Result<()>,
    ) -> Result<()> {
        ids.iter()
            .try_for_each(|&id| check(id, &grid.fpus[id as usize]))
    }

    /// 发送命令：覆盖整个网格且命令支持广播时每个网关一条广播，
    /// 否则逐个 FPU 发送
    fn dispatch(
        &self,
        selection: &FpuSelection,
        ids: &[u16],
        make: impl Fn(u16) -> Command,
    ) -> Result<()> {
        let sample = make(0);
        if selection.is_all() && sample.kind().supports_broadcast() {
            for gateway in 0..self.driver.num_gateways() {
                self.driver
                    .send(sample, Target::Broadcast { gateway: gateway as u8 })?;
            }
            debug!("Broadcast {:?} to {} gateway(s)", sample.kind(), self.driver.num_gateways());
            return Ok(());
        }
        for &id in ids {
            self.driver.send(make(id), Target::Fpu(id))?;
        }
        debug!("Sent {:?} to {} FPU(s)", sample.kind(), ids.len());
        Ok(())
    }

    /// 长时操作的发送中途失败：不留下在途记录，丢弃已入队未发出的命令
    fn abandon_dispatch(&self, slot: &Mutex<Option<InFlight>>, err: GridError) -> GridError {
        *slot.lock() = None;
        let flushed = self.driver.flush_queues();
        warn!("Dispatch failed ({}), discarded {} queued command(s)", err, flushed);
        err
    }

    /// 该类命令的等待预算
    fn wait_budget(&self, kind: CommandKind) -> Duration {
        self.config().timeouts.for_kind(kind) * 2 + WAIT_MARGIN
    }

    /// 等待条件成立，返回快照和是否完成
    fn wait(&self, target: WaitTarget, timeout: Option<Duration>) -> Result<(GridState, bool)> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let (grid, status) = self.driver.wait_for(target, deadline);
        match status {
            WaitStatus::Satisfied => Ok((grid, true)),
            WaitStatus::Cancelled => Ok((grid, false)),
            WaitStatus::Disconnected => Err(GridError::ConnectionLost),
        }
    }

    /// 检查目标 FPU 对某类命令的响应状态
    fn check_responses(grid: &GridState, ids: &[u16], kind: CommandKind) -> Result<()> {
        for &id in ids {
            let status = &grid.fpus[id as usize];
            if status.last_command == Some(kind) && status.last_status != ResponseStatus::Ok {
                return Err(GridError::from_status(id, status.last_status));
            }
        }
        Ok(())
    }

    /// 简单命令：前置检查、发送、等待所有响应
    fn run(
        &self,
        selection: FpuSelection,
        precondition: impl Fn(u16, &FpuStatus) -> Result<()>,
        make: impl Fn(u16) -> Command,
    ) -> Result<OpOutcome> {
        let grid = self.connected_snapshot()?;
        let ids = self.resolve(&selection, &grid)?;
        Self::require(&grid, &ids, precondition)?;
        if ids.is_empty() {
            return Ok(OpOutcome::new(grid, true));
        }

        let kind = make(ids[0]).kind();
        let before = Counters::of(&grid);
        self.dispatch(&selection, &ids, make)?;
        let (after, finished) = self.wait(WaitTarget::NoMorePending, Some(self.wait_budget(kind)))?;
        if finished {
            before.check(&after)?;
            Self::check_responses(&after, &ids, kind)?;
        }
        Ok(OpOutcome::new(after, finished))
    }

    /// 等待长时操作（寻零/运动）完成并检查目标
    fn finish_long_running(
        &self,
        slot: &Mutex<Option<InFlight>>,
        target: WaitTarget,
        timeout: Option<Duration>,
        accept: impl Fn(FpuState) -> bool,
    ) -> Result<OpOutcome> {
        let in_flight = slot.lock().take();
        let (grid, finished) = self.wait(target, timeout)?;
        if !finished {
            *slot.lock() = in_flight;
            return Ok(OpOutcome::new(grid, false));
        }
        let Some(InFlight { counters, targets }) = in_flight else {
            return Ok(OpOutcome::new(grid, true));
        };
        counters.check(&grid)?;
        for &id in &targets {
            let status = &grid.fpus[id as usize];
            if status.last_status != ResponseStatus::Ok {
                return Err(GridError::from_status(id, status.last_status));
            }
            if !accept(status.state) {
                return Err(GridError::InvalidState {
                    fpu: id,
                    state: status.state,
                });
            }
        }
        Ok(OpOutcome::new(grid, true))
    }

    // ============================================================
    // 基本命令
    // ============================================================

    /// 查询状态和步数
    pub fn ping(&self, selection: impl Into<FpuSelection>) -> Result<OpOutcome> {
        self.run(selection.into(), |_, _| Ok(()), |_| Command::PingFpu)
    }

    /// 软复位（丢弃波形和寻零状态）
    pub fn reset(&self, selection: impl Into<FpuSelection>) -> Result<OpOutcome> {
        self.run(selection.into(), not_moving, |_| Command::ResetFpu)
    }

    pub fn reset_step_counters(&self, selection: impl Into<FpuSelection>) -> Result<OpOutcome> {
        self.run(
            selection.into(),
            |id, s| {
                not_locked(id, s)?;
                not_moving(id, s)
            },
            |_| Command::ResetStepCounter,
        )
    }

    pub fn lock_fpu(&self, fpu: u16) -> Result<OpOutcome> {
        self.run(fpu.into(), not_moving, |_| Command::LockUnit)
    }

    pub fn unlock_fpu(&self, fpu: u16) -> Result<OpOutcome> {
        self.run(fpu.into(), |_, _| Ok(()), |_| Command::UnlockUnit)
    }

    // ============================================================
    // 寻零
    // ============================================================

    /// 开始寻零（不等待完成）
    pub fn find_datum_start(
        &self,
        selection: impl Into<FpuSelection>,
        search: DatumSearch,
    ) -> Result<OpOutcome> {
        let selection = selection.into();
        let grid = self.connected_snapshot()?;
        let ids = self.resolve(&selection, &grid)?;
        Self::require(&grid, &ids, movable)?;

        if let Err(e) = self.dispatch(&selection, &ids, |_| Command::FindDatum(search)) {
            return Err(self.abandon_dispatch(&self.datum, e));
        }
        *self.datum.lock() = Some(InFlight {
            counters: Counters::of(&grid),
            targets: ids.clone(),
        });
        info!("Datum search started on {} FPU(s)", ids.len());
        Ok(OpOutcome::new(self.snapshot(), false))
    }

    /// 等待寻零结束（`None` 表示无限等待）
    pub fn find_datum_wait(&self, timeout: Option<Duration>) -> Result<OpOutcome> {
        self.finish_long_running(&self.datum, WaitTarget::DatumFinished, timeout, |state| {
            state == FpuState::AtDatum
        })
    }

    /// 寻零并等待完成
    pub fn find_datum(
        &self,
        selection: impl Into<FpuSelection>,
        search: DatumSearch,
    ) -> Result<OpOutcome> {
        self.find_datum_start(selection, search)?;
        self.find_datum_wait(Some(self.wait_budget(CommandKind::FindDatum)))
    }

    // ============================================================
    // 波形
    // ============================================================

    /// 当前生效的波形规则版本
    ///
    /// 配置中固定了版本时直接使用；否则按目标 FPU 中最低的固件版本
    /// 选择（必要时先查询固件版本）。
    pub fn waveform_ruleset(&self, fpus: &[u16]) -> Result<WaveformRuleset> {
        if let Some(ruleset) = self.config().motion.ruleset {
            return Ok(ruleset);
        }
        let mut grid = self.connected_snapshot()?;
        if fpus
            .iter()
            .any(|&id| grid.fpus.get(id as usize).is_some_and(|s| s.firmware.is_none()))
        {
            grid = self.get_firmware_version(fpus)?.grid;
        }
        let min = fpus
            .iter()
            .filter_map(|&id| grid.fpus.get(id as usize).and_then(|s| s.firmware))
            .min()
            .map(firmware_semver);
        Ok(ruleset_for_firmware(min.as_ref()))
    }

    /// 装载波形
    ///
    /// 每轮给每个 FPU 发送至多 `config_chunk_size` 段，然后等待确认。
    /// 没有到达预期状态的 FPU 从第 0 段重新开始；失败轮数超过
    /// `max_config_retries` 时返回 `MaxRetriesExceeded`。
    pub fn configure_motion(
        &self,
        table: &WaveformTable,
        allow_uninitialized: bool,
    ) -> Result<OpOutcome> {
        let grid = self.connected_snapshot()?;
        let ids: Vec<u16> = table.fpus().collect();
        if let Some(&bad) = ids.iter().find(|&&id| id as usize >= grid.num_fpus()) {
            return Err(GridError::InvalidFpuId {
                fpu: bad as usize,
                num_fpus: grid.num_fpus(),
            });
        }
        Self::require(&grid, &ids, |id, s| {
            movable(id, s)?;
            if !allow_uninitialized && !s.is_referenced() {
                return Err(GridError::NotReferenced { fpu: id });
            }
            Ok(())
        })?;

        let ruleset = self.waveform_ruleset(&ids)?;
        validate(table, &self.config().motion, ruleset)?;

        let num_segments = table.num_segments();
        let chunk = self.config().config_chunk_size;
        let max_retries = self.config().max_config_retries;
        let budget = self.wait_budget(CommandKind::ConfigMotion);
        let before = Counters::of(&self.snapshot());
        info!(
            "Uploading {} segment(s) to {} FPU(s) (ruleset {:?})",
            num_segments,
            ids.len(),
            ruleset
        );

        // (FPU, 下一段)
        let mut progress: Vec<(u16, usize)> = ids.iter().map(|&id| (id, 0)).collect();
        let mut attempts = 1u32;
        let grid = loop {
            let mut round_end = Vec::with_capacity(progress.len());
            for &(fpu, next) in &progress {
                let steps = table.get(fpu).unwrap_or_default();
                let end = (next + chunk).min(num_segments);
                for (index, pair) in steps.iter().enumerate().take(end).skip(next) {
                    let segment = MotionSegment {
                        alpha_steps: pair.alpha,
                        beta_steps: pair.beta,
                        first: index == 0,
                        last: index + 1 == num_segments,
                    };
                    self.driver.send(Command::ConfigMotion(segment), Target::Fpu(fpu))?;
                }
                round_end.push(end);
            }

            let (after, finished) = self.wait(WaitTarget::NoMorePending, Some(budget))?;
            let mut failed = 0usize;
            let mut remaining = Vec::new();
            for (&(fpu, _), end) in progress.iter().zip(round_end) {
                let status = &after.fpus[fpu as usize];
                if status.last_status.is_hardware_fault() {
                    return Err(GridError::HardwareFault {
                        fpu,
                        status: status.last_status,
                    });
                }
                no_unresolved_fault(fpu, status)?;

                let expected = if end == num_segments {
                    FpuState::ReadyForward
                } else {
                    FpuState::Loading
                };
                let confirmed = finished
                    && status.last_status == ResponseStatus::Ok
                    && status.state == expected
                    && !status.has_pending(CommandKind::ConfigMotion);
                if !confirmed {
                    debug!(
                        "FPU {}: waveform not confirmed (state {:?}, status {:?})",
                        fpu, status.state, status.last_status
                    );
                    failed += 1;
                    remaining.push((fpu, 0));
                } else if end < num_segments {
                    remaining.push((fpu, end));
                }
            }

            if remaining.is_empty() {
                break after;
            }
            if failed > 0 {
                if attempts > max_retries {
                    warn!(
                        "Waveform upload gave up after {} attempt(s), {} FPU(s) unconfirmed",
                        attempts, failed
                    );
                    return Err(GridError::MaxRetriesExceeded { attempts });
                }
                attempts += 1;
                warn!(
                    "{} FPU(s) failed waveform upload, restarting them (attempt {}/{})",
                    failed,
                    attempts,
                    max_retries + 1
                );
            }
            progress = remaining;
        };

        let overflows = grid.count_can_overflow.wrapping_sub(before.overflows);
        if overflows > 0 {
            return Err(GridError::CanOverflow { count: overflows });
        }
        info!("Waveform loaded on {} FPU(s)", ids.len());
        Ok(OpOutcome::new(grid, true))
    }

    // ============================================================
    // 运动
    // ============================================================

    /// 开始执行已装载的波形（不等待完成）
    pub fn execute_motion_start(&self, selection: impl Into<FpuSelection>) -> Result<OpOutcome> {
        let selection = selection.into();
        let grid = self.connected_snapshot()?;
        let ids = self.resolve(&selection, &grid)?;
        Self::require(&grid, &ids, |id, s| {
            movable(id, s)?;
            if !s.state.is_ready() || !s.waveform_ready {
                return Err(GridError::InvalidState { fpu: id, state: s.state });
            }
            Ok(())
        })?;

        if let Err(e) = self.dispatch(&selection, &ids, |_| Command::ExecuteMotion) {
            return Err(self.abandon_dispatch(&self.motion, e));
        }
        *self.motion.lock() = Some(InFlight {
            counters: Counters::of(&grid),
            targets: ids.clone(),
        });
        info!("Motion started on {} FPU(s)", ids.len());
        Ok(OpOutcome::new(self.snapshot(), false))
    }

    /// 等待运动结束（`None` 表示无限等待）
    pub fn execute_motion_wait(&self, timeout: Option<Duration>) -> Result<OpOutcome> {
        self.finish_long_running(&self.motion, WaitTarget::MovementFinished, timeout, |state| {
            matches!(state, FpuState::Resting | FpuState::AtDatum)
        })
    }

    /// 执行运动并等待完成
    pub fn execute_motion(&self, selection: impl Into<FpuSelection>) -> Result<OpOutcome> {
        self.execute_motion_start(selection)?;
        self.execute_motion_wait(Some(self.wait_budget(CommandKind::ExecuteMotion)))
    }

    fn rearm_waveform(&self, selection: FpuSelection, command: Command) -> Result<OpOutcome> {
        self.run(
            selection,
            |id, s| {
                movable(id, s)?;
                let rearmable = matches!(
                    s.state,
                    FpuState::Resting | FpuState::AtDatum | FpuState::ReadyForward | FpuState::ReadyReverse
                );
                if !s.waveform_valid || !rearmable {
                    return Err(GridError::InvalidState { fpu: id, state: s.state });
                }
                Ok(())
            },
            |_| command,
        )
    }

    /// 再次正向执行上一次装载的波形（之后需要 `execute_motion`）
    pub fn repeat_motion(&self, selection: impl Into<FpuSelection>) -> Result<OpOutcome> {
        self.rearm_waveform(selection.into(), Command::RepeatMotion)
    }

    /// 反向执行上一次装载的波形（之后需要 `execute_motion`）
    pub fn reverse_motion(&self, selection: impl Into<FpuSelection>) -> Result<OpOutcome> {
        self.rearm_waveform(selection.into(), Command::ReverseMotion)
    }

    /// 急停
    ///
    /// 先清空所有尚未发送的命令，再向每个网关广播 `AbortMotion`。
    pub fn abort_motion(&self) -> Result<OpOutcome> {
        self.connected_snapshot()?;
        let flushed = self.driver.flush_queues();
        if flushed > 0 {
            warn!("Abort: discarded {} queued command(s)", flushed);
        }
        for gateway in 0..self.driver.num_gateways() {
            self.driver
                .send(Command::AbortMotion, Target::Broadcast { gateway: gateway as u8 })?;
        }
        info!("Abort broadcast sent");
        let (grid, finished) = self.wait(
            WaitTarget::MovementFinished,
            Some(self.wait_budget(CommandKind::AbortMotion)),
        )?;
        *self.motion.lock() = None;
        *self.datum.lock() = None;
        Ok(OpOutcome::new(grid, finished))
    }

    // ============================================================
    // 碰撞与限位恢复
    // ============================================================

    /// 把碰撞的 beta 臂朝指定方向移开
    pub fn free_beta_collision(&self, fpu: u16, direction: RecoveryDirection) -> Result<OpOutcome> {
        self.run(
            fpu.into(),
            |id, s| {
                not_locked(id, s)?;
                if !s.beta_collision {
                    return Err(GridError::InvalidState { fpu: id, state: s.state });
                }
                Ok(())
            },
            |_| Command::FreeBetaCollision { direction },
        )
    }

    pub fn enable_beta_collision_protection(
        &self,
        selection: impl Into<FpuSelection>,
    ) -> Result<OpOutcome> {
        self.run(selection.into(), not_locked, |_| {
            Command::EnableBetaCollisionProtection
        })
    }

    /// 把越过限位的 alpha 臂朝指定方向移回
    pub fn free_alpha_limit_breach(
        &self,
        fpu: u16,
        direction: RecoveryDirection,
    ) -> Result<OpOutcome> {
        self.run(
            fpu.into(),
            |id, s| {
                not_locked(id, s)?;
                if !s.alpha_limit {
                    return Err(GridError::InvalidState { fpu: id, state: s.state });
                }
                Ok(())
            },
            |_| Command::FreeAlphaLimitBreach { direction },
        )
    }

    pub fn enable_alpha_limit_protection(
        &self,
        selection: impl Into<FpuSelection>,
    ) -> Result<OpOutcome> {
        self.run(selection.into(), not_locked, |_| {
            Command::EnableAlphaLimitProtection
        })
    }

    // ============================================================
    // 查询
    // ============================================================

    /// 读寄存器（结果在 `FpuStatus::register_value`）
    pub fn read_register(
        &self,
        selection: impl Into<FpuSelection>,
        address: u16,
    ) -> Result<OpOutcome> {
        self.run(selection.into(), |_, _| Ok(()), |_| Command::ReadRegister { address })
    }

    /// 查询固件版本（结果在 `FpuStatus::firmware`）
    pub fn get_firmware_version(&self, selection: impl Into<FpuSelection>) -> Result<OpOutcome> {
        self.run(selection.into(), |_, _| Ok(()), |_| Command::GetFirmwareVersion)
    }

    /// 网格中缓存的最低固件版本
    pub fn min_firmware_version(&self) -> Option<semver::Version> {
        self.snapshot().min_firmware().map(firmware_semver)
    }

    /// 计算固件/参数区校验和（结果在 `FpuStatus::crc32`）
    pub fn check_integrity(&self, selection: impl Into<FpuSelection>) -> Result<OpOutcome> {
        self.run(selection.into(), |_, _| Ok(()), |_| Command::CheckIntegrity)
    }

    /// 读序列号（结果在 `FpuStatus::serial`）
    pub fn read_serial_numbers(&self, selection: impl Into<FpuSelection>) -> Result<OpOutcome> {
        self.run(selection.into(), |_, _| Ok(()), |_| Command::ReadSerialNumber)
    }

    /// 写序列号
    ///
    /// 序列号必须是 1..=6 个可打印 ASCII 字符，且不能与网格中其他
    /// FPU 重复（缺少缓存时先读取全部序列号）。写入后读回确认。
    pub fn write_serial_number(&self, fpu: u16, serial: &str) -> Result<OpOutcome> {
        let parsed = SerialNumber::parse(serial).map_err(|e| GridError::InvalidParameter {
            param: "serial",
            reason: e.to_string(),
        })?;
        let mut grid = self.connected_snapshot()?;
        let ids = self.resolve(&fpu.into(), &grid)?;
        Self::require(&grid, &ids, |id, s| {
            not_locked(id, s)?;
            not_moving(id, s)
        })?;

        if grid.fpus.iter().any(|s| s.serial.is_none()) {
            grid = self.read_serial_numbers(FpuSelection::All)?.grid;
        }
        if let Some((other, _)) = grid
            .fpus
            .iter()
            .enumerate()
            .find(|(id, s)| *id != fpu as usize && s.serial == Some(parsed))
        {
            return Err(GridError::DuplicateSerialNumber {
                serial: parsed.to_string(),
                other: other as u16,
            });
        }

        self.run(fpu.into(), |_, _| Ok(()), |_| Command::WriteSerialNumber { serial: parsed })?;
        let outcome = self.read_serial_numbers(fpu)?;
        if outcome.finished
            && outcome.fpu(fpu).and_then(|s| s.serial) != Some(parsed)
        {
            return Err(GridError::Rejected {
                fpu,
                status: ResponseStatus::InvalidParameter,
            });
        }
        info!("FPU {}: serial number set to {}", fpu, parsed);
        Ok(outcome)
    }

    // ============================================================
    // 运动参数
    // ============================================================

    /// 设置微步等级（1、2、4、8）
    pub fn set_ustep_level(&self, selection: impl Into<FpuSelection>, level: u8) -> Result<OpOutcome> {
        if !VALID_USTEP_LEVELS.contains(&level) {
            return Err(GridError::InvalidParameter {
                param: "level",
                reason: format!("{level} not in {VALID_USTEP_LEVELS:?}"),
            });
        }
        self.run(
            selection.into(),
            |id, s| {
                not_locked(id, s)?;
                not_moving(id, s)
            },
            |_| Command::SetUstepLevel { level },
        )
    }

    /// 设置每段的电机时钟数
    pub fn set_ticks_per_segment(
        &self,
        selection: impl Into<FpuSelection>,
        ticks: u32,
    ) -> Result<OpOutcome> {
        if ticks == 0 || ticks > MAX_TICKS_PER_SEGMENT {
            return Err(GridError::InvalidParameter {
                param: "ticks",
                reason: format!("must be in 1..={MAX_TICKS_PER_SEGMENT}, got {ticks}"),
            });
        }
        self.run(
            selection.into(),
            |id, s| {
                not_locked(id, s)?;
                not_moving(id, s)
            },
            |_| Command::SetTicksPerSegment { ticks },
        )
    }

    /// 设置每段的最小/最大步数
    pub fn set_steps_per_segment(
        &self,
        selection: impl Into<FpuSelection>,
        min_steps: u16,
        max_steps: u16,
    ) -> Result<OpOutcome> {
        if min_steps == 0 || min_steps > max_steps || max_steps > i16::MAX as u16 {
            return Err(GridError::InvalidParameter {
                param: "steps",
                reason: format!("need 0 < min <= max <= {}, got {min_steps}..{max_steps}", i16::MAX),
            });
        }
        self.run(
            selection.into(),
            |id, s| {
                not_locked(id, s)?;
                not_moving(id, s)
            },
            |_| Command::SetStepsPerSegment {
                min_steps,
                max_steps,
            },
        )
    }

    /// 重新允许运动
    ///
    /// 急停后处于 `Aborted` 的 FPU 拒绝寻零、装载波形和执行，直到收到
    /// 该命令回到 `Resting`（复位同样会清除）。
    pub fn enable_move(&self, selection: impl Into<FpuSelection>) -> Result<OpOutcome> {
        self.run(
            selection.into(),
            |id, s| {
                not_locked(id, s)?;
                not_moving(id, s)
            },
            |_| Command::EnableMove,
        )
    }
}
