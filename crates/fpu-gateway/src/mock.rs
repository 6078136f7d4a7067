//! 网关模拟器
//!
//! 在本机监听一个 TCP 端口，模拟一个网关及其 5 条总线上的 380 个 FPU。
//! 用于集成测试和无硬件调试，覆盖的设备行为：
//!
//! - ping / reset / 锁定解锁 / 计步清零
//! - 寻零（先确认，延迟后发送 `FinishedDatum`）
//! - 波形装载、执行、重复、反向、急停
//! - 固件版本、序列号、寄存器、完整性校验查询
//! - 碰撞与限位恢复
//!
//! 测试可以让指定设备对某类命令保持沉默、注入告警通知、断开当前连接，
//! 并统计收到的命令数量。

use crate::GatewayError;
use fpu_protocol::{
    BUSES_PER_GATEWAY, Command, CommandKind, DatumDirection, FPUS_PER_BUS, FPUS_PER_GATEWAY,
    FirmwareVersion, FpuState, FrameDecoder, GatewayFrame, MessageCode, NUM_COMMAND_KINDS,
    Notification, RecoveryDirection, Response, ResponseData, ResponseStatus, SerialNumber,
    StatusReport, VALID_USTEP_LEVELS, encode_frame,
};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// 轮询间隔（接受连接与读超时）
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// 模拟器配置
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// 模拟的设备数量（1..=380，按逻辑编号从 0 开始填充）
    pub num_fpus: usize,
    /// 寻零耗时
    pub datum_duration: Duration,
    /// 运动耗时
    pub motion_duration: Duration,
    /// 所有设备的固件版本
    pub firmware: FirmwareVersion,
    /// 初始状态
    pub initial_state: FpuState,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            num_fpus: FPUS_PER_GATEWAY,
            datum_duration: Duration::from_millis(20),
            motion_duration: Duration::from_millis(20),
            firmware: FirmwareVersion::new(2, 0, 0),
            initial_state: FpuState::Uninitialized,
        }
    }
}

/// 单个模拟设备
#[derive(Debug, Clone)]
struct SimDevice {
    state: FpuState,
    underlying: FpuState,
    alpha_steps: i16,
    beta_steps: i16,
    alpha_referenced: bool,
    beta_referenced: bool,
    alpha_limit: bool,
    beta_collision: bool,
    waveform: Vec<(i16, i16)>,
    waveform_valid: bool,
    waveform_ready: bool,
    reversed: bool,
    firmware: FirmwareVersion,
    serial: SerialNumber,
    crc32: u32,
    /// 对这些命令不做任何响应（也不执行）
    silent: [bool; NUM_COMMAND_KINDS],
    silent_all: bool,
}

impl SimDevice {
    fn new(fpu_id: usize, config: &SimulatorConfig) -> Self {
        Self {
            state: config.initial_state,
            underlying: config.initial_state,
            alpha_steps: 0,
            beta_steps: 0,
            alpha_referenced: false,
            beta_referenced: false,
            alpha_limit: false,
            beta_collision: false,
            waveform: Vec::new(),
            waveform_valid: false,
            waveform_ready: false,
            reversed: false,
            firmware: config.firmware,
            serial: SerialNumber::default(),
            crc32: 0x5EED_0000 | fpu_id as u32,
            silent: [false; NUM_COMMAND_KINDS],
            silent_all: false,
        }
    }

    fn report(&self, status: ResponseStatus) -> StatusReport {
        StatusReport {
            state: self.state,
            status,
            alpha_referenced: self.alpha_referenced,
            beta_referenced: self.beta_referenced,
            locked: self.state == FpuState::Locked,
            alpha_limit: self.alpha_limit,
            beta_collision: self.beta_collision,
            waveform_valid: self.waveform_valid,
            waveform_ready: self.waveform_ready,
        }
    }

    fn is_silent_for(&self, kind: CommandKind) -> bool {
        self.silent_all || self.silent[kind.index()]
    }
}

/// 延迟发送的通知
#[derive(Debug, Clone, Copy)]
struct ScheduledEvent {
    due: Instant,
    fpu: usize,
    seq: u8,
    notification: Notification,
}

/// 模拟器共享状态
#[derive(Debug)]
struct SimState {
    devices: Vec<SimDevice>,
    scheduled: Vec<ScheduledEvent>,
    /// 立即发送的帧（测试注入）
    outbox: Vec<GatewayFrame>,
    received: [u64; NUM_COMMAND_KINDS],
    broadcasts: u64,
    kick_client: bool,
    connections: u64,
}

/// 网关模拟器
///
/// 析构时停止所有线程并关闭监听端口。
pub struct GatewaySimulator {
    addr: SocketAddr,
    config: SimulatorConfig,
    state: Arc<Mutex<SimState>>,
    is_running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GatewaySimulator {
    /// 在 127.0.0.1 的随机端口上启动模拟器
    pub fn start(config: SimulatorConfig) -> Result<Self, GatewayError> {
        let num_fpus = config.num_fpus.clamp(1, FPUS_PER_GATEWAY);
        let config = SimulatorConfig { num_fpus, ..config };

        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let state = Arc::new(Mutex::new(SimState {
            devices: (0..num_fpus).map(|i| SimDevice::new(i, &config)).collect(),
            scheduled: Vec::new(),
            outbox: Vec::new(),
            received: [0; NUM_COMMAND_KINDS],
            broadcasts: 0,
            kick_client: false,
            connections: 0,
        }));
        let is_running = Arc::new(AtomicBool::new(true));

        let handle = {
            let state = state.clone();
            let is_running = is_running.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("fpu-gateway-sim".into())
                .spawn(move || accept_loop(listener, state, is_running, config))?
        };

        info!("Gateway simulator listening on {} ({} FPUs)", addr, num_fpus);
        Ok(Self {
            addr,
            config,
            state,
            is_running,
            handle: Some(handle),
        })
    }

    /// 监听地址（"127.0.0.1:port"）
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn num_fpus(&self) -> usize {
        self.config.num_fpus
    }

    /// 让设备对某类命令保持沉默（`None` 表示所有命令）
    pub fn set_silent(&self, fpu: usize, kind: Option<CommandKind>, silent: bool) {
        let mut st = self.state.lock();
        if let Some(dev) = st.devices.get_mut(fpu) {
            match kind {
                Some(kind) => dev.silent[kind.index()] = silent,
                None => dev.silent_all = silent,
            }
        }
    }

    /// 设置设备固件版本
    pub fn set_firmware(&self, fpu: usize, version: FirmwareVersion) {
        if let Some(dev) = self.state.lock().devices.get_mut(fpu) {
            dev.firmware = version;
        }
    }

    /// 设置设备序列号
    pub fn set_serial(&self, fpu: usize, serial: SerialNumber) {
        if let Some(dev) = self.state.lock().devices.get_mut(fpu) {
            dev.serial = serial;
        }
    }

    /// 设置设备步数
    pub fn set_position(&self, fpu: usize, alpha_steps: i16, beta_steps: i16) {
        if let Some(dev) = self.state.lock().devices.get_mut(fpu) {
            dev.alpha_steps = alpha_steps;
            dev.beta_steps = beta_steps;
        }
    }

    /// 注入一条告警通知（同时修改设备状态）
    pub fn inject_warning(&self, fpu: usize, notification: Notification) {
        let mut st = self.state.lock();
        let Some(dev) = st.devices.get_mut(fpu) else {
            return;
        };
        match notification {
            Notification::WarnCollisionBeta => {
                dev.beta_collision = true;
                dev.state = FpuState::ObstacleError;
            },
            Notification::WarnLimitAlpha => {
                dev.alpha_limit = true;
                dev.state = FpuState::ObstacleError;
            },
            Notification::WarnTimeoutDatum => dev.state = FpuState::Aborted,
            Notification::WarnCanOverflow
            | Notification::FinishedDatum
            | Notification::FinishedMotion => {},
        }
        let status = match notification {
            Notification::WarnCollisionBeta => ResponseStatus::Collision,
            Notification::WarnLimitAlpha => ResponseStatus::AlphaLimit,
            Notification::WarnTimeoutDatum => ResponseStatus::DatumTimeout,
            _ => ResponseStatus::Ok,
        };
        let frame = position_response(fpu, dev, 0, MessageCode::Notification(notification), status);
        st.scheduled.retain(|e| e.fpu != fpu);
        st.outbox.push(frame);
    }

    /// 设备当前状态
    pub fn device_state(&self, fpu: usize) -> Option<FpuState> {
        self.state.lock().devices.get(fpu).map(|d| d.state)
    }

    /// 设备当前步数
    pub fn device_position(&self, fpu: usize) -> Option<(i16, i16)> {
        self.state
            .lock()
            .devices
            .get(fpu)
            .map(|d| (d.alpha_steps, d.beta_steps))
    }

    /// 设备已装载的波形段数
    pub fn waveform_len(&self, fpu: usize) -> usize {
        self.state
            .lock()
            .devices
            .get(fpu)
            .map(|d| d.waveform.len())
            .unwrap_or(0)
    }

    /// 收到的某类命令数量（广播按帧计数）
    pub fn command_count(&self, kind: CommandKind) -> u64 {
        self.state.lock().received[kind.index()]
    }

    /// 收到的广播帧数量
    pub fn broadcast_count(&self) -> u64 {
        self.state.lock().broadcasts
    }

    /// 接受过的连接数量
    pub fn connection_count(&self) -> u64 {
        self.state.lock().connections
    }

    /// 断开当前客户端连接
    pub fn disconnect_client(&self) {
        self.state.lock().kick_client = true;
    }

    /// 停止模拟器
    pub fn stop(&mut self) {
        self.is_running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GatewaySimulator {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// 线程
// ============================================================================

fn accept_loop(
    listener: TcpListener,
    state: Arc<Mutex<SimState>>,
    is_running: Arc<AtomicBool>,
    config: SimulatorConfig,
) {
    while is_running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Gateway simulator: client connected from {}", peer);
                {
                    let mut st = state.lock();
                    st.connections += 1;
                    st.kick_client = false;
                }
                if let Err(e) = serve_client(stream, &state, &is_running, &config) {
                    debug!("Gateway simulator: client session ended: {}", e);
                }
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!("Gateway simulator: accept failed: {}", e);
                thread::sleep(POLL_INTERVAL);
            },
        }
    }
    trace!("Gateway simulator: accept loop exited");
}

fn serve_client(
    mut stream: TcpStream,
    state: &Mutex<SimState>,
    is_running: &AtomicBool,
    config: &SimulatorConfig,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    let mut out = Vec::with_capacity(4096);

    while is_running.load(Ordering::Acquire) {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                let mut st = state.lock();
                decoder.decode_slice(&buf[..n], |frame| {
                    handle_frame(&mut st, config, &frame, &mut out);
                });
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {},
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }

        {
            let mut st = state.lock();
            if st.kick_client {
                st.kick_client = false;
                info!("Gateway simulator: dropping client connection");
                return Ok(());
            }
            flush_due_events(&mut st, Instant::now(), &mut out);
            for frame in st.outbox.drain(..) {
                out.extend(encode_frame(&frame));
            }
        }

        if !out.is_empty() {
            stream.write_all(&out)?;
            out.clear();
        }
    }
    Ok(())
}

// ============================================================================
// 设备行为
// ============================================================================

fn recovery_delta(direction: RecoveryDirection) -> i16 {
    match direction {
        RecoveryDirection::Clockwise => 10,
        RecoveryDirection::AntiClockwise => -10,
    }
}

fn fpu_index(bus: u8, busid: u8) -> usize {
    bus as usize * FPUS_PER_BUS + (busid as usize - 1)
}

fn position_response(
    fpu: usize,
    dev: &SimDevice,
    seq: u8,
    code: MessageCode,
    status: ResponseStatus,
) -> GatewayFrame {
    Response {
        bus: (fpu / FPUS_PER_BUS) as u8,
        busid: (fpu % FPUS_PER_BUS) as u8 + 1,
        seq,
        code,
        report: Some(dev.report(status)),
        data: ResponseData::Position {
            alpha_steps: dev.alpha_steps,
            beta_steps: dev.beta_steps,
        },
    }
    .to_frame()
}

fn handle_frame(st: &mut SimState, config: &SimulatorConfig, frame: &GatewayFrame, out: &mut Vec<u8>) {
    let Ok((seq, command)) = Command::parse(frame) else {
        warn!("Gateway simulator: unparseable command frame");
        return;
    };
    let kind = command.kind();
    st.received[kind.index()] += 1;

    if (frame.bus as usize) >= BUSES_PER_GATEWAY {
        return;
    }

    if frame.is_broadcast() {
        st.broadcasts += 1;
        let first = frame.bus as usize * FPUS_PER_BUS;
        let last = (first + FPUS_PER_BUS).min(st.devices.len());
        for fpu in first..last {
            if st.devices[fpu].state == FpuState::Locked {
                continue;
            }
            handle_command(st, config, fpu, seq, &command, out);
        }
        return;
    }

    let busid = frame.busid();
    if busid == 0 || busid as usize > FPUS_PER_BUS {
        return;
    }
    let fpu = fpu_index(frame.bus, busid);
    if fpu >= st.devices.len() {
        return;
    }
    handle_command(st, config, fpu, seq, &command, out);
}

fn handle_command(
    st: &mut SimState,
    config: &SimulatorConfig,
    fpu: usize,
    seq: u8,
    command: &Command,
    out: &mut Vec<u8>,
) {
    let kind = command.kind();
    if st.devices[fpu].is_silent_for(kind) {
        trace!("Gateway simulator: FPU {} silent for {:?}", fpu, kind);
        return;
    }

    let now = Instant::now();
    let code = MessageCode::Command(kind);
    let mut schedule: Option<(Duration, Notification)> = None;
    let dev = &mut st.devices[fpu];

    let locked = dev.state == FpuState::Locked;
    let allowed_when_locked = matches!(
        kind,
        CommandKind::UnlockUnit
            | CommandKind::LockUnit
            | CommandKind::PingFpu
            | CommandKind::GetFirmwareVersion
            | CommandKind::ReadSerialNumber
            | CommandKind::ReadRegister
    );
    let status = if locked && !allowed_when_locked {
        ResponseStatus::Locked
    } else {
        match *command {
            Command::PingFpu => ResponseStatus::Ok,
            Command::ResetFpu => {
                *dev = SimDevice {
                    firmware: dev.firmware,
                    serial: dev.serial,
                    crc32: dev.crc32,
                    silent: dev.silent,
                    silent_all: dev.silent_all,
                    ..SimDevice::new(fpu, config)
                };
                dev.state = FpuState::Uninitialized;
                ResponseStatus::Ok
            },
            Command::FindDatum(search) => {
                if dev.state.is_moving() || dev.state.needs_recovery() {
                    ResponseStatus::InvalidCommand
                } else {
                    if search.alpha != DatumDirection::Skip {
                        dev.alpha_steps = 0;
                        dev.alpha_referenced = true;
                    }
                    if search.beta != DatumDirection::Skip {
                        dev.beta_steps = 0;
                        dev.beta_referenced = true;
                    }
                    dev.underlying = dev.state;
                    dev.state = FpuState::DatumSearch;
                    schedule = Some((config.datum_duration, Notification::FinishedDatum));
                    ResponseStatus::Ok
                }
            },
            Command::ConfigMotion(segment) => match dev.state {
                FpuState::Moving | FpuState::DatumSearch | FpuState::ObstacleError | FpuState::Aborted => {
                    ResponseStatus::InvalidCommand
                },
                _ => {
                    if segment.first {
                        dev.waveform.clear();
                        dev.waveform_valid = false;
                        dev.waveform_ready = false;
                    }
                    dev.waveform.push((segment.alpha_steps, segment.beta_steps));
                    if segment.last {
                        dev.waveform_valid = true;
                        dev.waveform_ready = true;
                        dev.reversed = false;
                        dev.state = FpuState::ReadyForward;
                    } else {
                        dev.state = FpuState::Loading;
                    }
                    ResponseStatus::Ok
                },
            },
            Command::ExecuteMotion => {
                if dev.state.is_ready() && dev.waveform_ready {
                    let sign: i32 = if dev.reversed { -1 } else { 1 };
                    let (da, db) = dev.waveform.iter().fold((0i32, 0i32), |(a, b), &(x, y)| {
                        (a + x as i32, b + y as i32)
                    });
                    dev.alpha_steps = (dev.alpha_steps as i32 + sign * da) as i16;
                    dev.beta_steps = (dev.beta_steps as i32 + sign * db) as i16;
                    dev.state = FpuState::Moving;
                    dev.waveform_ready = false;
                    schedule = Some((config.motion_duration, Notification::FinishedMotion));
                    ResponseStatus::Ok
                } else {
                    ResponseStatus::WaveformNotReady
                }
            },
            Command::RepeatMotion | Command::ReverseMotion => {
                if dev.waveform_valid
                    && matches!(
                        dev.state,
                        FpuState::Resting | FpuState::AtDatum | FpuState::ReadyForward | FpuState::ReadyReverse
                    )
                {
                    dev.reversed = matches!(command, Command::ReverseMotion);
                    dev.waveform_ready = true;
                    dev.state = if dev.reversed {
                        FpuState::ReadyReverse
                    } else {
                        FpuState::ReadyForward
                    };
                    ResponseStatus::Ok
                } else {
                    ResponseStatus::WaveformInvalid
                }
            },
            Command::AbortMotion => {
                if dev.state.is_moving() {
                    dev.state = FpuState::Aborted;
                }
                dev.waveform_ready = false;
                st.scheduled.retain(|e| e.fpu != fpu);
                let dev = &st.devices[fpu];
                out.extend(encode_frame(&position_response(fpu, dev, seq, code, ResponseStatus::Ok)));
                return;
            },
            Command::LockUnit => {
                if dev.state != FpuState::Locked {
                    dev.underlying = dev.state;
                    dev.state = FpuState::Locked;
                }
                ResponseStatus::Ok
            },
            Command::UnlockUnit => {
                if dev.state == FpuState::Locked {
                    dev.state = dev.underlying;
                }
                ResponseStatus::Ok
            },
            Command::ResetStepCounter => {
                if dev.state.is_moving() {
                    ResponseStatus::InvalidCommand
                } else {
                    dev.alpha_steps = 0;
                    dev.beta_steps = 0;
                    ResponseStatus::Ok
                }
            },
            Command::FreeBetaCollision { direction } => {
                if dev.beta_collision {
                    let delta = recovery_delta(direction);
                    dev.beta_steps = dev.beta_steps.saturating_add(delta);
                    dev.beta_collision = false;
                    dev.state = FpuState::Resting;
                    ResponseStatus::Ok
                } else {
                    ResponseStatus::InvalidCommand
                }
            },
            Command::FreeAlphaLimitBreach { direction } => {
                if dev.alpha_limit {
                    let delta = recovery_delta(direction);
                    dev.alpha_steps = dev.alpha_steps.saturating_add(delta);
                    dev.alpha_limit = false;
                    dev.state = FpuState::Resting;
                    ResponseStatus::Ok
                } else {
                    ResponseStatus::InvalidCommand
                }
            },
            Command::EnableBetaCollisionProtection | Command::EnableAlphaLimitProtection => {
                if dev.state == FpuState::ObstacleError {
                    ResponseStatus::InvalidCommand
                } else {
                    ResponseStatus::Ok
                }
            },
            Command::SetUstepLevel { level } => {
                if VALID_USTEP_LEVELS.contains(&level) {
                    ResponseStatus::Ok
                } else {
                    ResponseStatus::InvalidParameter
                }
            },
            Command::SetTicksPerSegment { .. } | Command::SetStepsPerSegment { .. } => ResponseStatus::Ok,
            Command::EnableMove => {
                if dev.state.is_moving() {
                    ResponseStatus::InvalidCommand
                } else {
                    if dev.state == FpuState::Aborted {
                        dev.state = FpuState::Resting;
                    }
                    ResponseStatus::Ok
                }
            },
            Command::ReadRegister { address } => {
                let value = (address as u8) ^ (fpu as u8);
                let frame = Response {
                    bus: (fpu / FPUS_PER_BUS) as u8,
                    busid: (fpu % FPUS_PER_BUS) as u8 + 1,
                    seq,
                    code,
                    report: Some(dev.report(ResponseStatus::Ok)),
                    data: ResponseData::Register { value },
                }
                .to_frame();
                out.extend(encode_frame(&frame));
                return;
            },
            Command::GetFirmwareVersion => {
                let frame = Response {
                    bus: (fpu / FPUS_PER_BUS) as u8,
                    busid: (fpu % FPUS_PER_BUS) as u8 + 1,
                    seq,
                    code,
                    report: Some(dev.report(ResponseStatus::Ok)),
                    data: ResponseData::Firmware(dev.firmware),
                }
                .to_frame();
                out.extend(encode_frame(&frame));
                return;
            },
            Command::CheckIntegrity => {
                let frame = Response {
                    bus: (fpu / FPUS_PER_BUS) as u8,
                    busid: (fpu % FPUS_PER_BUS) as u8 + 1,
                    seq,
                    code,
                    report: Some(dev.report(ResponseStatus::Ok)),
                    data: ResponseData::Integrity { crc32: dev.crc32 },
                }
                .to_frame();
                out.extend(encode_frame(&frame));
                return;
            },
            Command::ReadSerialNumber => {
                let frame = Response {
                    bus: (fpu / FPUS_PER_BUS) as u8,
                    busid: (fpu % FPUS_PER_BUS) as u8 + 1,
                    seq,
                    code,
                    report: None,
                    data: ResponseData::Serial(dev.serial),
                }
                .to_frame();
                out.extend(encode_frame(&frame));
                return;
            },
            Command::WriteSerialNumber { serial } => {
                dev.serial = serial;
                ResponseStatus::Ok
            },
        }
    };

    let frame = position_response(fpu, &st.devices[fpu], seq, code, status);
    out.extend(encode_frame(&frame));

    if let Some((delay, notification)) = schedule {
        st.scheduled.push(ScheduledEvent {
            due: now + delay,
            fpu,
            seq,
            notification,
        });
    }
}

fn flush_due_events(st: &mut SimState, now: Instant, out: &mut Vec<u8>) {
    if st.scheduled.is_empty() {
        return;
    }
    let mut due = Vec::new();
    st.scheduled.retain(|e| {
        if e.due <= now {
            due.push(*e);
            false
        } else {
            true
        }
    });
    for event in due {
        let dev = &mut st.devices[event.fpu];
        match event.notification {
            Notification::FinishedDatum => {
                dev.state = FpuState::AtDatum;
            },
            Notification::FinishedMotion => {
                dev.state = FpuState::Resting;
            },
            _ => {},
        }
        let frame = position_response(
            event.fpu,
            dev,
            event.seq,
            MessageCode::Notification(event.notification),
            ResponseStatus::Ok,
        );
        out.extend(encode_frame(&frame));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fpu_protocol::{DatumSearch, MotionSegment};

    fn exchange(stream: &mut TcpStream, frames: &[GatewayFrame], want: usize) -> Vec<Response> {
        for f in frames {
            stream.write_all(&encode_frame(f)).unwrap();
        }
        stream.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut responses = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut buf = [0u8; 1024];
        while responses.len() < want && Instant::now() < deadline {
            if let Ok(n) = stream.read(&mut buf) {
                decoder.decode_slice(&buf[..n], |f| responses.push(Response::try_from(f).unwrap()));
            }
        }
        responses
    }

    fn connect(sim: &GatewaySimulator) -> TcpStream {
        TcpStream::connect(sim.address()).unwrap()
    }

    #[test]
    fn test_ping_reports_state() {
        let sim = GatewaySimulator::start(SimulatorConfig {
            num_fpus: 4,
            ..Default::default()
        })
        .unwrap();
        let mut stream = connect(&sim);
        let responses = exchange(&mut stream, &[Command::PingFpu.serialize(0, 3, 42)], 1);
        assert_eq!(responses.len(), 1);
        let r = responses[0];
        assert_eq!((r.bus, r.busid, r.seq), (0, 3, 42));
        assert_eq!(r.code, MessageCode::Command(CommandKind::PingFpu));
        assert_eq!(r.report.unwrap().state, FpuState::Uninitialized);
        assert_eq!(sim.command_count(CommandKind::PingFpu), 1);
    }

    #[test]
    fn test_datum_search_acknowledges_then_finishes() {
        let sim = GatewaySimulator::start(SimulatorConfig {
            num_fpus: 1,
            ..Default::default()
        })
        .unwrap();
        sim.set_position(0, 100, -40);
        let mut stream = connect(&sim);
        let responses = exchange(
            &mut stream,
            &[Command::FindDatum(DatumSearch::automatic()).serialize(0, 1, 7)],
            2,
        );
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].code, MessageCode::Command(CommandKind::FindDatum));
        assert_eq!(responses[0].report.unwrap().state, FpuState::DatumSearch);
        assert_eq!(
            responses[1].code,
            MessageCode::Notification(Notification::FinishedDatum)
        );
        assert_eq!(responses[1].seq, 7);
        let report = responses[1].report.unwrap();
        assert_eq!(report.state, FpuState::AtDatum);
        assert!(report.alpha_referenced && report.beta_referenced);
        assert_eq!(sim.device_position(0), Some((0, 0)));
    }

    #[test]
    fn test_silent_device_ignores_command() {
        let sim = GatewaySimulator::start(SimulatorConfig {
            num_fpus: 2,
            ..Default::default()
        })
        .unwrap();
        sim.set_silent(1, Some(CommandKind::ConfigMotion), true);
        let segment = MotionSegment {
            alpha_steps: 10,
            beta_steps: 10,
            first: true,
            last: true,
        };
        let mut stream = connect(&sim);
        let responses = exchange(
            &mut stream,
            &[
                Command::ConfigMotion(segment).serialize(0, 2, 1),
                Command::ConfigMotion(segment).serialize(0, 1, 2),
            ],
            1,
        );
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].busid, 1);
        assert_eq!(sim.device_state(0), Some(FpuState::ReadyForward));
        assert_eq!(sim.waveform_len(1), 0);
        assert_eq!(sim.command_count(CommandKind::ConfigMotion), 2);
    }

    #[test]
    fn test_broadcast_skips_locked_devices() {
        let sim = GatewaySimulator::start(SimulatorConfig {
            num_fpus: 3,
            initial_state: FpuState::Resting,
            ..Default::default()
        })
        .unwrap();
        let mut stream = connect(&sim);
        let lock = exchange(&mut stream, &[Command::LockUnit.serialize(0, 2, 1)], 1);
        assert_eq!(lock[0].report.unwrap().state, FpuState::Locked);

        let responses = exchange(&mut stream, &[Command::PingFpu.serialize(0, 0, 5)], 2);
        let mut busids: Vec<u8> = responses.iter().map(|r| r.busid).collect();
        busids.sort_unstable();
        assert_eq!(busids, vec![1, 3]);
        assert_eq!(sim.broadcast_count(), 1);
    }

    #[test]
    fn test_aborted_device_needs_enable_move() {
        let sim = GatewaySimulator::start(SimulatorConfig {
            num_fpus: 1,
            initial_state: FpuState::Aborted,
            ..Default::default()
        })
        .unwrap();
        let segment = MotionSegment {
            alpha_steps: 10,
            beta_steps: 0,
            first: true,
            last: true,
        };
        let mut stream = connect(&sim);

        let rejected = exchange(&mut stream, &[Command::ConfigMotion(segment).serialize(0, 1, 1)], 1);
        let report = rejected[0].report.unwrap();
        assert_eq!(report.status, ResponseStatus::InvalidCommand);
        assert_eq!(report.state, FpuState::Aborted);
        let rejected = exchange(
            &mut stream,
            &[Command::FindDatum(DatumSearch::automatic()).serialize(0, 1, 2)],
            1,
        );
        assert_eq!(rejected[0].report.unwrap().status, ResponseStatus::InvalidCommand);

        let enabled = exchange(&mut stream, &[Command::EnableMove.serialize(0, 1, 3)], 1);
        assert_eq!(enabled[0].report.unwrap().state, FpuState::Resting);
        let loaded = exchange(&mut stream, &[Command::ConfigMotion(segment).serialize(0, 1, 4)], 1);
        assert_eq!(loaded[0].report.unwrap().state, FpuState::ReadyForward);
        assert_eq!(sim.waveform_len(0), 1);
    }
}
