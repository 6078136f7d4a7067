//! 网关 IO 循环
//!
//! 两个后台线程：
//! - 发送循环：`mio::Poll` 监听所有网关写半部的可写事件和一个 `Waker`
//!   （入队、停止时触发）。对每个可写网关先刷写残留字节，再取下一条
//!   命令，**先**在状态存储中登记在途记录，再编码写出。
//! - 接收循环：`mio::Poll` 监听所有网关读半部，超时取自超时跟踪器的
//!   最早截止时间。解码出的每一帧交给状态存储，每轮结束后清扫到期的
//!   在途命令。
//!
//! 两个循环共享 `is_running` 标志；任一侧检测到连接断开都会把连接状态
//! 置为 `Unconnected`、清除标志并唤醒另一侧。

use crate::metrics::DriverMetrics;
use crate::pool::{CommandPool, PooledCommand, Target};
use crate::queue::CommandQueue;
use crate::state::InterfaceState;
use crate::store::{GridStateStore, RegisterError, ResponseMatch};
use fpu_gateway::{FlushStatus, GatewayError, GatewayRx, GatewayTx, ReadStatus};
use fpu_protocol::BUSES_PER_GATEWAY;
#[cfg(feature = "realtime")]
use fpu_protocol::CommandKind;
use mio::{Events, Poll, Token, Waker};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// 两个 Poll 中 `Waker` 使用的 token（网关 token 为网关编号）
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// 接收循环最长的单次等待，保证能及时看到停止标志
const MAX_RX_POLL: Duration = Duration::from_millis(100);

/// 发送循环空闲时的等待上限
const MAX_TX_POLL: Duration = Duration::from_millis(100);

/// 在途记录已满时的重试间隔
const PENDING_FULL_BACKOFF: Duration = Duration::from_millis(1);

/// IO 循环共享的上下文
#[derive(Clone)]
pub struct LoopContext {
    pub pool: Arc<CommandPool>,
    pub queue: Arc<CommandQueue>,
    pub store: Arc<GridStateStore>,
    pub metrics: Arc<DriverMetrics>,
    pub is_running: Arc<AtomicBool>,
    /// 唤醒发送循环
    pub tx_waker: Arc<Waker>,
    /// 唤醒接收循环
    pub rx_waker: Arc<Waker>,
}

impl LoopContext {
    /// 连接丢失：通知状态存储并停止两个循环
    fn connection_lost(&self, gateway: usize, reason: &str) {
        error!("Gateway {}: connection lost ({})", gateway, reason);
        self.store.on_disconnect(InterfaceState::Unconnected);
        self.is_running.store(false, Ordering::Release);
        if let Err(e) = self.tx_waker.wake() {
            warn!("Failed to wake TX loop: {}", e);
        }
        if let Err(e) = self.rx_waker.wake() {
            warn!("Failed to wake RX loop: {}", e);
        }
    }
}

// ============================================================================
// 发送循环
// ============================================================================

/// 一条命令的发送结果
enum SendOutcome {
    /// 帧已进入写缓冲区，票据等字节写完后归还
    Buffered(PooledCommand),
    /// 命令没有可发送的目标，已归还
    Dropped,
    /// 在途记录已满，命令已放回队首
    Deferred,
}

/// 发送线程主循环
///
/// `links` 的下标即网关编号，调用方已把它们以 `Token(index)` 注册为
/// 可写事件，并在同一个 `poll` 上创建了 `ctx.tx_waker`。
pub fn tx_loop(mut links: Vec<GatewayTx>, mut poll: Poll, ctx: LoopContext) {
    let n = links.len();
    // 边沿触发：注册后第一次可写事件之前假定可写
    let mut writable = vec![true; n];
    let mut in_flight: Vec<Option<PooledCommand>> = (0..n).map(|_| None).collect();
    let mut seq = vec![0u8; n];
    let mut events = Events::with_capacity(64);
    let mut backoff = false;

    'outer: loop {
        // Acquire: 看到 false 时也能看到另一侧的清理写入
        if !ctx.is_running.load(Ordering::Acquire) {
            trace!("TX thread: is_running flag is false, exiting");
            break;
        }

        let queued = ctx.queue.non_empty_mask();
        let timeout = tx_poll_timeout(backoff, &writable, |g| {
            links[g].has_pending() || queued & (1 << g) != 0
        });
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("TX thread: poll failed: {}", e);
            break;
        }
        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            if let Some(flag) = writable.get_mut(token.0)
                && event.is_writable()
            {
                *flag = true;
            }
        }
        backoff = false;

        for g in 0..n {
            while writable[g] {
                if links[g].has_pending() {
                    let before = links[g].bytes_written();
                    let result = links[g].flush();
                    ctx.metrics
                        .tx_bytes
                        .fetch_add(links[g].bytes_written() - before, Ordering::Relaxed);
                    match result {
                        Ok(FlushStatus::Complete) => {
                            if let Some(ticket) = in_flight[g].take() {
                                ctx.pool.release(ticket);
                            }
                        },
                        Ok(FlushStatus::Blocked) => {
                            writable[g] = false;
                        },
                        Err(e) => {
                            ctx.metrics.socket_errors.fetch_add(1, Ordering::Relaxed);
                            ctx.connection_lost(g, &e.to_string());
                            break 'outer;
                        },
                    }
                    continue;
                }

                let Some(command) = ctx.queue.dequeue(g) else {
                    break;
                };
                match send_command(&mut links[g], g, &mut seq[g], command, &ctx) {
                    SendOutcome::Buffered(ticket) => in_flight[g] = Some(ticket),
                    SendOutcome::Dropped => {},
                    SendOutcome::Deferred => {
                        backoff = true;
                        break;
                    },
                }
            }
        }
    }

    // 未写完的命令放回队首，重连后重发
    for (g, slot) in in_flight.iter_mut().enumerate() {
        if let Some(ticket) = slot.take() {
            links[g].discard_pending();
            match ctx.queue.requeue_front(g, ticket) {
                Ok(()) => {
                    ctx.store.add_queued(1);
                    ctx.metrics.requeued_commands.fetch_add(1, Ordering::Relaxed);
                },
                Err(rejected) => ctx.pool.release(rejected.0),
            }
        }
    }

    trace!("TX thread: loop exited");
}

/// 发送循环下一次 `poll` 的超时
///
/// 只有可写且有工作（残留字节或排队命令）的网关才需要立即处理；写阻塞
/// 的网关等待可写事件，新命令由 `Waker` 唤醒。
fn tx_poll_timeout(backoff: bool, writable: &[bool], has_work: impl Fn(usize) -> bool) -> Duration {
    if backoff {
        PENDING_FULL_BACKOFF
    } else if (0..writable.len()).any(|g| writable[g] && has_work(g)) {
        Duration::ZERO
    } else {
        MAX_TX_POLL
    }
}

/// 登记并编码一条命令
fn send_command(
    link: &mut GatewayTx,
    gateway: usize,
    seq: &mut u8,
    command: PooledCommand,
    ctx: &LoopContext,
) -> SendOutcome {
    let kind = command.kind();
    let deadline = Instant::now() + command.timeout();
    *seq = seq.wrapping_add(1);
    let s = *seq;

    match command.target() {
        Target::Fpu(id) => {
            let Some(address) = command.target().address() else {
                warn!("Gateway {}: dropping {:?} for invalid FPU {}", gateway, kind, id);
                ctx.store.sub_queued(1);
                ctx.pool.release(command);
                return SendOutcome::Dropped;
            };
            let expects_response = command.command().expects_response(false);
            match ctx
                .store
                .register_sent_single(id as usize, kind, s, deadline, expects_response)
            {
                Ok(()) => {},
                Err(RegisterError::PendingFull { fpu }) => {
                    trace!("FPU {}: too many commands in flight, deferring {:?}", fpu, kind);
                    return defer(gateway, command, ctx);
                },
                Err(RegisterError::InvalidFpu { fpu }) => {
                    warn!("Gateway {}: dropping {:?} for FPU {} outside the grid", gateway, kind, fpu);
                    ctx.store.sub_queued(1);
                    ctx.pool.release(command);
                    return SendOutcome::Dropped;
                },
            }
            let frame = command.command().serialize(address.bus, address.busid, s);
            link.queue_frame(&frame);
            ctx.metrics.tx_frames.fetch_add(1, Ordering::Relaxed);
            debug!("Gateway {} TX {:?} -> FPU {} (seq {})", gateway, kind, id, s);
        },
        Target::Broadcast { .. } => {
            #[cfg(feature = "realtime")]
            let _boost = (kind == CommandKind::ExecuteMotion).then(PriorityBoost::raise);

            let expects_response = command.command().expects_response(true);
            let bus_mask = match ctx
                .store
                .register_sent_broadcast(gateway, kind, s, deadline, expects_response)
            {
                Ok(mask) => mask,
                Err(RegisterError::PendingFull { fpu }) => {
                    trace!("FPU {}: too many commands in flight, deferring broadcast {:?}", fpu, kind);
                    return defer(gateway, command, ctx);
                },
                Err(RegisterError::InvalidFpu { .. }) => {
                    ctx.store.sub_queued(1);
                    0
                },
            };
            if bus_mask == 0 {
                debug!("Gateway {}: broadcast {:?} has no participants", gateway, kind);
                ctx.pool.release(command);
                return SendOutcome::Dropped;
            }
            for bus in 0..BUSES_PER_GATEWAY as u8 {
                if bus_mask & (1 << bus) != 0 {
                    link.queue_frame(&command.command().serialize(bus, 0, s));
                    ctx.metrics.tx_frames.fetch_add(1, Ordering::Relaxed);
                }
            }
            ctx.metrics.broadcasts.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Gateway {} TX broadcast {:?} (seq {}, buses {:05b})",
                gateway, kind, s, bus_mask
            );
        },
    }
    SendOutcome::Buffered(command)
}

fn defer(gateway: usize, command: PooledCommand, ctx: &LoopContext) -> SendOutcome {
    ctx.metrics.requeued_commands.fetch_add(1, Ordering::Relaxed);
    if let Err(rejected) = ctx.queue.requeue_front(gateway, command) {
        ctx.store.sub_queued(1);
        ctx.pool.release(rejected.0);
        return SendOutcome::Dropped;
    }
    SendOutcome::Deferred
}

/// 同步广播运动期间临时提升发送线程优先级，离开作用域时恢复
#[cfg(feature = "realtime")]
struct PriorityBoost {
    previous: Option<thread_priority::ThreadPriority>,
}

#[cfg(feature = "realtime")]
impl PriorityBoost {
    fn raise() -> Self {
        use thread_priority::*;

        let previous = get_current_thread_priority().ok();
        if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
            warn!(
                "Failed to raise TX thread priority: {}. \
                On Linux, you may need to run with CAP_SYS_NICE or use rtkit.",
                e
            );
            return Self { previous: None };
        }
        Self { previous }
    }
}

#[cfg(feature = "realtime")]
impl Drop for PriorityBoost {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take()
            && let Err(e) = thread_priority::set_current_thread_priority(previous)
        {
            warn!("Failed to restore TX thread priority: {}", e);
        }
    }
}

// ============================================================================
// 接收循环
// ============================================================================

/// 接收线程主循环
///
/// `links` 的下标即网关编号，调用方已把它们以 `Token(index)` 注册为
/// 可读事件，并在同一个 `poll` 上创建了 `ctx.rx_waker`。
pub fn rx_loop(mut links: Vec<GatewayRx>, mut poll: Poll, ctx: LoopContext) {
    let n = links.len();
    let mut dropped_seen = vec![0u64; n];
    let mut events = Events::with_capacity(64);

    'outer: loop {
        if !ctx.is_running.load(Ordering::Acquire) {
            trace!("RX thread: is_running flag is false, exiting");
            break;
        }

        let timeout = ctx
            .store
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
            .map_or(MAX_RX_POLL, |d| d.min(MAX_RX_POLL));
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("RX thread: poll failed: {}", e);
            ctx.store.set_interface_state(InterfaceState::Fatal);
            ctx.is_running.store(false, Ordering::Release);
            if let Err(e) = ctx.tx_waker.wake() {
                warn!("Failed to wake TX loop: {}", e);
            }
            break;
        }

        for event in events.iter() {
            let g = event.token().0;
            if event.token() == WAKE_TOKEN || g >= n {
                continue;
            }
            match service_gateway(&mut links[g], g, &ctx) {
                Ok(ReadStatus::Drained { .. }) => {},
                Ok(ReadStatus::Closed { .. }) => {
                    ctx.connection_lost(g, "peer closed");
                    break 'outer;
                },
                Err(e) => {
                    ctx.metrics.socket_errors.fetch_add(1, Ordering::Relaxed);
                    ctx.connection_lost(g, &e.to_string());
                    break 'outer;
                },
            }
            let dropped = links[g].dropped_frames();
            if dropped > dropped_seen[g] {
                warn!(
                    "Gateway {}: {} malformed frame(s) dropped",
                    g,
                    dropped - dropped_seen[g]
                );
                ctx.metrics
                    .rx_dropped_frames
                    .fetch_add(dropped - dropped_seen[g], Ordering::Relaxed);
                dropped_seen[g] = dropped;
            }
        }

        let expired = ctx.store.apply_timeout_sweep(Instant::now());
        if expired > 0 {
            ctx.metrics
                .command_timeouts
                .fetch_add(expired as u64, Ordering::Relaxed);
        }
    }

    trace!("RX thread: loop exited");
}

/// 读空一个网关并应用所有完整帧
fn service_gateway(
    link: &mut GatewayRx,
    gateway: usize,
    ctx: &LoopContext,
) -> Result<ReadStatus, GatewayError> {
    let status = link.read_available(|frame| {
        ctx.metrics.rx_frames.fetch_add(1, Ordering::Relaxed);
        match ctx.store.apply_response(gateway, &frame) {
            Ok(ResponseMatch::Unsolicited) => {
                ctx.metrics.rx_unmatched.fetch_add(1, Ordering::Relaxed);
            },
            Ok(ResponseMatch::Completed(_) | ResponseMatch::Acknowledged(_)) => {},
            Err(e) => {
                ctx.metrics.rx_invalid.fetch_add(1, Ordering::Relaxed);
                warn!("Gateway {}: ignoring invalid response: {}", gateway, e);
            },
        }
    })?;
    let bytes = match status {
        ReadStatus::Drained { bytes } | ReadStatus::Closed { bytes } => bytes,
    };
    ctx.metrics.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    Ok(status)
}
