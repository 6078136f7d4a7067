//! 网格驱动（对外 API）
//!
//! [`GridDriver`] 持有命令池、命令队列、状态存储和指标，并在连接期间
//! 管理接收/发送两个后台线程。命令的提交不等待响应；调用方通过
//! [`GridDriver::wait_until`] 在状态存储上等待结果。

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::metrics::{DriverMetrics, MetricsSnapshot};
use crate::pipeline::{LoopContext, WAKE_TOKEN, rx_loop, tx_loop};
use crate::pool::{CommandPool, PooledCommand, Target};
use crate::queue::{CommandQueue, QueueFull};
use crate::state::{GridState, InterfaceState, WaitStatus, WaitTarget};
use crate::store::GridStateStore;
use fpu_gateway::GatewayLink;
use fpu_protocol::Command;
use mio::{Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 线程退出等待上限
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Extension trait for timeout-capable thread joins
trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        use std::sync::mpsc;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(self.join());
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "Thread panicked during join",
            ))),
        }
    }
}

/// 一次连接期间的后台线程
struct IoThreads {
    rx_thread: JoinHandle<()>,
    tx_thread: JoinHandle<()>,
    is_running: Arc<AtomicBool>,
    rx_waker: Arc<Waker>,
    tx_waker: Arc<Waker>,
}

impl IoThreads {
    fn is_alive(&self) -> bool {
        !self.rx_thread.is_finished() && !self.tx_thread.is_finished()
    }

    fn stop(self) {
        // Release: 线程看到 false 时也能看到之前的写入
        self.is_running.store(false, Ordering::Release);
        if let Err(e) = self.rx_waker.wake() {
            warn!("Failed to wake RX loop: {}", e);
        }
        if let Err(e) = self.tx_waker.wake() {
            warn!("Failed to wake TX loop: {}", e);
        }
        if self.rx_thread.join_timeout(JOIN_TIMEOUT).is_err() {
            error!("RX thread panicked or failed to shut down within {:?}", JOIN_TIMEOUT);
        }
        if self.tx_thread.join_timeout(JOIN_TIMEOUT).is_err() {
            error!("TX thread panicked or failed to shut down within {:?}", JOIN_TIMEOUT);
        }
    }
}

/// FPU 网格驱动
pub struct GridDriver {
    config: DriverConfig,
    pool: Arc<CommandPool>,
    queue: Arc<CommandQueue>,
    store: Arc<GridStateStore>,
    metrics: Arc<DriverMetrics>,
    io: Mutex<Option<IoThreads>>,
}

impl GridDriver {
    /// 按配置创建驱动并预留所有命令资源
    ///
    /// 资源预留失败返回 `ResourceExhausted`，属于启动失败。
    pub fn new(config: DriverConfig) -> Result<Self, DriverError> {
        config.validate()?;
        let pool = CommandPool::for_grid(config.num_fpus)?;
        let queue = CommandQueue::new(config.num_gateways(), CommandQueue::DEFAULT_CAPACITY)?;
        let store = GridStateStore::new(
            config.num_fpus,
            config.tracker_granularity(),
            config.trace_wakeups,
        );
        Ok(Self {
            config,
            pool: Arc::new(pool),
            queue: Arc::new(queue),
            store: Arc::new(store),
            metrics: Arc::new(DriverMetrics::new()),
            io: Mutex::new(None),
        })
    }

    // ============================================================
    // 连接管理
    // ============================================================

    /// 连接所有网关并启动 IO 线程
    pub fn connect(&self) -> Result<(), DriverError> {
        let mut io = self.io.lock();
        if let Some(threads) = io.take() {
            if threads.is_alive() && self.store.interface_state() == InterfaceState::Connected {
                *io = Some(threads);
                return Err(DriverError::AlreadyConnected);
            }
            // 上一次连接已经断开，回收残留线程
            threads.stop();
        }

        // 断线前排队和放回队首的命令保留，连接后按原顺序发送
        let queued = self.queue.total_len();
        if queued > 0 {
            info!("Resuming {} queued command(s) after reconnect", queued);
        }
        self.store.reset(queued as u32);

        let num_gateways = self.config.num_gateways();
        let mut rx_links = Vec::with_capacity(num_gateways);
        let mut tx_links = Vec::with_capacity(num_gateways);
        for (index, address) in self.config.gateways.iter().take(num_gateways).enumerate() {
            let link = GatewayLink::connect(
                index,
                &address.to_string(),
                self.config.connect_timeout(),
            )?;
            let (rx, tx) = link.split()?;
            rx_links.push(rx);
            tx_links.push(tx);
        }

        let rx_poll = Poll::new()?;
        let tx_poll = Poll::new()?;
        for rx in rx_links.iter_mut() {
            let token = Token(rx.index());
            rx_poll.registry().register(rx, token, Interest::READABLE)?;
        }
        for tx in tx_links.iter_mut() {
            let token = Token(tx.index());
            tx_poll.registry().register(tx, token, Interest::WRITABLE)?;
        }
        let rx_waker = Arc::new(Waker::new(rx_poll.registry(), WAKE_TOKEN)?);
        let tx_waker = Arc::new(Waker::new(tx_poll.registry(), WAKE_TOKEN)?);
        self.queue.set_waker(Some(tx_waker.clone()));

        let is_running = Arc::new(AtomicBool::new(true));
        let ctx = LoopContext {
            pool: self.pool.clone(),
            queue: self.queue.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            is_running: is_running.clone(),
            tx_waker: tx_waker.clone(),
            rx_waker: rx_waker.clone(),
        };
        self.store.set_interface_state(InterfaceState::Connected);

        let rx_ctx = ctx.clone();
        let rx_thread = std::thread::Builder::new()
            .name("fpu-rx".into())
            .spawn(move || rx_loop(rx_links, rx_poll, rx_ctx))
            .map_err(|e| {
                self.store.set_interface_state(InterfaceState::Unconnected);
                DriverError::IoThread(e.to_string())
            })?;
        let tx_thread = match std::thread::Builder::new()
            .name("fpu-tx".into())
            .spawn(move || tx_loop(tx_links, tx_poll, ctx))
        {
            Ok(handle) => handle,
            Err(e) => {
                is_running.store(false, Ordering::Release);
                let _ = rx_waker.wake();
                let _ = rx_thread.join_timeout(JOIN_TIMEOUT);
                self.store.set_interface_state(InterfaceState::Unconnected);
                return Err(DriverError::IoThread(e.to_string()));
            },
        };

        *io = Some(IoThreads {
            rx_thread,
            tx_thread,
            is_running,
            rx_waker,
            tx_waker,
        });
        info!("Connected to {} gateway(s), {} FPUs", num_gateways, self.config.num_fpus);
        Ok(())
    }

    /// 停止 IO 线程并断开所有网关
    ///
    /// 尚未发送的命令留在队列中；需要丢弃时调用 [`flush_queues`](Self::flush_queues)。
    pub fn disconnect(&self) -> Result<(), DriverError> {
        let Some(threads) = self.io.lock().take() else {
            return Err(DriverError::NotConnected);
        };
        threads.stop();
        self.queue.set_waker(None);
        self.store.on_disconnect(InterfaceState::Unconnected);
        info!("Disconnected from gateways");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.store.interface_state() == InterfaceState::Connected
    }

    /// 检查 IO 线程是否都在运行
    pub fn is_healthy(&self) -> bool {
        self.io.lock().as_ref().is_some_and(IoThreads::is_alive)
    }

    // ============================================================
    // 命令提交
    // ============================================================

    /// 从命令池取票据并提交（使用配置的响应超时）
    pub fn send(&self, command: Command, target: Target) -> Result<(), DriverError> {
        let timeout = self.config.timeouts.for_kind(command.kind());
        self.send_with_timeout(command, target, timeout)
    }

    /// 同 `send`，指定响应超时
    pub fn send_with_timeout(
        &self,
        command: Command,
        target: Target,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.check_target(target)?;
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let ticket = self
            .pool
            .acquire_timeout(command, target, timeout, self.config.pool_wait())?;
        self.submit(ticket)
    }

    /// 提交已取出的票据
    ///
    /// 队列已满时票据归还命令池并返回 `QueueFull`。
    pub fn submit(&self, ticket: PooledCommand) -> Result<(), DriverError> {
        let gateway = ticket.target().gateway();
        // 先计数再入队：发送线程不会先于计数把它减掉
        self.store.add_queued(1);
        if let Err(QueueFull(ticket)) = self.queue.enqueue(gateway, ticket) {
            self.store.sub_queued(1);
            self.pool.release(ticket);
            return Err(DriverError::QueueFull { gateway });
        }
        Ok(())
    }

    /// 清空所有尚未发送的命令，返回清掉的数量
    pub fn flush_queues(&self) -> usize {
        let flushed = self.queue.flush_to_pool(&self.pool);
        if flushed > 0 {
            self.store.sub_queued(flushed as u32);
        }
        flushed
    }

    fn check_target(&self, target: Target) -> Result<(), DriverError> {
        match target {
            Target::Fpu(id) if id as usize >= self.config.num_fpus => Err(DriverError::InvalidFpuId {
                fpu: id as usize,
                num_fpus: self.config.num_fpus,
            }),
            Target::Broadcast { gateway } if gateway as usize >= self.config.num_gateways() => {
                Err(DriverError::InvalidGateway {
                    gateway: gateway as usize,
                    num_gateways: self.config.num_gateways(),
                })
            },
            _ => Ok(()),
        }
    }

    // ============================================================
    // 状态读取与等待
    // ============================================================

    pub fn snapshot(&self) -> GridState {
        self.store.snapshot()
    }

    /// 等待直到条件满足、连接断开或截止时间到达
    pub fn wait_until(
        &self,
        predicate: impl FnMut(&GridState) -> bool,
        deadline: Option<Instant>,
    ) -> (GridState, WaitStatus) {
        self.store.wait_until(predicate, deadline)
    }

    pub fn wait_for(&self, target: WaitTarget, deadline: Option<Instant>) -> (GridState, WaitStatus) {
        self.store.wait_for(target, deadline)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn num_fpus(&self) -> usize {
        self.config.num_fpus
    }

    pub fn num_gateways(&self) -> usize {
        self.config.num_gateways()
    }

    pub fn store(&self) -> &Arc<GridStateStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<CommandPool> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }
}

impl Drop for GridDriver {
    fn drop(&mut self) {
        if let Some(threads) = self.io.get_mut().take() {
            threads.stop();
        }
        self.queue.set_waker(None);
    }
}
