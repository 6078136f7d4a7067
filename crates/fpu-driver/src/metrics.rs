//! 驱动性能指标
//!
//! 原子计数器，IO 线程写、任意线程读，不引入锁竞争。

use std::sync::atomic::{AtomicU64, Ordering};

/// 驱动实时指标
///
/// # 使用示例
///
/// ```rust
/// use fpu_driver::DriverMetrics;
/// use std::sync::atomic::Ordering;
///
/// let metrics = DriverMetrics::default();
/// metrics.rx_frames.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(metrics.snapshot().rx_frames, 1);
/// ```
#[derive(Debug, Default)]
pub struct DriverMetrics {
    /// 已写出的帧数（广播按总线计）
    pub tx_frames: AtomicU64,
    pub tx_bytes: AtomicU64,
    /// 解码成功的帧数
    pub rx_frames: AtomicU64,
    pub rx_bytes: AtomicU64,
    /// 解码器丢弃的畸形帧数
    pub rx_dropped_frames: AtomicU64,
    /// 没有匹配在途命令的响应数
    pub rx_unmatched: AtomicU64,
    /// 能成帧但无法解析为响应的帧数
    pub rx_invalid: AtomicU64,
    /// 命令超时次数
    pub command_timeouts: AtomicU64,
    /// socket 读写错误次数
    pub socket_errors: AtomicU64,
    /// 因在途上限或断线被放回队首的命令数
    pub requeued_commands: AtomicU64,
    /// 已发送的广播命令数
    pub broadcasts: AtomicU64,
}

impl DriverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取指标快照
    ///
    /// 各计数器分别读取，彼此之间可能有微小的时间差。
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_dropped_frames: self.rx_dropped_frames.load(Ordering::Relaxed),
            rx_unmatched: self.rx_unmatched.load(Ordering::Relaxed),
            rx_invalid: self.rx_invalid.load(Ordering::Relaxed),
            command_timeouts: self.command_timeouts.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            requeued_commands: self.requeued_commands.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
        }
    }

    /// 重置所有计数器
    pub fn reset(&self) {
        self.tx_frames.store(0, Ordering::Relaxed);
        self.tx_bytes.store(0, Ordering::Relaxed);
        self.rx_frames.store(0, Ordering::Relaxed);
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.rx_dropped_frames.store(0, Ordering::Relaxed);
        self.rx_unmatched.store(0, Ordering::Relaxed);
        self.rx_invalid.store(0, Ordering::Relaxed);
        self.command_timeouts.store(0, Ordering::Relaxed);
        self.socket_errors.store(0, Ordering::Relaxed);
        self.requeued_commands.store(0, Ordering::Relaxed);
        self.broadcasts.store(0, Ordering::Relaxed);
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub tx_frames: u64,
    pub tx_bytes: u64,
    pub rx_frames: u64,
    pub rx_bytes: u64,
    pub rx_dropped_frames: u64,
    pub rx_unmatched: u64,
    pub rx_invalid: u64,
    pub command_timeouts: u64,
    pub socket_errors: u64,
    pub requeued_commands: u64,
    pub broadcasts: u64,
}

impl MetricsSnapshot {
    /// 接收帧丢弃率（百分比）
    ///
    /// 没有收到任何帧时返回 0.0。
    pub fn rx_drop_rate(&self) -> f64 {
        let total = self.rx_frames + self.rx_dropped_frames;
        if total == 0 {
            return 0.0;
        }
        (self.rx_dropped_frames as f64 / total as f64) * 100.0
    }
}
