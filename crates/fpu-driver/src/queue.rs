//! 网关命令队列
//!
//! 每个网关一个有界 FIFO，容量 = 每网关 FPU 数 × 单 FPU 在途上限，
//! 正常运行时入队不会失败。所有队列共用一把锁和一个条件变量；入队
//! 同时唤醒发送循环的 `mio::Waker`。

use crate::pool::{CommandPool, PooledCommand};
use crate::error::DriverError;
use fpu_protocol::{FPUS_PER_GATEWAY, MAX_PENDING_PER_FPU};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// 入队失败：队列已满，票据原样交还调用方
#[derive(Debug)]
pub struct QueueFull(pub PooledCommand);

#[derive(Debug)]
struct QueueInner {
    queues: Vec<VecDeque<PooledCommand>>,
    capacity: usize,
}

/// 命令队列（所有网关）
#[derive(Debug)]
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
    waker: Mutex<Option<Arc<mio::Waker>>>,
}

impl CommandQueue {
    /// 默认单网关容量
    pub const DEFAULT_CAPACITY: usize = FPUS_PER_GATEWAY * MAX_PENDING_PER_FPU;

    pub fn new(num_gateways: usize, capacity: usize) -> Result<Self, DriverError> {
        let mut queues = Vec::with_capacity(num_gateways);
        for _ in 0..num_gateways {
            let mut q = VecDeque::new();
            q.try_reserve_exact(capacity)
                .map_err(|_| DriverError::ResourceExhausted {
                    what: "command queue",
                    requested: capacity,
                })?;
            queues.push(q);
        }
        Ok(Self {
            inner: Mutex::new(QueueInner { queues, capacity }),
            ready: Condvar::new(),
            waker: Mutex::new(None),
        })
    }

    /// 设置/清除发送循环的唤醒句柄
    pub fn set_waker(&self, waker: Option<Arc<mio::Waker>>) {
        *self.waker.lock() = waker;
    }

    /// 唤醒发送循环
    pub fn wake(&self) {
        if let Some(waker) = self.waker.lock().as_ref()
            && let Err(e) = waker.wake()
        {
            warn!("Failed to wake TX loop: {}", e);
        }
    }

    pub fn num_gateways(&self) -> usize {
        self.inner.lock().queues.len()
    }

    /// 入队（仅在队列已满时失败）
    pub fn enqueue(&self, gateway: usize, command: PooledCommand) -> Result<(), QueueFull> {
        {
            let mut inner = self.inner.lock();
            let capacity = inner.capacity;
            let Some(queue) = inner.queues.get_mut(gateway) else {
                return Err(QueueFull(command));
            };
            if queue.len() >= capacity {
                return Err(QueueFull(command));
            }
            queue.push_back(command);
        }
        self.ready.notify_all();
        self.wake();
        Ok(())
    }

    /// 非阻塞出队
    pub fn dequeue(&self, gateway: usize) -> Option<PooledCommand> {
        self.inner.lock().queues.get_mut(gateway)?.pop_front()
    }

    /// 把已出队但无法发送的命令放回队首（不受容量限制）
    pub fn requeue_front(&self, gateway: usize, command: PooledCommand) -> Result<(), QueueFull> {
        {
            let mut inner = self.inner.lock();
            let Some(queue) = inner.queues.get_mut(gateway) else {
                return Err(QueueFull(command));
            };
            queue.push_front(command);
        }
        self.ready.notify_all();
        Ok(())
    }

    /// 等待任一队列非空，返回非空队列的位掩码（超时返回 0）
    pub fn wait_for_any(&self, timeout: Duration) -> u8 {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            let mask = Self::ready_mask(&inner);
            if mask != 0 {
                return mask;
            }
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                return Self::ready_mask(&inner);
            }
        }
    }

    /// 当前非空队列的位掩码（不阻塞）
    pub fn non_empty_mask(&self) -> u8 {
        Self::ready_mask(&self.inner.lock())
    }

    fn ready_mask(inner: &QueueInner) -> u8 {
        inner
            .queues
            .iter()
            .enumerate()
            .filter(|(_, q)| !q.is_empty())
            .fold(0u8, |mask, (i, _)| mask | (1 << i))
    }

    /// 清空所有队列，把票据归还命令池，返回清掉的数量
    pub fn flush_to_pool(&self, pool: &CommandPool) -> usize {
        let drained: Vec<PooledCommand> = {
            let mut inner = self.inner.lock();
            inner.queues.iter_mut().flat_map(|q| q.drain(..)).collect()
        };
        let n = drained.len();
        for command in drained {
            pool.release(command);
        }
        n
    }

    pub fn len(&self, gateway: usize) -> usize {
        self.inner.lock().queues.get(gateway).map_or(0, |q| q.len())
    }

    pub fn total_len(&self) -> usize {
        self.inner.lock().queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Target;
    use fpu_protocol::{Command, CommandKind};
    use std::thread;

    const T: Duration = Duration::from_millis(100);

    fn setup(gateways: usize, cap: usize) -> (CommandQueue, CommandPool) {
        (
            CommandQueue::new(gateways, cap).unwrap(),
            CommandPool::for_grid(FPUS_PER_GATEWAY).unwrap(),
        )
    }

    #[test]
    fn test_fifo_order_per_gateway() {
        let (queue, pool) = setup(2, 8);
        for id in 0..3u16 {
            queue
                .enqueue(0, pool.acquire(Command::PingFpu, Target::Fpu(id), T))
                .unwrap();
        }
        queue
            .enqueue(1, pool.acquire(Command::ResetFpu, Target::Fpu(400), T))
            .unwrap();

        assert_eq!(queue.len(0), 3);
        assert_eq!(queue.total_len(), 4);
        for id in 0..3u16 {
            let cmd = queue.dequeue(0).unwrap();
            assert_eq!(cmd.target(), Target::Fpu(id));
            pool.release(cmd);
        }
        assert!(queue.dequeue(0).is_none());
        let cmd = queue.dequeue(1).unwrap();
        assert_eq!(cmd.kind(), CommandKind::ResetFpu);
        pool.release(cmd);
    }

    #[test]
    fn test_enqueue_fails_only_when_full() {
        let (queue, pool) = setup(1, 2);
        queue.enqueue(0, pool.acquire(Command::PingFpu, Target::Fpu(0), T)).unwrap();
        queue.enqueue(0, pool.acquire(Command::PingFpu, Target::Fpu(1), T)).unwrap();
        let QueueFull(rejected) = queue
            .enqueue(0, pool.acquire(Command::PingFpu, Target::Fpu(2), T))
            .unwrap_err();
        assert_eq!(rejected.target(), Target::Fpu(2));
        pool.release(rejected);

        // 不存在的网关
        let QueueFull(rejected) = queue
            .enqueue(5, pool.acquire(Command::PingFpu, Target::Fpu(3), T))
            .unwrap_err();
        pool.release(rejected);
        assert_eq!(queue.flush_to_pool(&pool), 2);
        assert_eq!(pool.outstanding(CommandKind::PingFpu), 0);
    }

    #[test]
    fn test_requeue_front_restores_order() {
        let (queue, pool) = setup(1, 4);
        queue.enqueue(0, pool.acquire(Command::PingFpu, Target::Fpu(0), T)).unwrap();
        queue.enqueue(0, pool.acquire(Command::PingFpu, Target::Fpu(1), T)).unwrap();
        let first = queue.dequeue(0).unwrap();
        queue.requeue_front(0, first).unwrap();
        assert_eq!(queue.dequeue(0).unwrap().target(), Target::Fpu(0));
        let _ = queue.flush_to_pool(&pool);
    }

    #[test]
    fn test_wait_for_any_mask_and_timeout() {
        let (queue, pool) = setup(3, 4);
        assert_eq!(queue.wait_for_any(Duration::from_millis(10)), 0);

        let queue = Arc::new(queue);
        let pool = Arc::new(pool);
        let producer = {
            let queue = queue.clone();
            let pool = pool.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue
                    .enqueue(2, pool.acquire(Command::PingFpu, Target::Broadcast { gateway: 2 }, T))
                    .unwrap();
            })
        };
        assert_eq!(queue.wait_for_any(Duration::from_secs(2)), 0b100);
        producer.join().unwrap();
        assert_eq!(queue.flush_to_pool(&pool), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_raises_waker() {
        let (queue, pool) = setup(1, 4);
        let mut poll = mio::Poll::new().unwrap();
        let waker = Arc::new(mio::Waker::new(poll.registry(), mio::Token(99)).unwrap());
        queue.set_waker(Some(waker));

        queue.enqueue(0, pool.acquire(Command::PingFpu, Target::Fpu(0), T)).unwrap();
        let mut events = mio::Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert!(events.iter().any(|e| e.token() == mio::Token(99)));
        let _ = queue.flush_to_pool(&pool);
    }
}
