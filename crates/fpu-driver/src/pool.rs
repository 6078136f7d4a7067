//! 命令池
//!
//! 每种命令一个预分配的槽位空闲链表。连接时按网格规模一次性预留
//! 容量，之后取用和归还都不会分配内存。
//!
//! 取出的命令以 [`PooledCommand`] 票据形式流转：票据不可复制，必须
//! 通过 [`CommandPool::release`] 显式归还，编译期杜绝重复归还。

use crate::error::DriverError;
use fpu_protocol::{
    Command, CommandKind, FPUS_PER_GATEWAY, FpuAddress, MAX_NUM_GATEWAYS, MAX_PENDING_PER_FPU,
    NUM_COMMAND_KINDS,
};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// 命令目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// 单个 FPU（逻辑编号）
    Fpu(u16),
    /// 某个网关下的所有 FPU
    Broadcast { gateway: u8 },
}

impl Target {
    /// 目标所在网关
    pub fn gateway(&self) -> usize {
        match *self {
            Target::Fpu(id) => id as usize / FPUS_PER_GATEWAY,
            Target::Broadcast { gateway } => gateway as usize,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Target::Broadcast { .. })
    }

    /// 单播目标的物理地址
    pub fn address(&self) -> Option<FpuAddress> {
        match *self {
            Target::Fpu(id) => FpuAddress::from_fpu_id(id).ok(),
            Target::Broadcast { .. } => None,
        }
    }
}

/// 池化命令票据
#[derive(Debug)]
#[must_use = "pooled commands must be enqueued or released back to the pool"]
pub struct PooledCommand {
    slot: u32,
    command: Command,
    target: Target,
    timeout: Duration,
}

impl PooledCommand {
    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 槽位编号（每种命令内唯一）
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

#[derive(Debug)]
struct PoolInner {
    free: Vec<Vec<u32>>,
    capacity: [usize; NUM_COMMAND_KINDS],
}

/// 命令池
#[derive(Debug)]
pub struct CommandPool {
    inner: Mutex<PoolInner>,
    released: Condvar,
}

impl CommandPool {
    /// 按各命令种类的容量创建
    ///
    /// 预留失败返回 `ResourceExhausted`，调用方应视为启动失败。
    pub fn new(capacity: [usize; NUM_COMMAND_KINDS]) -> Result<Self, DriverError> {
        let mut free = Vec::new();
        free.try_reserve_exact(NUM_COMMAND_KINDS)
            .map_err(|_| DriverError::ResourceExhausted {
                what: "command pool",
                requested: NUM_COMMAND_KINDS,
            })?;
        for &cap in capacity.iter() {
            let mut slots: Vec<u32> = Vec::new();
            slots
                .try_reserve_exact(cap)
                .map_err(|_| DriverError::ResourceExhausted {
                    what: "command pool slots",
                    requested: cap,
                })?;
            slots.extend((0..cap as u32).rev());
            free.push(slots);
        }
        Ok(Self {
            inner: Mutex::new(PoolInner { free, capacity }),
            released: Condvar::new(),
        })
    }

    /// 按网格规模计算容量
    ///
    /// 波形装载每个 FPU 可能同时有多段在途；其它命令每个 FPU 一条，外加
    /// 每个网关一条广播的余量。
    pub fn for_grid(num_fpus: usize) -> Result<Self, DriverError> {
        let mut capacity = [0usize; NUM_COMMAND_KINDS];
        for kind in CommandKind::ALL {
            capacity[kind.index()] = match kind {
                CommandKind::ConfigMotion => num_fpus * MAX_PENDING_PER_FPU,
                _ => num_fpus + MAX_NUM_GATEWAYS,
            };
        }
        Self::new(capacity)
    }

    /// 取一个槽位并填入命令（耗尽时阻塞到有归还）
    pub fn acquire(&self, command: Command, target: Target, timeout: Duration) -> PooledCommand {
        let index = command.kind().index();
        let mut inner = self.inner.lock();
        loop {
            if let Some(slot) = inner.free[index].pop() {
                return PooledCommand {
                    slot,
                    command,
                    target,
                    timeout,
                };
            }
            warn!("Command pool exhausted for {:?}, waiting for release", command.kind());
            self.released.wait(&mut inner);
        }
    }

    /// 同 `acquire`，但最多等待 `wait`
    pub fn acquire_timeout(
        &self,
        command: Command,
        target: Target,
        timeout: Duration,
        wait: Duration,
    ) -> Result<PooledCommand, DriverError> {
        let index = command.kind().index();
        let deadline = Instant::now() + wait;
        let mut inner = self.inner.lock();
        loop {
            if let Some(slot) = inner.free[index].pop() {
                return Ok(PooledCommand {
                    slot,
                    command,
                    target,
                    timeout,
                });
            }
            if self.released.wait_until(&mut inner, deadline).timed_out() {
                if let Some(slot) = inner.free[index].pop() {
                    return Ok(PooledCommand {
                        slot,
                        command,
                        target,
                        timeout,
                    });
                }
                return Err(DriverError::PoolTimeout {
                    kind: command.kind(),
                });
            }
        }
    }

    /// 非阻塞取用
    pub fn try_acquire(
        &self,
        command: Command,
        target: Target,
        timeout: Duration,
    ) -> Option<PooledCommand> {
        let slot = self.inner.lock().free[command.kind().index()].pop()?;
        Some(PooledCommand {
            slot,
            command,
            target,
            timeout,
        })
    }

    /// 归还票据
    pub fn release(&self, ticket: PooledCommand) {
        let index = ticket.kind().index();
        {
            let mut inner = self.inner.lock();
            inner.free[index].push(ticket.slot);
        }
        self.released.notify_all();
    }

    /// 某种命令的预分配容量
    pub fn capacity(&self, kind: CommandKind) -> usize {
        self.inner.lock().capacity[kind.index()]
    }

    /// 某种命令的空闲槽位数
    pub fn available(&self, kind: CommandKind) -> usize {
        self.inner.lock().free[kind.index()].len()
    }

    /// 某种命令已取出未归还的数量
    pub fn outstanding(&self, kind: CommandKind) -> usize {
        let inner = self.inner.lock();
        inner.capacity[kind.index()] - inner.free[kind.index()].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;
    use std::thread;

    fn small_pool(cap: usize) -> CommandPool {
        CommandPool::new([cap; NUM_COMMAND_KINDS]).unwrap()
    }

    const T: Duration = Duration::from_millis(100);

    #[test]
    fn test_for_grid_capacities() {
        let pool = CommandPool::for_grid(76).unwrap();
        assert_eq!(pool.capacity(CommandKind::ConfigMotion), 76 * MAX_PENDING_PER_FPU);
        assert_eq!(pool.capacity(CommandKind::PingFpu), 76 + MAX_NUM_GATEWAYS);
        assert_eq!(pool.outstanding(CommandKind::PingFpu), 0);
    }

    #[test]
    fn test_huge_reservation_fails_cleanly() {
        let mut capacity = [1usize; NUM_COMMAND_KINDS];
        capacity[CommandKind::ConfigMotion.index()] = usize::MAX / 2;
        assert!(matches!(
            CommandPool::new(capacity),
            Err(DriverError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn test_try_acquire_exhaustion_and_release() {
        let pool = small_pool(2);
        let a = pool.try_acquire(Command::PingFpu, Target::Fpu(0), T).unwrap();
        let b = pool.try_acquire(Command::PingFpu, Target::Fpu(1), T).unwrap();
        assert_ne!(a.slot(), b.slot());
        assert!(pool.try_acquire(Command::PingFpu, Target::Fpu(2), T).is_none());
        // 其它种类不受影响
        let c = pool.try_acquire(Command::ResetFpu, Target::Fpu(2), T).unwrap();
        pool.release(a);
        assert_eq!(pool.available(CommandKind::PingFpu), 1);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.outstanding(CommandKind::PingFpu), 0);
    }

    #[test]
    fn test_acquire_timeout_expires() {
        let pool = small_pool(1);
        let held = pool.try_acquire(Command::PingFpu, Target::Fpu(0), T).unwrap();
        let result = pool.acquire_timeout(
            Command::PingFpu,
            Target::Fpu(1),
            T,
            Duration::from_millis(20),
        );
        assert!(matches!(
            result,
            Err(DriverError::PoolTimeout {
                kind: CommandKind::PingFpu
            })
        ));
        pool.release(held);
    }

    #[test]
    fn test_blocked_acquire_wakes_on_release() {
        let pool = Arc::new(small_pool(1));
        let held = pool.try_acquire(Command::PingFpu, Target::Fpu(0), T).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let t = pool.acquire(Command::PingFpu, Target::Fpu(5), T);
                let target = t.target();
                pool.release(t);
                target
            })
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(held);
        assert_eq!(waiter.join().unwrap(), Target::Fpu(5));
        assert_eq!(pool.available(CommandKind::PingFpu), 1);
    }

    #[test]
    fn test_pool_conservation_random_sequences() {
        let cap = 8;
        let pool = small_pool(cap);
        let mut rng = rand::thread_rng();
        let mut held: Vec<PooledCommand> = Vec::new();
        let kinds = [CommandKind::PingFpu, CommandKind::ConfigMotion, CommandKind::ResetFpu];
        let command_of = |k: CommandKind| match k {
            CommandKind::ConfigMotion => Command::ConfigMotion(Default::default()),
            CommandKind::ResetFpu => Command::ResetFpu,
            _ => Command::PingFpu,
        };

        for _ in 0..5_000 {
            if rng.gen_bool(0.55) {
                let kind = kinds[rng.gen_range(0..kinds.len())];
                if let Some(t) = pool.try_acquire(command_of(kind), Target::Fpu(0), T) {
                    held.push(t);
                }
            } else if !held.is_empty() {
                let i = rng.gen_range(0..held.len());
                pool.release(held.swap_remove(i));
            }
            for kind in kinds {
                let out = held.iter().filter(|t| t.kind() == kind).count();
                assert_eq!(pool.outstanding(kind), out);
                assert!(out <= cap);
            }
            // 同一种类不会有重复槽位
            let mut slots: Vec<(u8, u32)> = held.iter().map(|t| (t.kind().code(), t.slot())).collect();
            slots.sort_unstable();
            slots.dedup();
            assert_eq!(slots.len(), held.len());
        }
        for t in held {
            pool.release(t);
        }
    }

    #[test]
    fn test_target_gateway() {
        assert_eq!(Target::Fpu(0).gateway(), 0);
        assert_eq!(Target::Fpu(380).gateway(), 1);
        assert_eq!(Target::Broadcast { gateway: 2 }.gateway(), 2);
        assert_eq!(Target::Fpu(77).address().unwrap().bus, 1);
    }
}
