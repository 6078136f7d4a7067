//! 超时跟踪器
//!
//! 记录每个 FPU 所有在途命令中最早的截止时间，并缓存全局最小值及其
//! 出现次数。截止时间以毫秒为单位相对于创建时刻，按配置的粒度向上
//! 取整（超时不会提前触发）。
//!
//! 复杂度：更新摊销 O(1)；最小值的最后一个持有者被移除时退化为 O(N)
//! 的全表扫描。

use std::time::{Duration, Instant};

/// 表示“没有截止时间”的哨兵值
pub const NEVER: u64 = u64::MAX;

/// 超时跟踪器
#[derive(Debug, Clone)]
pub struct TimeoutTracker {
    epoch: Instant,
    granularity_ms: u64,
    deadlines: Vec<u64>,
    /// 缓存的全局最小值
    min: u64,
    /// 等于 `min` 的条目数（`min == NEVER` 时为 0）
    multiplicity: usize,
    /// 下次查找最小值持有者的起点
    resume: usize,
}

impl TimeoutTracker {
    pub fn new(num_fpus: usize, granularity: Duration) -> Self {
        Self::with_epoch(num_fpus, granularity, Instant::now())
    }

    pub fn with_epoch(num_fpus: usize, granularity: Duration, epoch: Instant) -> Self {
        Self {
            epoch,
            granularity_ms: (granularity.as_millis() as u64).max(1),
            deadlines: vec![NEVER; num_fpus],
            min: NEVER,
            multiplicity: 0,
            resume: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// 把时刻量化为刻度（向上取整到粒度）
    pub fn quantize(&self, at: Instant) -> u64 {
        let nanos = at.saturating_duration_since(self.epoch).as_nanos();
        let ms = nanos.div_ceil(1_000_000) as u64;
        ms.div_ceil(self.granularity_ms) * self.granularity_ms
    }

    /// 当前时刻对应的刻度（向下取整，用于判断到期）
    pub fn tick_floor(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// 刻度对应的时刻
    pub fn instant_of(&self, tick: u64) -> Option<Instant> {
        if tick == NEVER {
            return None;
        }
        self.epoch.checked_add(Duration::from_millis(tick))
    }

    /// 设置某个 FPU 的截止时间
    pub fn insert_or_update(&mut self, fpu: usize, deadline: Instant) {
        let tick = self.quantize(deadline);
        self.set_raw(fpu, tick);
    }

    /// 以刻度设置截止时间
    pub fn set_raw(&mut self, fpu: usize, value: u64) {
        let Some(slot) = self.deadlines.get_mut(fpu) else {
            return;
        };
        let old = *slot;
        if old == value {
            return;
        }
        *slot = value;

        if value < self.min {
            self.min = value;
            self.multiplicity = 1;
            self.resume = fpu;
            return;
        }
        if value == self.min {
            self.multiplicity += 1;
            return;
        }
        if old == self.min && self.min != NEVER {
            self.multiplicity -= 1;
            if self.multiplicity == 0 {
                self.rescan();
            }
        }
    }

    /// 清除某个 FPU 的截止时间
    pub fn clear(&mut self, fpu: usize) {
        self.set_raw(fpu, NEVER);
    }

    /// 清除所有截止时间
    pub fn clear_all(&mut self) {
        self.deadlines.fill(NEVER);
        self.min = NEVER;
        self.multiplicity = 0;
        self.resume = 0;
    }

    pub fn deadline_of(&self, fpu: usize) -> Option<u64> {
        self.deadlines.get(fpu).copied().filter(|&d| d != NEVER)
    }

    /// 最早的截止时间（刻度）
    pub fn peek_next_deadline(&self) -> Option<u64> {
        (self.min != NEVER).then_some(self.min)
    }

    /// 最早的截止时间（时刻）
    pub fn next_deadline_instant(&self) -> Option<Instant> {
        self.instant_of(self.min)
    }

    /// 取出一个持有最早截止时间的 FPU 并清除其条目
    pub fn pop_minimum(&mut self) -> Option<(usize, u64)> {
        if self.min == NEVER {
            return None;
        }
        let n = self.deadlines.len();
        let start = self.resume.min(n.saturating_sub(1));
        let min = self.min;
        let fpu = (0..n)
            .map(|i| (start + i) % n)
            .find(|&i| self.deadlines[i] == min)?;
        self.set_raw(fpu, NEVER);
        if self.multiplicity > 0 {
            self.resume = (fpu + 1) % n;
        }
        Some((fpu, min))
    }

    /// 若最早的截止时间已到，取出对应的 FPU
    pub fn pop_expired(&mut self, now: Instant) -> Option<(usize, u64)> {
        if self.min == NEVER || self.min > self.tick_floor(now) {
            return None;
        }
        self.pop_minimum()
    }

    fn rescan(&mut self) {
        self.min = NEVER;
        self.multiplicity = 0;
        self.resume = 0;
        for (i, &d) in self.deadlines.iter().enumerate() {
            if d < self.min {
                self.min = d;
                self.multiplicity = 1;
                self.resume = i;
            } else if d == self.min && d != NEVER {
                self.multiplicity += 1;
            }
        }
    }
}
