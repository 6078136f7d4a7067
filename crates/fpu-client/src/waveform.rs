//! 波形表与校验
//!
//! 波形表为每个 FPU 给出一串 (alpha, beta) 步数对，每一对是一个时间段内
//! 两个臂各走的步数。所有 FPU 的段数必须一致。
//!
//! 校验是纯函数 [`validate`]，检查顺序固定：
//!
//! 1. 约束参数合理
//! 2. 段数不超过上限
//! 3. 各 FPU 段数一致
//! 4. 单段步数不超过上限
//! 5. 相邻段的加减速规则（第一段视为从静止启动）
//! 6. 最后一段可以直接停止
//!
//! 五个规则版本只在第 5 步不同：
//!
//! | 版本 | 加速上限 | 减速下限 | 方向翻转 |
//! |------|----------|----------|----------|
//! | V1 | `f·x` | `x/f` | 不允许 |
//! | V2 | `max(f·x, x+m)` | `min(x/f, x−m)` | 不允许 |
//! | V3 | 同 V2 | 同 V2 | 两侧都不超过启动步数时允许 |
//! | V4 | 同 V2 | 不限 | 同 V3 |
//! | V5 | `max(f·x, S)` | 不限 | 同 V3 |
//!
//! 其中 `x`、`y` 为相邻两段步数的绝对值，`f` 为最大放大倍数，`m` 为
//! 最小步数，`S` 为启动步数上限。从静止启动或停到静止时只要求
//! 非零一侧不超过 `S`。

use crate::error::{Arm, WaveformError};
use fpu_driver::{MotionLimits, WaveformRuleset};
use fpu_protocol::{FirmwareVersion, MAX_WAVEFORM_SEGMENTS};
use std::collections::BTreeMap;

/// 浮点比较容差
const EPSILON: f64 = 1e-9;

/// 一个时间段内两个臂的步数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepPair {
    pub alpha: i16,
    pub beta: i16,
}

impl StepPair {
    pub const fn new(alpha: i16, beta: i16) -> Self {
        Self { alpha, beta }
    }

    fn arm(&self, arm: Arm) -> i32 {
        match arm {
            Arm::Alpha => self.alpha as i32,
            Arm::Beta => self.beta as i32,
        }
    }
}

impl From<(i16, i16)> for StepPair {
    fn from((alpha, beta): (i16, i16)) -> Self {
        Self { alpha, beta }
    }
}

/// 波形表（按 FPU 编号排序）
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WaveformTable {
    entries: BTreeMap<u16, Vec<StepPair>>,
}

impl WaveformTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置某个 FPU 的波形（覆盖旧值）
    pub fn insert(&mut self, fpu: u16, steps: impl IntoIterator<Item = impl Into<StepPair>>) {
        self.entries
            .insert(fpu, steps.into_iter().map(Into::into).collect());
    }

    /// 链式版本的 [`insert`](Self::insert)
    pub fn with(mut self, fpu: u16, steps: impl IntoIterator<Item = impl Into<StepPair>>) -> Self {
        self.insert(fpu, steps);
        self
    }

    pub fn get(&self, fpu: u16) -> Option<&[StepPair]> {
        self.entries.get(&fpu).map(Vec::as_slice)
    }

    /// 涉及的 FPU 编号（升序）
    pub fn fpus(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &[StepPair])> {
        self.entries.iter().map(|(&fpu, steps)| (fpu, steps.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 段数（取第一个 FPU 的段数）
    pub fn num_segments(&self) -> usize {
        self.entries.values().next().map_or(0, Vec::len)
    }
}

/// 按固件版本选择规则版本
///
/// 未知固件（网格中没有缓存任何版本）按最保守的 V1 处理。
pub fn ruleset_for_firmware(version: Option<&semver::Version>) -> WaveformRuleset {
    let Some(version) = version else {
        return WaveformRuleset::V1;
    };
    let thresholds = [
        (semver::Version::new(1, 3, 0), WaveformRuleset::V1),
        (semver::Version::new(1, 4, 0), WaveformRuleset::V2),
        (semver::Version::new(1, 5, 0), WaveformRuleset::V3),
        (semver::Version::new(2, 0, 0), WaveformRuleset::V4),
    ];
    thresholds
        .into_iter()
        .find(|(below, _)| version < below)
        .map_or(WaveformRuleset::V5, |(_, ruleset)| ruleset)
}

/// 设备固件版本转换为 semver
pub fn firmware_semver(version: FirmwareVersion) -> semver::Version {
    semver::Version::new(
        version.major as u64,
        version.minor as u64,
        version.patch as u64,
    )
}

/// 校验波形表
pub fn validate(
    table: &WaveformTable,
    limits: &MotionLimits,
    ruleset: WaveformRuleset,
) -> Result<(), WaveformError> {
    check_limits(limits)?;
    if table.is_empty() {
        return Err(WaveformError::InvalidConfig("empty waveform table".into()));
    }

    for (fpu, steps) in table.iter() {
        if steps.is_empty() {
            return Err(WaveformError::EmptySequence { fpu });
        }
        if steps.len() > limits.max_segments {
            return Err(WaveformError::TooManySections {
                fpu,
                count: steps.len(),
                max: limits.max_segments,
            });
        }
    }

    let expected = table.num_segments();
    if let Some((fpu, steps)) = table.iter().find(|(_, steps)| steps.len() != expected) {
        return Err(WaveformError::RaggedSections {
            fpu,
            expected,
            actual: steps.len(),
        });
    }

    for (fpu, steps) in table.iter() {
        for arm in [Arm::Alpha, Arm::Beta] {
            check_arm(fpu, arm, steps, limits, ruleset)?;
        }
    }
    Ok(())
}

fn check_limits(limits: &MotionLimits) -> Result<(), WaveformError> {
    let fail = |msg: String| Err(WaveformError::InvalidConfig(msg));
    if limits.max_segments == 0 || limits.max_segments > MAX_WAVEFORM_SEGMENTS {
        return fail(format!(
            "max_segments must be in 1..={MAX_WAVEFORM_SEGMENTS}, got {}",
            limits.max_segments
        ));
    }
    if limits.max_steps == 0 || limits.max_steps > i16::MAX as u32 {
        return fail(format!("max_steps out of range: {}", limits.max_steps));
    }
    if limits.min_steps > limits.max_start_steps || limits.max_start_steps > limits.max_steps {
        return fail(format!(
            "need min_steps <= max_start_steps <= max_steps, got {} / {} / {}",
            limits.min_steps, limits.max_start_steps, limits.max_steps
        ));
    }
    if !limits.max_increase.is_finite() || limits.max_increase < 1.0 {
        return fail(format!("max_increase must be >= 1.0, got {}", limits.max_increase));
    }
    Ok(())
}

fn check_arm(
    fpu: u16,
    arm: Arm,
    steps: &[StepPair],
    limits: &MotionLimits,
    ruleset: WaveformRuleset,
) -> Result<(), WaveformError> {
    // 先整体检查幅值，再检查变化率
    if let Some((segment, value)) = steps
        .iter()
        .map(|s| s.arm(arm))
        .enumerate()
        .find(|(_, v)| v.unsigned_abs() > limits.max_steps)
    {
        return Err(WaveformError::StepCountTooLarge {
            fpu,
            arm,
            segment,
            steps: value,
            max: limits.max_steps,
        });
    }

    let mut previous = 0i32;
    for (segment, pair) in steps.iter().enumerate() {
        let next = pair.arm(arm);
        if !transition_allowed(ruleset, previous, next, limits) {
            return Err(WaveformError::ChangeTooLarge {
                fpu,
                arm,
                segment,
                from: previous,
                to: next,
            });
        }
        previous = next;
    }

    if previous.unsigned_abs() > limits.max_start_steps {
        return Err(WaveformError::TailInvalid {
            fpu,
            arm,
            steps: previous,
            max: limits.max_start_steps,
        });
    }
    Ok(())
}

/// 相邻两段 `x -> y` 是否满足规则
fn transition_allowed(ruleset: WaveformRuleset, x: i32, y: i32, limits: &MotionLimits) -> bool {
    let ax = x.unsigned_abs() as f64;
    let ay = y.unsigned_abs() as f64;
    let start = limits.max_start_steps as f64;
    let min = limits.min_steps as f64;
    let f = limits.max_increase;

    match (x, y) {
        (0, 0) => return true,
        (0, _) => return ay <= start,
        (_, 0) => return ax <= start,
        _ => {},
    }

    if (x > 0) != (y > 0) {
        return ruleset >= WaveformRuleset::V3 && ax <= start && ay <= start;
    }

    let accel_ok = match ruleset {
        WaveformRuleset::V1 => ay <= f * ax + EPSILON,
        WaveformRuleset::V2 | WaveformRuleset::V3 | WaveformRuleset::V4 => {
            ay <= (f * ax).max(ax + min) + EPSILON
        },
        WaveformRuleset::V5 => ay <= (f * ax).max(start) + EPSILON,
    };
    let decel_ok = match ruleset {
        WaveformRuleset::V1 => ax <= f * ay + EPSILON,
        WaveformRuleset::V2 | WaveformRuleset::V3 => ay + EPSILON >= (ax / f).min(ax - min),
        WaveformRuleset::V4 | WaveformRuleset::V5 => true,
    };
    accel_ok && decel_ok
}
