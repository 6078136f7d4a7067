//! 错误类型体系
//!
//! 每个操作只返回一个具体的错误种类，可通过 [`GridError::category`]
//! 归入六个大类：连接、超时、设备状态、参数、硬件故障、资源。
//!
//! 参数校验与前置条件错误在发出任何命令之前返回，不改变设备状态；
//! 超时与缓冲区溢出只在实际发送之后、通过计数器差值判定。

use fpu_driver::DriverError;
use fpu_protocol::{FpuState, ProtocolError, ResponseStatus};
use thiserror::Error;

/// 波形中的臂
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arm {
    Alpha,
    Beta,
}

impl std::fmt::Display for Arm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arm::Alpha => write!(f, "alpha"),
            Arm::Beta => write!(f, "beta"),
        }
    }
}

/// 波形校验失败
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WaveformError {
    /// 约束参数本身不合理
    #[error("Invalid waveform limits: {0}")]
    InvalidConfig(String),

    /// 某个 FPU 的波形没有任何段
    #[error("FPU {fpu}: waveform has no sections")]
    EmptySequence { fpu: u16 },

    /// 段数超过上限
    #[error("FPU {fpu}: waveform has {count} sections (allowed 1..={max})")]
    TooManySections { fpu: u16, count: usize, max: usize },

    /// 各 FPU 的段数不一致
    #[error("FPU {fpu}: waveform has {actual} sections, other FPUs have {expected}")]
    RaggedSections {
        fpu: u16,
        expected: usize,
        actual: usize,
    },

    /// 单段步数超过上限
    #[error("FPU {fpu} {arm} arm, section {segment}: {steps} steps exceeds {max}")]
    StepCountTooLarge {
        fpu: u16,
        arm: Arm,
        segment: usize,
        steps: i32,
        max: u32,
    },

    /// 相邻段之间变化过大（或方向不允许翻转）
    #[error("FPU {fpu} {arm} arm, section {segment}: change {from} -> {to} not allowed")]
    ChangeTooLarge {
        fpu: u16,
        arm: Arm,
        segment: usize,
        from: i32,
        to: i32,
    },

    /// 最后一段没有减速到可停止的步数
    #[error("FPU {fpu} {arm} arm: final section has {steps} steps, max {max} to stop")]
    TailInvalid {
        fpu: u16,
        arm: Arm,
        steps: i32,
        max: u32,
    },
}

/// 错误大类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 未连接、已连接、连接断开、总线缓冲区溢出
    Connectivity,
    /// 命令无响应、重试耗尽
    Timeout,
    /// 设备状态不满足前置条件
    DeviceState,
    /// 参数校验失败
    Parameter,
    /// 设备上报的硬件故障
    HardwareFault,
    /// 启动时资源预留失败
    Resource,
}

/// 网格操作错误
#[derive(Debug, Error)]
pub enum GridError {
    // ==================== Connectivity ====================
    #[error("Not connected to the gateways")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    /// 操作期间连接断开
    #[error("Connection lost during operation")]
    ConnectionLost,

    /// 设备 CAN 缓冲区溢出
    #[error("{count} CAN buffer overflow(s) during operation")]
    CanOverflow { count: u32 },

    // ==================== Timeout ====================
    /// 命令无响应
    #[error("{count} command(s) timed out")]
    CommandTimeout { count: u32 },

    /// 装载波形重试耗尽
    #[error("Waveform upload failed after {attempts} attempt(s)")]
    MaxRetriesExceeded { attempts: u32 },

    // ==================== Device state ====================
    /// 设备状态不允许该操作
    #[error("FPU {fpu} is in state {state:?}, operation not allowed")]
    InvalidState { fpu: u16, state: FpuState },

    #[error("FPU {fpu} is locked")]
    Locked { fpu: u16 },

    /// 急停后尚未恢复（需要 `enable_move` 或复位）
    #[error("FPU {fpu} is aborted, call enable_move to recover")]
    InAbortedState { fpu: u16 },

    /// 未解除的碰撞或限位
    #[error("FPU {fpu} has an unresolved collision or limit breach")]
    UnresolvedCollision { fpu: u16 },

    /// 尚未寻零
    #[error("FPU {fpu} has not been referenced")]
    NotReferenced { fpu: u16 },

    /// 设备拒绝了命令
    #[error("FPU {fpu} rejected command: {status:?}")]
    Rejected { fpu: u16, status: ResponseStatus },

    // ==================== Parameter ====================
    #[error("Invalid FPU id {fpu} (grid has {num_fpus} FPUs)")]
    InvalidFpuId { fpu: usize, num_fpus: usize },

    #[error("Invalid waveform: {0}")]
    InvalidWaveform(#[from] WaveformError),

    /// 参数无效
    #[error("Invalid parameter '{param}': {reason}")]
    InvalidParameter { param: &'static str, reason: String },

    /// 序列号已被其他 FPU 使用
    #[error("Serial number {serial} already used by FPU {other}")]
    DuplicateSerialNumber { serial: String, other: u16 },

    // ==================== Hardware ====================
    /// 设备上报硬件故障（碰撞、限位、步进时序）
    #[error("FPU {fpu} reported hardware fault: {status:?}")]
    HardwareFault { fpu: u16, status: ResponseStatus },

    // ==================== Lower layers ====================
    #[error("Driver error: {0}")]
    Driver(DriverError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<DriverError> for GridError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotConnected => GridError::NotConnected,
            DriverError::AlreadyConnected => GridError::AlreadyConnected,
            DriverError::InvalidFpuId { fpu, num_fpus } => GridError::InvalidFpuId { fpu, num_fpus },
            other => GridError::Driver(other),
        }
    }
}

impl GridError {
    /// 错误大类
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotConnected
            | Self::AlreadyConnected
            | Self::ConnectionLost
            | Self::CanOverflow { .. } => ErrorCategory::Connectivity,
            Self::CommandTimeout { .. } | Self::MaxRetriesExceeded { .. } => ErrorCategory::Timeout,
            Self::InvalidState { .. }
            | Self::Locked { .. }
            | Self::InAbortedState { .. }
            | Self::UnresolvedCollision { .. }
            | Self::NotReferenced { .. }
            | Self::Rejected { .. } => ErrorCategory::DeviceState,
            Self::InvalidFpuId { .. }
            | Self::InvalidWaveform(_)
            | Self::InvalidParameter { .. }
            | Self::DuplicateSerialNumber { .. }
            | Self::Protocol(_) => ErrorCategory::Parameter,
            Self::HardwareFault { .. } => ErrorCategory::HardwareFault,
            Self::Driver(err) => match err {
                DriverError::ResourceExhausted { .. }
                | DriverError::PoolTimeout { .. }
                | DriverError::QueueFull { .. } => ErrorCategory::Resource,
                DriverError::Config(_) | DriverError::InvalidGateway { .. } => {
                    ErrorCategory::Parameter
                },
                _ => ErrorCategory::Connectivity,
            },
        }
    }

    /// 重新执行操作可能会成功
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Timeout | ErrorCategory::Connectivity
        ) && !matches!(self, Self::AlreadyConnected)
    }

    /// 从设备响应状态码构造错误
    pub(crate) fn from_status(fpu: u16, status: ResponseStatus) -> Self {
        match status {
            s if s.is_hardware_fault() => Self::HardwareFault { fpu, status: s },
            ResponseStatus::Locked => Self::Locked { fpu },
            ResponseStatus::NotReferenced => Self::NotReferenced { fpu },
            ResponseStatus::InvalidParameter => Self::InvalidParameter {
                param: "command",
                reason: format!("FPU {fpu} rejected the command parameters"),
            },
            ResponseStatus::TimedOut => Self::CommandTimeout { count: 1 },
            status => Self::Rejected { fpu, status },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(GridError::NotConnected.category(), ErrorCategory::Connectivity);
        assert_eq!(
            GridError::MaxRetriesExceeded { attempts: 3 }.category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            GridError::InvalidState {
                fpu: 1,
                state: FpuState::Moving
            }
            .category(),
            ErrorCategory::DeviceState
        );
        assert_eq!(
            GridError::InAbortedState { fpu: 2 }.category(),
            ErrorCategory::DeviceState
        );
        assert_eq!(
            GridError::from(WaveformError::InvalidConfig("x".into())).category(),
            ErrorCategory::Parameter
        );
        assert_eq!(
            GridError::from(DriverError::ResourceExhausted {
                what: "pool",
                requested: 1
            })
            .category(),
            ErrorCategory::Resource
        );
    }

    #[test]
    fn test_driver_error_mapping() {
        assert!(matches!(
            GridError::from(DriverError::NotConnected),
            GridError::NotConnected
        ));
        assert!(matches!(
            GridError::from(DriverError::InvalidFpuId {
                fpu: 9,
                num_fpus: 4
            }),
            GridError::InvalidFpuId { fpu: 9, .. }
        ));
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            GridError::from_status(3, ResponseStatus::Collision),
            GridError::HardwareFault { fpu: 3, .. }
        ));
        assert!(matches!(
            GridError::from_status(3, ResponseStatus::Locked),
            GridError::Locked { fpu: 3 }
        ));
        assert!(matches!(
            GridError::from_status(3, ResponseStatus::WaveformNotReady),
            GridError::Rejected { .. }
        ));
        assert!(GridError::CommandTimeout { count: 1 }.is_retryable());
        assert!(!GridError::AlreadyConnected.is_retryable());
    }
}
