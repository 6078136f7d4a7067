//! # FPU Driver
//!
//! 网格驱动层：命令池、网关命令队列、超时跟踪、网格状态存储，以及
//! 收发分离的两个后台 IO 线程。
//!
//! ## 模块
//!
//! - `config`: 驱动配置（TOML）
//! - `pool`: 预分配命令池与票据
//! - `queue`: 每网关命令队列
//! - `timeout`: 超时跟踪器
//! - `state` / `store`: 网格状态快照与共享存储
//! - `pipeline`: 收发循环
//! - `driver` / `builder`: 对外 API
//! - `metrics`: 原子计数指标
//!
//! ## 线程模型
//!
//! 固定两个后台线程（`fpu-rx`、`fpu-tx`），加上任意数量的调用方线程。
//! 状态存储、命令池、命令队列各有独立的 `Mutex` + `Condvar`。

pub mod builder;
pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod state;
pub mod store;
pub mod timeout;

pub use builder::GridDriverBuilder;
pub use config::{CommandTimeouts, DriverConfig, GatewayAddress, MotionLimits, WaveformRuleset};
pub use driver::GridDriver;
pub use error::DriverError;
pub use metrics::{DriverMetrics, MetricsSnapshot};
pub use pool::{CommandPool, PooledCommand, Target};
pub use queue::CommandQueue;
pub use state::{
    FpuStatus, GridState, GridSummary, InterfaceState, PendingCommand, WaitStatus, WaitTarget,
};
pub use store::{GridStateStore, ResponseMatch};
pub use timeout::TimeoutTracker;
