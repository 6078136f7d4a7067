//! FPU SDK - 光纤定位单元网格的 Rust SDK
//!
//! 通过 TCP 上的 CAN 网关驱动最多数百个光纤定位单元（FPU）：寻零、
//! 波形装载与同步执行、急停、碰撞恢复以及各类查询。
//!
//! # 架构设计
//!
//! 从底层到高层：
//!
//! - **协议层** (`protocol`): 网关帧、命令编码与响应解析
//! - **网关层** (`gateway`): TCP 连接和网关模拟器（`mock` feature）
//! - **驱动层** (`driver`): 命令池、发送队列、超时跟踪、网格状态
//! - **客户端层** (`client`): 带前置检查的同步网格操作
//!
//! # 快速开始
//!
//! ```no_run
//! use fpu_sdk::prelude::*;
//!
//! fpu_sdk::init_logger();
//! let config = DriverConfig::load_from_file("grid.toml").unwrap();
//! let client = GridClient::new(config).unwrap();
//! client.connect().unwrap();
//! client.find_datum(FpuSelection::All, DatumSearch::automatic()).unwrap();
//! ```

pub use fpu_client as client;
pub use fpu_driver as driver;
pub use fpu_gateway as gateway;
pub use fpu_protocol as protocol;

pub mod prelude;

// 客户端层（推荐入口）
pub use fpu_client::{
    ErrorCategory, FpuSelection, GridClient, GridError, OpOutcome, StepPair, WaveformError,
    WaveformTable,
};

// 驱动层
pub use fpu_driver::{
    DriverConfig, DriverError, GatewayAddress, GridDriver, GridDriverBuilder, GridState,
    GridSummary, WaveformRuleset,
};

// 协议与传输层错误
pub use fpu_gateway::GatewayError;
pub use fpu_protocol::ProtocolError;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// 初始化日志
///
/// 安装 `tracing` fmt 订阅者（过滤规则取自 `RUST_LOG`，默认 `info`），
/// 并把 `log` 记录转发到 `tracing`。重复调用无效果；已有全局订阅者时
/// 保留原有订阅者。
pub fn init_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            return;
        }
        let _ = tracing_log::LogTracer::builder()
            .with_max_level(log::LevelFilter::Trace)
            .init();
    });
}
