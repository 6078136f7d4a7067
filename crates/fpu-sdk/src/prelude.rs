//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use fpu_sdk::prelude::*;
//! ```

// 客户端层
pub use fpu_client::{FpuSelection, GridClient, OpOutcome, WaveformTable};

// 驱动层
pub use fpu_driver::{
    CommandTimeouts, DriverConfig, GatewayAddress, GridDriverBuilder, GridState, GridSummary,
    MotionLimits, WaveformRuleset,
};

// 协议层
pub use fpu_protocol::{DatumSearch, FpuState, RecoveryDirection};

// 错误类型
pub use fpu_client::GridError;
pub use fpu_driver::DriverError;
pub use fpu_gateway::GatewayError;
pub use fpu_protocol::ProtocolError;
