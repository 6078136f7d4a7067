//! # FPU Gateway Transport
//!
//! 网关传输层：每个网关是一条 TCP 字节流，承载 DLE 分帧的 CAN 消息。
//!
//! 连接建立后通过 [`GatewayLink::split`] 拆分为独立的读半部和写半部，
//! 两者都实现 `mio::event::Source`，分别注册到接收循环和发送循环的
//! `mio::Poll` 上。
//!
//! ## 模块
//!
//! - `link`: TCP 连接与读写半部
//! - `mock`（feature `mock`）: 网关模拟器，用于无硬件测试

pub mod link;

#[cfg(feature = "mock")]
pub mod mock;

pub use fpu_protocol::GatewayFrame;
pub use link::{FlushStatus, GatewayLink, GatewayRx, GatewayTx, ReadStatus};

#[cfg(feature = "mock")]
pub use mock::{GatewaySimulator, SimulatorConfig};

use std::time::Duration;
use thiserror::Error;

/// 网关传输层错误类型
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// 地址无法解析
    #[error("Cannot resolve gateway address: {0}")]
    Resolve(String),

    /// 连接超时
    #[error("Connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// 对端关闭连接
    #[error("Gateway closed the connection")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] fpu_protocol::ProtocolError),
}

impl GatewayError {
    /// 是否意味着连接已不可用
    pub fn is_connection_lost(&self) -> bool {
        match self {
            GatewayError::Closed => true,
            GatewayError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
