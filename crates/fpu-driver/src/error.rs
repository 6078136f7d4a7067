//! 驱动层错误类型定义

use fpu_gateway::GatewayError;
use fpu_protocol::{CommandKind, ProtocolError};
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 网关传输错误
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// 配置无效
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// 启动时无法预留资源（致命，不重试）
    #[error("Cannot reserve {requested} slots for {what}")]
    ResourceExhausted { what: &'static str, requested: usize },

    /// 命令池在等待期限内没有空闲槽位
    #[error("Command pool exhausted for {kind:?}")]
    PoolTimeout { kind: CommandKind },

    /// 网关命令队列已满
    #[error("Command queue full for gateway {gateway}")]
    QueueFull { gateway: usize },

    /// 未连接
    #[error("Not connected")]
    NotConnected,

    /// 已经连接
    #[error("Already connected")]
    AlreadyConnected,

    /// FPU 编号超出网格范围
    #[error("Invalid FPU id {fpu} (grid has {num_fpus} FPUs)")]
    InvalidFpuId { fpu: usize, num_fpus: usize },

    /// 网关编号超出配置范围
    #[error("Invalid gateway {gateway} (grid uses {num_gateways} gateways)")]
    InvalidGateway { gateway: usize, num_gateways: usize },

    /// IO 线程错误
    #[error("IO thread error: {0}")]
    IoThread(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::ResourceExhausted {
            what: "ConfigMotion pool",
            requested: 18240,
        };
        assert_eq!(err.to_string(), "Cannot reserve 18240 slots for ConfigMotion pool");

        let err = DriverError::InvalidFpuId {
            fpu: 2000,
            num_fpus: 76,
        };
        assert!(err.to_string().contains("2000"));

        assert_eq!(DriverError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_from_protocol_error() {
        let driver_error: DriverError = ProtocolError::InvalidBusId { bus: 9 }.into();
        match driver_error {
            DriverError::Protocol(ProtocolError::InvalidBusId { bus }) => assert_eq!(bus, 9),
            other => panic!("Expected Protocol variant, got {other:?}"),
        }
    }

    #[test]
    fn test_from_gateway_error() {
        let driver_error: DriverError = GatewayError::Closed.into();
        assert!(matches!(driver_error, DriverError::Gateway(GatewayError::Closed)));
    }
}
