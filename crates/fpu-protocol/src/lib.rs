//! # FPU Protocol
//!
//! 光纤定位单元（FPU）网关 CAN 协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `constants`: 网格拓扑与协议常量
//! - `ids`: CAN 标识符与逻辑地址换算
//! - `framer`: 字节流分帧（DLE 转义）
//! - `command`: 命令帧构建
//! - `response`: 响应帧解析
//!
//! ## 字节序
//!
//! 网关协议中的多字节整数统一使用小端字节序（LSB first）。

pub mod command;
pub mod constants;
pub mod framer;
pub mod ids;
pub mod response;

// 重新导出常用类型
pub use command::*;
pub use constants::*;
pub use framer::{FrameDecoder, encode_frame, encode_frame_into};
pub use ids::*;
pub use response::*;

use thiserror::Error;

/// 协议层错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// 帧长度不合法
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// 总线号超出网关范围
    #[error("Invalid bus id: {bus}")]
    InvalidBusId { bus: u8 },

    /// 总线内地址超出范围（有效范围 1..=76，0 为广播）
    #[error("Invalid FPU bus address: {busid}")]
    InvalidBusAddress { busid: u8 },

    /// 未知消息码
    #[error("Unknown message code: {code:#04x}")]
    UnknownMessageCode { code: u8 },

    /// 未知 FPU 状态值
    #[error("Unknown FPU state value: {value}")]
    UnknownState { value: u8 },

    /// 序列号字符串不合法
    #[error("Invalid serial number: {0}")]
    InvalidSerialNumber(String),

    /// 参数超出协议可表示范围
    #[error("Value out of range for {field}: {value}")]
    ValueOutOfRange { field: &'static str, value: i64 },
}

/// 网关帧：一条 CAN 消息及其所在总线
///
/// # 设计目的
///
/// `GatewayFrame` 是分帧层和消息层之间的中间抽象：
/// - 分帧层（`framer`）只关心字节，解码结果直接落到此结构
/// - 命令层通过 `Command::serialize()` 构建
/// - 响应层通过 `Response::try_from()` 解析
///
/// # 线上格式（去除 DLE 转义后）
///
/// ```text
/// [bus-id][can-id lo][can-id hi][payload 0..=8]
/// ```
///
/// # 设计特性
///
/// - **Copy trait**：零成本复制，适合高频收发
/// - **固定 8 字节负载**：避免堆分配
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GatewayFrame {
    /// 网关内总线编号（0..5）
    pub bus: u8,
    /// 11 位 CAN 标识符（高 4 位优先级，低 7 位总线地址）
    pub can_id: u16,
    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],
    /// 有效数据长度 (0-8)
    pub len: u8,
}

impl GatewayFrame {
    /// 创建网关帧
    ///
    /// 超过 8 字节的数据会被截断。
    pub fn new(bus: u8, can_id: u16, data: &[u8]) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(MAX_PAYLOAD_LEN);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            bus,
            can_id,
            data: fixed_data,
            len: len as u8,
        }
    }

    /// 获取有效数据切片
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 总线内地址（低 7 位）
    pub fn busid(&self) -> u8 {
        (self.can_id & BUSID_MASK) as u8
    }

    /// 优先级（高 4 位）
    pub fn priority(&self) -> u8 {
        (self.can_id >> PRIORITY_SHIFT) as u8
    }

    /// 是否为广播帧（全零标识符）
    pub fn is_broadcast(&self) -> bool {
        self.can_id == BROADCAST_CAN_ID
    }

    /// 写出去转义前的原始字节（头 3 字节 + 负载）
    ///
    /// 返回写入的字节数。
    pub fn write_raw(&self, out: &mut [u8; MAX_FRAME_LEN]) -> usize {
        out[0] = self.bus;
        out[1..3].copy_from_slice(&self.can_id.to_le_bytes());
        let len = self.len as usize;
        out[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].copy_from_slice(self.data_slice());
        FRAME_HEADER_LEN + len
    }

    /// 从去转义后的原始字节解析
    pub fn from_raw(raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.len() < FRAME_HEADER_LEN || raw.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::InvalidLength {
                expected: FRAME_HEADER_LEN,
                actual: raw.len(),
            });
        }
        let can_id = u16::from_le_bytes([raw[1], raw[2]]);
        Ok(Self::new(raw[0], can_id, &raw[FRAME_HEADER_LEN..]))
    }
}
