//! 协议常量定义
//!
//! 网格拓扑、分帧字节与各类容量上限。

// ============================================================================
// 网格拓扑
// ============================================================================

/// 最大网关数量
pub const MAX_NUM_GATEWAYS: usize = 3;

/// 每个网关复用的物理总线数量
pub const BUSES_PER_GATEWAY: usize = 5;

/// 每条总线上的 FPU 数量（总线地址 1..=76）
pub const FPUS_PER_BUS: usize = 76;

/// 每个网关下的 FPU 数量
pub const FPUS_PER_GATEWAY: usize = BUSES_PER_GATEWAY * FPUS_PER_BUS;

/// 网格中 FPU 的最大数量
pub const MAX_NUM_POSITIONERS: usize = MAX_NUM_GATEWAYS * FPUS_PER_GATEWAY;

/// 网关默认 TCP 端口
pub const DEFAULT_GATEWAY_PORT: u16 = 4700;

// ============================================================================
// 分帧
// ============================================================================

/// 转义字节（Data Link Escape）
pub const DLE: u8 = 0x10;

/// 帧起始标记（跟在 DLE 之后）
pub const STX: u8 = 0x02;

/// 帧结束标记（跟在 DLE 之后）
pub const ETX: u8 = 0x03;

/// 帧头长度：总线号 1 字节 + CAN 标识符 2 字节
pub const FRAME_HEADER_LEN: usize = 3;

/// CAN 负载最大长度
pub const MAX_PAYLOAD_LEN: usize = 8;

/// 去转义后单帧最大长度
pub const MAX_FRAME_LEN: usize = FRAME_HEADER_LEN + MAX_PAYLOAD_LEN;

/// 转义后单帧最大长度（每个字节都可能被加倍，外加首尾标记）
pub const MAX_ENCODED_FRAME_LEN: usize = 2 * MAX_FRAME_LEN + 4;

// ============================================================================
// 消息
// ============================================================================

/// 负载 Byte 1 中消息码的掩码（5 位）
pub const MESSAGE_CODE_MASK: u8 = 0x1F;

/// 序列号字符串长度
pub const SERIAL_NUMBER_LEN: usize = 6;

/// 单个 FPU 同时在途（已发送未确认）的命令上限
pub const MAX_PENDING_PER_FPU: usize = 16;

/// 波形表允许的最大段数
pub const MAX_WAVEFORM_SEGMENTS: usize = 256;

/// 合法的微步等级
pub const VALID_USTEP_LEVELS: [u8; 4] = [1, 2, 4, 8];

/// `SetTicksPerSegment` 可表示的最大值（24 位）
pub const MAX_TICKS_PER_SEGMENT: u32 = 0x00FF_FFFF;
