//! 响应帧解析
//!
//! 设备对每条命令（以及主动通知）回送一帧，负载布局：
//!
//! ```text
//! Byte 0: 序列号（回显命令的序列号，通知为 0）
//! Byte 1: 消息码
//! Byte 2-3: 状态字（u16 小端，见 `StatusWord`）
//! Byte 4-7: 附加数据（按消息码而定）
//! ```
//!
//! 例外：`ReadSerialNumber` 的响应在 Byte 2-7 直接携带 6 字节 ASCII
//! 序列号，没有状态字。

use crate::command::{CommandKind, MessageCode};
use crate::constants::*;
use crate::ids::can_identifier;
use crate::{GatewayFrame, ProtocolError};
use bilge::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::fmt;

/// 响应帧使用的 CAN 优先级
pub const RESPONSE_PRIORITY: u8 = 0x02;

// ============================================================================
// 设备状态
// ============================================================================

/// FPU 生命周期状态（设备状态字 Bit 0-4）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum FpuState {
    /// 未知（未收到过响应，或命令超时后无法确定）
    #[default]
    Unknown = 0,
    /// 上电后尚未寻零
    Uninitialized = 1,
    /// 已锁定，不参与广播
    Locked = 2,
    /// 正在寻零
    DatumSearch = 3,
    /// 位于零点
    AtDatum = 4,
    /// 正在装载波形
    Loading = 5,
    /// 波形已就绪（正向）
    ReadyForward = 6,
    /// 波形已就绪（反向）
    ReadyReverse = 7,
    /// 运动中
    Moving = 8,
    /// 运动结束，静止
    Resting = 9,
    /// 运动被中止
    Aborted = 10,
    /// 碰撞或限位错误
    ObstacleError = 11,
}

/// 状态数量
pub const NUM_FPU_STATES: usize = 12;

impl FpuState {
    /// 全部状态（按编码顺序）
    pub const ALL: [FpuState; NUM_FPU_STATES] = [
        FpuState::Unknown,
        FpuState::Uninitialized,
        FpuState::Locked,
        FpuState::DatumSearch,
        FpuState::AtDatum,
        FpuState::Loading,
        FpuState::ReadyForward,
        FpuState::ReadyReverse,
        FpuState::Moving,
        FpuState::Resting,
        FpuState::Aborted,
        FpuState::ObstacleError,
    ];

    /// 计数数组下标
    #[inline]
    pub fn index(self) -> usize {
        u8::from(self) as usize
    }

    /// 是否处于运动或寻零中
    pub fn is_moving(self) -> bool {
        matches!(self, FpuState::Moving | FpuState::DatumSearch)
    }

    /// 是否需要显式恢复才能继续运动
    pub fn needs_recovery(self) -> bool {
        matches!(self, FpuState::ObstacleError | FpuState::Aborted)
    }

    /// 波形是否就绪
    pub fn is_ready(self) -> bool {
        matches!(self, FpuState::ReadyForward | FpuState::ReadyReverse)
    }
}

/// 设备响应状态码（设备状态字 Bit 5-8）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, FromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ResponseStatus {
    /// 成功
    Ok = 0,
    /// Beta 臂碰撞
    Collision = 1,
    /// Alpha 臂限位
    AlphaLimit = 2,
    /// 当前状态下命令无效
    InvalidCommand = 3,
    /// 波形校验失败
    WaveformInvalid = 4,
    /// 波形未就绪
    WaveformNotReady = 5,
    /// 寻零超时
    DatumTimeout = 6,
    /// 尚未寻零
    NotReferenced = 7,
    /// 步进时序错误
    StepTiming = 8,
    /// 参数无效
    InvalidParameter = 9,
    /// 设备忙
    Busy = 10,
    /// 设备已锁定
    Locked = 11,
    /// 驱动侧判定超时（不会出现在线上）
    TimedOut = 12,
    /// 未知状态码
    #[default]
    Unknown = 15,
}

impl ResponseStatus {
    /// 是否为硬件上报的故障
    pub fn is_hardware_fault(self) -> bool {
        matches!(
            self,
            ResponseStatus::Collision | ResponseStatus::AlphaLimit | ResponseStatus::StepTiming
        )
    }
}

/// 设备状态字位域（u16 小端，LSB first）
///
/// - Bit 0-4: 生命周期状态
/// - Bit 5-8: 响应状态码
/// - Bit 9: Alpha 臂已寻零
/// - Bit 10: Beta 臂已寻零
/// - Bit 11: 已锁定
/// - Bit 12: Alpha 限位触发
/// - Bit 13: Beta 碰撞
/// - Bit 14: 波形有效
/// - Bit 15: 波形就绪
#[bitsize(16)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct StatusWord {
    pub state: u5,
    pub status: u4,
    pub alpha_referenced: bool,
    pub beta_referenced: bool,
    pub locked: bool,
    pub alpha_limit: bool,
    pub beta_collision: bool,
    pub waveform_valid: bool,
    pub waveform_ready: bool,
}

/// 解码后的设备状态报告
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusReport {
    pub state: FpuState,
    pub status: ResponseStatus,
    pub alpha_referenced: bool,
    pub beta_referenced: bool,
    pub locked: bool,
    pub alpha_limit: bool,
    pub beta_collision: bool,
    pub waveform_valid: bool,
    pub waveform_ready: bool,
}

impl StatusReport {
    /// 从线上状态字解码
    pub fn from_word(word: u16) -> Result<Self, ProtocolError> {
        let bits = StatusWord::from(word);
        let raw_state = bits.state().value();
        let state =
            FpuState::try_from(raw_state).map_err(|_| ProtocolError::UnknownState { value: raw_state })?;
        Ok(Self {
            state,
            status: ResponseStatus::from(bits.status().value()),
            alpha_referenced: bits.alpha_referenced(),
            beta_referenced: bits.beta_referenced(),
            locked: bits.locked(),
            alpha_limit: bits.alpha_limit(),
            beta_collision: bits.beta_collision(),
            waveform_valid: bits.waveform_valid(),
            waveform_ready: bits.waveform_ready(),
        })
    }

    /// 编码为线上状态字
    pub fn to_word(&self) -> u16 {
        let status: u8 = self.status.into();
        let bits = StatusWord::new(
            u5::new(self.state.into()),
            u4::new(status & 0x0F),
            self.alpha_referenced,
            self.beta_referenced,
            self.locked,
            self.alpha_limit,
            self.beta_collision,
            self.waveform_valid,
            self.waveform_ready,
        );
        u16::from(bits)
    }
}

// ============================================================================
// 附加数据
// ============================================================================

/// 固件版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// 设备序列号（最多 6 个可打印 ASCII 字符，不足补 0）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialNumber([u8; SERIAL_NUMBER_LEN]);

impl SerialNumber {
    /// 从字符串解析
    ///
    /// 空串、超长或包含非可打印 ASCII 字符（含空格）时返回错误。
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        if s.is_empty() || s.len() > SERIAL_NUMBER_LEN {
            return Err(ProtocolError::InvalidSerialNumber(s.to_string()));
        }
        if !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(ProtocolError::InvalidSerialNumber(s.to_string()));
        }
        let mut raw = [0u8; SERIAL_NUMBER_LEN];
        raw[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(raw))
    }

    /// 从线上字节构造（不校验）
    pub fn from_bytes(raw: [u8; SERIAL_NUMBER_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; SERIAL_NUMBER_LEN] {
        &self.0
    }

    /// 是否为空（出厂未写入）
    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|&b| b == 0 || b == b' ' || b == 0xFF)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0.iter().take_while(|&&b| b != 0) {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "?")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialNumber({self})")
    }
}

/// 响应附加数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResponseData {
    /// 无附加数据（负载过短）
    #[default]
    None,
    /// 两个臂的步数
    Position { alpha_steps: i16, beta_steps: i16 },
    /// 寄存器值
    Register { value: u8 },
    /// 固件版本
    Firmware(FirmwareVersion),
    /// 固件/参数区 CRC32
    Integrity { crc32: u32 },
    /// 序列号
    Serial(SerialNumber),
}

// ============================================================================
// 响应
// ============================================================================

/// 设备响应（命令回显或主动通知）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Response {
    /// 网关内总线编号
    pub bus: u8,
    /// 总线地址（1..=76）
    pub busid: u8,
    /// 回显的序列号
    pub seq: u8,
    pub code: MessageCode,
    /// 设备状态（序列号响应没有状态字）
    pub report: Option<StatusReport>,
    pub data: ResponseData,
}

impl TryFrom<GatewayFrame> for Response {
    type Error = ProtocolError;

    fn try_from(frame: GatewayFrame) -> Result<Self, Self::Error> {
        let data = frame.data_slice();
        if data.len() < 2 {
            return Err(ProtocolError::InvalidLength {
                expected: 2,
                actual: data.len(),
            });
        }
        let busid = frame.busid();
        if busid == 0 || busid as usize > FPUS_PER_BUS {
            return Err(ProtocolError::InvalidBusAddress { busid });
        }
        let seq = data[0];
        let code = MessageCode::from_byte(data[1])?;

        if code == MessageCode::Command(CommandKind::ReadSerialNumber) {
            if data.len() < 2 + SERIAL_NUMBER_LEN {
                return Err(ProtocolError::InvalidLength {
                    expected: 2 + SERIAL_NUMBER_LEN,
                    actual: data.len(),
                });
            }
            let mut raw = [0u8; SERIAL_NUMBER_LEN];
            raw.copy_from_slice(&data[2..2 + SERIAL_NUMBER_LEN]);
            return Ok(Self {
                bus: frame.bus,
                busid,
                seq,
                code,
                report: None,
                data: ResponseData::Serial(SerialNumber::from_bytes(raw)),
            });
        }

        if data.len() < 4 {
            return Err(ProtocolError::InvalidLength {
                expected: 4,
                actual: data.len(),
            });
        }
        let report = StatusReport::from_word(u16::from_le_bytes([data[2], data[3]]))?;

        let extra = match code {
            MessageCode::Command(CommandKind::ReadRegister) if data.len() >= 5 => {
                ResponseData::Register { value: data[4] }
            },
            MessageCode::Command(CommandKind::GetFirmwareVersion) if data.len() >= 7 => {
                ResponseData::Firmware(FirmwareVersion::new(data[4], data[5], data[6]))
            },
            MessageCode::Command(CommandKind::CheckIntegrity) if data.len() >= 8 => {
                ResponseData::Integrity {
                    crc32: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
                }
            },
            MessageCode::Command(
                CommandKind::ReadRegister
                | CommandKind::GetFirmwareVersion
                | CommandKind::CheckIntegrity,
            ) => ResponseData::None,
            _ if data.len() >= 8 => ResponseData::Position {
                alpha_steps: i16::from_le_bytes([data[4], data[5]]),
                beta_steps: i16::from_le_bytes([data[6], data[7]]),
            },
            _ => ResponseData::None,
        };

        Ok(Self {
            bus: frame.bus,
            busid,
            seq,
            code,
            report: Some(report),
            data: extra,
        })
    }
}

impl Response {
    /// 编码为网关帧（设备侧，用于模拟器）
    pub fn to_frame(&self) -> GatewayFrame {
        let mut data = [0u8; MAX_PAYLOAD_LEN];
        data[0] = self.seq;
        data[1] = self.code.code();

        if let ResponseData::Serial(serial) = self.data {
            data[2..8].copy_from_slice(serial.as_bytes());
        } else {
            let word = self.report.map(|r| r.to_word()).unwrap_or_default();
            data[2..4].copy_from_slice(&word.to_le_bytes());
            match self.data {
                ResponseData::Position {
                    alpha_steps,
                    beta_steps,
                } => {
                    data[4..6].copy_from_slice(&alpha_steps.to_le_bytes());
                    data[6..8].copy_from_slice(&beta_steps.to_le_bytes());
                },
                ResponseData::Register { value } => data[4] = value,
                ResponseData::Firmware(v) => {
                    data[4] = v.major;
                    data[5] = v.minor;
                    data[6] = v.patch;
                },
                ResponseData::Integrity { crc32 } => {
                    data[4..8].copy_from_slice(&crc32.to_le_bytes());
                },
                ResponseData::None | ResponseData::Serial(_) => {},
            }
        }

        GatewayFrame::new(
            self.bus,
            can_identifier(RESPONSE_PRIORITY, self.busid),
            &data,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Notification;

    fn report(state: FpuState) -> StatusReport {
        StatusReport {
            state,
            ..Default::default()
        }
    }

    #[test]
    fn test_status_word_bit_layout() {
        let r = StatusReport {
            state: FpuState::AtDatum,
            status: ResponseStatus::Collision,
            alpha_referenced: true,
            beta_referenced: false,
            locked: false,
            alpha_limit: false,
            beta_collision: true,
            waveform_valid: false,
            waveform_ready: true,
        };
        let word = r.to_word();
        // state=4 (bit 0-4), status=1 (bit 5), alpha_referenced (bit 9),
        // beta_collision (bit 13), waveform_ready (bit 15)
        assert_eq!(word, 4 | (1 << 5) | (1 << 9) | (1 << 13) | (1 << 15));
        assert_eq!(StatusReport::from_word(word).unwrap(), r);
    }

    #[test]
    fn test_unknown_state_value_rejected() {
        assert!(matches!(
            StatusReport::from_word(31),
            Err(ProtocolError::UnknownState { value: 31 })
        ));
    }

    #[test]
    fn test_unknown_status_defaults() {
        let word = (14u16 << 5) | FpuState::Resting as u16;
        let r = StatusReport::from_word(word).unwrap();
        assert_eq!(r.status, ResponseStatus::Unknown);
        assert_eq!(r.state, FpuState::Resting);
    }

    #[test]
    fn test_position_response() {
        let frame = GatewayFrame::new(
            2,
            can_identifier(RESPONSE_PRIORITY, 12),
            &[5, 26, 0x04, 0x06, 0x10, 0x00, 0xF6, 0xFF],
        );
        let resp = Response::try_from(frame).unwrap();
        assert_eq!(resp.bus, 2);
        assert_eq!(resp.busid, 12);
        assert_eq!(resp.seq, 5);
        assert_eq!(resp.code, MessageCode::Notification(Notification::FinishedDatum));
        let r = resp.report.unwrap();
        assert_eq!(r.state, FpuState::AtDatum);
        assert!(r.alpha_referenced && r.beta_referenced);
        assert_eq!(
            resp.data,
            ResponseData::Position {
                alpha_steps: 16,
                beta_steps: -10
            }
        );
    }

    #[test]
    fn test_firmware_and_register_responses() {
        let fw = Response {
            bus: 0,
            busid: 1,
            seq: 3,
            code: MessageCode::Command(CommandKind::GetFirmwareVersion),
            report: Some(report(FpuState::Resting)),
            data: ResponseData::Firmware(FirmwareVersion::new(1, 4, 2)),
        };
        assert_eq!(Response::try_from(fw.to_frame()).unwrap(), fw);

        let reg = Response {
            code: MessageCode::Command(CommandKind::ReadRegister),
            data: ResponseData::Register { value: 0xA5 },
            ..fw
        };
        assert_eq!(Response::try_from(reg.to_frame()).unwrap(), reg);

        let crc = Response {
            code: MessageCode::Command(CommandKind::CheckIntegrity),
            data: ResponseData::Integrity { crc32: 0xDEAD_BEEF },
            ..fw
        };
        assert_eq!(Response::try_from(crc.to_frame()).unwrap(), crc);
    }

    #[test]
    fn test_serial_number_response_has_no_status() {
        let frame = GatewayFrame::new(
            0,
            can_identifier(RESPONSE_PRIORITY, 76),
            &[9, 23, b'M', b'P', b'0', b'4', b'2', 0],
        );
        let resp = Response::try_from(frame).unwrap();
        assert!(resp.report.is_none());
        match resp.data {
            ResponseData::Serial(s) => assert_eq!(s.to_string(), "MP042"),
            other => panic!("unexpected data {other:?}"),
        }
    }

    #[test]
    fn test_response_rejects_broadcast_address_and_short_payload() {
        let broadcast = GatewayFrame::new(0, 0, &[0, 7, 0, 0]);
        assert!(matches!(
            Response::try_from(broadcast),
            Err(ProtocolError::InvalidBusAddress { busid: 0 })
        ));
        let short = GatewayFrame::new(0, can_identifier(2, 3), &[0, 7, 0]);
        assert!(matches!(
            Response::try_from(short),
            Err(ProtocolError::InvalidLength { expected: 4, .. })
        ));
    }

    #[test]
    fn test_serial_number_validation() {
        assert!(SerialNumber::parse("").is_err());
        assert!(SerialNumber::parse("1234567").is_err());
        assert!(SerialNumber::parse("AB C").is_err());
        assert!(SerialNumber::parse("AB\u{e9}").is_err());
        let s = SerialNumber::parse("X1").unwrap();
        assert_eq!(s.as_bytes(), &[b'X', b'1', 0, 0, 0, 0]);
        assert!(!s.is_blank());
        assert!(SerialNumber::default().is_blank());
    }

    #[test]
    fn test_firmware_ordering() {
        assert!(FirmwareVersion::new(1, 4, 0) > FirmwareVersion::new(1, 3, 9));
        assert!(FirmwareVersion::new(2, 0, 0) > FirmwareVersion::new(1, 9, 9));
        assert_eq!(FirmwareVersion::new(1, 2, 3).to_string(), "1.2.3");
    }

    #[test]
    fn test_state_index_matches_all() {
        for (i, s) in FpuState::ALL.iter().enumerate() {
            assert_eq!(s.index(), i);
        }
    }
}
