//! 命令帧构建
//!
//! 命令是一个封闭的标签联合（每种命令一个变体），序列化通过穷举
//! `match` 完成。所有命令帧的负载布局：
//!
//! ```text
//! Byte 0: 序列号
//! Byte 1: 消息码（低 5 位）
//! Byte 2..8: 命令参数（按命令而定，小端）
//! ```

use crate::constants::*;
use crate::ids::{BROADCAST_CAN_ID, can_identifier};
use crate::response::SerialNumber;
use crate::{GatewayFrame, ProtocolError};
use bilge::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};

// ============================================================================
// 消息码
// ============================================================================

/// 命令种类（线上消息码 1..=24）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CommandKind {
    ConfigMotion = 1,
    ExecuteMotion = 2,
    AbortMotion = 3,
    LockUnit = 4,
    UnlockUnit = 5,
    ReadRegister = 6,
    PingFpu = 7,
    ResetFpu = 8,
    FindDatum = 9,
    ResetStepCounter = 10,
    RepeatMotion = 11,
    ReverseMotion = 12,
    EnableBetaCollisionProtection = 13,
    FreeBetaCollision = 14,
    SetUstepLevel = 15,
    GetFirmwareVersion = 16,
    CheckIntegrity = 17,
    FreeAlphaLimitBreach = 18,
    EnableAlphaLimitProtection = 19,
    SetTicksPerSegment = 20,
    SetStepsPerSegment = 21,
    EnableMove = 22,
    ReadSerialNumber = 23,
    WriteSerialNumber = 24,
}

/// 命令种类数量（按消息码索引，0 号保留）
pub const NUM_COMMAND_KINDS: usize = 25;

impl CommandKind {
    /// 全部命令种类
    pub const ALL: [CommandKind; 24] = [
        CommandKind::ConfigMotion,
        CommandKind::ExecuteMotion,
        CommandKind::AbortMotion,
        CommandKind::LockUnit,
        CommandKind::UnlockUnit,
        CommandKind::ReadRegister,
        CommandKind::PingFpu,
        CommandKind::ResetFpu,
        CommandKind::FindDatum,
        CommandKind::ResetStepCounter,
        CommandKind::RepeatMotion,
        CommandKind::ReverseMotion,
        CommandKind::EnableBetaCollisionProtection,
        CommandKind::FreeBetaCollision,
        CommandKind::SetUstepLevel,
        CommandKind::GetFirmwareVersion,
        CommandKind::CheckIntegrity,
        CommandKind::FreeAlphaLimitBreach,
        CommandKind::EnableAlphaLimitProtection,
        CommandKind::SetTicksPerSegment,
        CommandKind::SetStepsPerSegment,
        CommandKind::EnableMove,
        CommandKind::ReadSerialNumber,
        CommandKind::WriteSerialNumber,
    ];

    /// 线上消息码
    #[inline]
    pub fn code(self) -> u8 {
        self.into()
    }

    /// 按消息码的数组下标
    #[inline]
    pub fn index(self) -> usize {
        self.code() as usize
    }

    /// CAN 仲裁优先级（越小越优先）
    pub fn priority(self) -> u8 {
        match self {
            CommandKind::AbortMotion => 0x01,
            CommandKind::ExecuteMotion
            | CommandKind::RepeatMotion
            | CommandKind::ReverseMotion => 0x02,
            CommandKind::LockUnit | CommandKind::UnlockUnit => 0x03,
            CommandKind::FreeBetaCollision
            | CommandKind::EnableBetaCollisionProtection
            | CommandKind::FreeAlphaLimitBreach
            | CommandKind::EnableAlphaLimitProtection => 0x04,
            CommandKind::FindDatum | CommandKind::ResetFpu | CommandKind::ResetStepCounter => 0x05,
            CommandKind::ConfigMotion | CommandKind::EnableMove => 0x06,
            CommandKind::SetUstepLevel
            | CommandKind::SetTicksPerSegment
            | CommandKind::SetStepsPerSegment
            | CommandKind::WriteSerialNumber => 0x07,
            CommandKind::PingFpu
            | CommandKind::ReadRegister
            | CommandKind::GetFirmwareVersion
            | CommandKind::CheckIntegrity
            | CommandKind::ReadSerialNumber => 0x08,
        }
    }

    /// 完成该命令的消息码
    ///
    /// 寻零和运动执行会先收到一条同码的确认，真正结束由
    /// `FinishedDatum` / `FinishedMotion` 通知。
    pub fn response_code(self) -> MessageCode {
        match self {
            CommandKind::FindDatum => MessageCode::Notification(Notification::FinishedDatum),
            CommandKind::ExecuteMotion => MessageCode::Notification(Notification::FinishedMotion),
            other => MessageCode::Command(other),
        }
    }

    /// 是否允许以广播方式发送
    pub fn supports_broadcast(self) -> bool {
        matches!(
            self,
            CommandKind::ExecuteMotion
                | CommandKind::AbortMotion
                | CommandKind::RepeatMotion
                | CommandKind::ReverseMotion
                | CommandKind::PingFpu
        )
    }
}

/// 设备主动上报的通知（线上消息码 25..=30）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Notification {
    /// 运动完成
    FinishedMotion = 25,
    /// 寻零完成
    FinishedDatum = 26,
    /// Beta 臂碰撞
    WarnCollisionBeta = 27,
    /// Alpha 臂越过限位开关
    WarnLimitAlpha = 28,
    /// 寻零超时（固件侧）
    WarnTimeoutDatum = 29,
    /// 设备 CAN 缓冲区溢出
    WarnCanOverflow = 30,
}

/// 线上消息码（命令回显或通知）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageCode {
    Command(CommandKind),
    Notification(Notification),
}

impl MessageCode {
    /// 从负载 Byte 1 解析（只看低 5 位）
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        let code = byte & MESSAGE_CODE_MASK;
        if let Ok(kind) = CommandKind::try_from(code) {
            return Ok(MessageCode::Command(kind));
        }
        Notification::try_from(code)
            .map(MessageCode::Notification)
            .map_err(|_| ProtocolError::UnknownMessageCode { code })
    }

    /// 线上消息码
    pub fn code(self) -> u8 {
        match self {
            MessageCode::Command(kind) => kind.into(),
            MessageCode::Notification(n) => n.into(),
        }
    }
}

// ============================================================================
// 命令参数
// ============================================================================

/// 寻零方向（每个臂独立）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum DatumDirection {
    /// 根据当前步数自动选择方向
    #[default]
    Automatic = 0,
    /// 顺时针
    Clockwise = 1,
    /// 逆时针
    AntiClockwise = 2,
    /// 跳过该臂
    Skip = 3,
}

impl DatumDirection {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => DatumDirection::Clockwise,
            2 => DatumDirection::AntiClockwise,
            3 => DatumDirection::Skip,
            _ => DatumDirection::Automatic,
        }
    }
}

/// 寻零参数位域（Byte 2）
///
/// - Bit 0-1: Alpha 臂方向
/// - Bit 2-3: Beta 臂方向
/// - Bit 4: 关闭固件侧寻零超时
/// - Bit 5-7: 保留
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct DatumFlags {
    pub alpha_mode: u2,
    pub beta_mode: u2,
    pub disable_timeout: bool,
    pub reserved: u3,
}

/// 寻零参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DatumSearch {
    pub alpha: DatumDirection,
    pub beta: DatumDirection,
    /// 关闭固件侧的寻零超时（仅用于调试）
    pub disable_timeout: bool,
}

impl DatumSearch {
    /// 两个臂都自动选择方向
    pub fn automatic() -> Self {
        Self::default()
    }

    fn to_flags(self) -> DatumFlags {
        let mut flags = DatumFlags::from(u8::new(0));
        flags.set_alpha_mode(u2::new(self.alpha as u8));
        flags.set_beta_mode(u2::new(self.beta as u8));
        flags.set_disable_timeout(self.disable_timeout);
        flags
    }

    /// 从线上位域解析（用于模拟器）
    pub fn from_byte(byte: u8) -> Self {
        let flags = DatumFlags::from(byte);
        Self {
            alpha: DatumDirection::from_bits(flags.alpha_mode().value()),
            beta: DatumDirection::from_bits(flags.beta_mode().value()),
            disable_timeout: flags.disable_timeout(),
        }
    }
}

/// 波形表中的一段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MotionSegment {
    pub alpha_steps: i16,
    pub beta_steps: i16,
    /// 第一段（设备清空旧波形）
    pub first: bool,
    /// 最后一段（设备进入 READY 状态）
    pub last: bool,
}

/// 碰撞/限位恢复的运动方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum RecoveryDirection {
    #[default]
    AntiClockwise = 0,
    Clockwise = 1,
}

// ============================================================================
// 命令
// ============================================================================

/// 命令（每种命令一个变体）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Command {
    ConfigMotion(MotionSegment),
    ExecuteMotion,
    AbortMotion,
    LockUnit,
    UnlockUnit,
    ReadRegister { address: u16 },
    PingFpu,
    ResetFpu,
    FindDatum(DatumSearch),
    ResetStepCounter,
    RepeatMotion,
    ReverseMotion,
    EnableBetaCollisionProtection,
    FreeBetaCollision { direction: RecoveryDirection },
    SetUstepLevel { level: u8 },
    GetFirmwareVersion,
    CheckIntegrity,
    FreeAlphaLimitBreach { direction: RecoveryDirection },
    EnableAlphaLimitProtection,
    SetTicksPerSegment { ticks: u32 },
    SetStepsPerSegment { min_steps: u16, max_steps: u16 },
    EnableMove,
    ReadSerialNumber,
    WriteSerialNumber { serial: SerialNumber },
}

impl Command {
    /// 命令种类
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::ConfigMotion(_) => CommandKind::ConfigMotion,
            Command::ExecuteMotion => CommandKind::ExecuteMotion,
            Command::AbortMotion => CommandKind::AbortMotion,
            Command::LockUnit => CommandKind::LockUnit,
            Command::UnlockUnit => CommandKind::UnlockUnit,
            Command::ReadRegister { .. } => CommandKind::ReadRegister,
            Command::PingFpu => CommandKind::PingFpu,
            Command::ResetFpu => CommandKind::ResetFpu,
            Command::FindDatum(_) => CommandKind::FindDatum,
            Command::ResetStepCounter => CommandKind::ResetStepCounter,
            Command::RepeatMotion => CommandKind::RepeatMotion,
            Command::ReverseMotion => CommandKind::ReverseMotion,
            Command::EnableBetaCollisionProtection => CommandKind::EnableBetaCollisionProtection,
            Command::FreeBetaCollision { .. } => CommandKind::FreeBetaCollision,
            Command::SetUstepLevel { .. } => CommandKind::SetUstepLevel,
            Command::GetFirmwareVersion => CommandKind::GetFirmwareVersion,
            Command::CheckIntegrity => CommandKind::CheckIntegrity,
            Command::FreeAlphaLimitBreach { .. } => CommandKind::FreeAlphaLimitBreach,
            Command::EnableAlphaLimitProtection => CommandKind::EnableAlphaLimitProtection,
            Command::SetTicksPerSegment { .. } => CommandKind::SetTicksPerSegment,
            Command::SetStepsPerSegment { .. } => CommandKind::SetStepsPerSegment,
            Command::EnableMove => CommandKind::EnableMove,
            Command::ReadSerialNumber => CommandKind::ReadSerialNumber,
            Command::WriteSerialNumber { .. } => CommandKind::WriteSerialNumber,
        }
    }

    /// 是否需要等待设备响应
    ///
    /// 广播急停不登记在途记录：急停前会清空队列，设备的回包按
    /// 无主状态更新处理。
    pub fn expects_response(&self, broadcast: bool) -> bool {
        !(broadcast && matches!(self, Command::AbortMotion))
    }

    /// 序列化为网关帧
    ///
    /// `busid` 为 0 时生成广播帧（标识符全零）。
    pub fn serialize(&self, bus: u8, busid: u8, seq: u8) -> GatewayFrame {
        let kind = self.kind();
        let can_id = if busid == 0 {
            BROADCAST_CAN_ID
        } else {
            can_identifier(kind.priority(), busid)
        };

        let mut data = [0u8; MAX_PAYLOAD_LEN];
        data[0] = seq;
        data[1] = kind.code() & MESSAGE_CODE_MASK;

        let len = match *self {
            Command::ConfigMotion(segment) => {
                data[2] = (segment.first as u8) | ((segment.last as u8) << 1);
                data[3..5].copy_from_slice(&segment.alpha_steps.to_le_bytes());
                data[5..7].copy_from_slice(&segment.beta_steps.to_le_bytes());
                7
            },
            Command::ReadRegister { address } => {
                data[2..4].copy_from_slice(&address.to_le_bytes());
                4
            },
            Command::FindDatum(search) => {
                data[2] = u8::from(search.to_flags()).value();
                3
            },
            Command::FreeBetaCollision { direction } | Command::FreeAlphaLimitBreach { direction } => {
                data[2] = direction as u8;
                3
            },
            Command::SetUstepLevel { level } => {
                data[2] = level;
                3
            },
            Command::SetTicksPerSegment { ticks } => {
                data[2..5].copy_from_slice(&ticks.to_le_bytes()[..3]);
                5
            },
            Command::SetStepsPerSegment {
                min_steps,
                max_steps,
            } => {
                data[2..4].copy_from_slice(&min_steps.to_le_bytes());
                data[4..6].copy_from_slice(&max_steps.to_le_bytes());
                6
            },
            Command::WriteSerialNumber { serial } => {
                data[2..8].copy_from_slice(serial.as_bytes());
                8
            },
            Command::ExecuteMotion
            | Command::AbortMotion
            | Command::LockUnit
            | Command::UnlockUnit
            | Command::PingFpu
            | Command::ResetFpu
            | Command::ResetStepCounter
            | Command::RepeatMotion
            | Command::ReverseMotion
            | Command::EnableBetaCollisionProtection
            | Command::GetFirmwareVersion
            | Command::CheckIntegrity
            | Command::EnableAlphaLimitProtection
            | Command::EnableMove
            | Command::ReadSerialNumber => 2,
        };

        GatewayFrame::new(bus, can_id, &data[..len])
    }

    /// 从命令帧解析（模拟器和抓包工具使用）
    pub fn parse(frame: &GatewayFrame) -> Result<(u8, Command), ProtocolError> {
        let data = frame.data_slice();
        if data.len() < 2 {
            return Err(ProtocolError::InvalidLength {
                expected: 2,
                actual: data.len(),
            });
        }
        let seq = data[0];
        let code = data[1] & MESSAGE_CODE_MASK;
        let kind =
            CommandKind::try_from(code).map_err(|_| ProtocolError::UnknownMessageCode { code })?;

        let need = |n: usize| -> Result<(), ProtocolError> {
            if data.len() < n {
                Err(ProtocolError::InvalidLength {
                    expected: n,
                    actual: data.len(),
                })
            } else {
                Ok(())
            }
        };

        let command = match kind {
            CommandKind::ConfigMotion => {
                need(7)?;
                Command::ConfigMotion(MotionSegment {
                    first: data[2] & 0x01 != 0,
                    last: data[2] & 0x02 != 0,
                    alpha_steps: i16::from_le_bytes([data[3], data[4]]),
                    beta_steps: i16::from_le_bytes([data[5], data[6]]),
                })
            },
            CommandKind::ReadRegister => {
                need(4)?;
                Command::ReadRegister {
                    address: u16::from_le_bytes([data[2], data[3]]),
                }
            },
            CommandKind::FindDatum => {
                need(3)?;
                Command::FindDatum(DatumSearch::from_byte(data[2]))
            },
            CommandKind::FreeBetaCollision | CommandKind::FreeAlphaLimitBreach => {
                need(3)?;
                let direction = if data[2] == RecoveryDirection::Clockwise as u8 {
                    RecoveryDirection::Clockwise
                } else {
                    RecoveryDirection::AntiClockwise
                };
                if kind == CommandKind::FreeBetaCollision {
                    Command::FreeBetaCollision { direction }
                } else {
                    Command::FreeAlphaLimitBreach { direction }
                }
            },
            CommandKind::SetUstepLevel => {
                need(3)?;
                Command::SetUstepLevel { level: data[2] }
            },
            CommandKind::SetTicksPerSegment => {
                need(5)?;
                Command::SetTicksPerSegment {
                    ticks: u32::from_le_bytes([data[2], data[3], data[4], 0]),
                }
            },
            CommandKind::SetStepsPerSegment => {
                need(6)?;
                Command::SetStepsPerSegment {
                    min_steps: u16::from_le_bytes([data[2], data[3]]),
                    max_steps: u16::from_le_bytes([data[4], data[5]]),
                }
            },
            CommandKind::WriteSerialNumber => {
                need(8)?;
                let mut raw = [0u8; SERIAL_NUMBER_LEN];
                raw.copy_from_slice(&data[2..8]);
                Command::WriteSerialNumber {
                    serial: SerialNumber::from_bytes(raw),
                }
            },
            CommandKind::ExecuteMotion => Command::ExecuteMotion,
            CommandKind::AbortMotion => Command::AbortMotion,
            CommandKind::LockUnit => Command::LockUnit,
            CommandKind::UnlockUnit => Command::UnlockUnit,
            CommandKind::PingFpu => Command::PingFpu,
            CommandKind::ResetFpu => Command::ResetFpu,
            CommandKind::ResetStepCounter => Command::ResetStepCounter,
            CommandKind::RepeatMotion => Command::RepeatMotion,
            CommandKind::ReverseMotion => Command::ReverseMotion,
            CommandKind::EnableBetaCollisionProtection => Command::EnableBetaCollisionProtection,
            CommandKind::GetFirmwareVersion => Command::GetFirmwareVersion,
            CommandKind::CheckIntegrity => Command::CheckIntegrity,
            CommandKind::EnableAlphaLimitProtection => Command::EnableAlphaLimitProtection,
            CommandKind::EnableMove => Command::EnableMove,
            CommandKind::ReadSerialNumber => Command::ReadSerialNumber,
        };

        Ok((seq, command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_five_bit_and_unique() {
        let mut seen = [false; 32];
        for kind in CommandKind::ALL {
            let code = kind.code();
            assert!(code <= MESSAGE_CODE_MASK);
            assert!(!seen[code as usize], "duplicate code {code}");
            seen[code as usize] = true;
            assert!(kind.index() < NUM_COMMAND_KINDS);
        }
        for n in 25u8..=30 {
            assert!(!seen[n as usize]);
            assert!(Notification::try_from(n).is_ok());
        }
    }

    #[test]
    fn test_message_code_masks_upper_bits() {
        assert_eq!(
            MessageCode::from_byte(0xE7).unwrap(),
            MessageCode::Command(CommandKind::PingFpu)
        );
        assert_eq!(
            MessageCode::from_byte(25).unwrap(),
            MessageCode::Notification(Notification::FinishedMotion)
        );
        assert!(matches!(
            MessageCode::from_byte(31),
            Err(ProtocolError::UnknownMessageCode { code: 31 })
        ));
        assert!(MessageCode::from_byte(0).is_err());
    }

    #[test]
    fn test_ping_serialization() {
        let frame = Command::PingFpu.serialize(3, 42, 0x5A);
        assert_eq!(frame.bus, 3);
        assert_eq!(frame.busid(), 42);
        assert_eq!(frame.priority(), CommandKind::PingFpu.priority());
        assert_eq!(frame.data_slice(), &[0x5A, 7]);
    }

    #[test]
    fn test_broadcast_uses_zero_identifier() {
        let frame = Command::ExecuteMotion.serialize(1, 0, 9);
        assert!(frame.is_broadcast());
        assert_eq!(frame.data_slice(), &[9, 2]);
    }

    #[test]
    fn test_config_motion_layout() {
        let segment = MotionSegment {
            alpha_steps: -500,
            beta_steps: 1200,
            first: true,
            last: false,
        };
        let frame = Command::ConfigMotion(segment).serialize(0, 1, 3);
        let d = frame.data_slice();
        assert_eq!(d.len(), 7);
        assert_eq!(d[2], 0x01);
        assert_eq!(i16::from_le_bytes([d[3], d[4]]), -500);
        assert_eq!(i16::from_le_bytes([d[5], d[6]]), 1200);
    }

    #[test]
    fn test_datum_flags_layout() {
        let search = DatumSearch {
            alpha: DatumDirection::Skip,
            beta: DatumDirection::AntiClockwise,
            disable_timeout: true,
        };
        let frame = Command::FindDatum(search).serialize(0, 5, 1);
        assert_eq!(frame.data_slice()[2], 0b0001_1011);
        assert_eq!(DatumSearch::from_byte(0b0001_1011), search);
    }

    #[test]
    fn test_parse_inverts_serialize() {
        let commands = [
            Command::ConfigMotion(MotionSegment {
                alpha_steps: 17,
                beta_steps: -17,
                first: false,
                last: true,
            }),
            Command::ReadRegister { address: 0x1234 },
            Command::FindDatum(DatumSearch::automatic()),
            Command::FreeBetaCollision {
                direction: RecoveryDirection::Clockwise,
            },
            Command::FreeAlphaLimitBreach {
                direction: RecoveryDirection::AntiClockwise,
            },
            Command::SetUstepLevel { level: 4 },
            Command::SetTicksPerSegment { ticks: 0x00AB_CDEF },
            Command::SetStepsPerSegment {
                min_steps: 5,
                max_steps: 2000,
            },
            Command::WriteSerialNumber {
                serial: SerialNumber::parse("AB123").unwrap(),
            },
            Command::AbortMotion,
            Command::EnableMove,
        ];
        for command in commands {
            let frame = command.serialize(2, 11, 77);
            let (seq, parsed) = Command::parse(&frame).unwrap();
            assert_eq!(seq, 77);
            assert_eq!(parsed, command);
        }
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(
            CommandKind::FindDatum.response_code(),
            MessageCode::Notification(Notification::FinishedDatum)
        );
        assert_eq!(
            CommandKind::ExecuteMotion.response_code(),
            MessageCode::Notification(Notification::FinishedMotion)
        );
        assert_eq!(
            CommandKind::PingFpu.response_code(),
            MessageCode::Command(CommandKind::PingFpu)
        );
    }

    #[test]
    fn test_broadcast_abort_expects_no_response() {
        assert!(!Command::AbortMotion.expects_response(true));
        assert!(Command::AbortMotion.expects_response(false));
        assert!(Command::ExecuteMotion.expects_response(true));
    }
}
