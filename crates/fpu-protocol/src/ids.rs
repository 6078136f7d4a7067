//! CAN 标识符与 FPU 逻辑地址
//!
//! 每个 FPU 在网格中有一个逻辑编号（0 起），对应唯一的
//! （网关, 总线, 总线地址）三元组：
//!
//! ```text
//! fpu_id = gateway * 380 + bus * 76 + (busid - 1)
//! ```

use crate::ProtocolError;
use crate::constants::*;

/// 广播帧的 CAN 标识符（全零）
pub const BROADCAST_CAN_ID: u16 = 0;

/// CAN 标识符中总线地址的掩码（低 7 位）
pub const BUSID_MASK: u16 = 0x007F;

/// CAN 标识符中优先级字段的偏移
pub const PRIORITY_SHIFT: u16 = 7;

/// 组合 11 位 CAN 标识符
///
/// 优先级数值越小，仲裁越优先。
#[inline]
pub fn can_identifier(priority: u8, busid: u8) -> u16 {
    ((priority as u16 & 0x0F) << PRIORITY_SHIFT) | (busid as u16 & BUSID_MASK)
}

/// FPU 物理地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FpuAddress {
    /// 网关编号
    pub gateway: u8,
    /// 网关内总线编号
    pub bus: u8,
    /// 总线地址（1..=76）
    pub busid: u8,
}

impl FpuAddress {
    /// 由逻辑编号计算物理地址
    pub fn from_fpu_id(fpu_id: u16) -> Result<Self, ProtocolError> {
        let id = fpu_id as usize;
        if id >= MAX_NUM_POSITIONERS {
            return Err(ProtocolError::ValueOutOfRange {
                field: "fpu_id",
                value: fpu_id as i64,
            });
        }
        Ok(Self {
            gateway: (id / FPUS_PER_GATEWAY) as u8,
            bus: ((id % FPUS_PER_GATEWAY) / FPUS_PER_BUS) as u8,
            busid: (id % FPUS_PER_BUS) as u8 + 1,
        })
    }

    /// 由物理地址计算逻辑编号
    pub fn fpu_id(&self) -> u16 {
        (self.gateway as usize * FPUS_PER_GATEWAY
            + self.bus as usize * FPUS_PER_BUS
            + (self.busid as usize - 1)) as u16
    }

    /// 由网关编号和接收到的帧字段构造（校验范围）
    pub fn from_frame_fields(gateway: u8, bus: u8, busid: u8) -> Result<Self, ProtocolError> {
        if bus as usize >= BUSES_PER_GATEWAY {
            return Err(ProtocolError::InvalidBusId { bus });
        }
        if busid == 0 || busid as usize > FPUS_PER_BUS {
            return Err(ProtocolError::InvalidBusAddress { busid });
        }
        Ok(Self {
            gateway,
            bus,
            busid,
        })
    }
}

/// 给定 FPU 数量需要的网关数量
pub fn gateways_for(num_fpus: usize) -> usize {
    num_fpus.div_ceil(FPUS_PER_GATEWAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_identifier_layout() {
        assert_eq!(can_identifier(0, 0), BROADCAST_CAN_ID);
        assert_eq!(can_identifier(1, 1), 0x0081);
        assert_eq!(can_identifier(0x0F, 76), (0x0F << 7) | 76);
        // 超出位宽的部分被截掉
        assert_eq!(can_identifier(0x1F, 0xFF), (0x0F << 7) | 0x7F);
    }

    #[test]
    fn test_address_mapping_boundaries() {
        let first = FpuAddress::from_fpu_id(0).unwrap();
        assert_eq!((first.gateway, first.bus, first.busid), (0, 0, 1));

        let last_on_bus = FpuAddress::from_fpu_id(75).unwrap();
        assert_eq!((last_on_bus.gateway, last_on_bus.bus, last_on_bus.busid), (0, 0, 76));

        let next_bus = FpuAddress::from_fpu_id(76).unwrap();
        assert_eq!((next_bus.gateway, next_bus.bus, next_bus.busid), (0, 1, 1));

        let second_gateway = FpuAddress::from_fpu_id(380).unwrap();
        assert_eq!(second_gateway.gateway, 1);
        assert_eq!(second_gateway.bus, 0);

        assert!(FpuAddress::from_fpu_id(MAX_NUM_POSITIONERS as u16).is_err());
    }

    #[test]
    fn test_address_mapping_is_bijective() {
        for id in 0..MAX_NUM_POSITIONERS as u16 {
            let addr = FpuAddress::from_fpu_id(id).unwrap();
            assert_eq!(addr.fpu_id(), id);
        }
    }

    #[test]
    fn test_frame_fields_validation() {
        assert!(FpuAddress::from_frame_fields(0, 5, 1).is_err());
        assert!(FpuAddress::from_frame_fields(0, 0, 0).is_err());
        assert!(FpuAddress::from_frame_fields(0, 0, 77).is_err());
        assert!(FpuAddress::from_frame_fields(0, 4, 76).is_ok());
    }

    #[test]
    fn test_gateways_for() {
        assert_eq!(gateways_for(1), 1);
        assert_eq!(gateways_for(380), 1);
        assert_eq!(gateways_for(381), 2);
        assert_eq!(gateways_for(1140), 3);
    }
}
