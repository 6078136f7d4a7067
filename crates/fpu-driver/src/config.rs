//! 驱动配置
//!
//! 进程级配置在构造驱动时一次性提供，运行期不再修改。可以通过
//! `Default`、TOML 文本或 [`GridDriverBuilder`](crate::GridDriverBuilder) 构建。
//!
//! # TOML 示例
//!
//! ```toml
//! num_fpus = 76
//! max_config_retries = 3
//! tracker_granularity_ms = 50
//!
//! [[gateways]]
//! host = "192.168.0.10"
//! port = 4700
//!
//! [timeouts]
//! find_datum_ms = 40000
//!
//! [motion]
//! min_steps = 125
//! max_steps = 500
//! ruleset = "v4"
//! ```

use crate::error::DriverError;
use fpu_protocol::{
    CommandKind, DEFAULT_GATEWAY_PORT, MAX_NUM_POSITIONERS, MAX_PENDING_PER_FPU,
    MAX_WAVEFORM_SEGMENTS, gateways_for,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// 网关地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayAddress {
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_port() -> u16 {
    DEFAULT_GATEWAY_PORT
}

impl GatewayAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 从 "host:port" 解析
    pub fn parse(s: &str) -> Result<Self, DriverError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DriverError::Config(format!("gateway address without port: {s}")))?;
        let port = port
            .parse()
            .map_err(|_| DriverError::Config(format!("invalid gateway port in {s}")))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for GatewayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 各类命令的响应超时（毫秒）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandTimeouts {
    /// 未单独配置的命令
    pub default_ms: u64,
    pub config_motion_ms: u64,
    /// 寻零全程（直到 `FinishedDatum`）
    pub find_datum_ms: u64,
    /// 运动全程（直到 `FinishedMotion`）
    pub execute_motion_ms: u64,
    pub reset_ms: u64,
    /// 碰撞/限位恢复运动
    pub recovery_ms: u64,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            default_ms: 1_000,
            config_motion_ms: 500,
            find_datum_ms: 60_000,
            execute_motion_ms: 40_000,
            reset_ms: 2_000,
            recovery_ms: 5_000,
        }
    }
}

impl CommandTimeouts {
    /// 所有命令使用同一个超时（测试用）
    pub fn uniform(ms: u64) -> Self {
        Self {
            default_ms: ms,
            config_motion_ms: ms,
            find_datum_ms: ms,
            execute_motion_ms: ms,
            reset_ms: ms,
            recovery_ms: ms,
        }
    }

    pub fn for_kind(&self, kind: CommandKind) -> Duration {
        let ms = match kind {
            CommandKind::ConfigMotion => self.config_motion_ms,
            CommandKind::FindDatum => self.find_datum_ms,
            CommandKind::ExecuteMotion => self.execute_motion_ms,
            CommandKind::ResetFpu => self.reset_ms,
            CommandKind::FreeBetaCollision | CommandKind::FreeAlphaLimitBreach => self.recovery_ms,
            _ => self.default_ms,
        };
        Duration::from_millis(ms)
    }
}

/// 波形校验规则版本
///
/// 各版本只在相邻段之间的加减速约束上不同，对应不同代的固件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaveformRuleset {
    V1,
    V2,
    V3,
    V4,
    V5,
}

impl WaveformRuleset {
    pub const ALL: [WaveformRuleset; 5] = [
        WaveformRuleset::V1,
        WaveformRuleset::V2,
        WaveformRuleset::V3,
        WaveformRuleset::V4,
        WaveformRuleset::V5,
    ];
}

/// 波形约束
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotionLimits {
    /// 运动中每段的最小步数（静止段为 0）
    pub min_steps: u32,
    /// 每段的最大步数
    pub max_steps: u32,
    /// 从静止启动（或停到静止）时允许的最大步数
    pub max_start_steps: u32,
    /// 波形最大段数
    pub max_segments: usize,
    /// 相邻段之间的最大放大倍数
    pub max_increase: f64,
    /// 固定规则版本；`None` 表示按固件版本自动选择
    pub ruleset: Option<WaveformRuleset>,
}

impl Default for MotionLimits {
    fn default() -> Self {
        Self {
            min_steps: 125,
            max_steps: 500,
            max_start_steps: 320,
            max_segments: MAX_WAVEFORM_SEGMENTS,
            max_increase: 2.0,
            ruleset: None,
        }
    }
}

/// 驱动配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    /// 网格中的 FPU 数量
    pub num_fpus: usize,
    /// 网关地址（按网关编号排列）
    pub gateways: Vec<GatewayAddress>,
    /// TCP 连接超时（毫秒）
    pub connect_timeout_ms: u64,
    pub timeouts: CommandTimeouts,
    pub motion: MotionLimits,
    /// 装载波形失败后的最大重试次数
    pub max_config_retries: u32,
    /// 每轮确认前每个 FPU 最多发送的波形段数
    pub config_chunk_size: usize,
    /// 超时跟踪器的量化粒度（毫秒）
    pub tracker_granularity_ms: u64,
    /// 命令池耗尽时的最长等待（毫秒）
    pub pool_wait_ms: u64,
    /// 每个事件都唤醒等待者（诊断用，会增加延迟）
    pub trace_wakeups: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            num_fpus: MAX_NUM_POSITIONERS,
            gateways: (0..3)
                .map(|i| GatewayAddress::new("127.0.0.1", DEFAULT_GATEWAY_PORT + i))
                .collect(),
            connect_timeout_ms: 2_000,
            timeouts: CommandTimeouts::default(),
            motion: MotionLimits::default(),
            max_config_retries: 5,
            config_chunk_size: MAX_PENDING_PER_FPU,
            tracker_granularity_ms: 50,
            pool_wait_ms: 5_000,
            trace_wakeups: false,
        }
    }
}

impl DriverConfig {
    /// 从 TOML 文本解析并校验
    pub fn from_toml_str(text: &str) -> Result<Self, DriverError> {
        let config: Self = toml::from_str(text).map_err(|e| DriverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// 序列化为 TOML 文本
    pub fn to_toml_string(&self) -> Result<String, DriverError> {
        toml::to_string(self).map_err(|e| DriverError::Config(e.to_string()))
    }

    /// 需要的网关数量
    pub fn num_gateways(&self) -> usize {
        gateways_for(self.num_fpus)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tracker_granularity(&self) -> Duration {
        Duration::from_millis(self.tracker_granularity_ms)
    }

    pub fn pool_wait(&self) -> Duration {
        Duration::from_millis(self.pool_wait_ms)
    }

    /// 校验配置的一致性
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.num_fpus == 0 || self.num_fpus > MAX_NUM_POSITIONERS {
            return Err(DriverError::Config(format!(
                "num_fpus must be in 1..={MAX_NUM_POSITIONERS}, got {}",
                self.num_fpus
            )));
        }
        if self.gateways.len() < self.num_gateways() {
            return Err(DriverError::Config(format!(
                "{} FPUs need {} gateways, {} configured",
                self.num_fpus,
                self.num_gateways(),
                self.gateways.len()
            )));
        }
        if self.tracker_granularity_ms == 0 {
            return Err(DriverError::Config("tracker_granularity_ms must be > 0".into()));
        }
        if self.config_chunk_size == 0 || self.config_chunk_size > MAX_PENDING_PER_FPU {
            return Err(DriverError::Config(format!(
                "config_chunk_size must be in 1..={MAX_PENDING_PER_FPU}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DriverConfig::default();
        config.validate().unwrap();
        assert_eq!(config.num_gateways(), 3);
        assert_eq!(config.tracker_granularity(), Duration::from_millis(50));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = DriverConfig::from_toml_str(
            r#"
            num_fpus = 76
            max_config_retries = 2

            [[gateways]]
            host = "10.0.0.5"

            [timeouts]
            find_datum_ms = 1234

            [motion]
            min_steps = 5
            ruleset = "v3"
            "#,
        )
        .unwrap();
        assert_eq!(config.num_fpus, 76);
        assert_eq!(config.max_config_retries, 2);
        assert_eq!(config.gateways, vec![GatewayAddress::new("10.0.0.5", 4700)]);
        assert_eq!(
            config.timeouts.for_kind(CommandKind::FindDatum),
            Duration::from_millis(1234)
        );
        assert_eq!(
            config.timeouts.for_kind(CommandKind::PingFpu),
            Duration::from_millis(1_000)
        );
        assert_eq!(config.motion.min_steps, 5);
        assert_eq!(config.motion.max_steps, 500);
        assert_eq!(config.motion.ruleset, Some(WaveformRuleset::V3));
    }

    #[test]
    fn test_toml_rejects_unknown_field() {
        assert!(matches!(
            DriverConfig::from_toml_str("num_fpu = 3"),
            Err(DriverError::Config(_))
        ));
    }

    #[test]
    fn test_validate_gateway_count() {
        let config = DriverConfig {
            num_fpus: 400,
            gateways: vec![GatewayAddress::new("a", 1)],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DriverConfig {
            num_fpus: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = DriverConfig {
            num_fpus: 10,
            trace_wakeups: true,
            ..Default::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(DriverConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_gateway_address_parse() {
        let addr = GatewayAddress::parse("gw1.local:4701").unwrap();
        assert_eq!(addr, GatewayAddress::new("gw1.local", 4701));
        assert_eq!(addr.to_string(), "gw1.local:4701");
        assert!(GatewayAddress::parse("nohost").is_err());
        assert!(GatewayAddress::parse("h:port").is_err());
    }
}
