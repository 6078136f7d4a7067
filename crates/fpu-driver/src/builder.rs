//! Builder 模式实现
//!
//! 提供链式构造 [`GridDriver`] 的便捷方式。

use crate::config::{CommandTimeouts, DriverConfig, GatewayAddress, MotionLimits};
use crate::driver::GridDriver;
use crate::error::DriverError;
use std::path::Path;
use std::time::Duration;

/// GridDriver Builder（链式构造）
///
/// # Example
///
/// ```no_run
/// use fpu_driver::{GatewayAddress, GridDriverBuilder};
///
/// let driver = GridDriverBuilder::new()
///     .num_fpus(76)
///     .gateway(GatewayAddress::new("192.168.0.10", 4700))
///     .max_config_retries(3)
///     .build()
///     .unwrap();
/// driver.connect().unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct GridDriverBuilder {
    config: DriverConfig,
    /// 是否已显式设置网关（第一次设置时替换默认地址）
    custom_gateways: bool,
}

impl GridDriverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以现有配置为起点
    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self.custom_gateways = true;
        self
    }

    /// 从 TOML 文件加载配置
    pub fn config_file(self, path: impl AsRef<Path>) -> Result<Self, DriverError> {
        Ok(self.config(DriverConfig::load_from_file(path)?))
    }

    pub fn num_fpus(mut self, num_fpus: usize) -> Self {
        self.config.num_fpus = num_fpus;
        self
    }

    /// 追加一个网关地址（网关编号按追加顺序）
    pub fn gateway(mut self, address: GatewayAddress) -> Self {
        if !self.custom_gateways {
            self.config.gateways.clear();
            self.custom_gateways = true;
        }
        self.config.gateways.push(address);
        self
    }

    /// 替换全部网关地址
    pub fn gateways(mut self, addresses: impl IntoIterator<Item = GatewayAddress>) -> Self {
        self.config.gateways = addresses.into_iter().collect();
        self.custom_gateways = true;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeouts(mut self, timeouts: CommandTimeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn motion_limits(mut self, limits: MotionLimits) -> Self {
        self.config.motion = limits;
        self
    }

    pub fn max_config_retries(mut self, retries: u32) -> Self {
        self.config.max_config_retries = retries;
        self
    }

    pub fn tracker_granularity(mut self, granularity: Duration) -> Self {
        self.config.tracker_granularity_ms = granularity.as_millis() as u64;
        self
    }

    pub fn pool_wait(mut self, wait: Duration) -> Self {
        self.config.pool_wait_ms = wait.as_millis() as u64;
        self
    }

    /// 每个事件都唤醒等待者（诊断用）
    pub fn trace_wakeups(mut self, enabled: bool) -> Self {
        self.config.trace_wakeups = enabled;
        self
    }

    /// 当前累积的配置
    pub fn peek_config(&self) -> &DriverConfig {
        &self.config
    }

    /// 构建驱动（不连接）
    pub fn build(self) -> Result<GridDriver, DriverError> {
        GridDriver::new(self.config)
    }
}
