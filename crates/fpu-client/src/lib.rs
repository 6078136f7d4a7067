//! # FPU Client
//!
//! 网格操作层：寻零、波形装载与执行、急停、碰撞恢复和各类查询，
//! 以及多版本波形校验。
//!
//! ## 模块
//!
//! - `client`: [`GridClient`] 同步操作
//! - `waveform`: 波形表与校验规则（V1..V5）
//! - `error`: 按类别划分的错误类型
//! - `types`: 目标集合与操作结果
//!
//! # 示例
//!
//! ```no_run
//! use fpu_client::{GridClient, FpuSelection, WaveformTable};
//! use fpu_driver::GridDriverBuilder;
//! use fpu_protocol::DatumSearch;
//!
//! let driver = GridDriverBuilder::new().num_fpus(76).build().unwrap();
//! let client = GridClient::from_driver(driver);
//! client.connect().unwrap();
//! client.find_datum(FpuSelection::All, DatumSearch::automatic()).unwrap();
//!
//! let table = WaveformTable::new().with(0, [(100i16, 0i16), (0, 0)]);
//! client.configure_motion(&table, false).unwrap();
//! client.execute_motion(0u16).unwrap();
//! ```

pub mod client;
pub mod error;
pub mod types;
pub mod waveform;

pub use client::GridClient;
pub use error::{Arm, ErrorCategory, GridError, WaveformError};
pub use types::{FpuSelection, OpOutcome};
pub use waveform::{StepPair, WaveformTable, firmware_semver, ruleset_for_firmware, validate};
