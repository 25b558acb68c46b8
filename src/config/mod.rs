//! 配置模块
//!
//! 环境变量解析与主机清单

pub mod env;
pub mod inventory;

pub use env::{BlobSettings, EnvConfig, EtcdPaths};
pub use inventory::load_inventory;
