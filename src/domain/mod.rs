//! 领域模型模块
//!
//! 纯数据结构，不依赖 tokio

pub mod etcd;
pub mod facts;
pub mod host;
pub mod log;

// Re-exports for convenience
pub use etcd::{BackupManifest, EtcdEnvironment, RestorePhase, RestoreSession};
pub use facts::HostFacts;
pub use host::{AuthMethod, Host};
pub use log::{LogEntry, LogStream};
