//! XJP Cluster Agent - 裸机 Kubernetes 集群运维代理
//!
//! 远程执行抽象（本地 shell / SSH）与多节点 etcd 备份恢复编排。

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;

pub use app::{parse_args, RuntimeConfig};
pub use error::{AgentError, AgentResult, RestoreError};
