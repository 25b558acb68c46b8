//! etcd 备份与恢复

pub mod backup;
pub mod cluster;
pub mod command;
pub mod restore;

pub use backup::{latest_backup, list_backups, BackupManager};
pub use cluster::{restore_cluster, run_phased, RestoreOptions, RestoreReport, RestoreRequest, RestoreStep};
pub use restore::{RestoreManager, RestoreTimings};
