//! 基础设施模块
//!
//! 封装外部依赖（本地进程、SSH/SFTP、对象存储）

pub mod blob_store;
pub mod command;
pub mod connector;
pub mod encoding;
pub mod executor;
pub mod ssh;

#[cfg(test)]
pub mod fake;

pub use blob_store::{BlobStore, ObjectStoreBlobStore};
pub use command::LocalExecutor;
pub use connector::{Connector, HostConnector};
pub use executor::{CopyReport, Executor, FileCopy, FileCopyResult, LogSink, ShellCommand};
pub use ssh::{SshExecutor, SshOptions};
