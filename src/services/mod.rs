//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod etcd;
pub mod os_client;
pub mod poll;

pub use os_client::OsClient;
pub use poll::poll_until;
