//! 统一错误处理
//!
//! `AgentError` 覆盖远程执行与 etcd 备份/恢复的全部失败类别，
//! `RestoreError` 在其上附加主机与阶段归属，供多主机编排使用。

use std::time::Duration;

use thiserror::Error;

use crate::domain::etcd::RestorePhase;

/// 代理错误类型
#[derive(Debug, Error)]
pub enum AgentError {
    /// 传输层或认证失败（致命，终止本次运行）
    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    /// 无法启动命令或会话
    #[error("failed to start `{command}`: {message}")]
    Spawn { command: String, message: String },

    /// 命令以非零状态退出，携带捕获的输出
    #[error("command `{command}` exited with status {status}: {output}")]
    Command {
        command: String,
        status: i32,
        output: String,
    },

    /// 轮询条件在截止时间内未满足
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// 必需的配置缺失或格式错误
    #[error("configuration error: {0}")]
    Config(String),

    /// 对象存储或文件传输失败
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// 等待期间收到取消信号
    #[error("cancelled while waiting for {0}")]
    Cancelled(String),

    /// 阶段调用顺序错误
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl AgentError {
    pub fn connection(host: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Connection {
            host: host.into(),
            message: message.to_string(),
        }
    }

    pub fn spawn(command: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Spawn {
            command: command.into(),
            message: message.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer(message.into())
    }

    /// 错误类别的稳定名称，用于结构化日志
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Connection { .. } => "connection",
            AgentError::Spawn { .. } => "spawn",
            AgentError::Command { .. } => "command",
            AgentError::Timeout { .. } => "timeout",
            AgentError::Config(_) => "config",
            AgentError::Transfer(_) => "transfer",
            AgentError::Cancelled(_) => "cancelled",
            AgentError::InvalidState(_) => "invalid_state",
        }
    }

    /// `CommandError` 捕获的输出
    pub fn output(&self) -> Option<&str> {
        match self {
            AgentError::Command { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// 便捷类型别名
pub type AgentResult<T> = Result<T, AgentError>;

/// 集群恢复失败，标明失败的主机与阶段
#[derive(Debug, Error)]
#[error("etcd restore failed on host {host} during {phase} phase: {source}")]
pub struct RestoreError {
    pub host: String,
    pub phase: RestorePhase,
    #[source]
    pub source: AgentError,
}

impl RestoreError {
    pub fn new(host: impl Into<String>, phase: RestorePhase, source: AgentError) -> Self {
        Self {
            host: host.into(),
            phase,
            source,
        }
    }
}
