//! 命令输出日志模型

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 命令成功结束时的终止哨兵消息
pub const PIPELINE_SUCCESS: &str = "Pipeline Success";
/// 命令失败结束时的终止哨兵消息
pub const PIPELINE_DONE: &str = "Pipeline Done";

/// 日志来源
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// 执行器自身产生的状态行（终止哨兵）
    Status,
}

/// 日志行
///
/// 每条命令恰好产生一条 `terminal == true` 的哨兵，调用方以此判断命令结束，
/// 不依赖通道关闭。
#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
    pub is_error: bool,
    pub terminal: bool,
}

impl LogEntry {
    fn line(stream: LogStream, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            message: message.into(),
            is_error: stream == LogStream::Stderr,
            terminal: false,
        }
    }

    /// 创建 stdout 日志行
    pub fn stdout(message: impl Into<String>) -> Self {
        Self::line(LogStream::Stdout, message)
    }

    /// 创建 stderr 日志行
    pub fn stderr(message: impl Into<String>) -> Self {
        Self::line(LogStream::Stderr, message)
    }

    /// 创建终止哨兵
    pub fn pipeline_finished(success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: LogStream::Status,
            message: if success { PIPELINE_SUCCESS } else { PIPELINE_DONE }.to_string(),
            is_error: !success,
            terminal: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }
}
