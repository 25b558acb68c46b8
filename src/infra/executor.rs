//! 远程执行抽象
//!
//! `Executor` 定义本地 shell 与 SSH 会话共同的能力：
//! - 流式执行（逐行日志 + 终止哨兵）
//! - 同步捕获输出 / 只关心成败的执行
//! - 文件上传下载（非 root 时经临时路径中转并提权复制）
//! - 在此之上的写文件、批量复制与带权限的下载
//! - 目录与路径探测
//!
//! 非 root 用户的变更类操作使用 `sudo -S`，密码经标准输入传入，不出现在命令行中。

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::domain::host::Host;
use crate::domain::log::LogEntry;
use crate::error::{AgentError, AgentResult};

/// 调用方持有的日志通道
///
/// 有界通道，消费方跟不上时执行器等待而不是丢行，调用方需要并发消费。
pub type LogSink = mpsc::Sender<LogEntry>;

/// `CommandError` 中保留的输出尾部行数
pub const OUTPUT_TAIL_LINES: usize = 20;

/// 待执行的 shell 命令
#[derive(Clone)]
pub struct ShellCommand {
    script: String,
    stdin: Option<String>,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            stdin: None,
        }
    }

    /// 非交互式提权
    ///
    /// 没有 TTY 时 sudo 无法提示输入密码，这里让 sudo 从 stdin 读取。
    pub fn sudo(script: &str, password: Option<&str>) -> Self {
        let command = Self::new(format!("sudo -S -p '' sh -c {}", quote(script)));
        match password {
            Some(password) => command.with_stdin(format!("{}\n", password)),
            None => command,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }
}

impl std::fmt::Debug for ShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellCommand")
            .field("script", &self.script)
            .field("stdin", &self.stdin.as_ref().map(|_| "***"))
            .finish()
    }
}

impl std::fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.script)
    }
}

impl From<&str> for ShellCommand {
    fn from(script: &str) -> Self {
        Self::new(script)
    }
}

impl From<String> for ShellCommand {
    fn from(script: String) -> Self {
        Self::new(script)
    }
}

/// 单引号转义，供拼接进 shell 命令
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:,@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// 命令执行器
#[async_trait]
pub trait Executor: Send + Sync {
    /// 执行器绑定的主机
    fn host(&self) -> &Host;

    /// 流式执行
    ///
    /// stdout/stderr 每行一条 `LogEntry`；无论成败（包括启动失败）都恰好发送一条终止哨兵。
    /// 执行器不会关闭通道，调用方必须以哨兵判断结束。
    async fn run_streaming(&self, command: &ShellCommand, log_tx: LogSink) -> AgentResult<()>;

    /// 执行并返回合并后的 stdout+stderr
    async fn run_capture(&self, command: &ShellCommand) -> AgentResult<String>;

    /// 执行并丢弃输出
    async fn run(&self, command: &ShellCommand) -> AgentResult<()>;

    /// 上传整个文件
    async fn upload(&self, local: &Path, remote: &str) -> AgentResult<()>;

    /// 下载整个文件
    async fn download(&self, remote: &str, local: &Path) -> AgentResult<()>;

    /// 当前登录用户（实现方缓存结果）
    async fn current_user(&self) -> AgentResult<String>;

    /// 释放连接
    async fn close(&self) -> AgentResult<()> {
        Ok(())
    }

    async fn is_privileged(&self) -> bool {
        matches!(self.current_user().await.as_deref(), Ok("root"))
    }

    /// 必要时以 sudo 包装
    async fn elevated(&self, script: &str) -> ShellCommand {
        if self.is_privileged().await {
            ShellCommand::new(script)
        } else {
            ShellCommand::sudo(script, self.host().password.as_deref())
        }
    }

    /// 幂等创建目录
    async fn ensure_directory(&self, path: &str) -> AgentResult<()> {
        let command = self.elevated(&format!("mkdir -p {}", quote(path))).await;
        self.run(&command).await
    }

    /// 把内容写到远程路径并设置权限
    async fn write_file(&self, content: &[u8], path: &str, mode: u32) -> AgentResult<()> {
        let local = std::env::temp_dir().join(format!("xjp-write-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&local, content)
            .await
            .map_err(|e| AgentError::transfer(format!("write {}: {}", local.display(), e)))?;
        let uploaded = self.upload(&local, path).await;
        let _ = tokio::fs::remove_file(&local).await;
        uploaded?;

        let chmod = self.elevated(&format!("chmod {:04o} {}", mode, quote(path))).await;
        self.run(&chmod).await
    }

    /// 批量上传，单个文件失败不影响其余文件
    async fn copy_files(&self, files: &[FileCopy]) -> CopyReport {
        let results = join_all(files.iter().map(|file| async move {
            let outcome = self.upload(&file.source, &file.target).await;
            if let Err(e) = &outcome {
                tracing::warn!(host = %self.host().name, source = %file.source.display(), target = %file.target, error = %e, "File copy failed");
            }
            FileCopyResult {
                source: file.source.clone(),
                target: file.target.clone(),
                success: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            }
        }))
        .await;
        CopyReport::new(results)
    }

    /// 下载到本地并设置本地文件权限
    async fn fetch_file(&self, remote: &str, local: &Path, mode: u32) -> AgentResult<()> {
        self.download(remote, local).await?;
        set_local_mode(local, mode).await
    }

    async fn dir_exists(&self, path: &str) -> bool {
        test_path(self, "-d", path).await
    }

    async fn file_exists(&self, path: &str) -> bool {
        test_path(self, "-f", path).await
    }
}

async fn test_path<E: Executor + ?Sized>(executor: &E, flag: &str, path: &str) -> bool {
    let command = ShellCommand::new(format!(
        "test {} {} && echo exists || echo 'not exists'",
        flag,
        quote(path)
    ));
    matches!(executor.run_capture(&command).await, Ok(output) if output.trim() == "exists")
}

/// 一次批量复制中的单个文件
#[derive(Clone, Debug)]
pub struct FileCopy {
    pub source: PathBuf,
    pub target: String,
}

impl FileCopy {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FileCopyResult {
    pub source: PathBuf,
    pub target: String,
    pub success: bool,
    pub error: Option<String>,
}

/// 批量复制结果，按输入顺序排列
#[derive(Clone, Debug, Serialize)]
pub struct CopyReport {
    pub results: Vec<FileCopyResult>,
    pub overall_success: bool,
}

impl CopyReport {
    fn new(results: Vec<FileCopyResult>) -> Self {
        let overall_success = results.iter().all(|r| r.success);
        Self {
            results,
            overall_success,
        }
    }
}

#[cfg(unix)]
async fn set_local_mode(local: &Path, mode: u32) -> AgentResult<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(local, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| AgentError::transfer(format!("chmod {}: {}", local.display(), e)))
}

#[cfg(not(unix))]
async fn set_local_mode(_local: &Path, _mode: u32) -> AgentResult<()> {
    Ok(())
}

/// 中转用的临时路径
pub fn scratch_path(target: &str) -> String {
    let name = Path::new(target)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "transfer".to_string());
    format!("/tmp/xjp-{}-{}", uuid::Uuid::new_v4().simple(), name)
}

/// 将中转文件提权复制到最终位置并删除中转文件
pub async fn relocate_in<E: Executor + ?Sized>(executor: &E, scratch: &str, target: &str) -> AgentResult<()> {
    let copy = executor
        .elevated(&format!("cp -f {} {}", quote(scratch), quote(target)))
        .await;
    let result = executor.run(&copy).await;
    discard_scratch(executor, scratch).await;
    result.map_err(|e| AgentError::transfer(format!("failed to move {} to {}: {}", scratch, target, e)))
}

/// 将受保护的文件提权复制到中转路径，并归属给当前用户
pub async fn relocate_out<E: Executor + ?Sized>(executor: &E, source: &str, scratch: &str) -> AgentResult<()> {
    let user = executor.current_user().await?;
    let copy = executor
        .elevated(&format!(
            "cp -f {src} {dst} && chown {user} {dst}",
            src = quote(source),
            dst = quote(scratch),
            user = quote(&user)
        ))
        .await;
    executor
        .run(&copy)
        .await
        .map_err(|e| AgentError::transfer(format!("failed to stage {} at {}: {}", source, scratch, e)))
}

/// 删除中转文件，失败只记录日志
pub async fn discard_scratch<E: Executor + ?Sized>(executor: &E, scratch: &str) {
    let remove = executor.elevated(&format!("rm -f {}", quote(scratch))).await;
    if let Err(e) = executor.run(&remove).await {
        tracing::warn!(host = %executor.host().name, path = %scratch, error = %e, "Failed to remove scratch file");
    }
}

/// 保留最近若干行输出，用于错误诊断
#[derive(Debug, Default)]
pub struct OutputTail {
    lines: VecDeque<String>,
}

impl OutputTail {
    pub fn push(&mut self, line: &str) {
        if self.lines.len() == OUTPUT_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn extend(&mut self, other: OutputTail) {
        for line in other.lines {
            self.push(&line);
        }
    }

    pub fn render(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::fake::FakeExecutor;

    #[test]
    fn test_quote() {
        assert_eq!(quote("/var/lib/etcd"), "/var/lib/etcd");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_sudo_keeps_password_off_command_line() {
        let command = ShellCommand::sudo("mv -f /a /b", Some("hunter2"));
        assert!(!command.script().contains("hunter2"));
        assert!(command.script().starts_with("sudo -S -p '' sh -c "));
        assert_eq!(command.stdin(), Some("hunter2\n"));
        assert!(!format!("{:?}", command).contains("hunter2"));
    }

    #[test]
    fn test_scratch_path_is_unique() {
        let a = scratch_path("/data/backup/prod/etcd-backup-1.db");
        let b = scratch_path("/data/backup/prod/etcd-backup-1.db");
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/xjp-"));
        assert!(a.ends_with("etcd-backup-1.db"));
    }

    #[tokio::test]
    async fn test_ensure_directory_twice_is_idempotent() {
        let fake = FakeExecutor::new("node1");
        fake.ensure_directory("/data/backup/prod").await.unwrap();
        fake.ensure_directory("/data/backup/prod").await.unwrap();
        assert!(fake.has_dir("/data/backup/prod"));
        assert!(fake.dir_exists("/data/backup/prod").await);
        let mkdirs: Vec<_> = fake.commands().into_iter().filter(|c| c.starts_with("mkdir -p")).collect();
        assert_eq!(mkdirs, vec!["mkdir -p /data/backup/prod", "mkdir -p /data/backup/prod"]);
    }

    #[tokio::test]
    async fn test_write_file_sets_mode() {
        let fake = FakeExecutor::new("node1");
        fake.write_file(b"ETCD_NAME=etcd1\n", "/etc/etcd.env", 0o644).await.unwrap();
        assert_eq!(fake.file_content("/etc/etcd.env").as_deref(), Some("ETCD_NAME=etcd1\n"));
        assert!(fake.issued("chmod 0644 /etc/etcd.env"));
    }

    #[tokio::test]
    async fn test_write_file_elevates_chmod_for_non_root() {
        let fake = FakeExecutor::new("node1").with_user("ops").with_password("pw");
        fake.write_file(b"x", "/etc/etcd.env", 0o600).await.unwrap();
        let chmod = fake.commands().into_iter().find(|c| c.contains("chmod")).unwrap();
        assert!(chmod.starts_with("sudo -S -p '' sh -c "));
        assert!(chmod.contains("chmod 0600 /etc/etcd.env"));
        assert!(!chmod.contains("pw"));
    }

    #[tokio::test]
    async fn test_copy_files_reports_each_file() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("ca.pem");
        tokio::fs::write(&present, b"cert").await.unwrap();
        let fake = FakeExecutor::new("node1");

        let report = fake
            .copy_files(&[
                FileCopy::new(&present, "/etc/ssl/etcd/ca.pem"),
                FileCopy::new(dir.path().join("absent.pem"), "/etc/ssl/etcd/absent.pem"),
            ])
            .await;

        assert!(!report.overall_success);
        assert_eq!(report.results.len(), 2);
        assert!(report.results[0].success);
        assert!(report.results[0].error.is_none());
        assert!(!report.results[1].success);
        assert!(report.results[1].error.as_deref().unwrap().contains("absent.pem"));
        assert_eq!(fake.file_content("/etc/ssl/etcd/ca.pem").as_deref(), Some("cert"));
        assert!(!fake.has_file("/etc/ssl/etcd/absent.pem"));
    }

    #[tokio::test]
    async fn test_copy_files_empty_is_success() {
        let fake = FakeExecutor::new("node1");
        let report = fake.copy_files(&[]).await;
        assert!(report.overall_success);
        assert!(report.results.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_file_sets_local_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("admin.conf");
        let fake = FakeExecutor::new("node1");
        fake.put_file("/etc/kubernetes/admin.conf", "kubeconfig");

        fake.fetch_file("/etc/kubernetes/admin.conf", &local, 0o600).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&local).await.unwrap(), "kubeconfig");
        let mode = tokio::fs::metadata(&local).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_fetch_missing_file_is_transfer_error() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new("node1");
        let err = fake.fetch_file("/etc/absent", &dir.path().join("x"), 0o600).await.unwrap_err();
        assert!(matches!(err, AgentError::Transfer(_)));
    }

    #[test]
    fn test_output_tail_bounded() {
        let mut tail = OutputTail::default();
        for i in 0..(OUTPUT_TAIL_LINES + 5) {
            tail.push(&format!("line {}", i));
        }
        let rendered = tail.render();
        assert!(!rendered.contains("line 4\n"));
        assert!(rendered.ends_with(&format!("line {}", OUTPUT_TAIL_LINES + 4)));
        assert_eq!(rendered.lines().count(), OUTPUT_TAIL_LINES);
    }
}
