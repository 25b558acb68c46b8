//! 本地命令执行器
//!
//! 在代理所在主机上通过 `sh -c` 执行命令，支持：
//! - 实时日志流式输出（stdout/stderr 各一个读取任务）
//! - 超时控制（整个进程组一起终止）
//! - 合并输出捕获
//! - 非 root 时的提权文件复制

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::env::constants::DEFAULT_COMMAND_TIMEOUT_SECS;
use crate::domain::host::Host;
use crate::domain::log::LogEntry;
use crate::error::{AgentError, AgentResult};
use crate::infra::encoding::{decode_line, decode_output};
use crate::infra::executor::{
    discard_scratch, relocate_in, relocate_out, scratch_path, Executor, LogSink, OutputTail, ShellCommand,
};

/// 进程被终止后，读取任务最多再等待的时间
const READER_GRACE: Duration = Duration::from_millis(500);

/// 本地执行器
pub struct LocalExecutor {
    host: Host,
    timeout: Duration,
    user: OnceCell<String>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::with_host(Host::local())
    }

    /// 以指定主机描述创建（用于 inventory 中标记为本机的条目）
    pub fn with_host(host: Host) -> Self {
        Self {
            host,
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            user: OnceCell::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn shell(script: &str, command: &ShellCommand) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(if command.stdin().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        // 独立进程组，超时时连同 sh 派生的子进程一起终止
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// 终止整个进程组，再终止 sh 本身
    async fn kill_tree(child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                let group = format!("-{}", pid);
                if let Err(e) = Command::new("kill").args(["-KILL", "--", &group]).status().await {
                    warn!(pid, error = %e, "Failed to kill process group");
                }
            }
        }
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Process already exited");
        }
    }

    /// 写入 stdin 后关闭，子进程可能不读取 stdin，写失败只记录
    async fn feed_stdin(child: &mut Child, command: &ShellCommand) {
        let (Some(input), Some(mut stdin)) = (command.stdin(), child.stdin.take()) else {
            return;
        };
        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            debug!(error = %e, "Child closed stdin early");
        }
    }

    async fn execute_streaming(&self, command: &ShellCommand, log_tx: &LogSink) -> AgentResult<()> {
        let mut child = Self::shell(command.script(), command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::spawn(command.script(), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::spawn(command.script(), "stdout pipe unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::spawn(command.script(), "stderr pipe unavailable"))?;

        let stdout_task = tokio::spawn(pump_lines(stdout, log_tx.clone(), LogEntry::stdout));
        let stderr_task = tokio::spawn(pump_lines(stderr, log_tx.clone(), LogEntry::stderr));

        Self::feed_stdin(&mut child, command).await;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(|e| AgentError::spawn(command.script(), e))?,
            Err(_) => {
                error!(command = %command, timeout = ?self.timeout, "Command timed out, killing process group");
                Self::kill_tree(&mut child).await;
                join_reader_bounded(stdout_task, "stdout").await;
                join_reader_bounded(stderr_task, "stderr").await;
                return Err(AgentError::Timeout {
                    what: command.script().to_string(),
                    after: self.timeout,
                });
            }
        };

        // 等待日志读取完成，读取任务 panic 不影响命令结果
        let mut tail = join_reader(stdout_task, "stdout").await;
        tail.extend(join_reader(stderr_task, "stderr").await);

        if status.success() {
            Ok(())
        } else {
            Err(AgentError::Command {
                command: command.script().to_string(),
                status: status.code().unwrap_or(-1),
                output: tail.render(),
            })
        }
    }

    async fn execute_output(&self, command: &ShellCommand, capture: bool) -> AgentResult<String> {
        // stderr 重定向到 stdout，保持两者的产生顺序
        let script = format!("exec 2>&1\n{}", command.script());
        let mut cmd = Self::shell(&script, command);
        cmd.stdout(if capture { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| AgentError::spawn(command.script(), e))?;
        let reader = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Err(e) = stdout.read_to_end(&mut buf).await {
                    warn!(error = %e, "Failed to read command output");
                }
                buf
            })
        });
        Self::feed_stdin(&mut child, command).await;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(|e| AgentError::spawn(command.script(), e))?,
            Err(_) => {
                error!(command = %command, timeout = ?self.timeout, "Command timed out, killing process group");
                Self::kill_tree(&mut child).await;
                if let Some(reader) = reader {
                    reader.abort();
                }
                return Err(AgentError::Timeout {
                    what: command.script().to_string(),
                    after: self.timeout,
                });
            }
        };

        let raw = match reader {
            Some(reader) => reader.await.unwrap_or_else(|e| {
                error!(error = %e, "Output reader task failed");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let text = decode_output(&raw);
        if status.success() {
            Ok(text)
        } else {
            Err(AgentError::Command {
                command: command.script().to_string(),
                status: status.code().unwrap_or(-1),
                output: text,
            })
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// 逐行读取并转发到日志通道，返回输出尾部
async fn pump_lines<R>(reader: R, log_tx: LogSink, make: fn(String) -> LogEntry) -> OutputTail
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut tail = OutputTail::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(&buf);
                tail.push(&line);
                let _ = log_tx.send(make(line)).await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read command output");
                break;
            }
        }
    }
    tail
}

/// 等待读取任务结束，任务 panic 时记录并继续
pub(crate) async fn join_reader(task: JoinHandle<OutputTail>, stream: &str) -> OutputTail {
    match task.await {
        Ok(tail) => tail,
        Err(e) => {
            error!(stream = %stream, error = %e, "Log reader task failed");
            OutputTail::default()
        }
    }
}

/// 进程被终止后有限等待读取任务，仍未结束则放弃
async fn join_reader_bounded(mut task: JoinHandle<OutputTail>, stream: &str) -> OutputTail {
    match tokio::time::timeout(READER_GRACE, &mut task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            error!(stream = %stream, error = %e, "Log reader task failed");
            OutputTail::default()
        }
        Err(_) => {
            task.abort();
            warn!(stream = %stream, "Output pipe still held after kill, abandoning reader");
            OutputTail::default()
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn run_streaming(&self, command: &ShellCommand, log_tx: LogSink) -> AgentResult<()> {
        let result = self.execute_streaming(command, &log_tx).await;
        let _ = log_tx.send(LogEntry::pipeline_finished(result.is_ok())).await;
        result
    }

    async fn run_capture(&self, command: &ShellCommand) -> AgentResult<String> {
        self.execute_output(command, true).await
    }

    async fn run(&self, command: &ShellCommand) -> AgentResult<()> {
        self.execute_output(command, false).await.map(|_| ())
    }

    async fn upload(&self, local: &Path, remote: &str) -> AgentResult<()> {
        if self.is_privileged().await {
            tokio::fs::copy(local, remote)
                .await
                .map_err(|e| AgentError::transfer(format!("copy {} to {}: {}", local.display(), remote, e)))?;
            return Ok(());
        }
        let scratch = scratch_path(remote);
        tokio::fs::copy(local, &scratch)
            .await
            .map_err(|e| AgentError::transfer(format!("copy {} to {}: {}", local.display(), scratch, e)))?;
        relocate_in(self, &scratch, remote).await
    }

    async fn download(&self, remote: &str, local: &Path) -> AgentResult<()> {
        if self.is_privileged().await {
            tokio::fs::copy(remote, local)
                .await
                .map_err(|e| AgentError::transfer(format!("copy {} to {}: {}", remote, local.display(), e)))?;
            return Ok(());
        }
        let scratch = scratch_path(remote);
        relocate_out(self, remote, &scratch).await?;
        let copied = tokio::fs::copy(&scratch, local).await;
        discard_scratch(self, &scratch).await;
        copied
            .map(|_| ())
            .map_err(|e| AgentError::transfer(format!("copy {} to {}: {}", scratch, local.display(), e)))
    }

    async fn current_user(&self) -> AgentResult<String> {
        self.user
            .get_or_try_init(|| async {
                let output = self.run_capture(&ShellCommand::new("whoami")).await?;
                Ok::<_, AgentError>(output.trim().to_string())
            })
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::log::{LogStream, PIPELINE_DONE, PIPELINE_SUCCESS};
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::Receiver<LogEntry>) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            entries.push(entry);
        }
        entries
    }

    #[tokio::test]
    async fn test_streaming_emits_single_success_sentinel() {
        let executor = LocalExecutor::new();
        let (tx, mut rx) = mpsc::channel(64);

        executor
            .run_streaming(&ShellCommand::new("echo hello; echo world"), tx)
            .await
            .unwrap();

        let entries = drain(&mut rx);
        let sentinels: Vec<_> = entries.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(sentinels.len(), 1);
        assert_eq!(sentinels[0].message, PIPELINE_SUCCESS);
        assert!(entries.last().unwrap().is_terminal());

        let lines: Vec<_> = entries
            .iter()
            .filter(|e| e.stream == LogStream::Stdout)
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn test_streaming_failure_sentinel_and_stderr_flag() {
        let executor = LocalExecutor::new();
        let (tx, mut rx) = mpsc::channel(64);

        let err = executor
            .run_streaming(&ShellCommand::new("echo boom 1>&2; exit 3"), tx)
            .await
            .unwrap_err();
        match err {
            AgentError::Command { status, output, .. } => {
                assert_eq!(status, 3);
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let entries = drain(&mut rx);
        let stderr: Vec<_> = entries.iter().filter(|e| e.stream == LogStream::Stderr).collect();
        assert_eq!(stderr.len(), 1);
        assert!(stderr[0].is_error);

        let sentinels: Vec<_> = entries.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(sentinels.len(), 1);
        assert_eq!(sentinels[0].message, PIPELINE_DONE);
        assert!(sentinels[0].is_error);
    }

    #[tokio::test]
    async fn test_capture_matches_streamed_lines() {
        let executor = LocalExecutor::new();
        let script = "echo one; sleep 0.2; echo two 1>&2; sleep 0.2; echo three";

        let captured = executor.run_capture(&ShellCommand::new(script)).await.unwrap();
        assert_eq!(captured, "one\ntwo\nthree\n");

        let (tx, mut rx) = mpsc::channel(64);
        executor.run_streaming(&ShellCommand::new(script), tx).await.unwrap();
        let streamed: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| !e.is_terminal())
            .map(|e| e.message)
            .collect();
        assert_eq!(streamed, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_capture_nonzero_exit_carries_output() {
        let executor = LocalExecutor::new();
        let err = executor
            .run_capture(&ShellCommand::new("echo partial; exit 2"))
            .await
            .unwrap_err();
        assert_eq!(err.output(), Some("partial\n"));
    }

    #[tokio::test]
    async fn test_stdin_is_fed_to_command() {
        let executor = LocalExecutor::new();
        let command = ShellCommand::new("read line; echo got:$line").with_stdin("secret\n");
        let output = executor.run_capture(&command).await.unwrap();
        assert_eq!(output.trim(), "got:secret");
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let executor = LocalExecutor::new().with_timeout(Duration::from_millis(200));
        let (tx, mut rx) = mpsc::channel(8);
        let err = executor
            .run_streaming(&ShellCommand::new("sleep 5"), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        let entries = drain(&mut rx);
        assert_eq!(entries.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_path_checks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("snapshot.db");
        tokio::fs::write(&file, b"data").await.unwrap();

        let executor = LocalExecutor::new();
        assert!(executor.dir_exists(dir.path().to_str().unwrap()).await);
        assert!(executor.file_exists(file.to_str().unwrap()).await);
        assert!(!executor.file_exists("/nonexistent/xjp/file").await);
        assert!(!executor.dir_exists(file.to_str().unwrap()).await);
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let executor = LocalExecutor::new().with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();

        let (tx, mut rx) = mpsc::channel(8);
        let err = executor
            .run_streaming(&ShellCommand::new("sleep 4; echo done"), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(drain(&mut rx).iter().filter(|e| e.is_terminal()).count(), 1);

        let started = std::time::Instant::now();
        let err = executor
            .run_capture(&ShellCommand::new("sleep 4; echo done"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_slow_consumer_receives_every_line() {
        let executor = LocalExecutor::new();
        let (tx, mut rx) = mpsc::channel::<LogEntry>(8);
        let consumer = tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Some(entry) = rx.recv().await {
                if entry.is_terminal() {
                    break;
                }
                if lines.len() % 100 == 0 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                lines.push(entry.message);
            }
            lines
        });

        executor
            .run_streaming(&ShellCommand::new("seq 1 500"), tx)
            .await
            .unwrap();
        let lines = consumer.await.unwrap();
        assert_eq!(lines.len(), 500);
        assert_eq!(lines.first().map(String::as_str), Some("1"));
        assert_eq!(lines.last().map(String::as_str), Some("500"));
    }
}
