//! SSH 远程执行器
//!
//! 基于 russh 客户端：每条命令打开一个会话通道执行，文件传输走 SFTP 子系统。
//! 主机密钥校验关闭（集群内网环境），接受时记录指纹。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, error, info, warn};

use crate::config::env::constants::{DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS};
use crate::domain::host::{AuthMethod, Host};
use crate::domain::log::LogEntry;
use crate::error::{AgentError, AgentResult};
use crate::infra::command::join_reader;
use crate::infra::encoding::{decode_output, LineDecoder};
use crate::infra::executor::{
    discard_scratch, relocate_in, relocate_out, scratch_path, Executor, LogSink, OutputTail, ShellCommand,
};

/// 客户端回调
struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &key::PublicKey) -> Result<bool, Self::Error> {
        warn!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "Host key verification disabled, accepting server key"
        );
        Ok(true)
    }
}

/// SSH 连接参数
#[derive(Clone, Copy, Debug)]
pub struct SshOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }
}

/// 通道输出片段
enum Chunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// SSH 执行器
///
/// 持有一个已认证的连接，生命周期与一次运行相同，结束时调用 `close`。
pub struct SshExecutor {
    host: Host,
    handle: Handle<ClientHandler>,
    options: SshOptions,
    user: OnceCell<String>,
}

impl SshExecutor {
    /// 建立连接并按顺序尝试认证方式
    pub async fn connect(host: Host, options: SshOptions) -> AgentResult<Self> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(options.command_timeout),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: host.name.clone(),
        };

        info!(host = %host.name, endpoint = %host.endpoint(), user = %host.user, "Connecting over SSH");

        let connect = client::connect(config, (host.address.as_str(), host.port), handler);
        let mut handle = tokio::time::timeout(options.connect_timeout, connect)
            .await
            .map_err(|_| {
                AgentError::connection(
                    &host.name,
                    format!("timed out after {:?}", options.connect_timeout),
                )
            })?
            .map_err(|e| AgentError::connection(&host.name, e))?;

        authenticate(&mut handle, &host).await?;
        info!(host = %host.name, "SSH session established");

        Ok(Self {
            host,
            handle,
            options,
            user: OnceCell::new(),
        })
    }

    async fn open_exec(&self, command: &ShellCommand) -> AgentResult<Channel<Msg>> {
        let spawn_err = |e: russh::Error| AgentError::spawn(command.script(), e);
        let channel = self.handle.channel_open_session().await.map_err(spawn_err)?;
        channel.exec(true, command.script()).await.map_err(spawn_err)?;
        if let Some(input) = command.stdin() {
            channel.data(input.as_bytes()).await.map_err(spawn_err)?;
        }
        channel.eof().await.map_err(spawn_err)?;
        Ok(channel)
    }

    /// 驱动通道直到关闭，输出片段按到达顺序交给 `sink`
    async fn drive(&self, command: &ShellCommand, mut sink: impl FnMut(Chunk) + Send) -> AgentResult<i32> {
        let mut channel = self.open_exec(command).await?;
        let mut exit_status: Option<i32> = None;

        let pump = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => sink(Chunk::Stdout(data.to_vec())),
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => sink(Chunk::Stderr(data.to_vec())),
                    ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code as i32),
                    ChannelMsg::ExitSignal { signal_name, .. } => {
                        warn!(host = %self.host.name, signal = ?signal_name, "Remote command killed by signal");
                        exit_status = Some(-1);
                    }
                    _ => {}
                }
            }
        };

        if tokio::time::timeout(self.options.command_timeout, pump).await.is_err() {
            error!(host = %self.host.name, command = %command, "Remote command timed out");
            let _ = channel.close().await;
            return Err(AgentError::Timeout {
                what: command.script().to_string(),
                after: self.options.command_timeout,
            });
        }

        // 未收到退出码视为异常结束
        Ok(exit_status.unwrap_or(-1))
    }

    async fn execute_streaming(&self, command: &ShellCommand, log_tx: &LogSink) -> AgentResult<()> {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(pump_chunks(stdout_rx, log_tx.clone(), LogEntry::stdout));
        let stderr_task = tokio::spawn(pump_chunks(stderr_rx, log_tx.clone(), LogEntry::stderr));

        let status = self
            .drive(command, |chunk| {
                let _ = match chunk {
                    Chunk::Stdout(data) => stdout_tx.send(data),
                    Chunk::Stderr(data) => stderr_tx.send(data),
                };
            })
            .await;
        drop(stdout_tx);
        drop(stderr_tx);

        let mut tail = join_reader(stdout_task, "stdout").await;
        tail.extend(join_reader(stderr_task, "stderr").await);

        match status? {
            0 => Ok(()),
            status => Err(AgentError::Command {
                command: command.script().to_string(),
                status,
                output: tail.render(),
            }),
        }
    }

    async fn execute_output(&self, command: &ShellCommand) -> AgentResult<String> {
        let mut output = Vec::new();
        let status = self
            .drive(command, |chunk| match chunk {
                Chunk::Stdout(data) | Chunk::Stderr(data) => output.extend_from_slice(&data),
            })
            .await?;
        let text = decode_output(&output);
        if status == 0 {
            Ok(text)
        } else {
            Err(AgentError::Command {
                command: command.script().to_string(),
                status,
                output: text,
            })
        }
    }

    async fn sftp(&self) -> AgentResult<SftpSession> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| AgentError::transfer(format!("open sftp channel on {}: {}", self.host.name, e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| AgentError::transfer(format!("request sftp subsystem on {}: {}", self.host.name, e)))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| AgentError::transfer(format!("start sftp session on {}: {}", self.host.name, e)))
    }

    async fn sftp_put(&self, local: &Path, remote: &str) -> AgentResult<u64> {
        let sftp = self.sftp().await?;
        let result = async {
            let mut source = tokio::fs::File::open(local)
                .await
                .map_err(|e| AgentError::transfer(format!("open {}: {}", local.display(), e)))?;
            let mut target = sftp
                .create(remote)
                .await
                .map_err(|e| AgentError::transfer(format!("create remote {}: {}", remote, e)))?;
            let copied = tokio::io::copy(&mut source, &mut target)
                .await
                .map_err(|e| AgentError::transfer(format!("write remote {}: {}", remote, e)))?;
            target
                .shutdown()
                .await
                .map_err(|e| AgentError::transfer(format!("close remote {}: {}", remote, e)))?;
            Ok(copied)
        }
        .await;
        let _ = sftp.close().await;
        result
    }

    async fn sftp_get(&self, remote: &str, local: &Path) -> AgentResult<u64> {
        let sftp = self.sftp().await?;
        let result = async {
            let mut source = sftp
                .open(remote)
                .await
                .map_err(|e| AgentError::transfer(format!("open remote {}: {}", remote, e)))?;
            let mut target = tokio::fs::File::create(local)
                .await
                .map_err(|e| AgentError::transfer(format!("create {}: {}", local.display(), e)))?;
            let copied = tokio::io::copy(&mut source, &mut target)
                .await
                .map_err(|e| AgentError::transfer(format!("read remote {}: {}", remote, e)))?;
            target
                .flush()
                .await
                .map_err(|e| AgentError::transfer(format!("flush {}: {}", local.display(), e)))?;
            Ok(copied)
        }
        .await;
        let _ = sftp.close().await;
        result
    }
}

async fn authenticate(handle: &mut Handle<ClientHandler>, host: &Host) -> AgentResult<()> {
    let methods = host.effective_auth_methods();
    if methods.is_empty() {
        return Err(AgentError::connection(&host.name, "no authentication method configured"));
    }

    for method in methods {
        let accepted = match &method {
            AuthMethod::Password { password } => handle
                .authenticate_password(host.user.as_str(), password.as_str())
                .await
                .map_err(|e| AgentError::connection(&host.name, e))?,
            AuthMethod::PrivateKey { path, passphrase } => {
                let key_pair = match russh_keys::load_secret_key(path, passphrase.as_deref()) {
                    Ok(key_pair) => key_pair,
                    Err(e) => {
                        warn!(host = %host.name, key = %path, error = %e, "Failed to load private key");
                        continue;
                    }
                };
                handle
                    .authenticate_publickey(host.user.as_str(), Arc::new(key_pair))
                    .await
                    .map_err(|e| AgentError::connection(&host.name, e))?
            }
        };
        if accepted {
            return Ok(());
        }
        debug!(host = %host.name, method = ?method, "Authentication method rejected");
    }

    Err(AgentError::connection(
        &host.name,
        format!("authentication rejected for user {}", host.user),
    ))
}

/// 把字节片段解码成行并转发，返回输出尾部
async fn pump_chunks(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    log_tx: LogSink,
    make: fn(String) -> LogEntry,
) -> OutputTail {
    let mut decoder = LineDecoder::new();
    let mut tail = OutputTail::default();
    while let Some(chunk) = rx.recv().await {
        for line in decoder.push(&chunk) {
            tail.push(&line);
            let _ = log_tx.send(make(line)).await;
        }
    }
    if let Some(line) = decoder.finish() {
        tail.push(&line);
        let _ = log_tx.send(make(line)).await;
    }
    tail
}

#[async_trait]
impl Executor for SshExecutor {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn run_streaming(&self, command: &ShellCommand, log_tx: LogSink) -> AgentResult<()> {
        let result = self.execute_streaming(command, &log_tx).await;
        let _ = log_tx.send(LogEntry::pipeline_finished(result.is_ok())).await;
        result
    }

    async fn run_capture(&self, command: &ShellCommand) -> AgentResult<String> {
        self.execute_output(command).await
    }

    async fn run(&self, command: &ShellCommand) -> AgentResult<()> {
        self.execute_output(command).await.map(|_| ())
    }

    async fn upload(&self, local: &Path, remote: &str) -> AgentResult<()> {
        if self.is_privileged().await {
            let bytes = self.sftp_put(local, remote).await?;
            debug!(host = %self.host.name, remote = %remote, bytes, "Uploaded file");
            return Ok(());
        }
        let scratch = scratch_path(remote);
        if let Err(e) = self.sftp_put(local, &scratch).await {
            discard_scratch(self, &scratch).await;
            return Err(e);
        }
        relocate_in(self, &scratch, remote).await
    }

    async fn download(&self, remote: &str, local: &Path) -> AgentResult<()> {
        if self.is_privileged().await {
            let bytes = self.sftp_get(remote, local).await?;
            debug!(host = %self.host.name, remote = %remote, bytes, "Downloaded file");
            return Ok(());
        }
        let scratch = scratch_path(remote);
        relocate_out(self, remote, &scratch).await?;
        let result = self.sftp_get(&scratch, local).await;
        discard_scratch(self, &scratch).await;
        result.map(|_| ())
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

    async fn close(&self) -> AgentResult<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| AgentError::connection(&self.host.name, e))?;
        info!(host = %self.host.name, "SSH session closed");
        Ok(())
    }
}
