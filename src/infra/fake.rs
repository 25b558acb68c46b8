//! 测试用的脚本化执行器
//!
//! 按子串匹配预设响应，记录所有命令，并以内存表模拟远程文件系统
//! （`test -f/-d`、`mkdir -p`、`cat`、`rm -f`、`mv -f` 与文件传输），
//! 也可以让指定命令返回连接错误。

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::host::Host;
use crate::domain::log::LogEntry;
use crate::error::{AgentError, AgentResult};
use crate::infra::executor::{Executor, LogSink, ShellCommand};

const SUDO_PREFIX: &str = "sudo -S -p '' sh -c ";

/// 典型 kubespray 节点的 `/etc/etcd.env`
pub const SAMPLE_ETCD_ENV: &str = "ETCD_NAME=etcd1\n\
    ETCD_ADVERTISE_CLIENT_URLS=https://10.0.0.11:2379\n\
    ETCD_INITIAL_CLUSTER=etcd1=https://10.0.0.11:2380\n\
    ETCD_INITIAL_ADVERTISE_PEER_URLS=https://10.0.0.11:2380\n\
    ETCDCTL_CA_FILE=/etc/ssl/etcd/ssl/ca.pem\n\
    ETCDCTL_KEY_FILE=/etc/ssl/etcd/ssl/admin-node1-key.pem\n\
    ETCDCTL_CERT_FILE=/etc/ssl/etcd/ssl/admin-node1.pem\n";

#[derive(Clone, Debug)]
enum Response {
    Output(String),
    Fail { status: i32, output: String },
    Disconnected,
}

#[derive(Default)]
struct RemoteFs {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
}

pub struct FakeExecutor {
    host: Host,
    user: String,
    rules: Mutex<Vec<(String, Response)>>,
    commands: Mutex<Vec<String>>,
    fs: Mutex<RemoteFs>,
    closed: AtomicBool,
}

impl FakeExecutor {
    pub fn new(name: &str) -> Self {
        Self {
            host: Host::new(name, format!("10.0.0.{}", name.len()), "root"),
            user: "root".to_string(),
            rules: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            fs: Mutex::new(RemoteFs::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self.host.user = user.to_string();
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.host.password = Some(password.to_string());
        self
    }

    /// 命令包含 `pattern` 时返回 `output`，后添加的规则优先
    pub fn respond(&self, pattern: &str, output: &str) {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), Response::Output(output.to_string())));
    }

    pub fn fail(&self, pattern: &str, status: i32, output: &str) {
        self.rules.lock().unwrap().push((
            pattern.to_string(),
            Response::Fail {
                status,
                output: output.to_string(),
            },
        ));
    }

    /// 命令包含 `pattern` 时返回连接错误，模拟会话中断
    pub fn disconnect(&self, pattern: &str) {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), Response::Disconnected));
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.fs
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.as_bytes().to_vec());
    }

    pub fn put_dir(&self, path: &str) {
        self.fs.lock().unwrap().dirs.insert(path.to_string());
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.fs.lock().unwrap().files.contains_key(path)
    }

    pub fn file_content(&self, path: &str) -> Option<String> {
        self.fs
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|content| String::from_utf8_lossy(content).to_string())
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.fs.lock().unwrap().dirs.contains(path)
    }

    pub fn files_under(&self, prefix: &str) -> Vec<String> {
        let mut files: Vec<_> = self
            .fs
            .lock()
            .unwrap()
            .files
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        files.sort();
        files
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// 首个包含 `pattern` 的命令下标
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(pattern))
    }

    pub fn issued(&self, pattern: &str) -> bool {
        self.position(pattern).is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn execute(&self, command: &ShellCommand) -> AgentResult<String> {
        let script = command.script().to_string();
        self.commands.lock().unwrap().push(script.clone());

        let rule = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(pattern, _)| script.contains(pattern.as_str()))
            .map(|(_, response)| response.clone());
        if let Some(response) = rule {
            return match response {
                Response::Output(output) => Ok(output),
                Response::Fail { status, output } => Err(to_error(command, (status, output))),
                Response::Disconnected => Err(AgentError::connection(&self.host.name, "session closed")),
            };
        }

        self.builtin(&unwrap_sudo(&script)).map_err(|e| to_error(command, e))
    }

    fn builtin(&self, script: &str) -> Result<String, (i32, String)> {
        let args: Vec<String> = script.split_whitespace().map(unquote).collect();
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        let mut fs = self.fs.lock().unwrap();

        if script.contains(" snapshot save ") {
            fs.files.insert(arg(args.len() - 1), b"etcd-snapshot".to_vec());
            return Ok("Snapshot saved\n".to_string());
        }

        match (arg(0).as_str(), arg(1).as_str()) {
            ("test", "-f") => Ok(exists_answer(fs.files.contains_key(&arg(2)))),
            ("test", "-d") => Ok(exists_answer(fs.dirs.contains(&arg(2)))),
            ("mkdir", "-p") => {
                fs.dirs.insert(arg(2));
                Ok(String::new())
            }
            ("cat", path) => fs
                .files
                .get(path)
                .map(|content| String::from_utf8_lossy(content).to_string())
                .ok_or((1, format!("cat: {}: No such file or directory", path))),
            ("rm", "-f") => {
                fs.files.remove(&arg(2));
                Ok(String::new())
            }
            ("mv", "-f") => {
                let (source, target) = (arg(2), arg(3));
                if let Some(content) = fs.files.remove(&source) {
                    fs.files.insert(target, content);
                    Ok(String::new())
                } else if fs.dirs.remove(&source) {
                    fs.dirs.insert(target);
                    Ok(String::new())
                } else {
                    Err((1, format!("mv: cannot stat '{}': No such file or directory", source)))
                }
            }
            _ => Ok(String::new()),
        }
    }
}

fn exists_answer(exists: bool) -> String {
    if exists { "exists\n" } else { "not exists\n" }.to_string()
}

fn unquote(arg: &str) -> String {
    arg.trim_matches('\'').to_string()
}

fn unwrap_sudo(script: &str) -> String {
    match script.strip_prefix(SUDO_PREFIX) {
        Some(inner) => inner
            .trim_matches('\'')
            .replace(r"'\''", "'"),
        None => script.to_string(),
    }
}

fn to_error(command: &ShellCommand, (status, output): (i32, String)) -> AgentError {
    AgentError::Command {
        command: command.script().to_string(),
        status,
        output,
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn run_streaming(&self, command: &ShellCommand, log_tx: LogSink) -> AgentResult<()> {
        let result = self.execute(command);
        let (lines, success) = match &result {
            Ok(output) => (output.clone(), true),
            Err(e) => (e.output().unwrap_or_default().to_string(), false),
        };
        for line in lines.lines() {
            let entry = if success {
                LogEntry::stdout(line)
            } else {
                LogEntry::stderr(line)
            };
            let _ = log_tx.send(entry).await;
        }
        let _ = log_tx.send(LogEntry::pipeline_finished(success)).await;
        result.map(|_| ())
    }

    async fn run_capture(&self, command: &ShellCommand) -> AgentResult<String> {
        self.execute(command)
    }

    async fn run(&self, command: &ShellCommand) -> AgentResult<()> {
        self.execute(command).map(|_| ())
    }

    async fn upload(&self, local: &Path, remote: &str) -> AgentResult<()> {
        let content = tokio::fs::read(local)
            .await
            .map_err(|e| AgentError::transfer(format!("read {}: {}", local.display(), e)))?;
        self.fs.lock().unwrap().files.insert(remote.to_string(), content);
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> AgentResult<()> {
        let content = self
            .fs
            .lock()
            .unwrap()
            .files
            .get(remote)
            .cloned()
            .ok_or_else(|| AgentError::transfer(format!("remote file {} not found", remote)))?;
        tokio::fs::write(local, content)
            .await
            .map_err(|e| AgentError::transfer(format!("write {}: {}", local.display(), e)))
    }

    async fn current_user(&self) -> AgentResult<String> {
        Ok(self.user.clone())
    }

    async fn close(&self) -> AgentResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
