//! 主机操作客户端
//!
//! 在 `Executor` 之上提供：
//! - 一次性的主机事实探测
//! - systemd 单元生命周期管理
//! - 文件与网卡查询等小工具
//!
//! 非 root 登录时，所有变更类命令经 `Executor::elevated` 提权。

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::facts::{parse_interfaces, parse_os_release, single_value, HostFacts, UNKNOWN};
use crate::domain::host::Host;
use crate::error::{AgentError, AgentResult};
use crate::infra::executor::{quote, Executor, ShellCommand};

const CPU_MODEL_PROBE: &str = r#"grep -iE "^model\s+name\s+:" /proc/cpuinfo | awk -F':' '{print $NF}' | sort -u"#;
const CPU_CORES_PROBE: &str = "grep -c ^processor /proc/cpuinfo";
const MEMORY_PROBE: &str = "free -m | grep Mem | awk '{print $2}'";
const DISK_PROBE: &str = "df -h / | tail -n 1 | awk '{print $2}'";
const INTERFACES_PROBE: &str = r"ip addr show | grep -o '^[0-9]\+: [a-zA-Z0-9@._-]*' | awk '{print $2}'";

/// 主机操作客户端
pub struct OsClient {
    executor: Arc<dyn Executor>,
    facts: HostFacts,
}

impl OsClient {
    /// 不探测事实，事实保持为 Unknown
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            facts: HostFacts::default(),
        }
    }

    /// 创建并探测一次主机事实，任何失败的探测项降级为 Unknown
    pub async fn probe(executor: Arc<dyn Executor>) -> Self {
        let mut client = Self::new(executor);
        client.facts = client.collect_facts().await;
        client
    }

    async fn collect_facts(&self) -> HostFacts {
        let mut facts = HostFacts::default();

        if let Some(output) = self.probe_value("os-release", "cat /etc/os-release").await {
            let (id, version) = parse_os_release(&output);
            facts.distro_id = id;
            facts.distro_version = version;
        }
        if let Some(output) = self.probe_value("arch", "arch").await {
            facts.arch = single_value(&output);
        }
        if let Some(output) = self.probe_value("cpu model", CPU_MODEL_PROBE).await {
            facts.cpu_model = single_value(&output);
        }
        if let Some(output) = self.probe_value("cpu cores", CPU_CORES_PROBE).await {
            facts.cpu_cores = single_value(&output);
        }
        if let Some(output) = self.probe_value("memory", MEMORY_PROBE).await {
            let value = single_value(&output);
            facts.memory_size = if value == UNKNOWN { value } else { format!("{}MB", value) };
        }
        if let Some(output) = self.probe_value("disk", DISK_PROBE).await {
            facts.disk_size = single_value(&output);
        }
        if let Some(output) = self.probe_value("interfaces", INTERFACES_PROBE).await {
            facts.interfaces = parse_interfaces(&output);
        }

        debug!(host = %self.host().name, facts = ?facts, "Host facts collected");
        facts
    }

    async fn probe_value(&self, what: &str, script: &str) -> Option<String> {
        match self.executor.run_capture(&ShellCommand::new(script)).await {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(host = %self.host().name, probe = %what, error = %e, "Host probe failed");
                None
            }
        }
    }

    pub fn facts(&self) -> &HostFacts {
        &self.facts
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn host(&self) -> &Host {
        self.executor.host()
    }

    async fn systemctl(&self, args: &str) -> AgentResult<()> {
        let command = self.executor.elevated(&format!("systemctl {}", args)).await;
        self.executor
            .run_capture(&command)
            .await
            .map(|_| ())
            .inspect_err(|e| warn!(host = %self.host().name, action = %args, error = %e, "systemctl failed"))
    }

    pub async fn start(&self, unit: &str) -> AgentResult<()> {
        self.systemctl(&format!("start {}", quote(unit))).await
    }

    /// 只提交启动任务，不等待单元就绪
    pub async fn start_no_block(&self, unit: &str) -> AgentResult<()> {
        self.systemctl(&format!("start --no-block {}", quote(unit))).await
    }

    pub async fn stop(&self, unit: &str) -> AgentResult<()> {
        self.systemctl(&format!("stop {}", quote(unit))).await
    }

    pub async fn restart(&self, unit: &str) -> AgentResult<()> {
        self.systemctl(&format!("restart {}", quote(unit))).await
    }

    pub async fn enable(&self, unit: &str) -> AgentResult<()> {
        self.systemctl(&format!("enable {}", quote(unit))).await
    }

    pub async fn disable(&self, unit: &str) -> AgentResult<()> {
        self.systemctl(&format!("disable {}", quote(unit))).await
    }

    pub async fn mask(&self, unit: &str) -> AgentResult<()> {
        self.systemctl(&format!("mask {}", quote(unit))).await
    }

    pub async fn unmask(&self, unit: &str) -> AgentResult<()> {
        self.systemctl(&format!("unmask {}", quote(unit))).await
    }

    pub async fn daemon_reload(&self) -> AgentResult<()> {
        self.systemctl("daemon-reload").await
    }

    /// 单元是否处于运行状态
    ///
    /// `systemctl status` 对非运行单元返回非零退出码，此时按其输出判断。
    /// 连接、启动或超时错误原样返回，调用方不能把它当作单元已停止。
    pub async fn status(&self, unit: &str) -> AgentResult<bool> {
        let command = ShellCommand::new(format!("systemctl status {}", quote(unit)));
        match self.executor.run_capture(&command).await {
            Ok(output) => Ok(is_active(&output)),
            Err(AgentError::Command { output, .. }) => Ok(has_active_line(&output) && is_active(&output)),
            Err(e) => {
                debug!(host = %self.host().name, unit = %unit, error = %e, "Unit status unavailable");
                Err(e)
            }
        }
    }

    /// 读取远程文件内容
    pub async fn read_file(&self, path: &str) -> AgentResult<String> {
        let command = self.executor.elevated(&format!("cat {}", quote(path))).await;
        self.executor.run_capture(&command).await
    }

    pub async fn chmod(&self, path: &str, mode: &str) -> AgentResult<()> {
        let command = self
            .executor
            .elevated(&format!("chmod {} {}", quote(mode), quote(path)))
            .await;
        self.executor.run(&command).await
    }

    pub async fn remove_file(&self, path: &str) -> AgentResult<()> {
        let command = self.executor.elevated(&format!("rm -f {}", quote(path))).await;
        self.executor.run(&command).await
    }

    pub async fn move_path(&self, source: &str, target: &str) -> AgentResult<()> {
        let command = self
            .executor
            .elevated(&format!("mv -f {} {}", quote(source), quote(target)))
            .await;
        self.executor.run(&command).await?;
        info!(host = %self.host().name, from = %source, to = %target, "Moved path");
        Ok(())
    }

    /// 持有指定 IP 的网卡名，查询失败返回 Unknown
    pub async fn interface_for_address(&self, address: &str) -> String {
        let script = format!(
            "ip addr | grep -B 2 {} | head -n 1 | awk -F':' '{{print $2}}'",
            quote(&format!("inet {}/", address))
        );
        match self.executor.run_capture(&ShellCommand::new(script)).await {
            Ok(output) => single_value(output.split('@').next().unwrap_or_default()),
            Err(e) => {
                warn!(host = %self.host().name, address = %address, error = %e, "Failed to resolve interface");
                UNKNOWN.to_string()
            }
        }
    }
}

fn has_active_line(output: &str) -> bool {
    output.lines().any(|l| l.trim_start().starts_with("Active:"))
}

/// 解析 `systemctl status` 输出
///
/// 有 `Active:` 行时只看该行，`inactive` 与 `failed` 视为未运行；
/// 没有时退回到整段输出是否包含 `inactive`。
pub fn is_active(output: &str) -> bool {
    match output.lines().map(str::trim_start).find(|l| l.starts_with("Active:")) {
        Some(line) => {
            let state = line.trim_start_matches("Active:").trim_start();
            !(state.starts_with("inactive") || state.starts_with("failed"))
        }
        None => !output.contains("inactive"),
    }
}
