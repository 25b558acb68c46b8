//! etcd 备份/恢复领域模型
//!
//! - `EtcdEnvironment`: 每个节点的 `/etc/etcd.env` 解析结果（按主机传递，不写进程环境变量）
//! - `BackupManifest`: 单次备份的产物描述
//! - `RestoreSession`: 单次集群恢复中某台主机的阶段状态

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Serialize;

use crate::error::{AgentError, AgentResult};

pub const ETCDCTL_CA_FILE: &str = "ETCDCTL_CA_FILE";
pub const ETCDCTL_KEY_FILE: &str = "ETCDCTL_KEY_FILE";
pub const ETCDCTL_CERT_FILE: &str = "ETCDCTL_CERT_FILE";
pub const ETCDCTL_ENDPOINTS: &str = "ETCDCTL_ENDPOINTS";
pub const ETCD_ADVERTISE_CLIENT_URLS: &str = "ETCD_ADVERTISE_CLIENT_URLS";
pub const ETCD_NAME: &str = "ETCD_NAME";
pub const ETCD_INITIAL_CLUSTER: &str = "ETCD_INITIAL_CLUSTER";
pub const ETCD_INITIAL_ADVERTISE_PEER_URLS: &str = "ETCD_INITIAL_ADVERTISE_PEER_URLS";

const SNAPSHOT_PREFIX: &str = "etcd-backup-";
const SNAPSHOT_SUFFIX: &str = ".db";
const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// etcd 单元环境文件内容
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EtcdEnvironment {
    vars: BTreeMap<String, String>,
}

/// etcdctl 客户端 TLS 参数
#[derive(Clone, Debug, PartialEq)]
pub struct EtcdClientTls {
    pub ca_file: String,
    pub key_file: String,
    pub cert_file: String,
    pub endpoints: String,
}

/// 恢复时的成员身份参数
#[derive(Clone, Debug, PartialEq)]
pub struct EtcdMember {
    pub name: String,
    pub initial_cluster: String,
    pub initial_advertise_peer_urls: String,
}

impl EtcdEnvironment {
    /// 解析 `KEY=VALUE` 文本，跳过空行与 `#` 注释行
    pub fn parse(content: &str) -> Self {
        let mut vars = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                let value = value.trim().trim_matches('"');
                vars.insert(key.to_string(), value.to_string());
            }
        }
        Self { vars }
    }

    /// 获取非空值
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> AgentResult<&str> {
        self.get(key)
            .ok_or_else(|| AgentError::config(format!("{} is missing from the etcd environment", key)))
    }

    /// 客户端端点：优先 `ETCDCTL_ENDPOINTS`，否则使用 `ETCD_ADVERTISE_CLIENT_URLS`
    pub fn endpoints(&self) -> AgentResult<&str> {
        self.get(ETCDCTL_ENDPOINTS)
            .or_else(|| self.get(ETCD_ADVERTISE_CLIENT_URLS))
            .ok_or_else(|| {
                AgentError::config(format!(
                    "neither {} nor {} is set in the etcd environment",
                    ETCDCTL_ENDPOINTS, ETCD_ADVERTISE_CLIENT_URLS
                ))
            })
    }

    pub fn client_tls(&self) -> AgentResult<EtcdClientTls> {
        Ok(EtcdClientTls {
            ca_file: self.require(ETCDCTL_CA_FILE)?.to_string(),
            key_file: self.require(ETCDCTL_KEY_FILE)?.to_string(),
            cert_file: self.require(ETCDCTL_CERT_FILE)?.to_string(),
            endpoints: self.endpoints()?.to_string(),
        })
    }

    pub fn member(&self) -> AgentResult<EtcdMember> {
        Ok(EtcdMember {
            name: self.require(ETCD_NAME)?.to_string(),
            initial_cluster: self.require(ETCD_INITIAL_CLUSTER)?.to_string(),
            initial_advertise_peer_urls: self.require(ETCD_INITIAL_ADVERTISE_PEER_URLS)?.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

static LAST_STAMP_MILLIS: AtomicI64 = AtomicI64::new(0);

/// 生成快照时间戳，保证进程内严格递增（同一毫秒内多次调用顺延 1ms）
pub fn next_snapshot_stamp() -> DateTime<Local> {
    let now = Local::now().timestamp_millis();
    let mut last = LAST_STAMP_MILLIS.load(Ordering::SeqCst);
    loop {
        let candidate = if now > last { now } else { last + 1 };
        match LAST_STAMP_MILLIS.compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {
                return Local
                    .timestamp_millis_opt(candidate)
                    .single()
                    .unwrap_or_else(Local::now)
            }
            Err(actual) => last = actual,
        }
    }
}

/// `etcd-backup-<yyyyMMddHHmmss><millis>.db`
pub fn snapshot_file_name(stamp: DateTime<Local>) -> String {
    format!(
        "{}{}{}{}",
        SNAPSHOT_PREFIX,
        stamp.format(STAMP_FORMAT),
        stamp.format("%3f"),
        SNAPSHOT_SUFFIX
    )
}

/// 从快照文件名还原时间戳，兼容只有秒精度的旧文件名
pub fn parse_snapshot_stamp(file_name: &str) -> Option<NaiveDateTime> {
    let digits = file_name
        .strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(SNAPSHOT_SUFFIX)?;
    if digits.len() < 14 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (seconds, millis) = digits.split_at(14);
    let base = NaiveDateTime::parse_from_str(seconds, STAMP_FORMAT).ok()?;
    let millis: i64 = if millis.is_empty() { 0 } else { millis.parse().ok()? };
    Some(base + chrono::Duration::milliseconds(millis))
}

/// 对象存储中的确定性 key
pub fn blob_key(cluster_name: &str, file_name: &str) -> String {
    format!("data/{}/{}", cluster_name, file_name)
}

/// 集群在对象存储中的前缀
pub fn blob_prefix(cluster_name: &str) -> String {
    format!("data/{}/", cluster_name)
}

/// 单次备份的产物
#[derive(Clone, Debug, Serialize)]
pub struct BackupManifest {
    pub cluster_name: String,
    pub file_name: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub blob_key: String,
    pub created_at: DateTime<Local>,
    /// 清理失败的描述（不影响已成功的备份）
    pub cleanup_warnings: Vec<String>,
}

impl BackupManifest {
    pub fn new(
        cluster_name: &str,
        backup_dir: &str,
        local_dir: &std::path::Path,
        stamp: DateTime<Local>,
    ) -> Self {
        let file_name = snapshot_file_name(stamp);
        Self {
            cluster_name: cluster_name.to_string(),
            remote_path: format!("{}/{}/{}", backup_dir.trim_end_matches('/'), cluster_name, file_name),
            local_path: local_dir.join(&file_name),
            blob_key: blob_key(cluster_name, &file_name),
            file_name,
            created_at: stamp,
            cleanup_warnings: Vec::new(),
        }
    }
}

/// 恢复阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    Connect,
    Pre,
    Restore,
    Post,
    Verify,
}

impl RestorePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestorePhase::Connect => "connect",
            RestorePhase::Pre => "pre",
            RestorePhase::Restore => "restore",
            RestorePhase::Post => "post",
            RestorePhase::Verify => "verify",
        }
    }

    /// 按执行顺序排列的扫描阶段
    pub fn sweeps() -> [RestorePhase; 4] {
        [
            RestorePhase::Pre,
            RestorePhase::Restore,
            RestorePhase::Post,
            RestorePhase::Verify,
        ]
    }
}

impl std::fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单台主机在一次恢复中的状态
///
/// Pre 阶段写入的远程快照路径由同一会话的 Restore 阶段读取，不会重新计算；
/// 会话不可跨运行复用。
#[derive(Clone, Debug)]
pub struct RestoreSession {
    pub backup_name: String,
    pub remote_snapshot: Option<String>,
    pub local_snapshot: Option<PathBuf>,
    pub data_dir_backup: Option<String>,
    pub api_server_paused: bool,
    pub reached: Option<RestorePhase>,
}

impl RestoreSession {
    pub fn new(backup_name: impl Into<String>) -> Self {
        Self {
            backup_name: backup_name.into(),
            remote_snapshot: None,
            local_snapshot: None,
            data_dir_backup: None,
            api_server_paused: false,
            reached: None,
        }
    }

    /// 确认可以进入 `phase`：前一阶段必须已完成
    pub fn expect_ready_for(&self, phase: RestorePhase) -> AgentResult<()> {
        let required = match phase {
            RestorePhase::Connect | RestorePhase::Pre => None,
            RestorePhase::Restore => Some(RestorePhase::Pre),
            RestorePhase::Post => Some(RestorePhase::Restore),
            RestorePhase::Verify => Some(RestorePhase::Post),
        };
        match (required, self.reached) {
            (None, None) => Ok(()),
            (None, Some(reached)) => Err(AgentError::InvalidState(format!(
                "restore session already reached {} and cannot run {} again",
                reached, phase
            ))),
            (Some(req), Some(reached)) if reached == req => Ok(()),
            (Some(req), reached) => Err(AgentError::InvalidState(format!(
                "{} requires {} to have completed (reached: {})",
                phase,
                req,
                reached.map(|p| p.as_str()).unwrap_or("nothing")
            ))),
        }
    }

    pub fn complete(&mut self, phase: RestorePhase) {
        self.reached = Some(phase);
    }

    pub fn remote_snapshot(&self) -> AgentResult<&str> {
        self.remote_snapshot
            .as_deref()
            .ok_or_else(|| AgentError::InvalidState("no snapshot has been staged for this session".to_string()))
    }
}
