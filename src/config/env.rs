//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use constants::*;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 集群名称，决定备份目录与对象存储前缀
    pub cluster_name: String,
    /// 主机清单文件（JSON）
    pub inventory_path: PathBuf,
    /// etcd 相关路径
    pub etcd: EtcdPaths,
    /// 对象存储后端
    pub blob: BlobSettings,
    /// SSH 连接超时
    pub connect_timeout: Duration,
    /// 单条命令超时
    pub command_timeout: Duration,
}

/// etcd 备份/恢复涉及的路径
#[derive(Clone, Debug, PartialEq)]
pub struct EtcdPaths {
    /// 远程备份根目录，快照存放在 `<backup_dir>/<cluster>/`
    pub backup_dir: String,
    /// 代理本机的中转目录
    pub local_dir: PathBuf,
    /// etcd unit 环境文件
    pub env_file: String,
    /// etcd 数据目录
    pub data_dir: String,
    /// 恢复前旧数据目录的存放根目录
    pub data_backup_root: String,
    /// kube-apiserver 静态 Pod manifest
    pub apiserver_manifest: String,
    /// kubectl 使用的 kubeconfig
    pub kubeconfig: String,
}

impl Default for EtcdPaths {
    fn default() -> Self {
        Self {
            backup_dir: DEFAULT_BACKUP_DIR.to_string(),
            local_dir: PathBuf::from(DEFAULT_LOCAL_DIR),
            env_file: DEFAULT_ETCD_ENV_FILE.to_string(),
            data_dir: DEFAULT_ETCD_DATA_DIR.to_string(),
            data_backup_root: DEFAULT_DATA_BACKUP_ROOT.to_string(),
            apiserver_manifest: DEFAULT_APISERVER_MANIFEST.to_string(),
            kubeconfig: DEFAULT_KUBECONFIG.to_string(),
        }
    }
}

impl EtcdPaths {
    /// 某集群的远程备份目录
    pub fn cluster_backup_dir(&self, cluster_name: &str) -> String {
        format!("{}/{}", self.backup_dir.trim_end_matches('/'), cluster_name)
    }

    /// 暂停 API server 时 manifest 的去向
    pub fn paused_manifest(&self) -> String {
        format!("{}.bak", self.apiserver_manifest)
    }
}

/// 对象存储后端配置
#[derive(Clone, PartialEq)]
pub enum BlobSettings {
    /// 本地目录，不存在时自动创建
    Local { root: PathBuf },
    /// S3 兼容服务
    S3 {
        endpoint: String,
        bucket: String,
        region: String,
        access_key: String,
        secret_key: String,
        use_ssl: bool,
    },
}

impl std::fmt::Debug for BlobSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobSettings::Local { root } => f.debug_struct("Local").field("root", root).finish(),
            BlobSettings::S3 {
                endpoint,
                bucket,
                region,
                access_key,
                use_ssl,
                ..
            } => f
                .debug_struct("S3")
                .field("endpoint", endpoint)
                .field("bucket", bucket)
                .field("region", region)
                .field("access_key", access_key)
                .field("secret_key", &"***")
                .field("use_ssl", use_ssl)
                .finish(),
        }
    }
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 从任意键值来源加载配置
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let cluster_name = get_or("CLUSTER_AGENT_CLUSTER_NAME", DEFAULT_CLUSTER_NAME);
        let inventory_path = PathBuf::from(get_or("CLUSTER_AGENT_INVENTORY", DEFAULT_INVENTORY_PATH));

        let etcd = EtcdPaths {
            backup_dir: get_or("CLUSTER_AGENT_BACKUP_DIR", DEFAULT_BACKUP_DIR),
            local_dir: PathBuf::from(get_or("CLUSTER_AGENT_LOCAL_DIR", DEFAULT_LOCAL_DIR)),
            env_file: get_or("CLUSTER_AGENT_ETCD_ENV_FILE", DEFAULT_ETCD_ENV_FILE),
            data_dir: get_or("CLUSTER_AGENT_ETCD_DATA_DIR", DEFAULT_ETCD_DATA_DIR),
            data_backup_root: get_or("CLUSTER_AGENT_DATA_BACKUP_ROOT", DEFAULT_DATA_BACKUP_ROOT),
            apiserver_manifest: get_or("CLUSTER_AGENT_APISERVER_MANIFEST", DEFAULT_APISERVER_MANIFEST),
            kubeconfig: get_or("CLUSTER_AGENT_KUBECONFIG", DEFAULT_KUBECONFIG),
        };

        let backend = get_or("CLUSTER_AGENT_BLOB_BACKEND", "local");
        let blob = match backend.to_ascii_lowercase().as_str() {
            "s3" | "minio" => BlobSettings::S3 {
                endpoint: get_or("CLUSTER_AGENT_S3_ENDPOINT", "127.0.0.1:9000"),
                bucket: get_or("CLUSTER_AGENT_S3_BUCKET", DEFAULT_BUCKET),
                region: get_or("CLUSTER_AGENT_S3_REGION", "us-east-1"),
                access_key: get_or("CLUSTER_AGENT_S3_ACCESS_KEY", ""),
                secret_key: get_or("CLUSTER_AGENT_S3_SECRET_KEY", ""),
                use_ssl: get("CLUSTER_AGENT_S3_USE_SSL").map(|v| parse_bool(&v)).unwrap_or(false),
            },
            other => {
                if other != "local" {
                    warn!(backend = %other, "Unknown blob backend, falling back to local");
                }
                BlobSettings::Local {
                    root: PathBuf::from(get_or("CLUSTER_AGENT_BLOB_ROOT", DEFAULT_BLOB_ROOT)),
                }
            }
        };

        let connect_timeout = get("CLUSTER_AGENT_CONNECT_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        let command_timeout = get("CLUSTER_AGENT_COMMAND_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);

        Self {
            cluster_name,
            inventory_path,
            etcd,
            blob,
            connect_timeout: Duration::from_secs(connect_timeout),
            command_timeout: Duration::from_secs(command_timeout),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

/// 常量
pub mod constants {
    pub const DEFAULT_CLUSTER_NAME: &str = "default";
    pub const DEFAULT_INVENTORY_PATH: &str = "hosts.json";
    pub const DEFAULT_BACKUP_DIR: &str = "/data/backup";
    pub const DEFAULT_LOCAL_DIR: &str = "/tmp/xjp-cluster-agent";
    pub const DEFAULT_ETCD_ENV_FILE: &str = "/etc/etcd.env";
    pub const DEFAULT_ETCD_DATA_DIR: &str = "/var/lib/etcd";
    pub const DEFAULT_DATA_BACKUP_ROOT: &str = "/data";
    pub const DEFAULT_APISERVER_MANIFEST: &str = "/etc/kubernetes/manifests/kube-apiserver.yaml";
    pub const DEFAULT_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";
    pub const DEFAULT_BLOB_ROOT: &str = "/var/lib/xjp-cluster-agent/blobs";
    pub const DEFAULT_BUCKET: &str = "etcd-backup";

    /// SSH 连接超时（秒）
    pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

    /// 单条命令超时（秒）
    pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600; // 1 小时

    /// 等待 etcd 停止
    pub const ETCD_STOP_TIMEOUT_SECS: u64 = 30;
    pub const ETCD_STOP_TICK_SECS: u64 = 2;

    /// 等待 etcd 健康
    pub const ETCD_HEALTH_TIMEOUT_SECS: u64 = 60;
    pub const ETCD_HEALTH_TICK_SECS: u64 = 2;

    /// 等待节点 Ready
    pub const NODE_READY_TIMEOUT_SECS: u64 = 300; // 5 分钟
    pub const NODE_READY_TICK_SECS: u64 = 2;

    /// 日志通道容量
    pub const LOG_CHANNEL_CAPACITY: usize = 1024;
}
