//! etcd 单节点备份
//!
//! 流程：读取 etcd 环境文件 → 确保备份目录 → `etcdctl snapshot save`
//! → 下载到本机中转目录 → 上传对象存储 → 清理远程与本地副本。

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::env::EtcdPaths;
use crate::domain::etcd::{
    blob_prefix, next_snapshot_stamp, parse_snapshot_stamp, BackupManifest, EtcdEnvironment,
};
use crate::error::{AgentError, AgentResult};
use crate::infra::blob_store::BlobStore;
use crate::infra::executor::Executor;
use crate::services::etcd::command;
use crate::services::os_client::OsClient;

/// 读取并解析节点的 etcd 环境文件
///
/// 文件不存在说明该集群不是以 systemd 单元方式部署的 etcd，不支持。
pub(crate) async fn read_environment(os: &OsClient, env_file: &str) -> AgentResult<EtcdEnvironment> {
    if !os.executor().file_exists(env_file).await {
        return Err(AgentError::config(format!(
            "{} not found on {}, etcd is not managed by a systemd unit on this host",
            env_file,
            os.host().name
        )));
    }
    let content = os.read_file(env_file).await?;
    let environment = EtcdEnvironment::parse(&content);
    info!(host = %os.host().name, file = %env_file, keys = environment.len(), "Loaded etcd environment");
    Ok(environment)
}

/// 备份管理器
pub struct BackupManager {
    os: OsClient,
    blob: Arc<dyn BlobStore>,
    cluster_name: String,
    paths: EtcdPaths,
}

impl BackupManager {
    pub fn new(
        executor: Arc<dyn Executor>,
        blob: Arc<dyn BlobStore>,
        cluster_name: impl Into<String>,
        paths: EtcdPaths,
    ) -> Self {
        Self {
            os: OsClient::new(executor),
            blob,
            cluster_name: cluster_name.into(),
            paths,
        }
    }

    /// 执行一次备份，成功时返回备份描述
    pub async fn backup_etcd(&self) -> AgentResult<BackupManifest> {
        let host = self.os.host().name.clone();

        // 任何变更操作之前先校验环境
        let environment = read_environment(&self.os, &self.paths.env_file).await?;
        let tls = environment.client_tls()?;

        let backup_dir = self.paths.cluster_backup_dir(&self.cluster_name);
        self.os.executor().ensure_directory(&backup_dir).await?;

        let mut manifest = BackupManifest::new(
            &self.cluster_name,
            &self.paths.backup_dir,
            &self.paths.local_dir,
            next_snapshot_stamp(),
        );

        let save = self
            .os
            .executor()
            .elevated(&command::snapshot_save(&tls, &manifest.remote_path))
            .await;
        self.os
            .executor()
            .run_capture(&save)
            .await
            .inspect_err(|e| error!(host = %host, path = %manifest.remote_path, error = %e, "etcd snapshot save failed"))?;
        info!(host = %host, path = %manifest.remote_path, "etcd snapshot saved");

        tokio::fs::create_dir_all(&self.paths.local_dir).await.map_err(|e| {
            AgentError::transfer(format!("create {}: {}", self.paths.local_dir.display(), e))
        })?;
        self.os
            .executor()
            .fetch_file(&manifest.remote_path, &manifest.local_path, 0o600)
            .await
            .map_err(into_transfer)?;

        let bytes = self.blob.upload(&manifest.local_path, &manifest.blob_key).await?;
        info!(
            host = %host,
            store = %self.blob.describe(),
            key = %manifest.blob_key,
            bytes,
            "Uploaded etcd snapshot"
        );

        if let Err(e) = self.os.remove_file(&manifest.remote_path).await {
            warn!(host = %host, path = %manifest.remote_path, error = %e, "Failed to delete remote snapshot");
            manifest
                .cleanup_warnings
                .push(format!("remote {}: {}", manifest.remote_path, e));
        }
        if let Err(e) = tokio::fs::remove_file(&manifest.local_path).await {
            warn!(path = %manifest.local_path.display(), error = %e, "Failed to delete local snapshot");
            manifest
                .cleanup_warnings
                .push(format!("local {}: {}", manifest.local_path.display(), e));
        }

        info!(host = %host, file = %manifest.file_name, "Backup etcd successfully");
        Ok(manifest)
    }
}

fn into_transfer(err: AgentError) -> AgentError {
    match err {
        AgentError::Transfer(_) => err,
        other => AgentError::transfer(other.to_string()),
    }
}

/// 集群在对象存储中的快照文件名，按时间从旧到新
pub async fn list_backups(store: &dyn BlobStore, cluster_name: &str) -> AgentResult<Vec<String>> {
    let prefix = blob_prefix(cluster_name);
    let mut backups: Vec<String> = store
        .list(&prefix)
        .await?
        .into_iter()
        .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
        .filter(|name| !name.contains('/') && parse_snapshot_stamp(name).is_some())
        .collect();
    backups.sort_by_key(|name| parse_snapshot_stamp(name));
    Ok(backups)
}

/// 最新的快照文件名
pub async fn latest_backup(store: &dyn BlobStore, cluster_name: &str) -> AgentResult<String> {
    list_backups(store, cluster_name)
        .await?
        .pop()
        .ok_or_else(|| AgentError::config(format!("no etcd backups found for cluster {}", cluster_name)))
}
