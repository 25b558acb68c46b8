//! etcd 单节点恢复
//!
//! 每台主机的恢复拆成四个阶段，由集群编排按阶段逐台推进：
//!
//! - Pre: 读取环境 → 下载快照并放到节点 → 暂停 API server → 停止 etcd → 移走旧数据目录
//! - Restore: `etcdctl snapshot restore`
//! - Post: 启动 etcd（不等待）→ 恢复 API server → 清理快照副本
//! - Verify: 等待 etcd 健康 → 重启 kubelet → 等待节点 Ready

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::env::constants::{
    ETCD_HEALTH_TICK_SECS, ETCD_HEALTH_TIMEOUT_SECS, ETCD_STOP_TICK_SECS, ETCD_STOP_TIMEOUT_SECS,
    NODE_READY_TICK_SECS, NODE_READY_TIMEOUT_SECS,
};
use crate::config::env::EtcdPaths;
use crate::domain::etcd::{blob_key, EtcdClientTls, EtcdEnvironment, EtcdMember, RestorePhase, RestoreSession};
use crate::error::{AgentError, AgentResult};
use crate::infra::blob_store::BlobStore;
use crate::infra::executor::Executor;
use crate::services::etcd::backup::read_environment;
use crate::services::etcd::command;
use crate::services::os_client::OsClient;
use crate::services::poll::poll_until;

const ETCD_UNIT: &str = "etcd";
const KUBELET_UNIT: &str = "kubelet";

/// 各等待步骤的超时与轮询间隔
#[derive(Clone, Copy, Debug)]
pub struct RestoreTimings {
    pub stop_timeout: Duration,
    pub stop_tick: Duration,
    pub health_timeout: Duration,
    pub health_tick: Duration,
    pub node_timeout: Duration,
    pub node_tick: Duration,
}

impl Default for RestoreTimings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(ETCD_STOP_TIMEOUT_SECS),
            stop_tick: Duration::from_secs(ETCD_STOP_TICK_SECS),
            health_timeout: Duration::from_secs(ETCD_HEALTH_TIMEOUT_SECS),
            health_tick: Duration::from_secs(ETCD_HEALTH_TICK_SECS),
            node_timeout: Duration::from_secs(NODE_READY_TIMEOUT_SECS),
            node_tick: Duration::from_secs(NODE_READY_TICK_SECS),
        }
    }
}

/// Pre 阶段校验通过的 etcd 参数
struct ValidatedEnvironment {
    tls: EtcdClientTls,
    member: EtcdMember,
}

/// 单台主机的恢复管理器
///
/// 会话状态只属于一次运行，不可复用。
pub struct RestoreManager {
    os: OsClient,
    blob: Arc<dyn BlobStore>,
    cluster_name: String,
    paths: EtcdPaths,
    timings: RestoreTimings,
    session: RestoreSession,
    environment: Option<ValidatedEnvironment>,
}

impl RestoreManager {
    pub fn new(
        executor: Arc<dyn Executor>,
        blob: Arc<dyn BlobStore>,
        cluster_name: impl Into<String>,
        paths: EtcdPaths,
        backup_name: impl Into<String>,
    ) -> Self {
        Self {
            os: OsClient::new(executor),
            blob,
            cluster_name: cluster_name.into(),
            paths,
            timings: RestoreTimings::default(),
            session: RestoreSession::new(backup_name),
            environment: None,
        }
    }

    pub fn with_timings(mut self, timings: RestoreTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn host_name(&self) -> &str {
        &self.os.host().name
    }

    pub fn session(&self) -> &RestoreSession {
        &self.session
    }

    fn environment(&self) -> AgentResult<&ValidatedEnvironment> {
        self.environment
            .as_ref()
            .ok_or_else(|| AgentError::InvalidState("etcd environment has not been loaded".to_string()))
    }

    fn local_snapshot_path(&self) -> PathBuf {
        self.paths
            .local_dir
            .join(format!("{}-{}", self.host_name(), self.session.backup_name))
    }

    /// 准备阶段
    pub async fn pre(&mut self, cancel: &CancellationToken) -> AgentResult<()> {
        self.session.expect_ready_for(RestorePhase::Pre)?;
        let host = self.host_name().to_string();

        // 任何变更操作之前先校验环境
        let environment: EtcdEnvironment = read_environment(&self.os, &self.paths.env_file).await?;
        let validated = ValidatedEnvironment {
            tls: environment.client_tls()?,
            member: environment.member()?,
        };
        info!(host = %host, member = %validated.member.name, "etcd environment validated");
        self.environment = Some(validated);

        let backup_dir = self.paths.cluster_backup_dir(&self.cluster_name);
        self.os.executor().ensure_directory(&backup_dir).await?;

        let local = self.local_snapshot_path();
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::transfer(format!("create {}: {}", parent.display(), e)))?;
        }
        let key = blob_key(&self.cluster_name, &self.session.backup_name);
        self.blob.download(&key, &local).await?;
        self.session.local_snapshot = Some(local.clone());
        info!(host = %host, key = %key, path = %local.display(), "Downloaded snapshot");

        let remote = format!("{}/{}", backup_dir, self.session.backup_name);
        self.os.executor().upload(&local, &remote).await?;
        self.session.remote_snapshot = Some(remote.clone());
        self.os.chmod(&remote, "0600").await?;
        info!(host = %host, path = %remote, "Snapshot staged on host");

        self.pause_api_server().await?;
        self.stop_etcd(cancel).await?;
        self.move_data_dir_aside().await?;

        self.session.complete(RestorePhase::Pre);
        Ok(())
    }

    /// 恢复阶段：使用本机环境执行 snapshot restore
    pub async fn restore_etcd(&mut self) -> AgentResult<()> {
        self.session.expect_ready_for(RestorePhase::Restore)?;
        let snapshot = self.session.remote_snapshot()?.to_string();
        let environment = self.environment()?;

        let script = command::snapshot_restore(
            &environment.tls,
            &environment.member,
            &self.paths.data_dir,
            &snapshot,
        );
        let restore = self.os.executor().elevated(&script).await;
        self.os.executor().run_capture(&restore).await?;

        info!(
            host = %self.host_name(),
            snapshot = %snapshot,
            member = %environment.member.name,
            "etcd snapshot restored"
        );
        self.session.complete(RestorePhase::Restore);
        Ok(())
    }

    /// 收尾阶段，清理失败只记录日志
    pub async fn post(&mut self) -> AgentResult<()> {
        self.session.expect_ready_for(RestorePhase::Post)?;
        let host = self.host_name().to_string();

        self.os.start_no_block(ETCD_UNIT).await?;
        info!(host = %host, "etcd start requested");
        self.resume_api_server().await?;

        if let Some(local) = self.session.local_snapshot.take() {
            if let Err(e) = tokio::fs::remove_file(&local).await {
                warn!(host = %host, path = %local.display(), error = %e, "Failed to delete local snapshot");
            }
        }
        if let Some(remote) = self.session.remote_snapshot.clone() {
            if let Err(e) = self.os.remove_file(&remote).await {
                warn!(host = %host, path = %remote, error = %e, "Failed to delete remote snapshot");
            }
        }

        self.session.complete(RestorePhase::Post);
        Ok(())
    }

    /// 验证阶段
    pub async fn verify(&mut self, cancel: &CancellationToken) -> AgentResult<()> {
        self.session.expect_ready_for(RestorePhase::Verify)?;
        let host = self.host_name().to_string();
        let executor = Arc::clone(self.os.executor());

        let health = executor
            .elevated(&command::endpoint_health(&self.environment()?.tls))
            .await;
        poll_until(
            "etcd endpoint health",
            self.timings.health_tick,
            self.timings.health_timeout,
            cancel,
            || async {
                match executor.run_capture(&health).await {
                    Ok(output) => command::is_healthy(&output),
                    Err(e) => {
                        info!(host = %host, error = %e, "etcd not healthy yet");
                        false
                    }
                }
            },
        )
        .await?;
        info!(host = %host, "etcd is healthy");

        self.os.restart(KUBELET_UNIT).await?;

        let node = executor
            .elevated(&command::node_status(&self.paths.kubeconfig, &host))
            .await;
        poll_until(
            "node to become Ready",
            self.timings.node_tick,
            self.timings.node_timeout,
            cancel,
            || async {
                match executor.run_capture(&node).await {
                    Ok(output) => command::is_node_ready(&output),
                    Err(e) => {
                        info!(host = %host, error = %e, "Node status unavailable");
                        false
                    }
                }
            },
        )
        .await?;
        info!(host = %host, "Node is Ready");

        self.session.complete(RestorePhase::Verify);
        Ok(())
    }

    /// 补偿：恢复本次运行暂停的 API server
    pub async fn rollback(&mut self) -> AgentResult<()> {
        if self.session.api_server_paused {
            self.resume_api_server().await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> AgentResult<()> {
        self.os.executor().close().await
    }

    /// 将 kube-apiserver manifest 移出静态 Pod 目录
    async fn pause_api_server(&mut self) -> AgentResult<()> {
        self.os
            .move_path(&self.paths.apiserver_manifest, &self.paths.paused_manifest())
            .await?;
        self.session.api_server_paused = true;
        info!(host = %self.host_name(), "kube-apiserver paused");
        Ok(())
    }

    async fn resume_api_server(&mut self) -> AgentResult<()> {
        if !self.session.api_server_paused {
            return Ok(());
        }
        self.os
            .move_path(&self.paths.paused_manifest(), &self.paths.apiserver_manifest)
            .await?;
        self.session.api_server_paused = false;
        info!(host = %self.host_name(), "kube-apiserver resumed");
        Ok(())
    }

    async fn stop_etcd(&self, cancel: &CancellationToken) -> AgentResult<()> {
        self.os.stop(ETCD_UNIT).await?;
        let os = &self.os;
        poll_until(
            "etcd to stop",
            self.timings.stop_tick,
            self.timings.stop_timeout,
            cancel,
            || async { matches!(os.status(ETCD_UNIT).await, Ok(false)) },
        )
        .await?;
        info!(host = %self.host_name(), "etcd stopped");
        Ok(())
    }

    /// 旧数据目录移到 `<data_backup_root>/<cluster>/etcd-<timestamp>`
    async fn move_data_dir_aside(&mut self) -> AgentResult<()> {
        if !self.os.executor().dir_exists(&self.paths.data_dir).await {
            warn!(host = %self.host_name(), path = %self.paths.data_dir, "etcd data dir not found, nothing to move");
            return Ok(());
        }
        let parent = format!(
            "{}/{}",
            self.paths.data_backup_root.trim_end_matches('/'),
            self.cluster_name
        );
        self.os.executor().ensure_directory(&parent).await?;
        let target = format!("{}/etcd-{}", parent, Local::now().format("%Y%m%d%H%M%S"));
        self.os.move_path(&self.paths.data_dir, &target).await?;
        self.session.data_dir_backup = Some(target);
        Ok(())
    }
}
