//! 多节点 etcd 恢复编排
//!
//! 先连接所有主机，再按 Pre → Restore → Post → Verify 逐阶段推进，
//! 每个阶段内按主机顺序执行。任一主机任一阶段失败即终止（fail-fast），
//! 已执行过的阶段不回滚；可选地恢复本次暂停过的 API server。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::env::EtcdPaths;
use crate::domain::etcd::RestorePhase;
use crate::domain::host::Host;
use crate::error::{AgentError, AgentResult, RestoreError};
use crate::infra::blob_store::BlobStore;
use crate::infra::connector::Connector;
use crate::services::etcd::restore::{RestoreManager, RestoreTimings};

/// 可被编排的单主机恢复步骤
#[async_trait]
pub trait RestoreStep: Send {
    fn host_name(&self) -> &str;

    async fn run_phase(&mut self, phase: RestorePhase, cancel: &CancellationToken) -> AgentResult<()>;

    /// 失败后的补偿动作
    async fn rollback(&mut self) -> AgentResult<()>;

    async fn close(&mut self) -> AgentResult<()>;
}

#[async_trait]
impl RestoreStep for RestoreManager {
    fn host_name(&self) -> &str {
        RestoreManager::host_name(self)
    }

    async fn run_phase(&mut self, phase: RestorePhase, cancel: &CancellationToken) -> AgentResult<()> {
        match phase {
            RestorePhase::Connect => Ok(()),
            RestorePhase::Pre => self.pre(cancel).await,
            RestorePhase::Restore => self.restore_etcd().await,
            RestorePhase::Post => self.post().await,
            RestorePhase::Verify => self.verify(cancel).await,
        }
    }

    async fn rollback(&mut self) -> AgentResult<()> {
        RestoreManager::rollback(self).await
    }

    async fn close(&mut self) -> AgentResult<()> {
        RestoreManager::close(self).await
    }
}

/// 恢复选项
#[derive(Clone, Copy, Debug, Default)]
pub struct RestoreOptions {
    /// 失败时恢复本次暂停的 API server
    pub rollback_on_failure: bool,
    pub timings: RestoreTimings,
}

/// 恢复结果摘要
#[derive(Clone, Debug, Serialize)]
pub struct RestoreReport {
    pub cluster_name: String,
    pub backup_name: String,
    pub hosts: Vec<String>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

/// 恢复请求
pub struct RestoreRequest<'a> {
    pub hosts: &'a [Host],
    pub cluster_name: &'a str,
    pub backup_name: &'a str,
    pub paths: &'a EtcdPaths,
    pub options: RestoreOptions,
}

/// 恢复整个集群
///
/// 无论成败，所有已建立的连接都会在返回前关闭。
pub async fn restore_cluster(
    request: RestoreRequest<'_>,
    connector: &dyn Connector,
    blob: Arc<dyn BlobStore>,
    cancel: &CancellationToken,
) -> Result<RestoreReport, RestoreError> {
    let started_at = Local::now();
    let hosts: Vec<&Host> = request.hosts.iter().filter(|h| !h.deleted).collect();
    for skipped in request.hosts.iter().filter(|h| h.deleted) {
        info!(host = %skipped.name, "Skipping host marked as deleted");
    }

    info!(
        cluster = %request.cluster_name,
        backup = %request.backup_name,
        hosts = hosts.len(),
        "Starting etcd cluster restore"
    );

    let mut managers = Vec::with_capacity(hosts.len());
    for host in &hosts {
        match connector.connect(host).await {
            Ok(executor) => managers.push(
                RestoreManager::new(
                    executor,
                    Arc::clone(&blob),
                    request.cluster_name,
                    request.paths.clone(),
                    request.backup_name,
                )
                .with_timings(request.options.timings),
            ),
            Err(source) => {
                error!(host = %host.name, kind = source.kind(), error = %source, "Failed to connect");
                close_all(&mut managers).await;
                return Err(RestoreError::new(&host.name, RestorePhase::Connect, source));
            }
        }
    }

    let result = run_phased(&mut managers, request.options, cancel).await;
    close_all(&mut managers).await;
    result?;

    let report = RestoreReport {
        cluster_name: request.cluster_name.to_string(),
        backup_name: request.backup_name.to_string(),
        hosts: hosts.iter().map(|h| h.name.clone()).collect(),
        started_at,
        finished_at: Local::now(),
    };
    info!(cluster = %report.cluster_name, backup = %report.backup_name, "etcd cluster restored");
    Ok(report)
}

/// 逐阶段推进所有主机，首个失败即返回
pub async fn run_phased<S: RestoreStep>(
    steps: &mut [S],
    options: RestoreOptions,
    cancel: &CancellationToken,
) -> Result<(), RestoreError> {
    for phase in RestorePhase::sweeps() {
        info!(phase = %phase, hosts = steps.len(), "Starting restore sweep");
        for index in 0..steps.len() {
            let step = &mut steps[index];
            let outcome = if cancel.is_cancelled() {
                Err(AgentError::Cancelled(format!("{} phase", phase)))
            } else {
                step.run_phase(phase, cancel).await
            };

            if let Err(source) = outcome {
                let err = RestoreError::new(step.host_name(), phase, source);
                error!(host = %err.host, phase = %phase, kind = err.source.kind(), error = %err.source, "Restore aborted");
                if options.rollback_on_failure {
                    rollback_all(steps).await;
                }
                return Err(err);
            }
            info!(host = %step.host_name(), phase = %phase, "Phase completed");
        }
    }
    Ok(())
}

async fn rollback_all<S: RestoreStep>(steps: &mut [S]) {
    for step in steps.iter_mut() {
        if let Err(e) = step.rollback().await {
            warn!(host = %step.host_name(), error = %e, "Rollback failed");
        }
    }
}

async fn close_all<S: RestoreStep>(steps: &mut [S]) {
    for step in steps.iter_mut() {
        if let Err(e) = step.close().await {
            warn!(host = %step.host_name(), error = %e, "Failed to close connection");
        }
    }
}
