//! 命令行入口逻辑
//!
//! 参数解析与各子命令的执行，`main.rs` 只负责运行时与日志初始化。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::env::constants::LOG_CHANNEL_CAPACITY;
use crate::config::{load_inventory, EnvConfig};
use crate::domain::facts::HostFacts;
use crate::domain::host::Host;
use crate::domain::log::LogEntry;
use crate::infra::blob_store::{BlobStore, ObjectStoreBlobStore};
use crate::infra::connector::{Connector, HostConnector};
use crate::infra::executor::{Executor, ShellCommand};
use crate::services::etcd::{
    latest_backup, list_backups, restore_cluster, BackupManager, RestoreOptions, RestoreRequest,
};
use crate::services::os_client::OsClient;

/// 子命令
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Backup,
    Restore {
        /// 快照文件名或 `latest`
        backup: String,
        rollback_on_failure: bool,
    },
    Facts,
    Exec { script: String },
    List,
    Help,
}

/// 命令行覆盖项
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    pub command: Command,
    pub inventory: Option<PathBuf>,
    pub cluster: Option<String>,
    /// 只操作指定主机
    pub host: Option<String>,
}

/// 解析命令行参数（不含程序名）
pub fn parse_args(args: &[String]) -> std::result::Result<RuntimeConfig, String> {
    let mut inventory = None;
    let mut cluster = None;
    let mut host = None;
    let mut backup = None;
    let mut rollback_on_failure = false;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        // exec 之后的参数原样属于命令
        if positional.first().map(String::as_str) == Some("exec") {
            positional.push(args[i].clone());
            i += 1;
            continue;
        }
        let value = |flag: &str| {
            args.get(i + 1)
                .cloned()
                .ok_or_else(|| format!("{} requires a value", flag))
        };
        match args[i].as_str() {
            "--inventory" | "-i" => {
                inventory = Some(PathBuf::from(value("--inventory")?));
                i += 2;
            }
            "--cluster" | "-c" => {
                cluster = Some(value("--cluster")?);
                i += 2;
            }
            "--host" => {
                host = Some(value("--host")?);
                i += 2;
            }
            "--backup" | "-b" => {
                backup = Some(value("--backup")?);
                i += 2;
            }
            "--rollback-on-failure" => {
                rollback_on_failure = true;
                i += 1;
            }
            "--help" | "-h" => {
                positional.clear();
                positional.push("help".to_string());
                break;
            }
            other if other.starts_with('-') => return Err(format!("unknown option {}", other)),
            other => {
                positional.push(other.to_string());
                i += 1;
            }
        }
    }

    let command = match positional.first().map(String::as_str) {
        None | Some("help") => Command::Help,
        Some("backup") => Command::Backup,
        Some("restore") => Command::Restore {
            backup: backup.unwrap_or_else(|| "latest".to_string()),
            rollback_on_failure,
        },
        Some("facts") => Command::Facts,
        Some("list") => Command::List,
        Some("exec") => {
            let script = positional[1..].join(" ");
            if script.trim().is_empty() {
                return Err("exec requires a command".to_string());
            }
            Command::Exec { script }
        }
        Some(other) => return Err(format!("unknown command {}", other)),
    };

    Ok(RuntimeConfig {
        command,
        inventory,
        cluster,
        host,
    })
}

pub fn print_help() {
    println!("XJP Cluster Agent - etcd 备份恢复与远程执行");
    println!();
    println!("USAGE:");
    println!("    xjp-cluster-agent [OPTIONS] <COMMAND>");
    println!();
    println!("OPTIONS:");
    println!("    -i, --inventory <FILE>     Host inventory (JSON)");
    println!("    -c, --cluster <NAME>       Cluster name");
    println!("        --host <NAME>          Only operate on this host");
    println!("    -b, --backup <NAME>        Snapshot to restore (default: latest)");
    println!("        --rollback-on-failure  Resume paused API servers if restore fails");
    println!("    -h, --help                 Print help information");
    println!();
    println!("COMMANDS:");
    println!("    backup                     Snapshot etcd on one host and upload it");
    println!("    restore                    Restore etcd on every host from a snapshot");
    println!("    list                       List snapshots of the cluster");
    println!("    facts                      Print host facts");
    println!("    exec <COMMAND>...          Run a shell command on every host");
    println!();
    println!("ENVIRONMENT:");
    println!("    CLUSTER_AGENT_*            See config::env for the full list");
    println!("    RUST_LOG                   Log filter (default: info)");
}

/// 执行子命令
pub async fn run(runtime: RuntimeConfig) -> Result<()> {
    let mut config = EnvConfig::from_env();
    if let Some(cluster) = runtime.cluster.clone() {
        config.cluster_name = cluster;
    }
    if let Some(inventory) = runtime.inventory.clone() {
        config.inventory_path = inventory;
    }

    match &runtime.command {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::List => {
            let blob = open_blob_store(&config)?;
            for name in list_backups(blob.as_ref(), &config.cluster_name).await? {
                println!("{}", name);
            }
            Ok(())
        }
        Command::Backup => {
            let hosts = select_hosts(&config, runtime.host.as_deref()).await?;
            let host = hosts
                .iter()
                .find(|h| !h.deleted)
                .context("inventory has no active hosts")?;
            backup(&config, host).await
        }
        Command::Restore {
            backup,
            rollback_on_failure,
        } => {
            let hosts = select_hosts(&config, runtime.host.as_deref()).await?;
            restore(&config, &hosts, backup, *rollback_on_failure).await
        }
        Command::Facts => {
            let hosts = select_hosts(&config, runtime.host.as_deref()).await?;
            facts(&config, &hosts).await
        }
        Command::Exec { script } => {
            let hosts = select_hosts(&config, runtime.host.as_deref()).await?;
            exec(&config, &hosts, script).await
        }
    }
}

fn connector(config: &EnvConfig) -> HostConnector {
    HostConnector::new(config.connect_timeout, config.command_timeout)
}

fn open_blob_store(config: &EnvConfig) -> Result<Arc<dyn BlobStore>> {
    let store = ObjectStoreBlobStore::from_settings(&config.blob)?;
    info!(store = %store.describe(), "Blob store ready");
    Ok(Arc::new(store))
}

async fn select_hosts(config: &EnvConfig, only: Option<&str>) -> Result<Vec<Host>> {
    let hosts = load_inventory(&config.inventory_path).await?;
    let hosts: Vec<Host> = match only {
        Some(name) => hosts.into_iter().filter(|h| h.name == name).collect(),
        None => hosts,
    };
    if hosts.is_empty() {
        bail!("no matching hosts in {}", config.inventory_path.display());
    }
    Ok(hosts)
}

async fn backup(config: &EnvConfig, host: &Host) -> Result<()> {
    let blob = open_blob_store(config)?;
    let executor = connector(config).connect(host).await?;
    let manager = BackupManager::new(
        Arc::clone(&executor),
        blob,
        &config.cluster_name,
        config.etcd.clone(),
    );
    let result = manager.backup_etcd().await;
    if let Err(e) = executor.close().await {
        warn!(host = %host.name, error = %e, "Failed to close connection");
    }
    let manifest = result?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

async fn restore(config: &EnvConfig, hosts: &[Host], backup: &str, rollback_on_failure: bool) -> Result<()> {
    let blob = open_blob_store(config)?;
    let backup_name = if backup == "latest" {
        latest_backup(blob.as_ref(), &config.cluster_name).await?
    } else {
        backup.to_string()
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling restore");
            on_signal.cancel();
        }
    });

    let request = RestoreRequest {
        hosts,
        cluster_name: &config.cluster_name,
        backup_name: &backup_name,
        paths: &config.etcd,
        options: RestoreOptions {
            rollback_on_failure,
            ..RestoreOptions::default()
        },
    };
    let report = restore_cluster(request, &connector(config), blob, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[derive(Serialize)]
struct HostFactsReport<'a> {
    host: &'a str,
    address: &'a str,
    facts: HostFacts,
}

async fn facts(config: &EnvConfig, hosts: &[Host]) -> Result<()> {
    let connector = connector(config);
    for host in hosts.iter().filter(|h| !h.deleted) {
        let executor = connector.connect(host).await?;
        let client = OsClient::probe(Arc::clone(&executor)).await;
        let report = HostFactsReport {
            host: &host.name,
            address: &host.address,
            facts: client.facts().clone(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        if let Err(e) = executor.close().await {
            warn!(host = %host.name, error = %e, "Failed to close connection");
        }
    }
    Ok(())
}

async fn exec(config: &EnvConfig, hosts: &[Host], script: &str) -> Result<()> {
    let connector = connector(config);
    let command = ShellCommand::new(script);
    let mut failed = Vec::new();

    for host in hosts.iter().filter(|h| !h.deleted) {
        let executor = connector.connect(host).await?;
        let (result, lines) = stream_to_stdout(executor.as_ref(), &command).await;
        if let Err(e) = result {
            error!(host = %host.name, error = %e, "Command failed");
            failed.push(host.name.clone());
        } else {
            info!(host = %host.name, lines, "Command finished");
        }
        if let Err(e) = executor.close().await {
            warn!(host = %host.name, error = %e, "Failed to close connection");
        }
    }

    if !failed.is_empty() {
        bail!("command failed on {}", failed.join(", "));
    }
    Ok(())
}

/// 流式执行并打印到标准输出，返回执行结果与打印的行数
async fn stream_to_stdout(
    executor: &dyn Executor,
    command: &ShellCommand,
) -> (crate::error::AgentResult<()>, usize) {
    let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
    let name = executor.host().name.clone();
    let printer = tokio::spawn(drain_logs(log_rx, move |entry| {
        if entry.is_error {
            eprintln!("[{}] {}", name, entry.message);
        } else {
            println!("[{}] {}", name, entry.message);
        }
    }));

    let result = executor.run_streaming(command, log_tx).await;
    let lines = printer.await.unwrap_or_else(|e| {
        error!(error = %e, "Log printer task failed");
        0
    });
    (result, lines)
}

/// 消费日志直到终止哨兵，返回非哨兵行数
pub async fn drain_logs(mut log_rx: mpsc::Receiver<LogEntry>, mut print: impl FnMut(&LogEntry) + Send) -> usize {
    let mut lines = 0;
    while let Some(entry) = log_rx.recv().await {
        if entry.is_terminal() {
            break;
        }
        print(&entry);
        lines += 1;
    }
    lines
}
