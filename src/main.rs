//! XJP Cluster Agent - 裸机 Kubernetes 集群运维代理
//!
//! Usage:
//! - Backup etcd: `xjp-cluster-agent -i hosts.json -c prod backup`
//! - Restore the newest snapshot: `xjp-cluster-agent -i hosts.json -c prod restore`
//! - Restore a given snapshot: `xjp-cluster-agent restore --backup etcd-backup-20240309140506042.db`
//! - Run a command everywhere: `xjp-cluster-agent exec systemctl is-active etcd`

use tracing_subscriber::EnvFilter;

use xjp_cluster_agent::app;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match app::parse_args(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("Error: {}", message);
            eprintln!();
            app::print_help();
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(app::run(config)) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
