//! etcdctl / kubectl 命令构造与输出解析

use crate::domain::etcd::{EtcdClientTls, EtcdMember};
use crate::infra::executor::quote;

fn etcdctl(tls: &EtcdClientTls) -> String {
    format!(
        "ETCDCTL_API=3 etcdctl --cacert={} --key={} --cert={} --endpoints={}",
        quote(&tls.ca_file),
        quote(&tls.key_file),
        quote(&tls.cert_file),
        quote(&tls.endpoints)
    )
}

pub fn snapshot_save(tls: &EtcdClientTls, snapshot_path: &str) -> String {
    format!("{} snapshot save {}", etcdctl(tls), quote(snapshot_path))
}

pub fn snapshot_restore(tls: &EtcdClientTls, member: &EtcdMember, data_dir: &str, snapshot_path: &str) -> String {
    format!(
        "{} --name={} --initial-cluster={} --initial-advertise-peer-urls={} --data-dir={} snapshot restore {}",
        etcdctl(tls),
        quote(&member.name),
        quote(&member.initial_cluster),
        quote(&member.initial_advertise_peer_urls),
        quote(data_dir),
        quote(snapshot_path)
    )
}

pub fn endpoint_health(tls: &EtcdClientTls) -> String {
    format!("{} endpoint health", etcdctl(tls))
}

pub fn node_status(kubeconfig: &str, node: &str) -> String {
    format!(
        "kubectl --kubeconfig={} get node {} --no-headers",
        quote(kubeconfig),
        quote(node)
    )
}

/// `endpoint health` 输出中每个端点都报告 healthy
pub fn is_healthy(output: &str) -> bool {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    !lines.is_empty()
        && lines.iter().any(|l| l.contains("is healthy"))
        && !lines.iter().any(|l| l.contains("is unhealthy"))
}

/// `kubectl get node --no-headers` 第二列为 `Ready`
pub fn is_node_ready(output: &str) -> bool {
    output
        .lines()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| l.split_whitespace().nth(1))
        .map(|status| status == "Ready")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls() -> EtcdClientTls {
        EtcdClientTls {
            ca_file: "/etc/ssl/etcd/ssl/ca.pem".to_string(),
            key_file: "/etc/ssl/etcd/ssl/admin-node1-key.pem".to_string(),
            cert_file: "/etc/ssl/etcd/ssl/admin-node1.pem".to_string(),
            endpoints: "https://10.0.0.11:2379".to_string(),
        }
    }

    #[test]
    fn test_snapshot_save() {
        assert_eq!(
            snapshot_save(&tls(), "/data/backup/prod/etcd-backup-1.db"),
            "ETCDCTL_API=3 etcdctl --cacert=/etc/ssl/etcd/ssl/ca.pem --key=/etc/ssl/etcd/ssl/admin-node1-key.pem \
             --cert=/etc/ssl/etcd/ssl/admin-node1.pem --endpoints=https://10.0.0.11:2379 snapshot save \
             /data/backup/prod/etcd-backup-1.db"
        );
    }

    #[test]
    fn test_snapshot_restore_uses_member_identity() {
        let member = EtcdMember {
            name: "etcd1".to_string(),
            initial_cluster: "etcd1=https://10.0.0.11:2380,etcd2=https://10.0.0.12:2380".to_string(),
            initial_advertise_peer_urls: "https://10.0.0.11:2380".to_string(),
        };
        let command = snapshot_restore(&tls(), &member, "/var/lib/etcd", "/data/backup/prod/snap.db");
        assert!(command.contains("--name=etcd1"));
        assert!(command.contains("--initial-cluster=etcd1=https://10.0.0.11:2380,etcd2=https://10.0.0.12:2380"));
        assert!(command.contains("--data-dir=/var/lib/etcd"));
        assert!(command.ends_with("snapshot restore /data/backup/prod/snap.db"));
    }

    #[test]
    fn test_is_healthy() {
        assert!(is_healthy(
            "https://10.0.0.11:2379 is healthy: successfully committed proposal: took = 9.2ms\n"
        ));
        assert!(!is_healthy(
            "https://10.0.0.11:2379 is unhealthy: failed to commit proposal: context deadline exceeded\n"
        ));
        assert!(!is_healthy(""));
    }

    #[test]
    fn test_is_node_ready() {
        assert!(is_node_ready("node1   Ready    control-plane   12d   v1.29.3\n"));
        assert!(!is_node_ready("node1   NotReady control-plane   12d   v1.29.3\n"));
        assert!(!is_node_ready("node1   Ready,SchedulingDisabled   control-plane   12d   v1.29.3\n"));
        assert!(!is_node_ready(""));
    }
}
