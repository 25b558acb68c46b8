//! 按主机建立执行器

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::host::Host;
use crate::error::AgentResult;
use crate::infra::command::LocalExecutor;
use crate::infra::executor::Executor;
use crate::infra::ssh::{SshExecutor, SshOptions};

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host) -> AgentResult<Arc<dyn Executor>>;
}

/// 回环地址走本地 shell，其余走 SSH
#[derive(Clone, Copy, Debug, Default)]
pub struct HostConnector {
    pub ssh: SshOptions,
}

impl HostConnector {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            ssh: SshOptions {
                connect_timeout,
                command_timeout,
            },
        }
    }
}

pub fn is_local(host: &Host) -> bool {
    matches!(host.address.as_str(), "localhost" | "127.0.0.1" | "::1")
}

#[async_trait]
impl Connector for HostConnector {
    async fn connect(&self, host: &Host) -> AgentResult<Arc<dyn Executor>> {
        if is_local(host) {
            debug!(host = %host.name, "Using local shell");
            let executor = LocalExecutor::with_host(host.clone()).with_timeout(self.ssh.command_timeout);
            return Ok(Arc::new(executor));
        }
        let executor = SshExecutor::connect(host.clone(), self.ssh).await?;
        Ok(Arc::new(executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_local() {
        assert!(is_local(&Host::local()));
        assert!(is_local(&Host::new("me", "localhost", "root")));
        assert!(!is_local(&Host::new("node1", "10.0.0.11", "root")));
    }

    #[tokio::test]
    async fn test_loopback_host_gets_local_executor() {
        let host = Host::new("me", "127.0.0.1", "root");
        let executor = HostConnector::default().connect(&host).await.unwrap();
        assert_eq!(executor.host().name, "me");
        let output = executor.run_capture(&"echo hi".into()).await.unwrap();
        assert_eq!(output.trim(), "hi");
    }
}
