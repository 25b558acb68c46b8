//! 主机清单
//!
//! JSON 数组，每个元素是一个 `Host`：
//!
//! ```json
//! [
//!   { "name": "master-1", "address": "10.0.0.11", "user": "root", "private_key": "/root/.ssh/id_rsa" },
//!   { "name": "master-2", "address": "10.0.0.12", "user": "ops", "password": "..." }
//! ]
//! ```

use std::collections::HashSet;
use std::path::Path;

use tracing::info;

use crate::domain::host::Host;
use crate::error::{AgentError, AgentResult};

/// 读取并校验主机清单
pub async fn load_inventory(path: &Path) -> AgentResult<Vec<Host>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AgentError::config(format!("read inventory {}: {}", path.display(), e)))?;
    let hosts = parse_inventory(&content)
        .map_err(|e| AgentError::config(format!("inventory {}: {}", path.display(), e)))?;
    info!(path = %path.display(), hosts = hosts.len(), "Loaded inventory");
    Ok(hosts)
}

fn parse_inventory(content: &str) -> Result<Vec<Host>, String> {
    let hosts: Vec<Host> = serde_json::from_str(content).map_err(|e| e.to_string())?;

    let mut seen = HashSet::new();
    for host in &hosts {
        if host.name.trim().is_empty() || host.address.trim().is_empty() {
            return Err("every host needs a name and an address".to_string());
        }
        if !seen.insert(host.name.as_str()) {
            return Err(format!("duplicate host name {}", host.name));
        }
    }
    Ok(hosts)
}
