//! 主机身份与可达性

use serde::{Deserialize, Serialize};

/// SSH 认证方式
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    Password {
        password: String,
    },
    PrivateKey {
        /// 私钥文件路径
        path: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password(***)"),
            AuthMethod::PrivateKey { path, .. } => write!(f, "PrivateKey({})", path),
        }
    }
}

/// 受管主机
///
/// 绑定到执行器后视为不可变。
#[derive(Clone, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub internal_address: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// 私钥文件路径
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,
    #[serde(default)]
    pub deleted: bool,
}

fn default_ssh_port() -> u16 {
    22
}

impl Host {
    pub fn new(name: impl Into<String>, address: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            internal_address: None,
            port: default_ssh_port(),
            user: user.into(),
            password: None,
            private_key: None,
            auth_methods: Vec::new(),
            deleted: false,
        }
    }

    /// 代表本机的主机记录，供 `LocalExecutor` 使用
    pub fn local() -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
        Self::new("localhost", "127.0.0.1", user)
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// 按尝试顺序排列的认证方式：显式列表，然后是密码，最后是私钥
    pub fn effective_auth_methods(&self) -> Vec<AuthMethod> {
        let mut methods = self.auth_methods.clone();
        if let Some(password) = self.password.as_ref().filter(|p| !p.is_empty()) {
            methods.push(AuthMethod::Password {
                password: password.clone(),
            });
        }
        if let Some(path) = self.private_key.as_ref().filter(|p| !p.is_empty()) {
            methods.push(AuthMethod::PrivateKey {
                path: path.clone(),
                passphrase: None,
            });
        }
        methods
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("internal_address", &self.internal_address)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key)
            .field("auth_methods", &self.auth_methods)
            .field("deleted", &self.deleted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_auth_order() {
        let mut host = Host::new("master-1", "10.0.0.11", "ops").with_password("s3cret");
        host.private_key = Some("/home/ops/.ssh/id_ed25519".to_string());
        host.auth_methods.push(AuthMethod::PrivateKey {
            path: "/etc/agent/key".to_string(),
            passphrase: None,
        });

        let methods = host.effective_auth_methods();
        assert_eq!(methods.len(), 3);
        assert!(matches!(&methods[0], AuthMethod::PrivateKey { path, .. } if path == "/etc/agent/key"));
        assert!(matches!(&methods[1], AuthMethod::Password { .. }));
        assert!(matches!(&methods[2], AuthMethod::PrivateKey { path, .. } if path.ends_with("id_ed25519")));
    }

    #[test]
    fn test_debug_redacts_password() {
        let host = Host::new("master-1", "10.0.0.11", "ops").with_password("s3cret");
        let rendered = format!("{:?}", host);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_deserialize_inventory_entry() {
        let json = r#"{
            "name": "master-1",
            "address": "192.168.1.10",
            "internal_address": "10.0.0.10",
            "user": "root",
            "password": "pw"
        }"#;
        let host: Host = serde_json::from_str(json).unwrap();
        assert_eq!(host.port, 22);
        assert_eq!(host.internal_address.as_deref(), Some("10.0.0.10"));
        assert_eq!(host.endpoint(), "192.168.1.10:22");
        assert!(!host.deleted);
    }
}
