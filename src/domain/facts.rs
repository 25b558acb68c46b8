//! 主机事实快照

use serde::Serialize;

/// 探测失败时的占位值
pub const UNKNOWN: &str = "Unknown";

/// 主机事实
///
/// 构造时探测一次，之后只读，不会自动刷新。
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct HostFacts {
    pub distro_id: String,
    pub distro_version: String,
    pub arch: String,
    pub cpu_model: String,
    pub cpu_cores: String,
    pub memory_size: String,
    pub disk_size: String,
    pub interfaces: Vec<String>,
}

impl Default for HostFacts {
    fn default() -> Self {
        Self {
            distro_id: UNKNOWN.to_string(),
            distro_version: UNKNOWN.to_string(),
            arch: UNKNOWN.to_string(),
            cpu_model: UNKNOWN.to_string(),
            cpu_cores: UNKNOWN.to_string(),
            memory_size: UNKNOWN.to_string(),
            disk_size: UNKNOWN.to_string(),
            interfaces: vec![UNKNOWN.to_string()],
        }
    }
}

/// 解析 `/etc/os-release`，返回 `(ID, VERSION_ID)`
pub fn parse_os_release(output: &str) -> (String, String) {
    let mut id = UNKNOWN.to_string();
    let mut version = UNKNOWN.to_string();
    for line in output.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("ID=") {
            id = unquote(value).to_string();
        } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
            version = unquote(value).to_string();
        }
    }
    (id, version)
}

/// 解析 `ip addr show` 精简后的接口名列表（每行一个）
pub fn parse_interfaces(output: &str) -> Vec<String> {
    let interfaces: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.trim_end_matches(':').to_string())
        .collect();
    if interfaces.is_empty() {
        vec![UNKNOWN.to_string()]
    } else {
        interfaces
    }
}

/// 探测输出转为单个事实值，空输出视为未知
pub fn single_value(output: &str) -> String {
    let value = output.trim();
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value.to_string()
    }
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"').trim_matches('\'')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_release() {
        let output = "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\nID_LIKE=debian\n";
        let (id, version) = parse_os_release(output);
        assert_eq!(id, "ubuntu");
        assert_eq!(version, "22.04");
    }

    #[test]
    fn test_parse_os_release_missing_fields() {
        let (id, version) = parse_os_release("NAME=Something\n");
        assert_eq!(id, UNKNOWN);
        assert_eq!(version, UNKNOWN);
    }

    #[test]
    fn test_parse_interfaces() {
        assert_eq!(parse_interfaces("lo\neth0\ncali12ab\n"), vec!["lo", "eth0", "cali12ab"]);
        assert_eq!(parse_interfaces("\n"), vec![UNKNOWN]);
    }

    #[test]
    fn test_single_value() {
        assert_eq!(single_value(" 8\n"), "8");
        assert_eq!(single_value("   "), UNKNOWN);
    }
}
