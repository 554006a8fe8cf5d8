use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::SandboxLimits;
use crate::webhook::review::Operation;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub artifact: ArtifactConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactConfig {
    /// Directory holding `hash`, `sig` and `data`. Supports ${ENV_VAR} substitution
    #[serde(default = "default_artifact_path")]
    pub path: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            path: default_artifact_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,
    #[serde(default = "default_max_stack_kb")]
    pub max_stack_kb: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            memory_limit_mb: default_memory_limit_mb(),
            max_stack_kb: default_max_stack_kb(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    /// Operations the capability is bound to, e.g. ["create", "update"]
    #[serde(default = "default_operations")]
    pub operations: Vec<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            operations: default_operations(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from("/etc/capgate/artifact")
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_memory_limit_mb() -> usize {
    64
}

fn default_max_stack_kb() -> usize {
    1024
}

fn default_operations() -> Vec<String> {
    vec!["update".to_string()]
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address '{addr}': {e}"))
    }
}

impl SandboxConfig {
    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            timeout: Duration::from_millis(self.timeout_ms),
            memory_limit: self.memory_limit_mb * 1024 * 1024,
            max_stack: self.max_stack_kb * 1024,
        }
    }
}

impl WebhookConfig {
    /// Parsed operations. Fails on unknown names and on `connect`, which
    /// cannot carry a hook.
    pub fn operations(&self) -> anyhow::Result<Vec<Operation>> {
        self.operations
            .iter()
            .map(|name| {
                let op: Operation = name.parse()?;
                if op == Operation::Connect {
                    anyhow::bail!("hooks cannot be bound to {op}");
                }
                Ok(op)
            })
            .collect()
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${CAPGATE_ARTIFACT}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Parsing ─────────────────────────────────────────

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.socket_addr().unwrap().to_string(), "0.0.0.0:8443");
        assert_eq!(config.artifact.path, PathBuf::from("/etc/capgate/artifact"));
        assert_eq!(config.sandbox.limits(), SandboxLimits::default());
        assert_eq!(config.webhook.operations().unwrap(), vec![Operation::Update]);
    }

    #[test]
    fn test_full_file() {
        let config: Config = toml::from_str(
            r#"
[server]
host = "127.0.0.1"
port = 9443

[artifact]
path = "/mnt/artifact"

[sandbox]
timeout_ms = 500
memory_limit_mb = 16
max_stack_kb = 256

[webhook]
operations = ["create", "UPDATE", "delete"]
"#,
        )
        .unwrap();
        assert_eq!(config.server.socket_addr().unwrap().port(), 9443);
        let limits = config.sandbox.limits();
        assert_eq!(limits.timeout, Duration::from_millis(500));
        assert_eq!(limits.memory_limit, 16 * 1024 * 1024);
        assert_eq!(limits.max_stack, 256 * 1024);
        assert_eq!(
            config.webhook.operations().unwrap(),
            vec![Operation::Create, Operation::Update, Operation::Delete]
        );
    }

    #[test]
    fn test_connect_operation_rejected() {
        let config: Config = toml::from_str("[webhook]\noperations = [\"connect\"]").unwrap();
        assert!(config.webhook.operations().is_err());
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let config: Config = toml::from_str("[webhook]\noperations = [\"patch\"]").unwrap();
        assert!(config.webhook.operations().is_err());
    }

    #[test]
    fn test_empty_operations_list() {
        let config: Config = toml::from_str("[webhook]\noperations = []").unwrap();
        assert!(config.webhook.operations().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_host() {
        let config: Config = toml::from_str("[server]\nhost = \"not a host\"").unwrap();
        assert!(config.server.socket_addr().is_err());
    }

    // ── Loading ─────────────────────────────────────────

    #[test]
    fn test_load_expands_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capgate.toml");
        std::env::set_var("CAPGATE_TEST_ARTIFACT_DIR", "/srv/artifact");
        std::fs::write(&path, "[artifact]\npath = \"${CAPGATE_TEST_ARTIFACT_DIR}\"\n").unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.artifact.path, PathBuf::from("/srv/artifact"));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/capgate.toml").is_err());
    }
}
