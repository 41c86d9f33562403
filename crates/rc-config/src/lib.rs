//! Runtime configuration: the `$RC_CONFIG_PATH` document plus the handful of
//! environment variables that tune the daemon and helper.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rc_schemas::ConfigDocument;

pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_BIND_PORT: u16 = 8765;
pub const DEFAULT_MAX_AUDIT_LIMIT: i64 = 500;
pub const DEFAULT_MAX_BODY_BYTES: usize = 16_384;
pub const DEFAULT_PROBE_TICK_SECONDS: f64 = 2.0;
pub const MIN_PROBE_TICK_SECONDS: f64 = 1.0;
pub const DEFAULT_HELPER_SOCKET_PATH: &str = "/run/rc-control/helper.sock";
pub const DEFAULT_HELPER_SOCKET_GROUP: &str = "tewelde";

/// Fully resolved configuration for the control-plane daemon.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub db_path: PathBuf,
    pub admin_token: Option<String>,
    pub max_audit_limit: i64,
    pub max_body_bytes: usize,
    pub probe_tick_seconds: f64,
    pub helper_socket_path: PathBuf,
    pub document: ConfigDocument,
}

impl AppConfig {
    /// Load from the process environment, reading the config document from
    /// `$RC_CONFIG_PATH` (defaulting to `config/config.json` next to the
    /// running binary).
    pub fn from_env() -> Result<Self> {
        let config_path = config_path_from_env();
        let document = load_config_document(&config_path)
            .with_context(|| format!("loading config document from {}", config_path.display()))?;

        Ok(AppConfig {
            bind_host: env::var("RC_BIND_HOST").unwrap_or_else(|_| DEFAULT_BIND_HOST.to_string()),
            bind_port: env_u16("RC_BIND_PORT", DEFAULT_BIND_PORT),
            db_path: env::var("RC_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_db_path()),
            admin_token: env::var("RC_ADMIN_TOKEN").ok().filter(|s| !s.is_empty()),
            max_audit_limit: env_i64("RC_MAX_AUDIT_LIMIT", DEFAULT_MAX_AUDIT_LIMIT),
            max_body_bytes: env_usize("RC_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES),
            probe_tick_seconds: env_f64("RC_PROBE_TICK_SECONDS", DEFAULT_PROBE_TICK_SECONDS)
                .max(MIN_PROBE_TICK_SECONDS),
            helper_socket_path: env::var("RC_HELPER_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_HELPER_SOCKET_PATH)),
            document,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }
}

/// Configuration read by the privileged helper. Deliberately independent of
/// `AppConfig` — the helper runs as a separate process and must not inherit
/// the control plane's admin token or bind address.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    pub socket_path: PathBuf,
    pub socket_group: String,
    pub max_body_bytes: usize,
}

impl HelperConfig {
    pub fn from_env() -> Self {
        HelperConfig {
            socket_path: env::var("RC_HELPER_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_HELPER_SOCKET_PATH)),
            socket_group: env::var("RC_HELPER_SOCKET_GROUP")
                .unwrap_or_else(|_| DEFAULT_HELPER_SOCKET_GROUP.to_string()),
            max_body_bytes: env_usize("RC_HELPER_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES),
        }
    }
}

fn config_path_from_env() -> PathBuf {
    env::var("RC_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/config.json"))
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/health.sqlite3")
}

pub fn load_config_document(path: &Path) -> Result<ConfigDocument> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing config file {} as JSON", path.display()))
}

fn env_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"targets": {{"services": ["nginx"]}}, "actions": {{"service": ["restart"]}}, "scheduled_probes": []}}"#
        )
        .unwrap();

        let doc = load_config_document(file.path()).unwrap();
        assert_eq!(doc.targets.services, vec!["nginx".to_string()]);
        assert_eq!(doc.actions.service, vec!["restart".to_string()]);
        assert!(doc.scheduled_probes.is_empty());
    }

    #[test]
    fn rejects_missing_file() {
        let err = load_config_document(Path::new("/nonexistent/config.json"));
        assert!(err.is_err());
    }
}
