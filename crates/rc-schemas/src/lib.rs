//! Shared wire/storage types for the remote-control workspace.
//!
//! Every other crate in the workspace depends on this one; it owns no
//! behavior, only the shapes that cross a crate or process boundary.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Probe definitions
// ---------------------------------------------------------------------------

/// Minima enforced on every insert/update (spec.md §3).
pub const MIN_INTERVAL_SECONDS: i64 = 5;
pub const MIN_TIMEOUT_SECONDS: i64 = 1;
pub const MIN_STALE_AFTER_SECONDS: i64 = 10;

/// A configured, periodically-executed health check. Unique by `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeDefinition {
    pub key: String,
    pub probe_type: String,
    pub interval_seconds: i64,
    pub timeout_seconds: i64,
    pub stale_after_seconds: i64,
    pub enabled: bool,
    pub config: Value,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ProbeDefinition {
    /// Clamp numeric fields to their documented minima, deriving
    /// `stale_after_seconds` from `interval_seconds` when unset.
    pub fn clamp(mut self) -> Self {
        self.interval_seconds = self.interval_seconds.max(MIN_INTERVAL_SECONDS);
        self.timeout_seconds = self.timeout_seconds.max(MIN_TIMEOUT_SECONDS);
        self.stale_after_seconds = self.stale_after_seconds.max(MIN_STALE_AFTER_SECONDS);
        self
    }

    pub fn default_stale_after(interval_seconds: i64) -> i64 {
        (interval_seconds * 2).max(120)
    }
}

/// As read from the config document's `scheduled_probes` array. Missing
/// numeric fields fall back to the reference implementation's defaults
/// (interval 60s, timeout 5s) before clamping.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawProbeDefinition {
    pub key: String,
    #[serde(rename = "type")]
    pub probe_type: String,
    #[serde(default)]
    pub interval_seconds: Option<i64>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub stale_after_seconds: Option<i64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Value,
}

fn default_true() -> bool {
    true
}

impl From<RawProbeDefinition> for ProbeDefinition {
    fn from(raw: RawProbeDefinition) -> Self {
        let interval_seconds = raw.interval_seconds.unwrap_or(60);
        let stale_after_seconds = raw
            .stale_after_seconds
            .unwrap_or_else(|| ProbeDefinition::default_stale_after(interval_seconds));
        ProbeDefinition {
            key: raw.key,
            probe_type: raw.probe_type,
            interval_seconds,
            timeout_seconds: raw.timeout_seconds.unwrap_or(5),
            stale_after_seconds,
            enabled: raw.enabled,
            config: if raw.config.is_null() {
                Value::Object(Default::default())
            } else {
                raw.config
            },
            next_run_at: None,
            last_run_at: None,
        }
        .clamp()
    }
}

// ---------------------------------------------------------------------------
// Probe runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Healthy,
    Degraded,
    Error,
    Unknown,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeStatus::Healthy => "healthy",
            ProbeStatus::Degraded => "degraded",
            ProbeStatus::Error => "error",
            ProbeStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ProbeStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(ProbeStatus::Healthy),
            "degraded" => Ok(ProbeStatus::Degraded),
            "error" => Ok(ProbeStatus::Error),
            _ => Ok(ProbeStatus::Unknown),
        }
    }
}

/// The envelope a probe execution returns, before it has a `probe_key` or a
/// persisted `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub latency_ms: f64,
    pub ok: bool,
    pub status: ProbeStatus,
    pub error: String,
    pub payload: Value,
}

/// One append-only history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRun {
    pub id: i64,
    pub probe_key: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub ok: bool,
    pub status: ProbeStatus,
    pub latency_ms: f64,
    pub error: String,
    pub payload: Value,
}

/// The most recent run attached to a definition, as returned by
/// `get_latest_probes`. `None` when the probe has never executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestProbeRun {
    pub run_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub ok: bool,
    pub status: ProbeStatus,
    pub latency_ms: f64,
    pub error: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeWithLatestRun {
    pub key: String,
    pub probe_type: String,
    pub enabled: bool,
    pub interval_seconds: i64,
    pub stale_after_seconds: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub latest_run: Option<LatestProbeRun>,
    pub age_seconds: Option<i64>,
    pub is_stale: bool,
}

// ---------------------------------------------------------------------------
// Action audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Service,
    Container,
}

impl TargetType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "service" => Some(TargetType::Service),
            "container" => Some(TargetType::Container),
            _ => None,
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetType::Service => "service",
            TargetType::Container => "container",
        };
        f.write_str(s)
    }
}

/// An audit row not yet assigned an id (about to be inserted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewActionAudit {
    pub timestamp_utc: DateTime<Utc>,
    pub actor: String,
    pub remote_ip: String,
    pub target_type: TargetType,
    pub target: String,
    pub action: String,
    pub reason: String,
    pub ok: bool,
    pub return_code: Option<i32>,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionAuditRow {
    pub id: i64,
    pub timestamp_utc: DateTime<Utc>,
    pub actor: String,
    pub remote_ip: String,
    pub target_type: TargetType,
    pub target: String,
    pub action: String,
    pub reason: String,
    pub ok: bool,
    pub return_code: Option<i32>,
    pub stderr: String,
}

// ---------------------------------------------------------------------------
// Configuration document (`$RC_CONFIG_PATH`)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpCheckTarget {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_tcp_timeout")]
    pub timeout_seconds: f64,
}

fn default_tcp_timeout() -> f64 {
    1.5
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TargetsConfig {
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub tcp_checks: Vec<TcpCheckTarget>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ActionsConfig {
    #[serde(default)]
    pub service: Vec<String>,
    #[serde(default)]
    pub container: Vec<String>,
}

impl ActionsConfig {
    pub fn for_target_type(&self, tt: TargetType) -> &[String] {
        match tt {
            TargetType::Service => &self.service,
            TargetType::Container => &self.container,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub scheduled_probes: Vec<RawProbeDefinition>,
}

// ---------------------------------------------------------------------------
// HTTP API request/response bodies
// ---------------------------------------------------------------------------

/// Body of `POST /api/v1/action`. Kept as raw strings (not a typed enum) so
/// an unrecognized `target_type`/`action` is a validation-pipeline rejection
/// rather than a JSON deserialization failure — they carry different status
/// codes (400 vs 403).
#[derive(Debug, Clone, Deserialize)]
pub struct ActionRequest {
    pub target_type: String,
    pub action: String,
    pub target: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionResponse {
    pub ok: bool,
    pub target_type: String,
    pub target: String,
    pub action: String,
    pub reason: String,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub timestamp_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunProbeRequest {
    pub key: String,
}

// ---------------------------------------------------------------------------
// Subprocess / helper wire protocol
// ---------------------------------------------------------------------------

/// Normalized outcome of any executed subprocess, control-plane or helper
/// side. A timeout is represented here, not raised as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub ok: bool,
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn timed_out(seconds: u64) -> Self {
        CommandResult {
            ok: false,
            return_code: -1,
            stdout: String::new(),
            stderr: format!("Command timed out after {seconds}s"),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        CommandResult {
            ok: false,
            return_code: -1,
            stdout: String::new(),
            stderr: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub status: String,
    pub image: String,
    pub ports: String,
}

/// One request/response exchange on the helper's Unix stream socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HelperRequest {
    ContainerStatusMap,
    ServiceAction { action: String, target: String },
    ContainerAction { action: String, target: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperResponse {
    #[serde(flatten)]
    pub result: CommandResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<BTreeMap<String, ContainerStatus>>,
}

impl HelperResponse {
    pub fn from_result(result: CommandResult) -> Self {
        HelperResponse {
            result,
            containers: None,
        }
    }
}
