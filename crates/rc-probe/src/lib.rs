//! Stateless execution of the four probe types: `tcp_check`, `http_check`,
//! and the two composite checks (`sms_health`, `nid_health`) built out of
//! them plus an optional database backlog check.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use rc_schemas::{ProbeDefinition, ProbeResult, ProbeStatus};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;

const MAX_HTTP_SAMPLE_BYTES: usize = 512;
const MAX_HTTP_SAMPLE_CHARS: usize = 200;

#[derive(Clone)]
pub struct ProbeRunner {
    http: reqwest::Client,
}

impl Default for ProbeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeRunner {
    pub fn new() -> Self {
        ProbeRunner {
            http: reqwest::Client::new(),
        }
    }

    /// Run `def` and wrap the outcome (or failure to even start) into a
    /// `ProbeResult`. This never returns an `Err` — an unsupported
    /// `probe_type` or a malformed config produces a `status: error` result.
    pub async fn run(&self, def: &ProbeDefinition) -> ProbeResult {
        let started_at = Utc::now();
        let outcome = match def.probe_type.as_str() {
            "tcp_check" => self.run_tcp_definition(def).await,
            "http_check" => self.run_http_definition(def).await,
            "sms_health" => self.run_sms_health(def).await,
            "nid_health" => self.run_nid_health(def).await,
            other => Err(anyhow::anyhow!("unsupported probe_type: {other}")),
        };
        let ended_at = Utc::now();
        let latency_ms = (ended_at - started_at).num_milliseconds() as f64;

        match outcome {
            Ok((ok, status, payload)) => ProbeResult {
                started_at,
                ended_at,
                latency_ms,
                ok,
                status,
                error: String::new(),
                payload,
            },
            Err(e) => ProbeResult {
                started_at,
                ended_at,
                latency_ms,
                ok: false,
                status: ProbeStatus::Error,
                error: e.to_string(),
                payload: json!({}),
            },
        }
    }

    async fn run_tcp_definition(&self, def: &ProbeDefinition) -> Result<(bool, ProbeStatus, Value)> {
        let host = cfg_str(&def.config, "host", "");
        let port = cfg_i64(&def.config, "port", 0);
        if port <= 0 {
            anyhow::bail!("tcp_check requires a positive port");
        }
        let effective_timeout = Duration::from_secs(def.timeout_seconds.clamp(1, 10) as u64);
        let outcome = tcp_check(&host, port as u16, effective_timeout).await;
        let ok = outcome.ok;
        let status = if ok { ProbeStatus::Healthy } else { ProbeStatus::Degraded };
        Ok((ok, status, serde_json::to_value(outcome)?))
    }

    async fn run_http_definition(&self, def: &ProbeDefinition) -> Result<(bool, ProbeStatus, Value)> {
        let url = cfg_str(&def.config, "url", "");
        if url.is_empty() {
            anyhow::bail!("http_check requires a non-empty url");
        }
        let method = cfg_str(&def.config, "method", "GET");
        let expected_status = expected_status_list(&def.config);
        let allow_4xx = cfg_bool(&def.config, "allow_4xx", true);
        let effective_timeout = Duration::from_secs(def.timeout_seconds.clamp(1, 20) as u64);

        let outcome = http_probe(
            &self.http,
            &url,
            effective_timeout,
            &method,
            &expected_status,
            allow_4xx,
        )
        .await;
        let ok = outcome.ok;
        let status = if ok { ProbeStatus::Healthy } else { ProbeStatus::Degraded };
        Ok((ok, status, serde_json::to_value(outcome)?))
    }

    async fn run_sms_health(&self, def: &ProbeDefinition) -> Result<(bool, ProbeStatus, Value)> {
        let cfg = &def.config;
        let base_url_env = cfg_str(cfg, "afro_base_url_env", "AFRO_SMS_BASE_URL");
        let base_url = std::env::var(&base_url_env)
            .ok()
            .unwrap_or_else(|| cfg_str(cfg, "afro_base_url", "https://api.afromessage.com/api"));

        let mut steps = Vec::new();

        let (host, port) = parse_url_host_port(&base_url).unwrap_or_else(|| ("".to_string(), 0));
        let tcp_timeout = Duration::from_secs(def.timeout_seconds.clamp(1, 5) as u64);
        let tcp_outcome = tcp_check(&host, port, tcp_timeout).await;
        steps.push(StepResult {
            name: "provider_tcp".to_string(),
            ok: tcp_outcome.ok,
            skipped: false,
            detail: serde_json::to_value(&tcp_outcome)?,
        });

        let http_timeout = Duration::from_secs(def.timeout_seconds.clamp(1, 8) as u64);
        let http_outcome = http_probe(&self.http, &base_url, http_timeout, "GET", &[], true).await;
        steps.push(StepResult {
            name: "provider_http".to_string(),
            ok: http_outcome.ok,
            skipped: false,
            detail: serde_json::to_value(&http_outcome)?,
        });

        let dsn_env = cfg_str(cfg, "pg_dsn_env", "RC_PG_DSN");
        let dsn = cfg
            .get("pg_dsn")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| std::env::var(&dsn_env).ok())
            .filter(|s| !s.is_empty());

        match dsn {
            Some(dsn) => {
                let outbox_query = cfg_str(
                    cfg,
                    "outbox_count_query",
                    "SELECT COUNT(*) FROM cis_messaging.cis_sms WHERE status='Outbox';",
                );
                let max_outbox = cfg_i64(cfg, "max_outbox", 200);
                let failed_recent_rows = cfg_i64(cfg, "failed_recent_rows", 200);
                let failed_recent_query = cfg_str(
                    cfg,
                    "failed_recent_query",
                    &default_failed_recent_query(failed_recent_rows),
                );
                let max_failed_recent = cfg_i64(cfg, "max_failed_recent", 20);
                let psql_timeout = Duration::from_secs(def.timeout_seconds.clamp(1, 10) as u64);

                let outbox_detail =
                    match psql_scalar(&dsn, &outbox_query, psql_timeout).await {
                        Ok(value) => {
                            let count: i64 = value.trim().parse().unwrap_or(i64::MAX);
                            (count <= max_outbox, json!({"count": count, "max": max_outbox}))
                        }
                        Err(e) => (false, json!({"error": e.to_string()})),
                    };
                let failed_detail =
                    match psql_scalar(&dsn, &failed_recent_query, psql_timeout).await {
                        Ok(value) => {
                            let count: i64 = value.trim().parse().unwrap_or(i64::MAX);
                            (count <= max_failed_recent, json!({"count": count, "max": max_failed_recent}))
                        }
                        Err(e) => (false, json!({"error": e.to_string()})),
                    };

                steps.push(StepResult {
                    name: "db_outbox_backlog".to_string(),
                    ok: outbox_detail.0,
                    skipped: false,
                    detail: outbox_detail.1,
                });
                steps.push(StepResult {
                    name: "db_failed_recent".to_string(),
                    ok: failed_detail.0,
                    skipped: false,
                    detail: failed_detail.1,
                });
            }
            None => steps.push(StepResult {
                name: "db_checks".to_string(),
                ok: true,
                skipped: true,
                detail: json!({"reason": "no pg_dsn configured"}),
            }),
        }

        let (ok, status) = composite_status(&steps);
        Ok((ok, status, json!({ "steps": steps })))
    }

    async fn run_nid_health(&self, def: &ProbeDefinition) -> Result<(bool, ProbeStatus, Value)> {
        let cfg = &def.config;
        let base_url_env = cfg_str(cfg, "base_url_env", "NID_BASE_URL");
        let base_url = std::env::var(&base_url_env)
            .ok()
            .unwrap_or_else(|| cfg_str(cfg, "base_url", "http://196.188.240.67/gateway"));
        let request_data_url = cfg
            .get("request_data_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{base_url}/nid/requestData"));
        let get_data_url = cfg
            .get("get_data_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{base_url}/nid/getData"));

        let mut steps = Vec::new();

        let (host, port) = parse_url_host_port(&base_url).unwrap_or_else(|| ("".to_string(), 0));
        let tcp_timeout = Duration::from_secs(def.timeout_seconds.clamp(1, 10) as u64);
        let tcp_outcome = tcp_check(&host, port, tcp_timeout).await;
        steps.push(StepResult {
            name: "gateway_tcp".to_string(),
            ok: tcp_outcome.ok,
            skipped: false,
            detail: serde_json::to_value(&tcp_outcome)?,
        });

        let http_timeout = Duration::from_secs(def.timeout_seconds.clamp(1, 20) as u64);
        for (name, url) in [
            ("gateway_http_base", base_url.clone()),
            ("gateway_http_requestData_endpoint", request_data_url),
            ("gateway_http_getData_endpoint", get_data_url),
        ] {
            let outcome = http_probe(&self.http, &url, http_timeout, "GET", &[], true).await;
            steps.push(StepResult {
                name: name.to_string(),
                ok: outcome.ok,
                skipped: false,
                detail: serde_json::to_value(&outcome)?,
            });
        }

        let (ok, status) = composite_status(&steps);
        Ok((ok, status, json!({ "steps": steps })))
    }
}

#[derive(Debug, Clone, Serialize)]
struct StepResult {
    name: String,
    ok: bool,
    skipped: bool,
    detail: Value,
}

fn step_is_ok(step: &StepResult) -> bool {
    step.skipped || step.ok
}

/// Healthy if every step passed (or was explicitly skipped); error if none
/// did; degraded in between.
fn composite_status(steps: &[StepResult]) -> (bool, ProbeStatus) {
    let all_ok = steps.iter().all(step_is_ok);
    if all_ok {
        return (true, ProbeStatus::Healthy);
    }
    let any_ok = steps.iter().any(step_is_ok);
    (false, if any_ok { ProbeStatus::Degraded } else { ProbeStatus::Error })
}

fn default_failed_recent_query(rows: i64) -> String {
    format!(
        "SELECT COUNT(*) FROM (SELECT r.success FROM cis_messaging.cis_sms_result r \
         JOIN cis_messaging.cis_sms s ON s.id = r.sms_id \
         ORDER BY s.create_time DESC LIMIT {rows}) t WHERE t.success = false;"
    )
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TcpCheckOutcome {
    pub host: String,
    pub port: u16,
    pub ok: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
}

pub async fn tcp_check(host: &str, port: u16, timeout_dur: Duration) -> TcpCheckOutcome {
    let started = std::time::Instant::now();
    let addr = format!("{host}:{port}");
    let outcome = timeout(timeout_dur, TcpStream::connect(&addr)).await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        Ok(Ok(_stream)) => TcpCheckOutcome {
            host: host.to_string(),
            port,
            ok: true,
            latency_ms,
            error: None,
        },
        Ok(Err(e)) => TcpCheckOutcome {
            host: host.to_string(),
            port,
            ok: false,
            latency_ms,
            error: Some(e.to_string()),
        },
        Err(_) => TcpCheckOutcome {
            host: host.to_string(),
            port,
            ok: false,
            latency_ms,
            error: Some(format!("timed out after {}s", timeout_dur.as_secs())),
        },
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HttpCheckOutcome {
    pub url: String,
    pub method: String,
    pub status_code: u16,
    pub ok: bool,
    pub error: Option<String>,
    pub latency_ms: f64,
    pub sample: Option<String>,
}

pub async fn http_probe(
    client: &reqwest::Client,
    url: &str,
    timeout_dur: Duration,
    method: &str,
    expected_status: &[u16],
    allow_4xx: bool,
) -> HttpCheckOutcome {
    let started = std::time::Instant::now();
    let method_parsed = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);
    let request = client.request(method_parsed.clone(), url).timeout(timeout_dur);

    let result = async {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let sample = read_sample(response).await;
        Ok::<_, reqwest::Error>((status, sample))
    }
    .await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok((status, sample)) => {
            let ok = status_is_ok(status, expected_status, allow_4xx);
            HttpCheckOutcome {
                url: url.to_string(),
                method: method_parsed.to_string(),
                status_code: status,
                ok,
                error: None,
                latency_ms,
                sample: Some(sample),
            }
        }
        Err(e) => HttpCheckOutcome {
            url: url.to_string(),
            method: method_parsed.to_string(),
            status_code: 0,
            ok: false,
            error: Some(e.to_string()),
            latency_ms,
            sample: None,
        },
    }
}

fn status_is_ok(status: u16, expected_status: &[u16], allow_4xx: bool) -> bool {
    if !expected_status.is_empty() {
        expected_status.contains(&status)
    } else if allow_4xx {
        status < 500
    } else {
        (200..400).contains(&status)
    }
}

async fn read_sample(response: reqwest::Response) -> String {
    let mut stream = response.bytes_stream();
    let mut buf = Vec::with_capacity(MAX_HTTP_SAMPLE_BYTES);
    while buf.len() < MAX_HTTP_SAMPLE_BYTES {
        match stream.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    buf.truncate(MAX_HTTP_SAMPLE_BYTES);
    let text = String::from_utf8_lossy(&buf);
    text.chars().take(MAX_HTTP_SAMPLE_CHARS).collect()
}

pub fn parse_url_host_port(url: &str) -> Option<(String, u16)> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();
    let port = parsed.port_or_known_default()?;
    Some((host, port))
}

fn expected_status_list(cfg: &Value) -> Vec<u16> {
    match cfg.get("expected_status") {
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_u64).map(|v| v as u16).collect(),
        Some(Value::Number(n)) => n.as_u64().map(|v| vec![v as u16]).unwrap_or_default(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Database backlog checks (sms_health only)
// ---------------------------------------------------------------------------

async fn psql_scalar(dsn: &str, query: &str, timeout_dur: Duration) -> Result<String> {
    let child = tokio::process::Command::new("psql")
        .arg(dsn)
        .arg("-At")
        .arg("-v")
        .arg("ON_ERROR_STOP=1")
        .arg("-c")
        .arg(query)
        .output();

    let output = timeout(timeout_dur, child)
        .await
        .context("psql timed out")?
        .context("spawning psql")?;

    if !output.status.success() {
        anyhow::bail!(
            "psql exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn cfg_str(cfg: &Value, key: &str, default: &str) -> String {
    cfg.get(key).and_then(Value::as_str).unwrap_or(default).to_string()
}

fn cfg_i64(cfg: &Value, key: &str, default: i64) -> i64 {
    cfg.get(key).and_then(Value::as_i64).unwrap_or(default)
}

fn cfg_bool(cfg: &Value, key: &str, default: bool) -> bool {
    cfg.get(key).and_then(Value::as_bool).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use rc_schemas::ProbeDefinition;

    fn probe_def(probe_type: &str, config: Value) -> ProbeDefinition {
        ProbeDefinition {
            key: "test".to_string(),
            probe_type: probe_type.to_string(),
            interval_seconds: 60,
            timeout_seconds: 5,
            stale_after_seconds: 120,
            enabled: true,
            config,
            next_run_at: None,
            last_run_at: None,
        }
    }

    #[tokio::test]
    async fn tcp_check_rejects_zero_port() {
        let runner = ProbeRunner::new();
        let result = runner.run(&probe_def("tcp_check", json!({"host": "localhost", "port": 0}))).await;
        assert!(!result.ok);
        assert_eq!(result.status, ProbeStatus::Error);
        assert!(result.error.contains("positive port"));
    }

    #[tokio::test]
    async fn tcp_check_connects_to_open_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let runner = ProbeRunner::new();
        let result = runner
            .run(&probe_def("tcp_check", json!({"host": "127.0.0.1", "port": port})))
            .await;
        assert!(result.ok);
        assert_eq!(result.status, ProbeStatus::Healthy);
    }

    #[tokio::test]
    async fn http_check_honors_expected_status() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/ok");
            then.status(200).body("hello");
        });

        let runner = ProbeRunner::new();
        let url = server.url("/ok");
        let result = runner
            .run(&probe_def("http_check", json!({"url": url, "expected_status": [200]})))
            .await;
        mock.assert();
        assert!(result.ok);
    }

    #[tokio::test]
    async fn http_check_rejects_empty_url() {
        let runner = ProbeRunner::new();
        let result = runner.run(&probe_def("http_check", json!({"url": ""}))).await;
        assert!(!result.ok);
        assert!(result.error.contains("non-empty url"));
    }

    #[test]
    fn parses_default_ports() {
        assert_eq!(
            parse_url_host_port("https://example.com/foo"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(
            parse_url_host_port("http://example.com"),
            Some(("example.com".to_string(), 80))
        );
    }
}
