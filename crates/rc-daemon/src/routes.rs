use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rc_schemas::{ActionRequest, ActionResponse, NewActionAudit, RunProbeRequest};
use serde::Deserialize;
use serde_json::json;

use crate::hostinfo;
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let max_body_bytes = state.config.max_body_bytes;

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/config", get(config))
        .route("/api/v1/audit", get(audit))
        .route("/api/v1/probes/history", get(probe_history))
        .route("/api/v1/action", post(action))
        .route("/api/v1/probes/run", post(probes_run))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

fn token_ok(headers: &HeaderMap, state: &AppState) -> bool {
    match &state.config.admin_token {
        Some(expected) => headers
            .get("x-rc-token")
            .and_then(|v| v.to_str().ok())
            .map(|provided| rc_action::tokens_match(provided, expected))
            .unwrap_or(false),
        None => false,
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"ok": false, "error": "missing or invalid X-RC-Token"})),
    )
        .into_response()
}

fn actor_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-rc-actor")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"ok": true, "timestamp_utc": Utc::now()})))
}

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !token_ok(&headers, &state) {
        return unauthorized();
    }

    let now = Utc::now();
    let memory = hostinfo::memory_snapshot();
    let disk_root = hostinfo::disk_snapshot("/").await;
    let load_avg = hostinfo::load_avg();

    let mut services = serde_json::Map::new();
    for name in &state.config.document.targets.services {
        services.insert(name.clone(), service_status(name).await);
    }

    // Deliberately does not round-trip to the privileged helper here: the
    // control plane's own status read should not depend on the helper being
    // up. Live container state is available through the helper's
    // container_status_map op for callers that want it directly.
    let containers = state.config.document.targets.containers.clone();

    let mut tcp_checks = Vec::new();
    for target in &state.config.document.targets.tcp_checks {
        let outcome = rc_probe::tcp_check(
            &target.host,
            target.port,
            std::time::Duration::from_secs_f64(target.timeout_seconds.max(0.1)),
        )
        .await;
        tcp_checks.push(json!({"name": target.name, "result": outcome}));
    }

    let scheduled_probes = match state.store.get_latest_probes(now).await {
        Ok(probes) => serde_json::to_value(probes).unwrap_or(json!([])),
        Err(e) => {
            tracing::error!(error = %e, "failed to load scheduled probe status");
            json!([])
        }
    };

    let payload = json!({
        "ok": true,
        "data": {
            "timestamp_utc": now,
            "host": hostinfo::hostname(),
            "uptime_seconds": hostinfo::uptime_seconds(),
            "load_avg": load_avg,
            "memory": memory,
            "disk_root": disk_root,
            "sqlite_db_path": state.config.db_path,
            "targets": {
                "services": services,
                "containers": containers,
            },
            "tcp_checks": tcp_checks,
            "scheduled_probes": scheduled_probes,
        },
    });

    (StatusCode::OK, Json(payload)).into_response()
}

async fn service_status(name: &str) -> serde_json::Value {
    let output = tokio::process::Command::new("systemctl")
        .arg("show")
        .arg(name)
        .arg("--property=ActiveState,SubState,UnitFileState")
        .arg("--value")
        .output()
        .await;

    match output {
        Ok(o) if o.status.success() => {
            let text = String::from_utf8_lossy(&o.stdout);
            let mut lines = text.lines();
            json!({
                "active_state": lines.next().unwrap_or("").trim(),
                "sub_state": lines.next().unwrap_or("").trim(),
                "unit_file_state": lines.next().unwrap_or("").trim(),
            })
        }
        Ok(o) => json!({"error": String::from_utf8_lossy(&o.stderr).trim()}),
        Err(e) => json!({"error": e.to_string()}),
    }
}

async fn config(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !token_ok(&headers, &state) {
        return unauthorized();
    }
    let payload = json!({
        "ok": true,
        "data": {
            "targets": state.config.document.targets,
            "actions": state.config.document.actions,
            "scheduled_probes": state.config.document.scheduled_probes,
        },
    });
    (StatusCode::OK, Json(payload)).into_response()
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn audit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Response {
    if !token_ok(&headers, &state) {
        return unauthorized();
    }
    let limit = query.limit.unwrap_or(100).clamp(1, state.config.max_audit_limit);
    match state.store.read_action_audit(limit).await {
        Ok(rows) => (StatusCode::OK, Json(json!({"ok": true, "data": rows}))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read action audit");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"ok": false, "error": "store error"}))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    key: Option<String>,
    limit: Option<i64>,
}

async fn probe_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Response {
    if !token_ok(&headers, &state) {
        return unauthorized();
    }
    let Some(key) = query.key.filter(|k| !k.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "query parameter 'key' is required"})),
        )
            .into_response();
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    match state.store.get_probe_history(&key, limit).await {
        Ok(runs) => (StatusCode::OK, Json(json!({"ok": true, "data": runs}))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read probe history");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"ok": false, "error": "store error"}))).into_response()
        }
    }
}

async fn action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(body): Json<ActionRequest>,
) -> Response {
    if !token_ok(&headers, &state) {
        return unauthorized();
    }

    let target_type = match rc_action::validate(
        &body.target_type,
        &body.target,
        &body.action,
        &state.config.document.targets,
        &state.config.document.actions,
    ) {
        Ok(tt) => tt,
        Err(e) => {
            // Pre-execution validation failures are rejected but never audited.
            return (
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST),
                Json(json!({"ok": false, "error": e.to_string()})),
            )
                .into_response();
        }
    };

    let result = state.gateway.execute(target_type, &body.action, &body.target).await;

    let timestamp_utc = Utc::now();
    let audit = NewActionAudit {
        timestamp_utc,
        actor: actor_from_headers(&headers),
        remote_ip: remote.ip().to_string(),
        target_type,
        target: body.target.clone(),
        action: body.action.clone(),
        reason: body.reason.clone(),
        ok: result.ok,
        return_code: Some(result.return_code),
        stderr: result.stderr.clone(),
    };
    if let Err(e) = state.store.add_action_audit(audit).await {
        tracing::error!(error = %e, "failed to persist action audit row");
    }

    let status = if result.ok { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    let response = ActionResponse {
        ok: result.ok,
        target_type: target_type.to_string(),
        target: body.target,
        action: body.action,
        reason: body.reason,
        stdout: result.stdout,
        stderr: result.stderr,
        return_code: result.return_code,
        timestamp_utc,
    };
    (status, Json(response)).into_response()
}

async fn probes_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RunProbeRequest>,
) -> Response {
    if !token_ok(&headers, &state) {
        return unauthorized();
    }
    if body.key.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "'key' is required"})),
        )
            .into_response();
    }

    match rc_scheduler::run_once(&state.store, &state.runner, &body.key).await {
        Ok(run) => (StatusCode::OK, Json(json!({"ok": true, "data": run}))).into_response(),
        Err(e) => {
            tracing::warn!(probe_key = %body.key, error = %e, "manual probe run failed");
            (StatusCode::NOT_FOUND, Json(json!({"ok": false, "error": e.to_string()}))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use rc_action::ActionGateway;
    use rc_config::AppConfig;
    use rc_schemas::{ActionsConfig, ConfigDocument, TargetsConfig};
    use tower::ServiceExt;

    async fn test_state(admin_token: Option<&str>) -> Arc<AppState> {
        let store = Arc::new(rc_store::Store::open_in_memory().await.unwrap());
        let config = Arc::new(AppConfig {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 0,
            db_path: "test.sqlite3".into(),
            admin_token: admin_token.map(str::to_string),
            max_audit_limit: 500,
            max_body_bytes: 16_384,
            probe_tick_seconds: 60.0,
            helper_socket_path: "/nonexistent/helper.sock".into(),
            document: ConfigDocument {
                targets: TargetsConfig {
                    services: vec!["nginx".to_string()],
                    containers: vec![],
                    tcp_checks: vec![],
                },
                actions: ActionsConfig {
                    service: vec!["restart".to_string()],
                    container: vec![],
                },
                scheduled_probes: vec![],
            },
        });
        let gateway = ActionGateway::via_helper(config.helper_socket_path.clone());
        Arc::new(AppState::new(
            config,
            store,
            Arc::new(rc_probe::ProbeRunner::new()),
            gateway,
        ))
    }

    #[tokio::test]
    async fn health_requires_no_token() {
        let app = build_router(test_state(Some("secret")).await);
        let response = app
            .oneshot(Request::builder().uri("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_rejects_missing_token() {
        let app = build_router(test_state(Some("secret")).await);
        let response = app
            .oneshot(Request::builder().uri("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_rejects_when_no_token_configured() {
        let app = build_router(test_state(None).await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/status")
                    .header("x-rc-token", "anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn action_rejects_unknown_target_type() {
        let app = build_router(test_state(Some("secret")).await);
        let body = json!({"target_type": "vm", "action": "restart", "target": "nginx"}).to_string();
        let mut request = Request::builder()
            .method("POST")
            .uri("/api/v1/action")
            .header("x-rc-token", "secret")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn probe_history_requires_key() {
        let app = build_router(test_state(Some("secret")).await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/probes/history")
                    .header("x-rc-token", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
