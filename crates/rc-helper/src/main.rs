//! The privileged helper: a small root-owned daemon that talks to
//! `systemctl`/`docker` on behalf of the unprivileged control plane over a
//! Unix domain socket. It re-validates every request against its own copy
//! of the allowlist rather than trusting the caller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rc_config::HelperConfig;
use rc_schemas::{CommandResult, ConfigDocument, ContainerStatus, HelperRequest, HelperResponse};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = HelperConfig::from_env();
    let document_path = config_document_path();
    let document = Arc::new(
        rc_config::load_config_document(&document_path)
            .with_context(|| format!("loading config document from {}", document_path.display()))?,
    );

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path).context("removing stale socket file")?;
    }
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent).context("creating socket directory")?;
    }

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("binding helper socket at {}", config.socket_path.display()))?;
    apply_socket_permissions(&config.socket_path, &config.socket_group)?;

    tracing::info!(path = %config.socket_path.display(), "rc-helper listening");

    let max_body_bytes = config.max_body_bytes;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let document = document.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, document, max_body_bytes).await;
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
            _ = shutdown_signal() => {
                tracing::info!("rc-helper shutting down");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&config.socket_path);
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_document_path() -> PathBuf {
    std::env::var("RC_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/config.json"))
}

async fn handle_connection(stream: UnixStream, document: Arc<ConfigDocument>, max_body_bytes: usize) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).take((max_body_bytes + 1) as u64);
    let mut line = String::new();

    match reader.read_line(&mut line).await {
        Ok(0) => return,
        Ok(n) if n > max_body_bytes => {
            let _ = write_response(
                &mut write_half,
                &HelperResponse::from_result(CommandResult::rejected("request exceeds maximum body size")),
            )
            .await;
            return;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "failed reading helper request");
            return;
        }
    }

    let response = match serde_json::from_str::<HelperRequest>(line.trim_end()) {
        Ok(request) => dispatch(request, &document).await,
        Err(e) => HelperResponse::from_result(CommandResult::rejected(format!("invalid request: {e}"))),
    };

    if let Err(e) = write_response(&mut write_half, &response).await {
        tracing::warn!(error = %e, "failed writing helper response");
    }
}

async fn write_response(
    writer: &mut (impl AsyncWriteExt + Unpin),
    response: &HelperResponse,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(response).unwrap_or_else(|_| "{}".to_string());
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

const EXEC_TIMEOUT: Duration = Duration::from_secs(45);

async fn dispatch(request: HelperRequest, document: &ConfigDocument) -> HelperResponse {
    match request {
        HelperRequest::ContainerStatusMap => container_status_map().await,
        HelperRequest::ServiceAction { action, target } => {
            run_validated("service", &action, &target, "systemctl", document).await
        }
        HelperRequest::ContainerAction { action, target } => {
            run_validated("container", &action, &target, "docker", document).await
        }
    }
}

async fn run_validated(
    target_type: &str,
    action: &str,
    target: &str,
    program: &str,
    document: &ConfigDocument,
) -> HelperResponse {
    match rc_action::validate(target_type, target, action, &document.targets, &document.actions) {
        Ok(_) => {
            // Already running as root; no sudo needed here, unlike the
            // control plane's own direct-transport path.
            let result = rc_action::run_cmd(&[program, action, target], EXEC_TIMEOUT).await;
            HelperResponse::from_result(result)
        }
        Err(e) => HelperResponse::from_result(CommandResult::rejected(e.to_string())),
    }
}

async fn container_status_map() -> HelperResponse {
    let output = tokio::process::Command::new("docker")
        .args(["ps", "-a", "--format", "{{.Names}}\t{{.Status}}\t{{.Image}}\t{{.Ports}}"])
        .output()
        .await;

    match output {
        Ok(o) if o.status.success() => {
            let text = String::from_utf8_lossy(&o.stdout);
            let mut map: BTreeMap<String, ContainerStatus> = BTreeMap::new();
            for line in text.lines() {
                let fields: Vec<&str> = line.split('\t').collect();
                if fields.len() < 4 {
                    continue;
                }
                map.insert(
                    fields[0].to_string(),
                    ContainerStatus {
                        status: fields[1].to_string(),
                        image: fields[2].to_string(),
                        ports: fields[3].to_string(),
                    },
                );
            }
            HelperResponse {
                result: CommandResult {
                    ok: true,
                    return_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                },
                containers: Some(map),
            }
        }
        Ok(o) => HelperResponse::from_result(CommandResult {
            ok: false,
            return_code: o.status.code().unwrap_or(-1),
            stdout: String::new(),
            stderr: String::from_utf8_lossy(&o.stderr).into_owned(),
        }),
        Err(e) => HelperResponse::from_result(CommandResult::rejected(e.to_string())),
    }
}

#[cfg(unix)]
fn apply_socket_permissions(socket_path: &Path, group_name: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))
        .context("chmod 0660 on helper socket")?;
    if let Some(parent) = socket_path.parent() {
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o750))
            .context("chmod 0750 on helper socket directory")?;
    }

    match nix::unistd::Group::from_name(group_name).context("looking up helper socket group")? {
        Some(group) => {
            nix::unistd::chown(socket_path, None, Some(group.gid)).context("chown helper socket")?;
            if let Some(parent) = socket_path.parent() {
                nix::unistd::chown(parent, None, Some(group.gid)).context("chown helper socket directory")?;
            }
        }
        None => tracing::warn!(group = %group_name, "helper socket group not found, leaving default ownership"),
    }

    Ok(())
}

#[cfg(not(unix))]
fn apply_socket_permissions(_socket_path: &Path, _group_name: &str) -> Result<()> {
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_schemas::{ActionsConfig, TargetsConfig};

    fn document() -> ConfigDocument {
        ConfigDocument {
            targets: TargetsConfig {
                services: vec!["nginx".to_string()],
                containers: vec!["app".to_string()],
                tcp_checks: vec![],
            },
            actions: ActionsConfig {
                service: vec!["restart".to_string()],
                container: vec!["restart".to_string()],
            },
            scheduled_probes: vec![],
        }
    }

    #[tokio::test]
    async fn rejects_target_outside_allowlist() {
        let response = run_validated("service", "restart", "postgresql", "systemctl", &document()).await;
        assert!(!response.result.ok);
        assert!(response.result.stderr.contains("not in allowlist"));
    }

    #[tokio::test]
    async fn rejects_disallowed_action_independently_of_caller() {
        let response = run_validated("container", "stop", "app", "docker", &document()).await;
        assert!(!response.result.ok);
        assert!(response.result.stderr.contains("not allowed"));
    }
}
