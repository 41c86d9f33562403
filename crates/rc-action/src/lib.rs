//! The action gateway: a single choke point that validates an operator's
//! service/container action request before it ever reaches a subprocess,
//! then executes it either directly (when this process already holds the
//! required privilege) or by delegating to the privileged helper over its
//! Unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rc_schemas::{ActionsConfig, CommandResult, HelperRequest, HelperResponse, TargetType, TargetsConfig};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

const DIRECT_EXEC_TIMEOUT_SECS: u64 = 45;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("invalid target_type '{0}', expected 'service' or 'container'")]
    InvalidTargetType(String),
    #[error("target must not be empty")]
    EmptyTarget,
    #[error("Action '{action}' is not allowed for {target_type}.")]
    ActionNotAllowed { target_type: String, action: String },
    #[error("{target_type} '{target}' is not in allowlist.")]
    TargetNotAllowed { target_type: String, target: String },
}

impl ActionError {
    /// HTTP status the control plane should answer with — validation
    /// failures are 400s, allowlist rejections are 403s.
    pub fn status_code(&self) -> u16 {
        match self {
            ActionError::InvalidTargetType(_) | ActionError::EmptyTarget => 400,
            ActionError::ActionNotAllowed { .. } | ActionError::TargetNotAllowed { .. } => 403,
        }
    }
}

/// The four-step gate: target_type validity, non-empty target, action
/// allowlisted for that target_type, target allowlisted for that
/// target_type. Pure and synchronous so both the control plane and the
/// helper (which must not trust the control plane's say-so) can run it.
pub fn validate(
    target_type: &str,
    target: &str,
    action: &str,
    targets: &TargetsConfig,
    actions: &ActionsConfig,
) -> Result<TargetType, ActionError> {
    let tt = TargetType::parse(target_type)
        .ok_or_else(|| ActionError::InvalidTargetType(target_type.to_string()))?;

    if target.trim().is_empty() {
        return Err(ActionError::EmptyTarget);
    }

    let allowed_actions = actions.for_target_type(tt);
    if !allowed_actions.iter().any(|a| a == action) {
        return Err(ActionError::ActionNotAllowed {
            target_type: tt.to_string(),
            action: action.to_string(),
        });
    }

    let allowlist: &[String] = match tt {
        TargetType::Service => &targets.services,
        TargetType::Container => &targets.containers,
    };
    if !allowlist.iter().any(|t| t == target) {
        let noun = match tt {
            TargetType::Service => "Service",
            TargetType::Container => "Container",
        };
        return Err(ActionError::TargetNotAllowed {
            target_type: noun.to_string(),
            target: target.to_string(),
        });
    }

    Ok(tt)
}

/// Constant-time comparison for the admin token header, so response timing
/// can't be used to recover it byte by byte.
pub fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        return false;
    }
    provided.ct_eq(expected).into()
}

#[derive(Clone)]
pub enum Transport {
    /// Run the command in this process, via `sudo -n`. Used when the
    /// control plane itself has been granted passwordless sudo.
    Direct,
    /// Delegate to the privileged helper over its Unix socket.
    Helper { socket_path: PathBuf },
}

#[derive(Clone)]
pub struct ActionGateway {
    transport: Transport,
}

impl ActionGateway {
    pub fn direct() -> Self {
        ActionGateway { transport: Transport::Direct }
    }

    pub fn via_helper(socket_path: PathBuf) -> Self {
        ActionGateway { transport: Transport::Helper { socket_path } }
    }

    pub async fn execute(&self, target_type: TargetType, action: &str, target: &str) -> CommandResult {
        match &self.transport {
            Transport::Direct => run_direct(target_type, action, target).await,
            Transport::Helper { socket_path } => run_via_helper(socket_path, target_type, action, target).await,
        }
    }
}

async fn run_direct(target_type: TargetType, action: &str, target: &str) -> CommandResult {
    let program = match target_type {
        TargetType::Service => "systemctl",
        TargetType::Container => "docker",
    };
    run_cmd(
        &["sudo", "-n", program, action, target],
        Duration::from_secs(DIRECT_EXEC_TIMEOUT_SECS),
    )
    .await
}

/// Run a subprocess to completion or until `timeout_dur` elapses, normalizing
/// both outcomes into a `CommandResult` rather than surfacing a Rust error —
/// a timed-out command is a reportable result, not an exceptional one.
pub async fn run_cmd(argv: &[&str], timeout_dur: Duration) -> CommandResult {
    let Some((program, args)) = argv.split_first() else {
        return CommandResult::rejected("empty command");
    };

    let child = tokio::process::Command::new(program).args(args).output();
    match timeout(timeout_dur, child).await {
        Ok(Ok(output)) => CommandResult {
            ok: output.status.success(),
            return_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
        Ok(Err(e)) => CommandResult::rejected(e.to_string()),
        Err(_) => CommandResult::timed_out(timeout_dur.as_secs()),
    }
}

async fn run_via_helper(socket_path: &Path, target_type: TargetType, action: &str, target: &str) -> CommandResult {
    let request = match target_type {
        TargetType::Service => HelperRequest::ServiceAction {
            action: action.to_string(),
            target: target.to_string(),
        },
        TargetType::Container => HelperRequest::ContainerAction {
            action: action.to_string(),
            target: target.to_string(),
        },
    };

    match exchange(socket_path, &request).await {
        Ok(response) => response.result,
        Err(e) => CommandResult::rejected(format!("helper exchange failed: {e}")),
    }
}

/// Query the helper for `docker ps -a`-derived container status, used by
/// the control plane's `/api/v1/status` endpoint.
pub async fn container_status_map(
    socket_path: &Path,
) -> Result<std::collections::BTreeMap<String, rc_schemas::ContainerStatus>> {
    let response = exchange(socket_path, &HelperRequest::ContainerStatusMap).await?;
    Ok(response.containers.unwrap_or_default())
}

/// One newline-delimited JSON request/response round trip on the helper's
/// Unix stream socket.
pub async fn exchange(socket_path: &Path, request: &HelperRequest) -> Result<HelperResponse> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connecting to helper socket at {}", socket_path.display()))?;

    let mut line = serde_json::to_string(request).context("encoding helper request")?;
    line.push('\n');

    let (read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(line.as_bytes())
        .await
        .context("writing helper request")?;

    let mut reader = BufReader::new(read_half);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .await
        .context("reading helper response")?;

    if response_line.is_empty() {
        anyhow::bail!("helper closed the connection without responding");
    }

    serde_json::from_str(response_line.trim_end()).context("parsing helper response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_schemas::{ActionsConfig, TargetsConfig};

    fn targets() -> TargetsConfig {
        TargetsConfig {
            services: vec!["nginx".to_string()],
            containers: vec!["app".to_string()],
            tcp_checks: vec![],
        }
    }

    fn actions() -> ActionsConfig {
        ActionsConfig {
            service: vec!["restart".to_string(), "status".to_string()],
            container: vec!["restart".to_string()],
        }
    }

    #[test]
    fn rejects_unknown_target_type() {
        let err = validate("vm", "nginx", "restart", &targets(), &actions()).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(matches!(err, ActionError::InvalidTargetType(_)));
    }

    #[test]
    fn rejects_empty_target() {
        let err = validate("service", "", "restart", &targets(), &actions()).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(matches!(err, ActionError::EmptyTarget));
    }

    #[test]
    fn rejects_disallowed_action() {
        let err = validate("container", "app", "stop", &targets(), &actions()).unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert!(matches!(err, ActionError::ActionNotAllowed { .. }));
    }

    #[test]
    fn rejects_target_not_in_allowlist() {
        let err = validate("service", "postgresql", "restart", &targets(), &actions()).unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert!(matches!(err, ActionError::TargetNotAllowed { .. }));
    }

    #[test]
    fn accepts_known_good_request() {
        let tt = validate("service", "nginx", "restart", &targets(), &actions()).unwrap();
        assert_eq!(tt, TargetType::Service);
    }

    #[test]
    fn token_comparison_requires_exact_match() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secret", "secre"));
        assert!(!tokens_match("secret", "Secret"));
    }

    #[tokio::test]
    async fn run_cmd_captures_exit_code() {
        let result = run_cmd(&["sh", "-c", "exit 3"], Duration::from_secs(5)).await;
        assert!(!result.ok);
        assert_eq!(result.return_code, 3);
    }

    #[tokio::test]
    async fn run_cmd_times_out() {
        let result = run_cmd(&["sleep", "5"], Duration::from_millis(50)).await;
        assert!(!result.ok);
        assert_eq!(result.return_code, -1);
        assert!(result.stderr.contains("timed out"));
    }
}
