//! The probe scheduler: a single background tick loop that runs due probes
//! and writes their results back to the store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rc_probe::ProbeRunner;
use rc_schemas::ProbeRun;
use rc_store::Store;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TICK_SECONDS: f64 = 2.0;
pub const MIN_TICK_SECONDS: f64 = 1.0;
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Scheduler {
    store: Arc<Store>,
    runner: Arc<ProbeRunner>,
    tick: Duration,
    token: CancellationToken,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, runner: Arc<ProbeRunner>, tick_seconds: f64) -> Self {
        Scheduler {
            store,
            runner,
            tick: Duration::from_secs_f64(tick_seconds.max(MIN_TICK_SECONDS)),
            token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start the tick loop on its own task. Returns the join handle and a
    /// token the caller should cancel to request a graceful stop.
    pub fn spawn(self) -> (JoinHandle<()>, CancellationToken) {
        let token = self.token.clone();
        let handle = tokio::spawn(self.run());
        (handle, token)
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    tracing::info!("scheduler received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    self.tick_once().await;
                }
            }
        }
    }

    async fn tick_once(&self) {
        let now = Utc::now();
        let due = match self.store.list_due_probes(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "failed to list due probes");
                return;
            }
        };

        for def in due {
            // Write the next scheduled time before running so a slow or
            // hung probe isn't picked up again by the next tick.
            let next_run_at = now + chrono::Duration::seconds(def.interval_seconds);
            if let Err(e) = self.store.set_probe_next_run(&def.key, next_run_at).await {
                tracing::error!(probe_key = %def.key, error = %e, "failed to advance next_run_at");
                continue;
            }

            let result = self.runner.run(&def).await;
            if !result.ok {
                tracing::warn!(probe_key = %def.key, status = %result.status, error = %result.error, "probe run unhealthy");
            }

            if let Err(e) = self
                .store
                .save_probe_run(&def.key, &result, Some(next_run_at))
                .await
            {
                tracing::error!(probe_key = %def.key, error = %e, "failed to persist probe run");
            }
        }
    }
}

/// Cancel the scheduler and wait up to five seconds for its task to finish.
pub async fn shutdown(token: CancellationToken, handle: JoinHandle<()>) {
    token.cancel();
    if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await.is_err() {
        tracing::warn!("scheduler did not shut down within {:?}", SHUTDOWN_JOIN_TIMEOUT);
    }
}

/// Run a single probe immediately, outside the tick loop, for
/// `POST /api/v1/probes/run`. Advances `next_run_at` the same way a
/// scheduled run would, so a manual trigger doesn't cause an immediate
/// re-run on the next tick.
pub async fn run_once(store: &Store, runner: &ProbeRunner, key: &str) -> Result<ProbeRun> {
    let def = store
        .get_probe_definition(key)
        .await?
        .with_context(|| format!("no probe definition registered for key '{key}'"))?;

    let now = Utc::now();
    let next_run_at = now + chrono::Duration::seconds(def.interval_seconds);
    let result = runner.run(&def).await;
    store.save_probe_run(key, &result, Some(next_run_at)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_schemas::ProbeDefinition;
    use serde_json::json;

    #[tokio::test]
    async fn run_once_persists_a_history_row() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let runner = Arc::new(ProbeRunner::new());

        let def = ProbeDefinition {
            key: "local".to_string(),
            probe_type: "tcp_check".to_string(),
            interval_seconds: 60,
            timeout_seconds: 5,
            stale_after_seconds: 120,
            enabled: true,
            config: json!({"host": "127.0.0.1", "port": 0}),
            next_run_at: None,
            last_run_at: None,
        };
        store.sync_probe_definitions(&[def]).await.unwrap();

        let run = run_once(&store, &runner, "local").await.unwrap();
        assert_eq!(run.probe_key, "local");

        let history = store.get_probe_history("local", 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn run_once_errors_on_unknown_key() {
        let store = Store::open_in_memory().await.unwrap();
        let runner = ProbeRunner::new();
        assert!(run_once(&store, &runner, "missing").await.is_err());
    }

    #[tokio::test]
    async fn tick_loop_stops_on_cancellation() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let runner = Arc::new(ProbeRunner::new());
        let scheduler = Scheduler::new(store, runner, MIN_TICK_SECONDS);
        let (handle, token) = scheduler.spawn();
        shutdown(token, handle).await;
    }
}
