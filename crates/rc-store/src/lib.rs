//! The on-disk store: one SQLite file, WAL-mode, holding probe definitions,
//! probe run history, and the action audit trail.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rc_schemas::{
    ActionAuditRow, LatestProbeRun, NewActionAudit, ProbeDefinition, ProbeResult, ProbeRun,
    ProbeStatus, ProbeWithLatestRun, TargetType,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

/// Async handle to the probe/audit database.
///
/// Every write-path method takes `write_lock` for its duration. SQLite's own
/// locking would serialize these anyway; holding an in-process mutex avoids
/// `SQLITE_BUSY` surfacing as a retriable error in the common case of a
/// single daemon process.
pub struct Store {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating db directory {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("opening sqlite db at {}", db_path.display()))?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await
            .context("setting WAL journal mode")?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await
            .context("setting synchronous=NORMAL")?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .context("enabling foreign keys")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running schema migrations")?;

        tracing::info!(path = %db_path.display(), "opened sqlite store");

        Ok(Store {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory sqlite db")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running schema migrations")?;
        Ok(Store {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    // -- probe definitions ---------------------------------------------

    /// Upsert every definition in `desired`, then disable (not delete) any
    /// existing row whose key is absent from `desired`. Matches the
    /// reference behavior of treating the config document as the source of
    /// truth for which probes are active without discarding their history.
    pub async fn sync_probe_definitions(&self, desired: &[ProbeDefinition]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for def in desired {
            sqlx::query(
                r#"
                INSERT INTO probe_definitions
                    (probe_key, probe_type, interval_seconds, timeout_seconds,
                     stale_after_seconds, enabled, probe_config_json, next_run_at, last_run_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL)
                ON CONFLICT(probe_key) DO UPDATE SET
                    probe_type = excluded.probe_type,
                    interval_seconds = excluded.interval_seconds,
                    timeout_seconds = excluded.timeout_seconds,
                    stale_after_seconds = excluded.stale_after_seconds,
                    enabled = excluded.enabled
                "#,
            )
            .bind(&def.key)
            .bind(&def.probe_type)
            .bind(def.interval_seconds)
            .bind(def.timeout_seconds)
            .bind(def.stale_after_seconds)
            .bind(def.enabled as i64)
            .bind(def.config.to_string())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting probe definition {}", def.key))?;
        }

        if desired.is_empty() {
            sqlx::query("UPDATE probe_definitions SET enabled = 0")
                .execute(&mut *tx)
                .await?;
        } else {
            let placeholders = desired.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let sql = format!(
                "UPDATE probe_definitions SET enabled = 0 WHERE probe_key NOT IN ({placeholders})"
            );
            let mut q = sqlx::query(&sql);
            for def in desired {
                q = q.bind(&def.key);
            }
            q.execute(&mut *tx).await?;
        }

        tx.commit().await.context("committing probe definition sync")?;
        tracing::debug!(count = desired.len(), "synced probe definitions");
        Ok(())
    }

    pub async fn get_probe_definition(&self, key: &str) -> Result<Option<ProbeDefinition>> {
        let row = sqlx::query(
            "SELECT probe_key, probe_type, interval_seconds, timeout_seconds, \
             stale_after_seconds, enabled, probe_config_json, next_run_at, last_run_at \
             FROM probe_definitions WHERE probe_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("fetching probe definition")?;

        row.map(row_to_definition).transpose()
    }

    /// Probes that are enabled and due (`next_run_at` unset or in the past),
    /// ordered to match the reference scheduler's tie-break (earliest
    /// `next_run_at`, then key).
    pub async fn list_due_probes(&self, now: DateTime<Utc>) -> Result<Vec<ProbeDefinition>> {
        let rows = sqlx::query(
            "SELECT probe_key, probe_type, interval_seconds, timeout_seconds, \
             stale_after_seconds, enabled, probe_config_json, next_run_at, last_run_at \
             FROM probe_definitions \
             WHERE enabled = 1 AND (next_run_at IS NULL OR next_run_at <= ?) \
             ORDER BY COALESCE(next_run_at, '') ASC, probe_key ASC",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .context("listing due probes")?;

        rows.into_iter().map(row_to_definition).collect()
    }

    /// Optimistically advance `next_run_at` before a probe executes, so a
    /// slow or hung probe isn't immediately re-selected by the next tick.
    pub async fn set_probe_next_run(&self, key: &str, next_run_at: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE probe_definitions SET next_run_at = ? WHERE probe_key = ?")
            .bind(next_run_at.to_rfc3339())
            .bind(key)
            .execute(&self.pool)
            .await
            .context("advancing probe next_run_at")?;
        Ok(())
    }

    // -- probe runs -------------------------------------------------------

    /// Persist a completed probe execution and set `last_run_at`/
    /// `next_run_at` on the definition. `next_run_at` is the value already
    /// written by `set_probe_next_run` before the probe ran, not a value
    /// recomputed here — the scheduler decides cadence, the store just
    /// records it.
    pub async fn save_probe_run(
        &self,
        probe_key: &str,
        result: &ProbeResult,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<ProbeRun> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            r#"
            INSERT INTO probe_runs
                (probe_key, started_at, ended_at, ok, status, latency_ms, error, payload_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(probe_key)
        .bind(result.started_at.to_rfc3339())
        .bind(result.ended_at.to_rfc3339())
        .bind(result.ok as i64)
        .bind(result.status.to_string())
        .bind(result.latency_ms)
        .bind(if result.error.is_empty() {
            None::<String>
        } else {
            Some(result.error.clone())
        })
        .bind(result.payload.to_string())
        .execute(&mut *tx)
        .await
        .context("inserting probe run")?
        .last_insert_rowid();

        sqlx::query("UPDATE probe_definitions SET last_run_at = ?, next_run_at = COALESCE(?, next_run_at) WHERE probe_key = ?")
            .bind(result.ended_at.to_rfc3339())
            .bind(next_run_at.map(|t| t.to_rfc3339()))
            .bind(probe_key)
            .execute(&mut *tx)
            .await
            .context("updating probe definition after run")?;

        tx.commit().await.context("committing probe run")?;

        Ok(ProbeRun {
            id,
            probe_key: probe_key.to_string(),
            started_at: result.started_at,
            ended_at: result.ended_at,
            ok: result.ok,
            status: result.status,
            latency_ms: result.latency_ms,
            error: result.error.clone(),
            payload: result.payload.clone(),
        })
    }

    /// Every definition joined with its most recent run, with staleness
    /// computed relative to `now`.
    pub async fn get_latest_probes(&self, now: DateTime<Utc>) -> Result<Vec<ProbeWithLatestRun>> {
        let rows = sqlx::query(
            r#"
            SELECT
                d.probe_key, d.probe_type, d.enabled, d.interval_seconds, d.stale_after_seconds,
                d.next_run_at, d.last_run_at,
                r.id as run_id, r.started_at, r.ended_at, r.ok as run_ok, r.status,
                r.latency_ms, r.error, r.payload_json
            FROM probe_definitions d
            LEFT JOIN probe_runs r ON r.id = (
                SELECT id FROM probe_runs WHERE probe_key = d.probe_key ORDER BY id DESC LIMIT 1
            )
            ORDER BY d.probe_key ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("fetching latest probes")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let ended_at: Option<String> = row.try_get("ended_at")?;
            let ended_at = ended_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()
                .context("parsing probe run ended_at")?;

            let latest_run = match (row.try_get::<Option<i64>, _>("run_id")?, ended_at) {
                (Some(run_id), Some(ended_at)) => {
                    let started_at: String = row.try_get("started_at")?;
                    let status: String = row.try_get("status")?;
                    let payload_json: String = row.try_get("payload_json")?;
                    Some(LatestProbeRun {
                        run_id,
                        started_at: DateTime::parse_from_rfc3339(&started_at)?.with_timezone(&Utc),
                        ended_at,
                        ok: row.try_get::<i64, _>("run_ok")? != 0,
                        status: ProbeStatus::from_str(&status).unwrap_or(ProbeStatus::Unknown),
                        latency_ms: row.try_get("latency_ms")?,
                        error: row.try_get::<Option<String>, _>("error")?.unwrap_or_default(),
                        payload: serde_json::from_str(&payload_json).unwrap_or_default(),
                    })
                }
                _ => None,
            };

            let stale_after_seconds: i64 = row.try_get("stale_after_seconds")?;
            let age_seconds = latest_run
                .as_ref()
                .map(|r| (now - r.ended_at).num_seconds());
            let is_stale = match age_seconds {
                Some(age) => age > stale_after_seconds,
                None => true,
            };

            out.push(ProbeWithLatestRun {
                key: row.try_get("probe_key")?,
                probe_type: row.try_get("probe_type")?,
                enabled: row.try_get::<i64, _>("enabled")? != 0,
                interval_seconds: row.try_get("interval_seconds")?,
                stale_after_seconds,
                next_run_at: parse_opt_rfc3339(row.try_get("next_run_at")?)?,
                last_run_at: parse_opt_rfc3339(row.try_get("last_run_at")?)?,
                latest_run,
                age_seconds,
                is_stale,
            });
        }

        Ok(out)
    }

    pub async fn get_probe_history(&self, key: &str, limit: i64) -> Result<Vec<ProbeRun>> {
        let rows = sqlx::query(
            "SELECT id, probe_key, started_at, ended_at, ok, status, latency_ms, error, payload_json \
             FROM probe_runs WHERE probe_key = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("fetching probe history")?;

        rows.into_iter().map(row_to_run).collect()
    }

    // -- action audit -----------------------------------------------------

    pub async fn add_action_audit(&self, audit: NewActionAudit) -> Result<ActionAuditRow> {
        let _guard = self.write_lock.lock().await;
        let id = sqlx::query(
            r#"
            INSERT INTO action_audit
                (timestamp_utc, actor, remote_ip, target_type, target, action, reason, ok, return_code, stderr)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(audit.timestamp_utc.to_rfc3339())
        .bind(&audit.actor)
        .bind(&audit.remote_ip)
        .bind(audit.target_type.to_string())
        .bind(&audit.target)
        .bind(&audit.action)
        .bind(&audit.reason)
        .bind(audit.ok as i64)
        .bind(audit.return_code)
        .bind(&audit.stderr)
        .execute(&self.pool)
        .await
        .context("inserting action audit row")?
        .last_insert_rowid();

        Ok(ActionAuditRow {
            id,
            timestamp_utc: audit.timestamp_utc,
            actor: audit.actor,
            remote_ip: audit.remote_ip,
            target_type: audit.target_type,
            target: audit.target,
            action: audit.action,
            reason: audit.reason,
            ok: audit.ok,
            return_code: audit.return_code,
            stderr: audit.stderr,
        })
    }

    pub async fn read_action_audit(&self, limit: i64) -> Result<Vec<ActionAuditRow>> {
        let rows = sqlx::query(
            "SELECT id, timestamp_utc, actor, remote_ip, target_type, target, action, reason, \
             ok, return_code, stderr FROM action_audit ORDER BY timestamp_utc DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("reading action audit")?;

        rows.into_iter().map(row_to_audit).collect()
    }
}

fn parse_opt_rfc3339(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
        .transpose()
        .context("parsing timestamp")
}

fn row_to_definition(row: sqlx::sqlite::SqliteRow) -> Result<ProbeDefinition> {
    let config_json: String = row.try_get("probe_config_json")?;
    Ok(ProbeDefinition {
        key: row.try_get("probe_key")?,
        probe_type: row.try_get("probe_type")?,
        interval_seconds: row.try_get("interval_seconds")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        stale_after_seconds: row.try_get("stale_after_seconds")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        config: serde_json::from_str(&config_json).context("parsing probe_config_json")?,
        next_run_at: parse_opt_rfc3339(row.try_get("next_run_at")?)?,
        last_run_at: parse_opt_rfc3339(row.try_get("last_run_at")?)?,
    })
}

fn row_to_run(row: sqlx::sqlite::SqliteRow) -> Result<ProbeRun> {
    let started_at: String = row.try_get("started_at")?;
    let ended_at: String = row.try_get("ended_at")?;
    let status: String = row.try_get("status")?;
    let payload_json: String = row.try_get("payload_json")?;
    Ok(ProbeRun {
        id: row.try_get("id")?,
        probe_key: row.try_get("probe_key")?,
        started_at: DateTime::parse_from_rfc3339(&started_at)?.with_timezone(&Utc),
        ended_at: DateTime::parse_from_rfc3339(&ended_at)?.with_timezone(&Utc),
        ok: row.try_get::<i64, _>("ok")? != 0,
        status: ProbeStatus::from_str(&status).unwrap_or(ProbeStatus::Unknown),
        latency_ms: row.try_get("latency_ms")?,
        error: row.try_get::<Option<String>, _>("error")?.unwrap_or_default(),
        payload: serde_json::from_str(&payload_json).context("parsing payload_json")?,
    })
}

fn row_to_audit(row: sqlx::sqlite::SqliteRow) -> Result<ActionAuditRow> {
    let timestamp_utc: String = row.try_get("timestamp_utc")?;
    let target_type: String = row.try_get("target_type")?;
    Ok(ActionAuditRow {
        id: row.try_get("id")?,
        timestamp_utc: DateTime::parse_from_rfc3339(&timestamp_utc)?.with_timezone(&Utc),
        actor: row.try_get::<Option<String>, _>("actor")?.unwrap_or_default(),
        remote_ip: row.try_get::<Option<String>, _>("remote_ip")?.unwrap_or_default(),
        target_type: TargetType::parse(&target_type).unwrap_or(TargetType::Service),
        target: row.try_get::<Option<String>, _>("target")?.unwrap_or_default(),
        action: row.try_get::<Option<String>, _>("action")?.unwrap_or_default(),
        reason: row.try_get::<Option<String>, _>("reason")?.unwrap_or_default(),
        ok: row.try_get::<i64, _>("ok")? != 0,
        return_code: row.try_get("return_code")?,
        stderr: row.try_get::<Option<String>, _>("stderr")?.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(key: &str) -> ProbeDefinition {
        ProbeDefinition {
            key: key.to_string(),
            probe_type: "tcp_check".to_string(),
            interval_seconds: 60,
            timeout_seconds: 5,
            stale_after_seconds: 120,
            enabled: true,
            config: json!({"host": "127.0.0.1", "port": 80}),
            next_run_at: None,
            last_run_at: None,
        }
    }

    #[tokio::test]
    async fn sync_then_fetch_roundtrips() {
        let store = Store::open_in_memory().await.unwrap();
        store.sync_probe_definitions(&[def("a"), def("b")]).await.unwrap();

        let fetched = store.get_probe_definition("a").await.unwrap().unwrap();
        assert_eq!(fetched.probe_type, "tcp_check");
        assert!(fetched.enabled);

        store.sync_probe_definitions(&[def("a")]).await.unwrap();
        let disabled = store.get_probe_definition("b").await.unwrap().unwrap();
        assert!(!disabled.enabled);
    }

    #[tokio::test]
    async fn due_probes_respect_next_run_at() {
        let store = Store::open_in_memory().await.unwrap();
        store.sync_probe_definitions(&[def("a")]).await.unwrap();

        let due = store.list_due_probes(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);

        let future = Utc::now() + chrono::Duration::seconds(3600);
        store.set_probe_next_run("a", future).await.unwrap();
        let due = store.list_due_probes(Utc::now()).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn save_probe_run_updates_latest_and_history() {
        let store = Store::open_in_memory().await.unwrap();
        store.sync_probe_definitions(&[def("a")]).await.unwrap();

        let now = Utc::now();
        let result = ProbeResult {
            started_at: now,
            ended_at: now,
            latency_ms: 12.5,
            ok: true,
            status: ProbeStatus::Healthy,
            error: String::new(),
            payload: json!({"ok": true}),
        };
        store
            .save_probe_run("a", &result, Some(now + chrono::Duration::seconds(60)))
            .await
            .unwrap();

        let latest = store.get_latest_probes(now).await.unwrap();
        assert_eq!(latest.len(), 1);
        let run = latest[0].latest_run.as_ref().unwrap();
        assert!(run.ok);
        assert!(!latest[0].is_stale);

        let history = store.get_probe_history("a", 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn action_audit_roundtrips() {
        let store = Store::open_in_memory().await.unwrap();
        let audit = NewActionAudit {
            timestamp_utc: Utc::now(),
            actor: "operator".to_string(),
            remote_ip: "127.0.0.1".to_string(),
            target_type: TargetType::Service,
            target: "nginx".to_string(),
            action: "restart".to_string(),
            reason: "testing".to_string(),
            ok: true,
            return_code: Some(0),
            stderr: String::new(),
        };
        store.add_action_audit(audit).await.unwrap();

        let rows = store.read_action_audit(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].target, "nginx");
    }
}
