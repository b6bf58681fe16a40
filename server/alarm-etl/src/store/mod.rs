//! Versioned SQLite store: schema migrations, idempotent lifecycle upserts
//! and processed-file tracking.
//!
//! Two independent mechanisms keep repeated runs safe:
//! - `apply_migrations` moves the schema forward, all steps in one transaction;
//! - `load` upserts on natural keys and records the file fingerprint in the
//!   same transaction as the data, so a file is either fully loaded and
//!   marked, or neither.
//!
//! Every write goes through a store-wide gate, so concurrent per-file loads
//! never interleave.

pub mod migrations;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::correlate::CorrelationOutput;
use crate::error::EtlError;
use crate::timestamp;
use crate::types::*;

pub use migrations::{Migration, MIGRATIONS};

/// Result of `apply_migrations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
  pub from: i64,
  pub to: i64,
  pub applied: Vec<i64>,
}

/// Query filter for stored lifecycles; newest raise first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleFilter {
  pub state: Option<LifecycleState>,
  pub component: Option<String>,
  pub alarm_code: Option<String>,
  pub limit: u32,
}

impl Default for LifecycleFilter {
  fn default() -> Self {
    Self {
      state: None,
      component: None,
      alarm_code: None,
      limit: 100,
    }
  }
}

/// Tables that can be counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
  Lifecycles,
  Annotations,
  Orphans,
  OperationalLogs,
  ProcessedFiles,
  IngestRuns,
}

impl Table {
  fn name(self) -> &'static str {
    match self {
      Self::Lifecycles => "alarm_lifecycles",
      Self::Annotations => "lifecycle_annotations",
      Self::Orphans => "orphans",
      Self::OperationalLogs => "operational_logs",
      Self::ProcessedFiles => "processed_files",
      Self::IngestRuns => "ingest_runs",
    }
  }
}

#[derive(Clone)]
pub struct Store {
  pool: SqlitePool,
  write_gate: Arc<Mutex<()>>,
}

impl Store {
  pub async fn connect(config: &Config) -> Result<Self, EtlError> {
    Self::open(&config.database_url, config.busy_timeout()).await
  }

  /// Open (creating if needed) the database at `url`. Does not migrate.
  pub async fn open(url: &str, busy_timeout: Duration) -> Result<Self, EtlError> {
    let options = SqliteConnectOptions::from_str(url)?
      .create_if_missing(true)
      .foreign_keys(true)
      .busy_timeout(busy_timeout);

    let in_memory = is_memory_url(url);
    if !in_memory {
      if let Some(parent) = database_path(url).and_then(|p| p.parent().map(|d| d.to_path_buf())) {
        if !parent.as_os_str().is_empty() {
          std::fs::create_dir_all(&parent).map_err(|e| EtlError::io(&parent, e))?;
        }
      }
    }

    // An in-memory database lives and dies with its one connection.
    let pool_options = if in_memory {
      SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
    } else {
      SqlitePoolOptions::new().max_connections(4)
    };
    let pool = pool_options.connect_with(options).await?;

    info!(database = %url, "store opened");
    Ok(Self {
      pool,
      write_gate: Arc::new(Mutex::new(())),
    })
  }

  pub async fn in_memory() -> Result<Self, EtlError> {
    Self::open("sqlite::memory:", Duration::from_secs(5)).await
  }

  pub async fn close(&self) {
    self.pool.close().await;
  }

  // -------------------------------------------------------------------------
  // Migrations
  // -------------------------------------------------------------------------

  /// Bring the schema up to the newest released migration.
  pub async fn apply_migrations(&self) -> Result<MigrationOutcome, EtlError> {
    self.apply(MIGRATIONS).await
  }

  /// Apply every step above the stored version, in order, in one
  /// transaction. Any failure rolls the whole batch back.
  pub async fn apply(&self, steps: &[Migration]) -> Result<MigrationOutcome, EtlError> {
    migrations::check_order(steps).map_err(|reason| EtlError::migration(0, "ordering", reason))?;

    let _gate = self.write_gate.lock().await;
    let mut tx = self.pool.begin().await?;

    query::<Sqlite>(migrations::BOOTSTRAP).execute(&mut *tx).await?;
    query::<Sqlite>("INSERT OR IGNORE INTO schema_version (id, version, updated_at) VALUES (1, 0, ?)")
      .bind(Utc::now().to_rfc3339())
      .execute(&mut *tx)
      .await?;
    let current = read_version(&mut *tx).await?;

    let latest = migrations::latest_version(steps);
    if current > latest {
      return Err(EtlError::migration(
        current,
        "unknown",
        format!("store is at version {} but the newest known migration is {}", current, latest),
      ));
    }

    let mut applied = Vec::new();
    for step in steps.iter().filter(|m| m.version > current) {
      info!(version = step.version, description = step.description, "applying migration");
      for statement in step.statements {
        query::<Sqlite>(statement)
          .execute(&mut *tx)
          .await
          .map_err(|e| EtlError::migration(step.version, step.description, e.to_string()))?;
      }
      applied.push(step.version);
    }

    let to = applied.last().copied().unwrap_or(current);
    if to != current {
      query::<Sqlite>("UPDATE schema_version SET version = ?, updated_at = ? WHERE id = 1")
        .bind(to)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    if applied.is_empty() {
      debug!(version = current, "schema up to date");
    } else {
      info!(from = current, to, "schema migrated");
    }
    Ok(MigrationOutcome { from: current, to, applied })
  }

  /// Currently applied version; 0 for a store never migrated.
  pub async fn schema_version(&self) -> Result<i64, EtlError> {
    let exists = query::<Sqlite>("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'")
      .fetch_optional(&self.pool)
      .await?
      .is_some();
    if !exists {
      return Ok(0);
    }
    let row = query::<Sqlite>("SELECT version FROM schema_version WHERE id = 1")
      .fetch_optional(&self.pool)
      .await?;
    match row {
      Some(row) => Ok(row.try_get::<i64, _>("version")?),
      None => Ok(0),
    }
  }

  // -------------------------------------------------------------------------
  // Loading
  // -------------------------------------------------------------------------

  pub async fn is_file_processed(&self, fingerprint: &Fingerprint) -> Result<bool, EtlError> {
    let row = query::<Sqlite>("SELECT 1 FROM processed_files WHERE fingerprint = ?")
      .bind(fingerprint.0.as_str())
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.is_some())
  }

  /// Persist one file's correlated output and mark the file processed, all
  /// in one transaction. A known fingerprint makes this a no-op.
  pub async fn load(
    &self,
    file_id: &str,
    fingerprint: &Fingerprint,
    output: &CorrelationOutput,
  ) -> Result<LoadReport, EtlError> {
    let _gate = self.write_gate.lock().await;
    self.load_gated(file_id, fingerprint, output).await
  }

  /// As [`Store::load`], but the transaction must finish within `limit`.
  /// Waiting for the write gate is not counted; an expired transaction is
  /// dropped and rolls back.
  pub async fn load_within(
    &self,
    file_id: &str,
    fingerprint: &Fingerprint,
    output: &CorrelationOutput,
    limit: Duration,
  ) -> Result<LoadReport, EtlError> {
    let _gate = self.write_gate.lock().await;
    tokio::time::timeout(limit, self.load_gated(file_id, fingerprint, output))
      .await
      .map_err(|_| EtlError::Timeout {
        file_id: file_id.to_string(),
        millis: limit.as_millis() as u64,
      })?
  }

  async fn load_gated(
    &self,
    file_id: &str,
    fingerprint: &Fingerprint,
    output: &CorrelationOutput,
  ) -> Result<LoadReport, EtlError> {
    let mut tx = self.pool.begin().await?;

    let known = query::<Sqlite>("SELECT 1 FROM processed_files WHERE fingerprint = ?")
      .bind(fingerprint.0.as_str())
      .fetch_optional(&mut *tx)
      .await?
      .is_some();
    if known {
      debug!(file = %file_id, fingerprint = %fingerprint, "fingerprint already loaded");
      return Ok(LoadReport::skipped(file_id, fingerprint));
    }

    let mut report = LoadReport {
      file_id: file_id.to_string(),
      fingerprint: fingerprint.0.clone(),
      ..LoadReport::default()
    };

    for lifecycle in &output.lifecycles {
      upsert_lifecycle(&mut tx, lifecycle).await?;
      report.lifecycles += 1;
      report.annotations += lifecycle.annotations.len() as u64;
    }
    for orphan in &output.orphans {
      upsert_orphan(&mut tx, orphan).await?;
      report.orphans += 1;
    }
    for entry in &output.operational_logs {
      upsert_operational_log(&mut tx, file_id, entry).await?;
      report.operational_logs += 1;
    }

    query::<Sqlite>(
      r#"
      INSERT INTO processed_files
        (fingerprint, file_id, ingested_at, row_count, orphan_count, unrecognized_count)
      VALUES (?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(fingerprint.0.as_str())
    .bind(file_id)
    .bind(Utc::now().to_rfc3339())
    .bind(report.lifecycles as i64)
    .bind(report.orphans as i64)
    .bind(output.stats.unrecognized as i64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(report)
  }

  // -------------------------------------------------------------------------
  // Queries
  // -------------------------------------------------------------------------

  pub async fn processed_files(&self) -> Result<Vec<ProcessedFile>, EtlError> {
    let rows = query::<Sqlite>(
      r#"
      SELECT fingerprint, file_id, ingested_at, row_count, orphan_count, unrecognized_count
      FROM processed_files
      ORDER BY file_id, ingested_at
      "#,
    )
    .fetch_all(&self.pool)
    .await?;

    rows
      .iter()
      .map(|row| -> Result<ProcessedFile, EtlError> {
        Ok(ProcessedFile {
          fingerprint: Fingerprint(row.try_get("fingerprint")?),
          file_id: row.try_get("file_id")?,
          ingested_at: utc_column(row, "ingested_at")?,
          row_count: row.try_get::<i64, _>("row_count")? as u64,
          orphan_count: row.try_get::<i64, _>("orphan_count")? as u64,
          unrecognized_count: row.try_get::<i64, _>("unrecognized_count")? as u64,
        })
      })
      .collect()
  }

  /// Stored lifecycles matching `filter`, annotations included.
  pub async fn query_lifecycles(&self, filter: &LifecycleFilter) -> Result<Vec<AlarmLifecycle>, EtlError> {
    let mut sql = String::from(
      r#"
      SELECT component, alarm_code, raise_time, description, message, ack_time,
             ack_component, ack_operator, resolve_time, state, source_file, raise_line
      FROM alarm_lifecycles
      WHERE 1 = 1
      "#,
    );
    let mut args: Vec<String> = Vec::new();
    if let Some(state) = filter.state {
      sql.push_str(" AND state = ?");
      args.push(state.as_str().to_string());
    }
    if let Some(component) = &filter.component {
      sql.push_str(" AND component = ?");
      args.push(component.clone());
    }
    if let Some(alarm_code) = &filter.alarm_code {
      sql.push_str(" AND alarm_code = ?");
      args.push(alarm_code.clone());
    }
    sql.push_str(" ORDER BY raise_time DESC, component, alarm_code LIMIT ?");

    let mut q = query::<Sqlite>(&sql);
    for arg in &args {
      q = q.bind(arg.as_str());
    }
    let rows = q.bind(i64::from(filter.limit)).fetch_all(&self.pool).await?;

    let mut lifecycles = Vec::with_capacity(rows.len());
    for row in &rows {
      let mut lifecycle = lifecycle_from_row(row)?;
      lifecycle.annotations = self.annotations_for(&lifecycle.key()).await?;
      lifecycles.push(lifecycle);
    }
    Ok(lifecycles)
  }

  pub async fn annotations_for(&self, key: &LifecycleKey) -> Result<Vec<LogEntry>, EtlError> {
    let rows = query::<Sqlite>(
      r#"
      SELECT kind, line_no, logged_at, component, tag, value, by_component, by_operator
      FROM lifecycle_annotations
      WHERE component = ? AND alarm_code = ? AND raise_time = ?
      ORDER BY seq
      "#,
    )
    .bind(key.component.as_str())
    .bind(key.alarm_code.as_str())
    .bind(timestamp::format(&key.raise_time))
    .fetch_all(&self.pool)
    .await?;

    rows.iter().map(log_entry_from_row).collect()
  }

  pub async fn orphans_for(&self, file_id: &str) -> Result<Vec<Orphan>, EtlError> {
    let rows = query::<Sqlite>(
      r#"
      SELECT source_file, line_no, kind, component, alarm_code, event_time, detail
      FROM orphans
      WHERE source_file = ?
      ORDER BY line_no
      "#,
    )
    .bind(file_id)
    .fetch_all(&self.pool)
    .await?;

    rows
      .iter()
      .map(|row| -> Result<Orphan, EtlError> {
        let kind: String = row.try_get("kind")?;
        Ok(Orphan {
          file_id: row.try_get("source_file")?,
          line_no: row.try_get::<i64, _>("line_no")? as u32,
          kind: OrphanKind::from_str_loose(&kind)
            .ok_or_else(|| EtlError::Corrupt(format!("orphan kind {:?}", kind)))?,
          component: row.try_get("component")?,
          alarm_code: row.try_get("alarm_code")?,
          event_time: naive_column(row, "event_time")?,
          detail: row.try_get("detail")?,
        })
      })
      .collect()
  }

  pub async fn operational_logs_for(&self, file_id: &str) -> Result<Vec<LogEntry>, EtlError> {
    let rows = query::<Sqlite>(
      r#"
      SELECT kind, line_no, logged_at, component, tag, value, by_component, by_operator
      FROM operational_logs
      WHERE source_file = ?
      ORDER BY line_no
      "#,
    )
    .bind(file_id)
    .fetch_all(&self.pool)
    .await?;

    rows.iter().map(log_entry_from_row).collect()
  }

  /// Lifecycle row counts per state, states with no rows omitted.
  pub async fn lifecycle_states(&self) -> Result<Vec<(LifecycleState, u64)>, EtlError> {
    let rows = query::<Sqlite>("SELECT state, COUNT(*) AS n FROM alarm_lifecycles GROUP BY state ORDER BY state")
      .fetch_all(&self.pool)
      .await?;

    rows
      .iter()
      .map(|row| -> Result<(LifecycleState, u64), EtlError> {
        let state: String = row.try_get("state")?;
        let state = LifecycleState::from_str_loose(&state)
          .ok_or_else(|| EtlError::Corrupt(format!("lifecycle state {:?}", state)))?;
        Ok((state, row.try_get::<i64, _>("n")? as u64))
      })
      .collect()
  }

  pub async fn count(&self, table: Table) -> Result<u64, EtlError> {
    let sql = format!("SELECT COUNT(*) AS n FROM {}", table.name());
    let row = query::<Sqlite>(&sql).fetch_one(&self.pool).await?;
    Ok(row.try_get::<i64, _>("n")? as u64)
  }

  // -------------------------------------------------------------------------
  // Run history
  // -------------------------------------------------------------------------

  pub async fn record_run(&self, run: &IngestRun) -> Result<(), EtlError> {
    let _gate = self.write_gate.lock().await;
    query::<Sqlite>(
      r#"
      INSERT INTO ingest_runs
        (run_id, started_at, finished_at, files_total, files_loaded, files_skipped,
         files_failed, lifecycles_loaded, orphans, unrecognized, success)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      ON CONFLICT (run_id) DO UPDATE SET
        finished_at = excluded.finished_at,
        files_total = excluded.files_total,
        files_loaded = excluded.files_loaded,
        files_skipped = excluded.files_skipped,
        files_failed = excluded.files_failed,
        lifecycles_loaded = excluded.lifecycles_loaded,
        orphans = excluded.orphans,
        unrecognized = excluded.unrecognized,
        success = excluded.success
      "#,
    )
    .bind(run.run_id.as_str())
    .bind(run.started_at.to_rfc3339())
    .bind(run.finished_at.to_rfc3339())
    .bind(run.files_total as i64)
    .bind(run.files_loaded as i64)
    .bind(run.files_skipped as i64)
    .bind(run.files_failed as i64)
    .bind(run.lifecycles_loaded as i64)
    .bind(run.orphans as i64)
    .bind(run.unrecognized as i64)
    .bind(run.success)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  /// Most recent runs first.
  pub async fn runs(&self, limit: u32) -> Result<Vec<IngestRun>, EtlError> {
    let rows = query::<Sqlite>(
      r#"
      SELECT run_id, started_at, finished_at, files_total, files_loaded, files_skipped,
             files_failed, lifecycles_loaded, orphans, unrecognized, success
      FROM ingest_runs
      ORDER BY started_at DESC
      LIMIT ?
      "#,
    )
    .bind(i64::from(limit))
    .fetch_all(&self.pool)
    .await?;

    rows
      .iter()
      .map(|row| -> Result<IngestRun, EtlError> {
        Ok(IngestRun {
          run_id: row.try_get("run_id")?,
          started_at: utc_column(row, "started_at")?,
          finished_at: utc_column(row, "finished_at")?,
          files_total: row.try_get::<i64, _>("files_total")? as u64,
          files_loaded: row.try_get::<i64, _>("files_loaded")? as u64,
          files_skipped: row.try_get::<i64, _>("files_skipped")? as u64,
          files_failed: row.try_get::<i64, _>("files_failed")? as u64,
          lifecycles_loaded: row.try_get::<i64, _>("lifecycles_loaded")? as u64,
          orphans: row.try_get::<i64, _>("orphans")? as u64,
          unrecognized: row.try_get::<i64, _>("unrecognized")? as u64,
          success: row.try_get("success")?,
        })
      })
      .collect()
  }
}

// ---------------------------------------------------------------------------
// Write helpers (run inside the caller's transaction)
// ---------------------------------------------------------------------------

async fn read_version(conn: &mut SqliteConnection) -> Result<i64, EtlError> {
  let row = query::<Sqlite>("SELECT version FROM schema_version WHERE id = 1")
    .fetch_one(&mut *conn)
    .await?;
  Ok(row.try_get::<i64, _>("version")?)
}

/// Replace the row with the same (component, alarm code, raise time) and its annotations.
async fn upsert_lifecycle(conn: &mut SqliteConnection, lc: &AlarmLifecycle) -> Result<(), EtlError> {
  let raise_time = timestamp::format(&lc.raise_time);

  query::<Sqlite>(
    r#"
    INSERT INTO alarm_lifecycles
      (component, alarm_code, raise_time, description, message, ack_time, ack_component,
       ack_operator, resolve_time, state, source_file, raise_line)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (component, alarm_code, raise_time) DO UPDATE SET
      description = excluded.description,
      message = excluded.message,
      ack_time = excluded.ack_time,
      ack_component = excluded.ack_component,
      ack_operator = excluded.ack_operator,
      resolve_time = excluded.resolve_time,
      state = excluded.state,
      source_file = excluded.source_file,
      raise_line = excluded.raise_line
    "#,
  )
  .bind(lc.component.as_str())
  .bind(lc.alarm_code.as_str())
  .bind(raise_time.as_str())
  .bind(lc.description.as_str())
  .bind(lc.message.as_deref())
  .bind(lc.ack.as_ref().map(|a| timestamp::format(&a.time)))
  .bind(lc.ack.as_ref().map(|a| a.component.as_str()))
  .bind(lc.ack.as_ref().map(|a| a.operator.as_str()))
  .bind(lc.resolve_time.as_ref().map(timestamp::format))
  .bind(lc.state.as_str())
  .bind(lc.source_file.as_str())
  .bind(i64::from(lc.raise_line))
  .execute(&mut *conn)
  .await?;

  query::<Sqlite>("DELETE FROM lifecycle_annotations WHERE component = ? AND alarm_code = ? AND raise_time = ?")
    .bind(lc.component.as_str())
    .bind(lc.alarm_code.as_str())
    .bind(raise_time.as_str())
    .execute(&mut *conn)
    .await?;

  for (seq, entry) in lc.annotations.iter().enumerate() {
    query::<Sqlite>(
      r#"
      INSERT INTO lifecycle_annotations
        (component, alarm_code, raise_time, seq, kind, line_no, logged_at, tag, value,
         by_component, by_operator)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(lc.component.as_str())
    .bind(lc.alarm_code.as_str())
    .bind(raise_time.as_str())
    .bind(seq as i64)
    .bind(entry.kind.as_str())
    .bind(i64::from(entry.line_no))
    .bind(timestamp::format(&entry.logged_at))
    .bind(entry.tag.as_str())
    .bind(entry.value.as_str())
    .bind(entry.by_component.as_str())
    .bind(entry.by_operator.as_deref())
    .execute(&mut *conn)
    .await?;
  }
  Ok(())
}

async fn upsert_orphan(conn: &mut SqliteConnection, orphan: &Orphan) -> Result<(), EtlError> {
  query::<Sqlite>(
    r#"
    INSERT INTO orphans (source_file, line_no, kind, component, alarm_code, event_time, detail)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (component, alarm_code, kind, event_time) DO UPDATE SET
      detail = excluded.detail,
      source_file = excluded.source_file,
      line_no = excluded.line_no
    "#,
  )
  .bind(orphan.file_id.as_str())
  .bind(i64::from(orphan.line_no))
  .bind(orphan.kind.as_str())
  .bind(orphan.component.as_str())
  .bind(orphan.alarm_code.as_str())
  .bind(timestamp::format(&orphan.event_time))
  .bind(orphan.detail.as_str())
  .execute(&mut *conn)
  .await?;
  Ok(())
}

async fn upsert_operational_log(conn: &mut SqliteConnection, file_id: &str, entry: &LogEntry) -> Result<(), EtlError> {
  query::<Sqlite>(
    r#"
    INSERT INTO operational_logs
      (source_file, line_no, kind, logged_at, component, tag, value, by_component, by_operator)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (component, tag, logged_at, value) DO UPDATE SET
      kind = excluded.kind,
      by_component = excluded.by_component,
      by_operator = excluded.by_operator,
      source_file = excluded.source_file,
      line_no = excluded.line_no
    "#,
  )
  .bind(file_id)
  .bind(i64::from(entry.line_no))
  .bind(entry.kind.as_str())
  .bind(timestamp::format(&entry.logged_at))
  .bind(entry.component.as_str())
  .bind(entry.tag.as_str())
  .bind(entry.value.as_str())
  .bind(entry.by_component.as_str())
  .bind(entry.by_operator.as_deref())
  .execute(&mut *conn)
  .await?;
  Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn lifecycle_from_row(row: &SqliteRow) -> Result<AlarmLifecycle, EtlError> {
  let state: String = row.try_get("state")?;
  let ack_time: Option<String> = row.try_get("ack_time")?;
  let ack = match ack_time {
    Some(t) => Some(Acknowledgement {
      time: parse_naive(&t, "ack_time")?,
      component: row.try_get::<Option<String>, _>("ack_component")?.unwrap_or_default(),
      operator: row.try_get::<Option<String>, _>("ack_operator")?.unwrap_or_default(),
    }),
    None => None,
  };
  let resolve_time = match row.try_get::<Option<String>, _>("resolve_time")? {
    Some(t) => Some(parse_naive(&t, "resolve_time")?),
    None => None,
  };

  Ok(AlarmLifecycle {
    component: row.try_get("component")?,
    alarm_code: row.try_get("alarm_code")?,
    raise_time: naive_column(row, "raise_time")?,
    description: row.try_get("description")?,
    message: row.try_get("message")?,
    ack,
    annotations: Vec::new(),
    resolve_time,
    state: LifecycleState::from_str_loose(&state)
      .ok_or_else(|| EtlError::Corrupt(format!("lifecycle state {:?}", state)))?,
    source_file: row.try_get("source_file")?,
    raise_line: row.try_get::<i64, _>("raise_line")? as u32,
  })
}

fn log_entry_from_row(row: &SqliteRow) -> Result<LogEntry, EtlError> {
  let kind: String = row.try_get("kind")?;
  Ok(LogEntry {
    kind: RecordKind::from_str_loose(&kind).ok_or_else(|| EtlError::Corrupt(format!("record kind {:?}", kind)))?,
    line_no: row.try_get::<i64, _>("line_no")? as u32,
    logged_at: naive_column(row, "logged_at")?,
    component: row.try_get("component")?,
    tag: row.try_get("tag")?,
    value: row.try_get("value")?,
    by_component: row.try_get("by_component")?,
    by_operator: row.try_get("by_operator")?,
  })
}

fn naive_column(row: &SqliteRow, column: &str) -> Result<chrono::NaiveDateTime, EtlError> {
  let raw: String = row.try_get(column)?;
  parse_naive(&raw, column)
}

fn parse_naive(raw: &str, column: &str) -> Result<chrono::NaiveDateTime, EtlError> {
  timestamp::parse_storage(raw).ok_or_else(|| EtlError::Corrupt(format!("{}: {:?}", column, raw)))
}

fn utc_column(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, EtlError> {
  let raw: String = row.try_get(column)?;
  DateTime::parse_from_rfc3339(&raw)
    .map(|t| t.with_timezone(&Utc))
    .map_err(|_| EtlError::Corrupt(format!("{}: {:?}", column, raw)))
}

fn is_memory_url(url: &str) -> bool {
  url.contains(":memory:") || url.contains("mode=memory")
}

/// File path behind a `sqlite://path` or `sqlite:path` URL.
fn database_path(url: &str) -> Option<PathBuf> {
  let rest = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
  let path = rest.split('?').next().unwrap_or(rest);
  if path.is_empty() {
    None
  } else {
    Some(PathBuf::from(path))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pipeline::correlate_source;
  use crate::source::SourceFile;

  #[test]
  fn database_path_from_url() {
    assert_eq!(database_path("sqlite://database/a.db"), Some(PathBuf::from("database/a.db")));
    assert_eq!(database_path("sqlite:a.db?mode=rwc"), Some(PathBuf::from("a.db")));
    assert_eq!(database_path("postgres://x"), None);
  }

  #[test]
  fn memory_urls_detected() {
    assert!(is_memory_url("sqlite::memory:"));
    assert!(is_memory_url("sqlite://file?mode=memory"));
    assert!(!is_memory_url("sqlite://database/a.db"));
  }

  #[tokio::test]
  async fn fresh_store_migrates_to_latest() {
    let store = Store::in_memory().await.unwrap();
    assert_eq!(store.schema_version().await.unwrap(), 0);

    let outcome = store.apply_migrations().await.unwrap();
    assert_eq!(outcome.from, 0);
    assert_eq!(outcome.to, 3);
    assert_eq!(outcome.applied, vec![1, 2, 3]);
    assert_eq!(store.schema_version().await.unwrap(), 3);
    assert_eq!(store.count(Table::Lifecycles).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn second_migration_run_is_noop() {
    let store = Store::in_memory().await.unwrap();
    store.apply_migrations().await.unwrap();
    let again = store.apply_migrations().await.unwrap();
    assert_eq!(again.from, 3);
    assert_eq!(again.to, 3);
    assert!(again.applied.is_empty());
  }

  #[tokio::test]
  async fn failing_step_rolls_back_whole_batch() {
    let store = Store::in_memory().await.unwrap();
    store.apply(&MIGRATIONS[..1]).await.unwrap();

    let broken = [
      MIGRATIONS[0],
      Migration {
        version: 2,
        description: "half applied",
        statements: &["CREATE TABLE scratch (x INTEGER)", "THIS IS NOT SQL"],
      },
    ];
    let err = store.apply(&broken).await.unwrap_err();
    assert!(matches!(err, EtlError::Migration { version: 2, .. }));

    assert_eq!(store.schema_version().await.unwrap(), 1);
    let scratch = query::<Sqlite>("SELECT 1 FROM sqlite_master WHERE name = 'scratch'")
      .fetch_optional(&store.pool)
      .await
      .unwrap();
    assert!(scratch.is_none());
  }

  #[tokio::test]
  async fn newer_store_is_not_downgraded() {
    let store = Store::in_memory().await.unwrap();
    store.apply_migrations().await.unwrap();
    let err = store.apply(&MIGRATIONS[..1]).await.unwrap_err();
    assert!(matches!(err, EtlError::Migration { .. }));
    assert_eq!(store.schema_version().await.unwrap(), 3);
  }

  fn closed_day() -> (SourceFile, CorrelationOutput) {
    let source = SourceFile::from_text(
      "2025-10-05_formulacao.log",
      "2025-10-05 08:15:30,5 [PC510A00] FMDOS01 CFN ALARM Erro dosagem\n\
       2025-10-05 08:22:15,6 [PC510A00] FMDOS01 OK A_OK Erro dosagem\n",
    );
    let output = correlate_source(&source).unwrap();
    (source, output)
  }

  #[tokio::test]
  async fn load_expires_when_transaction_cannot_start() {
    let store = Store::in_memory().await.unwrap();
    store.apply_migrations().await.unwrap();
    let (source, output) = closed_day();

    // The in-memory pool has one connection; holding it stalls `begin`.
    let held = store.pool.acquire().await.unwrap();
    let err = store
      .load_within(&source.file_id, &source.fingerprint, &output, Duration::from_millis(50))
      .await
      .unwrap_err();
    assert!(matches!(err, EtlError::Timeout { .. }));
    assert!(err.is_retryable());
    drop(held);

    assert!(!store.is_file_processed(&source.fingerprint).await.unwrap());
    let load = store
      .load_within(&source.file_id, &source.fingerprint, &output, Duration::from_secs(30))
      .await
      .unwrap();
    assert_eq!(load.lifecycles, 1);
  }

  #[tokio::test]
  async fn waiting_for_the_write_gate_is_not_timed() {
    let store = Store::in_memory().await.unwrap();
    store.apply_migrations().await.unwrap();
    let (source, output) = closed_day();

    let gate = store.write_gate.clone().lock_owned().await;
    let loader = {
      let store = store.clone();
      tokio::spawn(async move {
        store
          .load_within(&source.file_id, &source.fingerprint, &output, Duration::from_millis(50))
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(gate);

    let load = loader.await.unwrap().unwrap();
    assert_eq!(load.lifecycles, 1);
  }

  #[tokio::test]
  async fn rekeying_collapses_rows_for_the_same_event() {
    let store = Store::in_memory().await.unwrap();
    store.apply(&MIGRATIONS[..2]).await.unwrap();

    for (file, line) in [("a.log", 1), ("b.log", 2)] {
      query::<Sqlite>(
        "INSERT INTO orphans (source_file, line_no, kind, component, alarm_code, event_time, detail)
         VALUES (?, ?, 'ORPHAN_OK', 'PC510A00', 'FMDOS01', '2025-10-05 08:22:15.600', 'ok without raise')",
      )
      .bind(file)
      .bind(line)
      .execute(&store.pool)
      .await
      .unwrap();
      query::<Sqlite>(
        "INSERT INTO operational_logs
           (source_file, line_no, kind, logged_at, component, tag, value, by_component, by_operator)
         VALUES (?, ?, 'NORMAL_LOG', '2025-10-05 09:01:00.200', 'PC530A00', 'IX_VARE_NR.A_CV', 'Aspart', 'PC530A00', 'MIXR')",
      )
      .bind(file)
      .bind(line)
      .execute(&store.pool)
      .await
      .unwrap();
    }

    let outcome = store.apply_migrations().await.unwrap();
    assert_eq!(outcome.applied, vec![3]);
    assert_eq!(store.count(Table::Orphans).await.unwrap(), 1);
    assert_eq!(store.count(Table::OperationalLogs).await.unwrap(), 1);
  }
}
