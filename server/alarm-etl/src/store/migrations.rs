//! Ordered schema migrations. Versions are strictly increasing; a step is
//! never edited once released, new structure goes into a new step.

/// One schema step: every statement runs inside the caller's transaction.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
  pub version: i64,
  pub description: &'static str,
  pub statements: &'static [&'static str],
}

/// Created before any step runs; holds the single applied-version row.
pub(crate) const BOOTSTRAP: &str = r#"
  CREATE TABLE IF NOT EXISTS schema_version (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    version    INTEGER NOT NULL,
    updated_at TEXT NOT NULL
  )
"#;

pub const MIGRATIONS: &[Migration] = &[
  Migration {
    version: 1,
    description: "lifecycles, annotations, orphans, processed files",
    statements: &[
      r#"
      CREATE TABLE processed_files (
        fingerprint        TEXT PRIMARY KEY,
        file_id            TEXT NOT NULL,
        ingested_at        TEXT NOT NULL,
        row_count          INTEGER NOT NULL,
        orphan_count       INTEGER NOT NULL,
        unrecognized_count INTEGER NOT NULL
      )
      "#,
      r#"
      CREATE TABLE alarm_lifecycles (
        component     TEXT NOT NULL,
        alarm_code    TEXT NOT NULL,
        raise_time    TEXT NOT NULL,
        description   TEXT NOT NULL,
        message       TEXT,
        ack_time      TEXT,
        ack_component TEXT,
        ack_operator  TEXT,
        resolve_time  TEXT,
        state         TEXT NOT NULL,
        source_file   TEXT NOT NULL,
        raise_line    INTEGER NOT NULL,
        PRIMARY KEY (component, alarm_code, raise_time)
      )
      "#,
      r#"
      CREATE TABLE lifecycle_annotations (
        component    TEXT NOT NULL,
        alarm_code   TEXT NOT NULL,
        raise_time   TEXT NOT NULL,
        seq          INTEGER NOT NULL,
        kind         TEXT NOT NULL,
        line_no      INTEGER NOT NULL,
        logged_at    TEXT NOT NULL,
        tag          TEXT NOT NULL,
        value        TEXT NOT NULL,
        by_component TEXT NOT NULL,
        by_operator  TEXT,
        PRIMARY KEY (component, alarm_code, raise_time, seq),
        FOREIGN KEY (component, alarm_code, raise_time)
          REFERENCES alarm_lifecycles (component, alarm_code, raise_time)
          ON DELETE CASCADE
      )
      "#,
      r#"
      CREATE TABLE orphans (
        source_file TEXT NOT NULL,
        line_no     INTEGER NOT NULL,
        kind        TEXT NOT NULL,
        component   TEXT NOT NULL,
        alarm_code  TEXT NOT NULL,
        event_time  TEXT NOT NULL,
        detail      TEXT NOT NULL,
        PRIMARY KEY (source_file, line_no)
      )
      "#,
    ],
  },
  Migration {
    version: 2,
    description: "operational logs, ingest runs, query indexes",
    statements: &[
      r#"
      CREATE TABLE operational_logs (
        source_file  TEXT NOT NULL,
        line_no      INTEGER NOT NULL,
        kind         TEXT NOT NULL,
        logged_at    TEXT NOT NULL,
        component    TEXT NOT NULL,
        tag          TEXT NOT NULL,
        value        TEXT NOT NULL,
        by_component TEXT NOT NULL,
        by_operator  TEXT,
        PRIMARY KEY (source_file, line_no)
      )
      "#,
      r#"
      CREATE TABLE ingest_runs (
        run_id            TEXT PRIMARY KEY,
        started_at        TEXT NOT NULL,
        finished_at       TEXT NOT NULL,
        files_total       INTEGER NOT NULL,
        files_loaded      INTEGER NOT NULL,
        files_skipped     INTEGER NOT NULL,
        files_failed      INTEGER NOT NULL,
        lifecycles_loaded INTEGER NOT NULL,
        orphans           INTEGER NOT NULL,
        unrecognized      INTEGER NOT NULL,
        success           INTEGER NOT NULL
      )
      "#,
      "CREATE INDEX idx_lifecycles_state ON alarm_lifecycles (state, raise_time)",
      "CREATE INDEX idx_lifecycles_resolve ON alarm_lifecycles (resolve_time)",
      "CREATE INDEX idx_lifecycles_source ON alarm_lifecycles (source_file)",
      "CREATE INDEX idx_orphans_kind ON orphans (kind, event_time)",
    ],
  },
  Migration {
    version: 3,
    description: "key orphans and operational logs on the event, not its line",
    statements: &[
      r#"
      CREATE TABLE orphans_by_event (
        component   TEXT NOT NULL,
        alarm_code  TEXT NOT NULL,
        kind        TEXT NOT NULL,
        event_time  TEXT NOT NULL,
        detail      TEXT NOT NULL,
        source_file TEXT NOT NULL,
        line_no     INTEGER NOT NULL,
        PRIMARY KEY (component, alarm_code, kind, event_time)
      )
      "#,
      r#"
      INSERT OR IGNORE INTO orphans_by_event
        (component, alarm_code, kind, event_time, detail, source_file, line_no)
      SELECT component, alarm_code, kind, event_time, detail, source_file, line_no
      FROM orphans
      ORDER BY source_file DESC, line_no
      "#,
      "DROP TABLE orphans",
      "ALTER TABLE orphans_by_event RENAME TO orphans",
      "CREATE INDEX idx_orphans_kind ON orphans (kind, event_time)",
      "CREATE INDEX idx_orphans_source ON orphans (source_file, line_no)",
      r#"
      CREATE TABLE operational_logs_by_event (
        component    TEXT NOT NULL,
        tag          TEXT NOT NULL,
        logged_at    TEXT NOT NULL,
        value        TEXT NOT NULL,
        kind         TEXT NOT NULL,
        by_component TEXT NOT NULL,
        by_operator  TEXT,
        source_file  TEXT NOT NULL,
        line_no      INTEGER NOT NULL,
        PRIMARY KEY (component, tag, logged_at, value)
      )
      "#,
      r#"
      INSERT OR IGNORE INTO operational_logs_by_event
        (component, tag, logged_at, value, kind, by_component, by_operator, source_file, line_no)
      SELECT component, tag, logged_at, value, kind, by_component, by_operator, source_file, line_no
      FROM operational_logs
      ORDER BY source_file DESC, line_no
      "#,
      "DROP TABLE operational_logs",
      "ALTER TABLE operational_logs_by_event RENAME TO operational_logs",
      "CREATE INDEX idx_operational_logs_source ON operational_logs (source_file, line_no)",
    ],
  },
];

/// Highest version in `migrations`, 0 for none.
pub fn latest_version(migrations: &[Migration]) -> i64 {
  migrations.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Versions must be positive and strictly increasing.
pub fn check_order(migrations: &[Migration]) -> Result<(), String> {
  let mut previous = 0;
  for m in migrations {
    if m.version <= previous {
      return Err(format!(
        "migration {} listed after {}: versions must strictly increase",
        m.version, previous
      ));
    }
    previous = m.version;
  }
  Ok(())
}
