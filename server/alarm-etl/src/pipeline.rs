//! Run orchestration: migrate once, then read, classify, correlate and load
//! each file in its own task, bounded by `max_workers`.
//!
//! A file's failure is recorded in its report and never stops the others.
//! Only a migration failure aborts the run, before any file is touched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::classify;
use crate::config::Config;
use crate::correlate::{correlate, CorrelationOutput};
use crate::error::EtlError;
use crate::source::{self, Encoding, SourceFile};
use crate::store::Store;
use crate::types::{ClassifiedRecord, IngestRun, LoadReport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
  Loaded,
  Skipped,
  Failed { error: String },
}

/// Outcome of one file, printed as one JSON line by the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
  pub file_id: String,
  /// Calendar day from the `<YYYY-MM-DD>_...` file name.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub date: Option<NaiveDate>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fingerprint: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub encoding: Option<Encoding>,
  #[serde(flatten)]
  pub status: FileStatus,
  pub lines: u64,
  pub classified: u64,
  pub unrecognized: u64,
  pub orphans: u64,
  pub lifecycles: u64,
  pub annotations: u64,
  pub operational_logs: u64,
  /// Load attempts made; 0 when the file never reached the store.
  pub attempts: u32,
}

impl FileReport {
  pub fn new(file_id: impl Into<String>) -> Self {
    Self {
      file_id: file_id.into(),
      date: None,
      fingerprint: None,
      encoding: None,
      status: FileStatus::Loaded,
      lines: 0,
      classified: 0,
      unrecognized: 0,
      orphans: 0,
      lifecycles: 0,
      annotations: 0,
      operational_logs: 0,
      attempts: 0,
    }
  }

  fn failed(mut self, err: &EtlError) -> Self {
    self.status = FileStatus::Failed { error: err.to_string() };
    self
  }

  pub fn is_failed(&self) -> bool {
    matches!(self.status, FileStatus::Failed { .. })
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
  #[serde(flatten)]
  pub run: IngestRun,
  #[serde(skip)]
  pub files: Vec<FileReport>,
}

impl RunReport {
  pub fn success(&self) -> bool {
    self.run.success
  }
}

#[derive(Clone)]
pub struct Pipeline {
  config: Arc<Config>,
  store: Store,
}

impl Pipeline {
  /// Rejects a config that could stall a run, e.g. zero workers.
  pub fn new(config: Config, store: Store) -> Result<Self, EtlError> {
    config.validate()?;
    Ok(Self {
      config: Arc::new(config),
      store,
    })
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  /// Every matching file under the configured source directory.
  pub fn discover(&self) -> Result<Vec<PathBuf>, EtlError> {
    source::list_log_files(&self.config.source_dir, &self.config.file_extension)
  }

  /// Migrate, then process `paths` concurrently and record the run.
  ///
  /// Returns `Err` only when migrations fail; per-file failures are in the
  /// report and clear `success`.
  pub async fn run(&self, paths: Vec<PathBuf>) -> Result<RunReport, EtlError> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4().to_string();

    let migration = self.store.apply_migrations().await?;
    info!(run = %run_id, files = paths.len(), schema = migration.to, "run started");

    let permits = Arc::new(Semaphore::new(self.config.max_workers));
    let mut tasks = JoinSet::new();
    for (index, path) in paths.into_iter().enumerate() {
      let pipeline = self.clone();
      let permits = Arc::clone(&permits);
      tasks.spawn(async move {
        // The semaphore is never closed.
        let _permit = permits.acquire_owned().await.ok();
        (index, pipeline.process_file(&path).await)
      });
    }

    let mut indexed = Vec::new();
    while let Some(joined) = tasks.join_next().await {
      match joined {
        Ok(done) => indexed.push(done),
        Err(e) => warn!(run = %run_id, error = %e, "file task aborted"),
      }
    }
    indexed.sort_by_key(|(index, _)| *index);
    let files: Vec<FileReport> = indexed.into_iter().map(|(_, report)| report).collect();

    let run = summarize(run_id, started_at, &files);
    if let Err(e) = self.store.record_run(&run).await {
      warn!(run = %run.run_id, error = %e, "run summary not recorded");
    }
    info!(
      run = %run.run_id,
      loaded = run.files_loaded,
      skipped = run.files_skipped,
      failed = run.files_failed,
      lifecycles = run.lifecycles_loaded,
      "run finished"
    );
    Ok(RunReport { run, files })
  }

  /// Process one file end to end. Assumes the schema is current.
  pub async fn process_file(&self, path: &Path) -> FileReport {
    let file_id = path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| path.display().to_string());
    let report = FileReport::new(file_id);

    let source = match read_blocking(path.to_path_buf()).await {
      Ok(s) => s,
      Err(e) => {
        warn!(file = %report.file_id, error = %e, "file not readable");
        return report.failed(&e);
      }
    };
    self.process_source(source, report).await
  }

  /// Process an already-read source.
  pub async fn process_source(&self, source: SourceFile, mut report: FileReport) -> FileReport {
    report.file_id = source.file_id.clone();
    report.date = source.date();
    report.fingerprint = Some(source.fingerprint.0.clone());
    report.encoding = Some(source.encoding);
    report.lines = source.lines.len() as u64;

    match self.store.is_file_processed(&source.fingerprint).await {
      Ok(true) => {
        info!(file = %source.file_id, fingerprint = %source.fingerprint, "already processed, skipping");
        report.status = FileStatus::Skipped;
        return report;
      }
      Ok(false) => {}
      Err(e) => return report.failed(&e),
    }

    let output = match correlate_source(&source) {
      Ok(o) => o,
      Err(e) => {
        warn!(file = %source.file_id, error = %e, "correlation failed");
        return report.failed(&e);
      }
    };
    report.classified = output.stats.classified();
    report.unrecognized = output.stats.unrecognized;

    match self.load_with_retries(&source, &output, &mut report.attempts).await {
      Ok(load) if load.skipped => report.status = FileStatus::Skipped,
      Ok(load) => {
        report.status = FileStatus::Loaded;
        report.lifecycles = load.lifecycles;
        report.annotations = load.annotations;
        report.orphans = load.orphans;
        report.operational_logs = load.operational_logs;
      }
      Err(e) => {
        warn!(file = %source.file_id, attempts = report.attempts, error = %e, "load failed");
        return report.failed(&e);
      }
    }
    report
  }

  async fn load_with_retries(
    &self,
    source: &SourceFile,
    output: &CorrelationOutput,
    attempts: &mut u32,
  ) -> Result<LoadReport, EtlError> {
    let max_attempts = self.config.load_retries.saturating_add(1);
    let timeout = self.config.load_timeout();

    loop {
      *attempts += 1;
      let attempt = self
        .store
        .load_within(&source.file_id, &source.fingerprint, output, timeout)
        .await;

      match attempt {
        Ok(load) => return Ok(load),
        Err(e) if e.is_retryable() && *attempts < max_attempts => {
          let wait = self.config.retry_backoff() * *attempts;
          warn!(
            file = %source.file_id,
            attempt = *attempts,
            wait_ms = wait.as_millis() as u64,
            error = %e,
            "load failed, retrying"
          );
          tokio::time::sleep(wait).await;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

/// Classify every line and correlate the file in one pass.
pub fn correlate_source(source: &SourceFile) -> Result<CorrelationOutput, EtlError> {
  let records = source.raw_lines().map(|line| {
    let record = classify(&line);
    if let ClassifiedRecord::Unrecognized { reason, .. } = &record {
      debug!(file = %line.file_id, line = line.line_no, reason = *reason, "unrecognized line");
    }
    record
  });
  let output = correlate(&source.file_id, records)?;

  let stats = &output.stats;
  info!(
    file = %source.file_id,
    records = stats.records,
    unrecognized = stats.unrecognized,
    lifecycles = output.lifecycles.len(),
    orphans = stats.orphans,
    unresolved = stats.unresolved,
    "file correlated"
  );
  Ok(output)
}

async fn read_blocking(path: PathBuf) -> Result<SourceFile, EtlError> {
  let display = path.clone();
  tokio::task::spawn_blocking(move || source::read_source(&path))
    .await
    .map_err(|e| EtlError::io(display, std::io::Error::other(e.to_string())))?
}

fn summarize(run_id: String, started_at: chrono::DateTime<Utc>, files: &[FileReport]) -> IngestRun {
  let mut run = IngestRun {
    run_id,
    started_at,
    finished_at: Utc::now(),
    files_total: files.len() as u64,
    files_loaded: 0,
    files_skipped: 0,
    files_failed: 0,
    lifecycles_loaded: 0,
    orphans: 0,
    unrecognized: 0,
    success: true,
  };
  for file in files {
    match file.status {
      FileStatus::Loaded => run.files_loaded += 1,
      FileStatus::Skipped => run.files_skipped += 1,
      FileStatus::Failed { .. } => run.files_failed += 1,
    }
    run.lifecycles_loaded += file.lifecycles;
    run.orphans += file.orphans;
    run.unrecognized += file.unrecognized;
  }
  run.success = run.files_failed == 0;
  run
}
