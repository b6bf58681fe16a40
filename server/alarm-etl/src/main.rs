//! Binary entrypoint: run the ETL over a directory of daily logs, or inspect
//! the store.
//!
//! stdout carries JSON lines only (one per file report, then a run summary,
//! or one per queried row). Diagnostics go to stderr through `tracing`.
//!
//! Exit status: 0 success, 1 at least one file failed, 2 fatal error
//! (configuration, store or migration).

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use alarm_etl::store::migrations;
use alarm_etl::telemetry::init_tracing;
use alarm_etl::{Config, LifecycleFilter, LifecycleState, Pipeline, Store, Table};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "alarm-etl", version, about = "Formulation line alarm log ETL")]
struct Cli {
  /// SQLite URL; overrides ALARM_ETL_DATABASE_URL.
  #[arg(long, global = true)]
  database: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
  /// Ingest log files (all files in the source directory when none are given).
  Run {
    #[arg(long)]
    source_dir: Option<PathBuf>,
    #[arg(long)]
    workers: Option<usize>,
    files: Vec<PathBuf>,
  },
  /// Apply pending schema migrations and print the resulting version.
  Migrate,
  /// Stored schema version; row counts, processed files and recent runs once
  /// the schema is current. Never migrates.
  Status {
    #[arg(long, default_value_t = 10)]
    runs: u32,
  },
  /// Print stored lifecycles, newest raise first. Requires a current schema.
  Query {
    #[arg(long, value_parser = parse_state)]
    state: Option<LifecycleState>,
    #[arg(long)]
    component: Option<String>,
    #[arg(long)]
    alarm_code: Option<String>,
    #[arg(long, default_value_t = 100)]
    limit: u32,
  },
}

fn parse_state(s: &str) -> Result<LifecycleState, String> {
  LifecycleState::from_str_loose(s).ok_or_else(|| format!("unknown state {:?} (open, acknowledged, closed, orphaned)", s))
}

/// Row counts are only read from a store at the current schema version.
#[derive(Serialize)]
struct StatusLine {
  schema_version: i64,
  latest_version: i64,
  #[serde(flatten)]
  rows: Option<RowCounts>,
}

#[derive(Serialize)]
struct RowCounts {
  lifecycles: u64,
  open_lifecycles: u64,
  by_state: BTreeMap<&'static str, u64>,
  orphans: u64,
  operational_logs: u64,
  processed_files: u64,
  runs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
  init_tracing();
  let cli = Cli::parse();

  match execute(cli).await {
    Ok(code) => code,
    Err(e) => {
      error!(error = %format!("{:#}", e), "fatal");
      ExitCode::from(2)
    }
  }
}

async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
  let mut config = Config::from_env().context("loading configuration")?;
  if let Some(url) = cli.database {
    config.database_url = url;
  }

  let stdout = io::stdout();
  let mut out = io::BufWriter::new(stdout.lock());

  let code = match cli.command {
    Command::Run { source_dir, workers, files } => {
      if let Some(dir) = source_dir {
        config.source_dir = dir;
      }
      if let Some(n) = workers {
        config.max_workers = n;
      }
      config.validate().context("validating configuration")?;

      let store = Store::connect(&config).await.context("opening store")?;
      let pipeline = Pipeline::new(config, store.clone()).context("building pipeline")?;
      let paths = if files.is_empty() {
        pipeline.discover().context("listing source files")?
      } else {
        files
      };

      let report = pipeline.run(paths).await.context("running pipeline")?;
      for file in &report.files {
        emit(&mut out, file)?;
      }
      emit(&mut out, &report)?;
      store.close().await;

      if report.success() {
        ExitCode::SUCCESS
      } else {
        ExitCode::from(1)
      }
    }

    Command::Migrate => {
      let store = Store::connect(&config).await.context("opening store")?;
      let outcome = store.apply_migrations().await.context("applying migrations")?;
      emit(&mut out, &outcome)?;
      store.close().await;
      ExitCode::SUCCESS
    }

    Command::Status { runs } => {
      let store = Store::connect(&config).await.context("opening store")?;
      write_status(&store, runs, &mut out).await?;
      store.close().await;
      ExitCode::SUCCESS
    }

    Command::Query {
      state,
      component,
      alarm_code,
      limit,
    } => {
      let store = Store::connect(&config).await.context("opening store")?;
      let filter = LifecycleFilter {
        state,
        component,
        alarm_code,
        limit,
      };
      write_query(&store, &filter, &mut out).await?;
      store.close().await;
      ExitCode::SUCCESS
    }
  };

  out.flush().context("flushing stdout")?;
  Ok(code)
}

/// Read-only: reports the stored schema version without migrating.
async fn write_status<W: Write>(store: &Store, runs: u32, out: &mut W) -> anyhow::Result<()> {
  let version = store.schema_version().await?;
  let latest = migrations::latest_version(migrations::MIGRATIONS);
  let current = version == latest;

  let rows = if current { Some(row_counts(store).await?) } else { None };
  emit(
    out,
    &StatusLine {
      schema_version: version,
      latest_version: latest,
      rows,
    },
  )?;
  if current {
    for file in store.processed_files().await? {
      emit(out, &file)?;
    }
    for run in store.runs(runs).await? {
      emit(out, &run)?;
    }
  }
  Ok(())
}

async fn write_query<W: Write>(store: &Store, filter: &LifecycleFilter, out: &mut W) -> anyhow::Result<()> {
  let version = store.schema_version().await?;
  let latest = migrations::latest_version(migrations::MIGRATIONS);
  if version != latest {
    anyhow::bail!("store is at schema version {}, expected {}; run `alarm-etl migrate`", version, latest);
  }
  for lifecycle in store.query_lifecycles(filter).await? {
    emit(out, &lifecycle)?;
  }
  Ok(())
}

async fn row_counts(store: &Store) -> anyhow::Result<RowCounts> {
  let states = store.lifecycle_states().await?;
  let open = states
    .iter()
    .filter(|(state, _)| !state.is_terminal())
    .map(|(_, n)| n)
    .sum::<u64>();
  Ok(RowCounts {
    lifecycles: store.count(Table::Lifecycles).await?,
    open_lifecycles: open,
    by_state: states.iter().map(|(state, n)| (state.as_str(), *n)).collect(),
    orphans: store.count(Table::Orphans).await?,
    operational_logs: store.count(Table::OperationalLogs).await?,
    processed_files: store.count(Table::ProcessedFiles).await?,
    runs: store.count(Table::IngestRuns).await?,
  })
}

fn emit<W: Write, T: Serialize>(out: &mut W, value: &T) -> anyhow::Result<()> {
  serde_json::to_writer(&mut *out, value)?;
  writeln!(out)?;
  Ok(())
}
