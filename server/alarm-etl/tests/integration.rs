//! Integration tests for the alarm ETL: source files on disk, a real SQLite
//! database in a temp directory, the full pipeline in between.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alarm_etl::correlate::correlate;
use alarm_etl::fingerprint;
use alarm_etl::pipeline::correlate_source;
use alarm_etl::source::SourceFile;
use alarm_etl::types::{Fingerprint, LifecycleKey};
use alarm_etl::{
  classify, Config, EtlError, FileReport, FileStatus, LifecycleFilter, LifecycleState, OrphanKind, Pipeline, RawLine,
  Store, Table,
};
use chrono::{NaiveDate, NaiveDateTime};
use sqlx_core::connection::Connection;
use sqlx_core::query::query;
use sqlx_sqlite::{Sqlite, SqliteConnection};
use tempfile::TempDir;

const CLOSED_DAY: &str = "\
2025-10-05 08:15:30,5 [PC510A00] FMDOS01 CFN ALARM Erro dosagem ingrediente principal
2025-10-05 08:17:22,8 [PC510A00] FMDOS01 ALARM is acknowledged by PC520A00::FORM ACK
2025-10-05 08:22:15,6 [PC510A00] FMDOS01 OK A_OK Erro dosagem ingrediente principal
";

const BUSY_DAY: &str = "\
2025-10-06 06:00:01,2 [PC520A01] -2147220484: FORM_Background_Schedule_WDG by PC520A01
2025-10-06 07:02:11,3 [PC520A01] FMTMP01                        ALARM           ALARM      Temperatura fora de especificação
2025-10-06 07:02:12,0 [PC520A01] FMTMP01                        CFN             MSG.       Verificar resistencia
2025-10-06 07:03:00,4 [PC520A01] FMTMP01 ALARM is acknowledged by PC520A00::CTRL                           ACK
2025-10-06 07:03:01,1 [PC520A01] Pix32.PC520A01.IX_BATCH_LOGDATA_1A.A_CV set to Ajuste de temperatura by PC520A00::CTRL
2025-10-06 07:03:01,2 [PC520A01] Pix32.PC520A01.IX_BATCH_LOGDATA_01.F_CV set to 72.5 by PC520A00::CTRL
2025-10-06 07:05:00,0 [PC530A00] Pix32.PC530A00.IX_VARE_NR.A_CV set to Insulin Aspart FormBase 100 by PC530A00::MIXR
2025-10-06 07:10:40,9 [PC520A01] FMTMP01 OK A_OK Temperatura fora de especificação
2025-10-06 07:11:00,0 [PC510A01] FMPRS02 OK A_OK Pressao baixa
2025-10-06 07:12:00,0 [PC510A01] FMVIS03 CFN ALARM Viscosidade fora do limite
garbage that is not a log line
";

fn ts(day: u32, h: u32, m: u32, s: u32, ms: u32) -> NaiveDateTime {
  NaiveDate::from_ymd_opt(2025, 10, day)
    .unwrap()
    .and_hms_milli_opt(h, m, s, ms)
    .unwrap()
}

fn write_log(dir: &Path, name: &str, body: &str) -> PathBuf {
  let path = dir.join(name);
  fs::write(&path, body).unwrap();
  path
}

fn config_for(tmp: &TempDir) -> Config {
  Config {
    source_dir: tmp.path().join("logs"),
    database_url: format!("sqlite://{}", tmp.path().join("db").join("alarms.db").display()),
    retry_backoff_ms: 1,
    ..Config::default()
  }
}

async fn pipeline_with(config: Config) -> Pipeline {
  fs::create_dir_all(&config.source_dir).unwrap();
  let store = Store::connect(&config).await.unwrap();
  Pipeline::new(config, store).unwrap()
}

async fn pipeline_for(tmp: &TempDir) -> Pipeline {
  pipeline_with(config_for(tmp)).await
}

/// A second connection to the same database, outside the store.
async fn side_connection(config: &Config) -> SqliteConnection {
  SqliteConnection::connect(&config.database_url).await.unwrap()
}

#[tokio::test]
async fn concrete_scenario_loads_one_closed_lifecycle() {
  let tmp = TempDir::new().unwrap();
  let pipeline = pipeline_for(&tmp).await;
  let path = write_log(&tmp.path().join("logs"), "2025-10-05_formulacao.log", CLOSED_DAY);

  let report = pipeline.run(vec![path]).await.unwrap();
  assert!(report.success());
  assert_eq!(report.files.len(), 1);
  assert_eq!(report.files[0].status, FileStatus::Loaded);
  assert_eq!(report.files[0].lifecycles, 1);
  assert_eq!(report.files[0].orphans, 0);

  let store = pipeline.store();
  let stored = store.query_lifecycles(&LifecycleFilter::default()).await.unwrap();
  assert_eq!(stored.len(), 1);
  let lc = &stored[0];
  assert_eq!(lc.component, "PC510A00");
  assert_eq!(lc.alarm_code, "FMDOS01");
  assert_eq!(lc.state, LifecycleState::Closed);
  assert_eq!(lc.raise_time, ts(5, 8, 15, 30, 500));
  assert_eq!(lc.resolve_time, Some(ts(5, 8, 22, 15, 600)));
  let ack = lc.ack.as_ref().unwrap();
  assert_eq!(ack.time, ts(5, 8, 17, 22, 800));
  assert_eq!(ack.component, "PC520A00");
  assert_eq!(ack.operator, "FORM");
  assert_eq!(lc.source_file, "2025-10-05_formulacao.log");
  assert_eq!(lc.raise_line, 1);
}

#[tokio::test]
async fn orphan_ok_lands_only_in_orphans() {
  let store = Store::in_memory().await.unwrap();
  store.apply_migrations().await.unwrap();

  let source = SourceFile::from_text(
    "2025-10-05_formulacao.log",
    "2025-10-05 08:22:15,6 [PC510A00] FMDOS01 OK A_OK Erro dosagem ingrediente principal\n",
  );
  let output = correlate_source(&source).unwrap();
  let load = store.load(&source.file_id, &source.fingerprint, &output).await.unwrap();

  assert_eq!(load.lifecycles, 0);
  assert_eq!(load.orphans, 1);
  assert_eq!(store.count(Table::Lifecycles).await.unwrap(), 0);

  let orphans = store.orphans_for("2025-10-05_formulacao.log").await.unwrap();
  assert_eq!(orphans.len(), 1);
  assert_eq!(orphans[0].kind, OrphanKind::OrphanOk);
  assert_eq!(orphans[0].alarm_code, "FMDOS01");
  assert_eq!(orphans[0].event_time, ts(5, 8, 22, 15, 600));
}

#[tokio::test]
async fn reloading_same_file_is_a_noop() {
  let store = Store::in_memory().await.unwrap();
  store.apply_migrations().await.unwrap();
  let source = SourceFile::from_text("2025-10-06_formulacao.log", BUSY_DAY);
  let output = correlate_source(&source).unwrap();

  let first = store.load(&source.file_id, &source.fingerprint, &output).await.unwrap();
  assert!(!first.skipped);
  let after_first = store.query_lifecycles(&LifecycleFilter::default()).await.unwrap();
  let counts_first = (
    store.count(Table::Lifecycles).await.unwrap(),
    store.count(Table::Annotations).await.unwrap(),
    store.count(Table::Orphans).await.unwrap(),
    store.count(Table::OperationalLogs).await.unwrap(),
  );

  let second = store.load(&source.file_id, &source.fingerprint, &output).await.unwrap();
  assert!(second.skipped);
  assert_eq!(second.lifecycles, 0);

  let after_second = store.query_lifecycles(&LifecycleFilter::default()).await.unwrap();
  let counts_second = (
    store.count(Table::Lifecycles).await.unwrap(),
    store.count(Table::Annotations).await.unwrap(),
    store.count(Table::Orphans).await.unwrap(),
    store.count(Table::OperationalLogs).await.unwrap(),
  );
  assert_eq!(after_first, after_second);
  assert_eq!(counts_first, counts_second);
  assert_eq!(store.processed_files().await.unwrap().len(), 1);
}

#[tokio::test]
async fn overlapping_file_replaces_rows_with_same_key() {
  let store = Store::in_memory().await.unwrap();
  store.apply_migrations().await.unwrap();

  // First export only saw the raise and the acknowledgement.
  let partial = SourceFile::from_text(
    "2025-10-05_formulacao.log",
    "2025-10-05 08:15:30,5 [PC510A00] FMDOS01 CFN ALARM Erro dosagem ingrediente principal\n\
     2025-10-05 08:17:22,8 [PC510A00] FMDOS01 ALARM is acknowledged by PC520A00::FORM ACK\n",
  );
  let full = SourceFile::from_text("2025-10-05_formulacao.log", CLOSED_DAY);
  assert_ne!(partial.fingerprint, full.fingerprint);

  store
    .load(&partial.file_id, &partial.fingerprint, &correlate_source(&partial).unwrap())
    .await
    .unwrap();
  let before = store.query_lifecycles(&LifecycleFilter::default()).await.unwrap();
  assert_eq!(before.len(), 1);
  assert_eq!(before[0].state, LifecycleState::Acknowledged);

  store
    .load(&full.file_id, &full.fingerprint, &correlate_source(&full).unwrap())
    .await
    .unwrap();
  let after = store.query_lifecycles(&LifecycleFilter::default()).await.unwrap();
  assert_eq!(after.len(), 1);
  assert_eq!(after[0].state, LifecycleState::Closed);
  assert_eq!(after[0].resolve_time, Some(ts(5, 8, 22, 15, 600)));
  assert_eq!(store.count(Table::ProcessedFiles).await.unwrap(), 2);
}

#[tokio::test]
async fn overlapping_file_with_shifted_lines_keeps_one_row_per_event() {
  let store = Store::in_memory().await.unwrap();
  store.apply_migrations().await.unwrap();

  let ok = "2025-10-05 08:22:15,6 [PC510A00] FMPRS02 OK A_OK Pressao baixa\n";
  let tag = "2025-10-05 08:23:00,0 [PC530A00] Pix32.PC530A00.IX_VARE_NR.A_CV set to Aspart by PC530A00::MIXR\n";
  let first = SourceFile::from_text("2025-10-05_formulacao.log", &format!("{}{}", ok, tag));
  // A later export of the same day starts earlier, so every line moves down.
  let later = SourceFile::from_text(
    "2025-10-05_formulacao.log",
    &format!(
      "2025-10-05 06:00:01,2 [PC520A01] -2147220484: FORM_Background_Schedule_WDG by PC520A01\n{}{}",
      ok, tag
    ),
  );

  for source in [&first, &later] {
    let output = correlate_source(source).unwrap();
    let load = store.load(&source.file_id, &source.fingerprint, &output).await.unwrap();
    assert!(!load.skipped);
  }

  assert_eq!(store.count(Table::Orphans).await.unwrap(), 1);
  let orphans = store.orphans_for("2025-10-05_formulacao.log").await.unwrap();
  assert_eq!(orphans[0].line_no, 2);

  // The tag log plus the new watchdog tick.
  assert_eq!(store.count(Table::OperationalLogs).await.unwrap(), 2);
  let logs = store.operational_logs_for("2025-10-05_formulacao.log").await.unwrap();
  assert_eq!(logs.iter().filter(|l| l.component == "PC530A00").count(), 1);
}

#[tokio::test]
async fn failed_load_leaves_no_rows_and_no_fingerprint() {
  let tmp = TempDir::new().unwrap();
  let config = config_for(&tmp);
  let store = Store::connect(&config).await.unwrap();
  store.apply_migrations().await.unwrap();

  // Lifecycles and orphans insert fine; the operational logs step fails.
  let mut side = side_connection(&config).await;
  query::<Sqlite>("DROP TABLE operational_logs").execute(&mut side).await.unwrap();

  let source = SourceFile::from_text("2025-10-06_formulacao.log", BUSY_DAY);
  let output = correlate_source(&source).unwrap();
  assert!(!output.lifecycles.is_empty());
  let err = store.load(&source.file_id, &source.fingerprint, &output).await.unwrap_err();
  assert!(matches!(err, EtlError::Store(_)));

  assert_eq!(store.count(Table::Lifecycles).await.unwrap(), 0);
  assert_eq!(store.count(Table::Annotations).await.unwrap(), 0);
  assert_eq!(store.count(Table::Orphans).await.unwrap(), 0);
  assert_eq!(store.count(Table::ProcessedFiles).await.unwrap(), 0);
  assert!(!store.is_file_processed(&source.fingerprint).await.unwrap());
}

#[tokio::test]
async fn locked_database_is_retried_until_free() {
  let tmp = TempDir::new().unwrap();
  let config = Config {
    busy_timeout_secs: 0,
    load_retries: 10,
    retry_backoff_ms: 50,
    ..config_for(&tmp)
  };
  let pipeline = pipeline_with(config.clone()).await;
  pipeline.store().apply_migrations().await.unwrap();

  let mut side = side_connection(&config).await;
  query::<Sqlite>("BEGIN IMMEDIATE").execute(&mut side).await.unwrap();
  let release = tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(200)).await;
    query::<Sqlite>("COMMIT").execute(&mut side).await.unwrap();
  });

  let source = SourceFile::from_text("2025-10-05_formulacao.log", CLOSED_DAY);
  let report = pipeline.process_source(source, FileReport::new("")).await;
  release.await.unwrap();

  assert_eq!(report.status, FileStatus::Loaded);
  assert!(report.attempts > 1, "attempts = {}", report.attempts);
  assert_eq!(pipeline.store().count(Table::Lifecycles).await.unwrap(), 1);
}

#[tokio::test]
async fn locked_database_exhausts_retries() {
  let tmp = TempDir::new().unwrap();
  let config = Config {
    busy_timeout_secs: 0,
    load_retries: 2,
    ..config_for(&tmp)
  };
  let pipeline = pipeline_with(config.clone()).await;
  pipeline.store().apply_migrations().await.unwrap();

  let mut side = side_connection(&config).await;
  query::<Sqlite>("BEGIN IMMEDIATE").execute(&mut side).await.unwrap();

  let source = SourceFile::from_text("2025-10-05_formulacao.log", CLOSED_DAY);
  let report = pipeline.process_source(source, FileReport::new("")).await;
  query::<Sqlite>("COMMIT").execute(&mut side).await.unwrap();

  assert!(report.is_failed());
  assert_eq!(report.attempts, 3);
  assert_eq!(pipeline.store().count(Table::ProcessedFiles).await.unwrap(), 0);
}

#[tokio::test]
async fn migration_failure_halts_run_before_any_file() {
  let tmp = TempDir::new().unwrap();
  let config = config_for(&tmp);
  let pipeline = pipeline_with(config.clone()).await;
  pipeline.store().apply_migrations().await.unwrap();
  let path = write_log(&config.source_dir, "2025-10-05_formulacao.log", CLOSED_DAY);

  let mut side = side_connection(&config).await;
  query::<Sqlite>("UPDATE schema_version SET version = 99 WHERE id = 1")
    .execute(&mut side)
    .await
    .unwrap();

  let err = pipeline.run(vec![path]).await.unwrap_err();
  assert!(matches!(err, EtlError::Migration { version: 99, .. }));
  assert_eq!(pipeline.store().count(Table::Lifecycles).await.unwrap(), 0);
  assert_eq!(pipeline.store().count(Table::ProcessedFiles).await.unwrap(), 0);
  assert_eq!(pipeline.store().count(Table::IngestRuns).await.unwrap(), 0);
}

#[tokio::test]
async fn batch_logs_stored_as_ordered_annotations() {
  let store = Store::in_memory().await.unwrap();
  store.apply_migrations().await.unwrap();
  let source = SourceFile::from_text("2025-10-06_formulacao.log", BUSY_DAY);
  let output = correlate_source(&source).unwrap();
  store.load(&source.file_id, &source.fingerprint, &output).await.unwrap();

  let key = LifecycleKey {
    component: "PC520A01".into(),
    alarm_code: "FMTMP01".into(),
    raise_time: ts(6, 7, 2, 11, 300),
  };
  let annotations = store.annotations_for(&key).await.unwrap();
  assert_eq!(annotations.len(), 2);
  assert_eq!(annotations[0].tag, "IX_BATCH_LOGDATA_1A.A_CV");
  assert_eq!(annotations[0].value, "Ajuste de temperatura");
  assert_eq!(annotations[1].tag, "IX_BATCH_LOGDATA_01.F_CV");
  assert_eq!(annotations[1].value, "72.5");
  assert_eq!(annotations[1].by_operator.as_deref(), Some("CTRL"));

  // Watchdog before any ack and the other component's tag log stay unattached.
  let operational = store.operational_logs_for("2025-10-06_formulacao.log").await.unwrap();
  assert_eq!(operational.len(), 2);
  assert_eq!(operational[0].line_no, 1);
  assert_eq!(operational[1].component, "PC530A00");
}

#[tokio::test]
async fn busy_day_counts_and_filters() {
  let store = Store::in_memory().await.unwrap();
  store.apply_migrations().await.unwrap();
  let source = SourceFile::from_text("2025-10-06_formulacao.log", BUSY_DAY);
  let output = correlate_source(&source).unwrap();
  assert_eq!(output.stats.unrecognized, 1);
  store.load(&source.file_id, &source.fingerprint, &output).await.unwrap();

  let closed = store
    .query_lifecycles(&LifecycleFilter {
      state: Some(LifecycleState::Closed),
      ..LifecycleFilter::default()
    })
    .await
    .unwrap();
  assert_eq!(closed.len(), 1);
  assert_eq!(closed[0].message.as_deref(), Some("Verificar resistencia"));
  assert_eq!(closed[0].annotations.len(), 2);

  let open = store
    .query_lifecycles(&LifecycleFilter {
      component: Some("PC510A01".into()),
      ..LifecycleFilter::default()
    })
    .await
    .unwrap();
  assert_eq!(open.len(), 1);
  assert_eq!(open[0].alarm_code, "FMVIS03");
  assert_eq!(open[0].state, LifecycleState::Open);

  let orphans = store.orphans_for("2025-10-06_formulacao.log").await.unwrap();
  assert_eq!(orphans.len(), 1);
  assert_eq!(orphans[0].kind, OrphanKind::OrphanOk);
  assert_eq!(orphans[0].alarm_code, "FMPRS02");

  let states = store.lifecycle_states().await.unwrap();
  assert!(states.contains(&(LifecycleState::Closed, 1)));
  assert!(states.contains(&(LifecycleState::Open, 1)));
}

#[tokio::test]
async fn parallel_run_over_directory_then_rerun_skips() {
  let tmp = TempDir::new().unwrap();
  let pipeline = pipeline_for(&tmp).await;
  let logs = tmp.path().join("logs");
  write_log(&logs, "2025-10-05_formulacao.log", CLOSED_DAY);
  write_log(&logs, "2025-10-06_formulacao.log", BUSY_DAY);
  write_log(&logs, "notes.txt", "not a log");

  let paths = pipeline.discover().unwrap();
  assert_eq!(paths.len(), 2);

  let first = pipeline.run(paths.clone()).await.unwrap();
  assert!(first.success());
  assert_eq!(first.run.files_loaded, 2);
  assert_eq!(first.run.lifecycles_loaded, 3);
  assert_eq!(first.files[0].file_id, "2025-10-05_formulacao.log");
  assert_eq!(first.files[1].file_id, "2025-10-06_formulacao.log");
  let rows = pipeline.store().count(Table::Lifecycles).await.unwrap();

  let second = pipeline.run(paths).await.unwrap();
  assert!(second.success());
  assert_eq!(second.run.files_skipped, 2);
  assert_eq!(second.run.files_loaded, 0);
  assert_eq!(pipeline.store().count(Table::Lifecycles).await.unwrap(), rows);

  let runs = pipeline.store().runs(10).await.unwrap();
  assert_eq!(runs.len(), 2);
  assert!(runs.iter().all(|r| r.success));
}

#[tokio::test]
async fn one_bad_file_does_not_stop_the_others() {
  let tmp = TempDir::new().unwrap();
  let pipeline = pipeline_for(&tmp).await;
  let good = write_log(&tmp.path().join("logs"), "2025-10-05_formulacao.log", CLOSED_DAY);
  let missing = tmp.path().join("logs").join("2025-10-07_formulacao.log");

  let report = pipeline.run(vec![missing, good]).await.unwrap();
  assert!(!report.success());
  assert_eq!(report.run.files_failed, 1);
  assert_eq!(report.run.files_loaded, 1);
  assert!(report.files[0].is_failed());
  assert_eq!(report.files[1].status, FileStatus::Loaded);
  assert_eq!(pipeline.store().count(Table::Lifecycles).await.unwrap(), 1);
}

#[tokio::test]
async fn latin1_file_is_decoded_and_loaded() {
  let tmp = TempDir::new().unwrap();
  let pipeline = pipeline_for(&tmp).await;
  let mut bytes = b"2025-10-05 08:00:00,1 [PC510A00] FMTMP01 CFN ALARM Temperatura fora de especifica".to_vec();
  bytes.extend_from_slice(&[0xe7, 0xe3]); // "çã" in ISO-8859-1
  bytes.extend_from_slice(b"o\n");
  let path = tmp.path().join("logs").join("2025-10-05_formulacao.log");
  fs::write(&path, &bytes).unwrap();

  let report = pipeline.run(vec![path]).await.unwrap();
  assert!(report.success());
  assert_eq!(report.files[0].fingerprint.as_deref(), Some(fingerprint::compute(&bytes).0.as_str()));

  let stored = pipeline.store().query_lifecycles(&LifecycleFilter::default()).await.unwrap();
  assert_eq!(stored[0].description, "Temperatura fora de especificação");
  assert_eq!(stored[0].state, LifecycleState::Open);
}

#[tokio::test]
async fn reopened_database_keeps_schema_and_rows() {
  let tmp = TempDir::new().unwrap();
  let config = config_for(&tmp);
  {
    let store = Store::connect(&config).await.unwrap();
    store.apply_migrations().await.unwrap();
    let source = SourceFile::from_text("2025-10-05_formulacao.log", CLOSED_DAY);
    let output = correlate_source(&source).unwrap();
    store.load(&source.file_id, &source.fingerprint, &output).await.unwrap();
    store.close().await;
  }

  let store = Store::connect(&config).await.unwrap();
  assert_eq!(store.schema_version().await.unwrap(), 3);
  let outcome = store.apply_migrations().await.unwrap();
  assert!(outcome.applied.is_empty());
  assert!(store
    .is_file_processed(&fingerprint::compute(CLOSED_DAY.as_bytes()))
    .await
    .unwrap());
  assert!(!store.is_file_processed(&Fingerprint("0".repeat(32))).await.unwrap());
  assert_eq!(store.count(Table::Lifecycles).await.unwrap(), 1);
}

#[test]
fn classify_and_correlate_without_a_store() {
  let records = CLOSED_DAY
    .lines()
    .enumerate()
    .map(|(i, text)| classify(&RawLine::new("f", i as u32 + 1, text)));
  let output = correlate("f", records).unwrap();
  assert_eq!(output.lifecycles.len(), 1);
  assert_eq!(output.stats.classified(), 3);
}
