//! Core types for the alarm ETL (classified records, lifecycles, load reports).

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Raw input
// ---------------------------------------------------------------------------

/// One decoded line of a source file, as handed over by the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
  pub file_id: String,
  /// 1-based.
  pub line_no: u32,
  pub text: String,
}

impl RawLine {
  pub fn new(file_id: impl Into<String>, line_no: u32, text: impl Into<String>) -> Self {
    Self {
      file_id: file_id.into(),
      line_no,
      text: text.into(),
    }
  }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Content-derived hex identifier of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ---------------------------------------------------------------------------
// Classified records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
  Cfn,
  Msg,
  Ack,
  Ok,
  BatchLog,
  Watchdog,
  NormalLog,
  Unrecognized,
}

impl RecordKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Cfn => "CFN",
      Self::Msg => "MSG",
      Self::Ack => "ACK",
      Self::Ok => "OK",
      Self::BatchLog => "BATCH_LOG",
      Self::Watchdog => "WATCHDOG",
      Self::NormalLog => "NORMAL_LOG",
      Self::Unrecognized => "UNRECOGNIZED",
    }
  }

  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "CFN" => Some(Self::Cfn),
      "MSG" => Some(Self::Msg),
      "ACK" => Some(Self::Ack),
      "OK" => Some(Self::Ok),
      "BATCH_LOG" => Some(Self::BatchLog),
      "WATCHDOG" => Some(Self::Watchdog),
      "NORMAL_LOG" => Some(Self::NormalLog),
      "UNRECOGNIZED" => Some(Self::Unrecognized),
      _ => None,
    }
  }
}

/// `<component>::<operator>` attribution found on ACK and tag-set lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
  pub component: String,
  pub operator: String,
}

/// Fields every recognized line carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
  pub line_no: u32,
  pub timestamp: NaiveDateTime,
  pub component: String,
}

/// Alarm-scoped line: raise, message or resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmLine {
  pub header: Header,
  pub alarm_code: String,
  pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckLine {
  pub header: Header,
  pub alarm_code: String,
  pub by: Attribution,
}

/// `Pix32.<component>.<tag>.<field> set to <value> by <component>::<operator>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSetLine {
  pub header: Header,
  pub tag_component: String,
  pub tag: String,
  pub field: String,
  pub value: String,
  pub by: Attribution,
}

impl TagSetLine {
  /// `<tag>.<field>`, the part of the path below the component.
  pub fn tag_path(&self) -> String {
    format!("{}.{}", self.tag, self.field)
  }
}

/// `<counter>: <name> by <component>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogLine {
  pub header: Header,
  pub counter: i64,
  pub name: String,
  pub by_component: String,
}

/// One raw line after classification. Never mutated once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedRecord {
  Cfn(AlarmLine),
  Msg(AlarmLine),
  Ack(AckLine),
  Ok(AlarmLine),
  BatchLog(TagSetLine),
  Watchdog(WatchdogLine),
  NormalLog(TagSetLine),
  Unrecognized { line_no: u32, reason: &'static str },
}

impl ClassifiedRecord {
  pub fn kind(&self) -> RecordKind {
    match self {
      Self::Cfn(_) => RecordKind::Cfn,
      Self::Msg(_) => RecordKind::Msg,
      Self::Ack(_) => RecordKind::Ack,
      Self::Ok(_) => RecordKind::Ok,
      Self::BatchLog(_) => RecordKind::BatchLog,
      Self::Watchdog(_) => RecordKind::Watchdog,
      Self::NormalLog(_) => RecordKind::NormalLog,
      Self::Unrecognized { .. } => RecordKind::Unrecognized,
    }
  }

  pub fn header(&self) -> Option<&Header> {
    match self {
      Self::Cfn(l) | Self::Msg(l) | Self::Ok(l) => Some(&l.header),
      Self::Ack(l) => Some(&l.header),
      Self::BatchLog(l) | Self::NormalLog(l) => Some(&l.header),
      Self::Watchdog(l) => Some(&l.header),
      Self::Unrecognized { .. } => None,
    }
  }

  pub fn line_no(&self) -> u32 {
    match self {
      Self::Unrecognized { line_no, .. } => *line_no,
      other => other.header().map(|h| h.line_no).unwrap_or_default(),
    }
  }
}

// ---------------------------------------------------------------------------
// Alarm lifecycles
// ---------------------------------------------------------------------------

/// Correlation key while a lifecycle is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlarmKey {
  pub component: String,
  pub alarm_code: String,
}

impl AlarmKey {
  pub fn new(component: impl Into<String>, alarm_code: impl Into<String>) -> Self {
    Self {
      component: component.into(),
      alarm_code: alarm_code.into(),
    }
  }
}

/// Natural key of a persisted lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LifecycleKey {
  pub component: String,
  pub alarm_code: String,
  pub raise_time: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
  Open,
  Acknowledged,
  Closed,
  /// Superseded by a second raise on the same key before it resolved.
  Orphaned,
}

impl LifecycleState {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Open => "OPEN",
      Self::Acknowledged => "ACKNOWLEDGED",
      Self::Closed => "CLOSED",
      Self::Orphaned => "ORPHANED",
    }
  }

  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "OPEN" => Some(Self::Open),
      "ACKNOWLEDGED" | "ACK" => Some(Self::Acknowledged),
      "CLOSED" => Some(Self::Closed),
      "ORPHANED" => Some(Self::Orphaned),
      _ => None,
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Closed | Self::Orphaned)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
  pub time: NaiveDateTime,
  pub component: String,
  pub operator: String,
}

/// Batch, normal or watchdog line, either attached to a lifecycle or kept
/// as an unattached operational log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
  pub kind: RecordKind,
  pub line_no: u32,
  pub logged_at: NaiveDateTime,
  pub component: String,
  pub tag: String,
  pub value: String,
  pub by_component: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub by_operator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmLifecycle {
  pub component: String,
  pub alarm_code: String,
  pub raise_time: NaiveDateTime,
  pub description: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ack: Option<Acknowledgement>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub annotations: Vec<LogEntry>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resolve_time: Option<NaiveDateTime>,
  pub state: LifecycleState,
  pub source_file: String,
  pub raise_line: u32,
}

impl AlarmLifecycle {
  pub fn key(&self) -> LifecycleKey {
    LifecycleKey {
      component: self.component.clone(),
      alarm_code: self.alarm_code.clone(),
      raise_time: self.raise_time,
    }
  }
}

// ---------------------------------------------------------------------------
// Orphans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrphanKind {
  UnmatchedMsg,
  OrphanAck,
  OrphanOk,
  SupersededCfn,
}

impl OrphanKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::UnmatchedMsg => "UNMATCHED_MSG",
      Self::OrphanAck => "ORPHAN_ACK",
      Self::OrphanOk => "ORPHAN_OK",
      Self::SupersededCfn => "SUPERSEDED_CFN",
    }
  }

  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "UNMATCHED_MSG" => Some(Self::UnmatchedMsg),
      "ORPHAN_ACK" => Some(Self::OrphanAck),
      "ORPHAN_OK" => Some(Self::OrphanOk),
      "SUPERSEDED_CFN" => Some(Self::SupersededCfn),
      _ => None,
    }
  }
}

/// Correlation event with no matching counterpart, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Orphan {
  pub file_id: String,
  pub line_no: u32,
  pub kind: OrphanKind,
  pub component: String,
  pub alarm_code: String,
  pub event_time: NaiveDateTime,
  pub detail: String,
}

// ---------------------------------------------------------------------------
// Store records and reports
// ---------------------------------------------------------------------------

/// A source file that has been fully ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedFile {
  pub file_id: String,
  pub fingerprint: Fingerprint,
  pub ingested_at: DateTime<Utc>,
  pub row_count: u64,
  pub orphan_count: u64,
  pub unrecognized_count: u64,
}

/// Outcome of one `Store::load` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
  pub file_id: String,
  pub fingerprint: String,
  /// Fingerprint was already recorded; nothing was written.
  pub skipped: bool,
  pub lifecycles: u64,
  pub annotations: u64,
  pub orphans: u64,
  pub operational_logs: u64,
}

impl LoadReport {
  pub fn skipped(file_id: &str, fingerprint: &Fingerprint) -> Self {
    Self {
      file_id: file_id.to_string(),
      fingerprint: fingerprint.0.clone(),
      skipped: true,
      ..Self::default()
    }
  }
}

/// One pipeline run, as summarized in the `ingest_runs` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRun {
  pub run_id: String,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
  pub files_total: u64,
  pub files_loaded: u64,
  pub files_skipped: u64,
  pub files_failed: u64,
  pub lifecycles_loaded: u64,
  pub orphans: u64,
  pub unrecognized: u64,
  pub success: bool,
}
