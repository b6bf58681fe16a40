//! Lifecycle correlation: assemble raise -> message -> ack -> annotations ->
//! resolve arcs from one file's classified records.
//!
//! The log format carries no correlation id, so lifecycles are matched by
//! (component, alarm code) with at most one in-progress lifecycle per key.
//! Tag and watchdog lines carry no alarm code and attach to the component's
//! most recently acknowledged lifecycle instead.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::error::EtlError;
use crate::types::*;

/// Per-file counters, reported alongside the load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationStats {
  pub records: u64,
  pub cfn: u64,
  pub msg: u64,
  pub ack: u64,
  pub ok: u64,
  pub batch_logs: u64,
  pub normal_logs: u64,
  pub watchdogs: u64,
  pub unrecognized: u64,
  pub orphans: u64,
  pub superseded: u64,
  pub annotations: u64,
  pub unattached_logs: u64,
  pub closed: u64,
  pub unresolved: u64,
}

impl CorrelationStats {
  pub fn classified(&self) -> u64 {
    self.records - self.unrecognized
  }
}

/// Everything one file's pass produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationOutput {
  pub file_id: String,
  /// Resolution order first, then still-open lifecycles in raise order.
  pub lifecycles: Vec<AlarmLifecycle>,
  pub orphans: Vec<Orphan>,
  /// Tag and watchdog lines that found no acknowledged lifecycle.
  pub operational_logs: Vec<LogEntry>,
  pub stats: CorrelationStats,
}

/// Stateful correlator for exactly one file, fed in line order.
pub struct Correlator {
  file_id: String,
  open: HashMap<AlarmKey, AlarmLifecycle>,
  /// Acknowledged, unresolved keys per component, oldest first.
  acknowledged: HashMap<String, Vec<AlarmKey>>,
  last_line: Option<u32>,
  out: CorrelationOutput,
}

impl Correlator {
  pub fn new(file_id: impl Into<String>) -> Self {
    let file_id = file_id.into();
    Self {
      open: HashMap::new(),
      acknowledged: HashMap::new(),
      last_line: None,
      out: CorrelationOutput {
        file_id: file_id.clone(),
        ..CorrelationOutput::default()
      },
      file_id,
    }
  }

  /// Consume the next record. Line numbers must be strictly increasing.
  pub fn feed(&mut self, record: ClassifiedRecord) -> Result<(), EtlError> {
    let line_no = record.line_no();
    if let Some(previous) = self.last_line {
      if line_no <= previous {
        return Err(EtlError::OutOfOrder {
          file_id: self.file_id.clone(),
          previous,
          current: line_no,
        });
      }
    }
    self.last_line = Some(line_no);
    self.out.stats.records += 1;

    match record {
      ClassifiedRecord::Cfn(line) => {
        self.out.stats.cfn += 1;
        self.on_raise(line);
      }
      ClassifiedRecord::Msg(line) => {
        self.out.stats.msg += 1;
        self.on_message(line);
      }
      ClassifiedRecord::Ack(line) => {
        self.out.stats.ack += 1;
        self.on_ack(line);
      }
      ClassifiedRecord::Ok(line) => {
        self.out.stats.ok += 1;
        self.on_resolve(line);
      }
      ClassifiedRecord::BatchLog(line) => {
        self.out.stats.batch_logs += 1;
        self.on_log(tag_entry(RecordKind::BatchLog, line));
      }
      ClassifiedRecord::NormalLog(line) => {
        self.out.stats.normal_logs += 1;
        self.on_log(tag_entry(RecordKind::NormalLog, line));
      }
      ClassifiedRecord::Watchdog(line) => {
        self.out.stats.watchdogs += 1;
        self.on_log(watchdog_entry(line));
      }
      ClassifiedRecord::Unrecognized { .. } => {
        self.out.stats.unrecognized += 1;
      }
    }
    Ok(())
  }

  /// End of stream: unresolved lifecycles are emitted as-is, in raise order.
  pub fn finish(mut self) -> CorrelationOutput {
    let mut remaining: Vec<AlarmLifecycle> = self.open.drain().map(|(_, lc)| lc).collect();
    remaining.sort_by(|a, b| (a.raise_time, a.raise_line).cmp(&(b.raise_time, b.raise_line)));

    self.out.stats.unresolved = remaining.len() as u64;
    self.out.lifecycles.extend(remaining);
    self.out
  }

  fn on_raise(&mut self, line: AlarmLine) {
    let key = AlarmKey::new(&line.header.component, &line.alarm_code);

    if let Some(mut stale) = self.open.remove(&key) {
      self.forget_ack(&key);
      debug!(
        file = %self.file_id,
        component = %key.component,
        alarm_code = %key.alarm_code,
        stale_line = stale.raise_line,
        line = line.header.line_no,
        "raise supersedes unresolved lifecycle"
      );
      self.out.stats.superseded += 1;
      self.push_orphan(Orphan {
        file_id: self.file_id.clone(),
        line_no: stale.raise_line,
        kind: OrphanKind::SupersededCfn,
        component: stale.component.clone(),
        alarm_code: stale.alarm_code.clone(),
        event_time: stale.raise_time,
        detail: format!(
          "{} lifecycle superseded by raise at line {}",
          stale.state.as_str(),
          line.header.line_no
        ),
      });
      stale.state = LifecycleState::Orphaned;
      self.out.lifecycles.push(stale);
    }

    self.open.insert(
      key,
      AlarmLifecycle {
        component: line.header.component,
        alarm_code: line.alarm_code,
        raise_time: line.header.timestamp,
        description: line.description,
        message: None,
        ack: None,
        annotations: Vec::new(),
        resolve_time: None,
        state: LifecycleState::Open,
        source_file: self.file_id.clone(),
        raise_line: line.header.line_no,
      },
    );
  }

  fn on_message(&mut self, line: AlarmLine) {
    let key = AlarmKey::new(&line.header.component, &line.alarm_code);
    match self.open.get_mut(&key) {
      Some(lc) if lc.state == LifecycleState::Open && lc.message.is_none() => {
        lc.message = Some(line.description);
      }
      _ => {
        debug!(file = %self.file_id, line = line.header.line_no, alarm_code = %line.alarm_code, "unmatched message");
        let detail = line.description.clone();
        self.push_alarm_orphan(OrphanKind::UnmatchedMsg, &line.header, &line.alarm_code, detail);
      }
    }
  }

  fn on_ack(&mut self, line: AckLine) {
    let key = AlarmKey::new(&line.header.component, &line.alarm_code);
    match self.open.get_mut(&key) {
      Some(lc) if lc.state == LifecycleState::Open => {
        lc.state = LifecycleState::Acknowledged;
        lc.ack = Some(Acknowledgement {
          time: line.header.timestamp,
          component: line.by.component,
          operator: line.by.operator,
        });
        self.acknowledged.entry(key.component.clone()).or_default().push(key);
      }
      _ => {
        debug!(file = %self.file_id, line = line.header.line_no, alarm_code = %line.alarm_code, "orphan acknowledgement");
        let detail = format!("acknowledged by {}::{}", line.by.component, line.by.operator);
        self.push_alarm_orphan(OrphanKind::OrphanAck, &line.header, &line.alarm_code, detail);
      }
    }
  }

  fn on_resolve(&mut self, line: AlarmLine) {
    let key = AlarmKey::new(&line.header.component, &line.alarm_code);
    match self.open.remove(&key) {
      Some(mut lc) => {
        self.forget_ack(&key);
        lc.state = LifecycleState::Closed;
        lc.resolve_time = Some(line.header.timestamp);
        self.out.stats.closed += 1;
        self.out.lifecycles.push(lc);
      }
      None => {
        debug!(file = %self.file_id, line = line.header.line_no, alarm_code = %line.alarm_code, "orphan resolution");
        let detail = line.description.clone();
        self.push_alarm_orphan(OrphanKind::OrphanOk, &line.header, &line.alarm_code, detail);
      }
    }
  }

  fn on_log(&mut self, entry: LogEntry) {
    let target = self
      .acknowledged
      .get(&entry.component)
      .and_then(|keys| keys.last())
      .and_then(|key| self.open.get_mut(key));

    match target {
      Some(lc) => {
        lc.annotations.push(entry);
        self.out.stats.annotations += 1;
      }
      None => {
        self.out.operational_logs.push(entry);
        self.out.stats.unattached_logs += 1;
      }
    }
  }

  fn forget_ack(&mut self, key: &AlarmKey) {
    if let Some(keys) = self.acknowledged.get_mut(&key.component) {
      keys.retain(|k| k != key);
      if keys.is_empty() {
        self.acknowledged.remove(&key.component);
      }
    }
  }

  fn push_alarm_orphan(&mut self, kind: OrphanKind, header: &Header, alarm_code: &str, detail: String) {
    self.push_orphan(Orphan {
      file_id: self.file_id.clone(),
      line_no: header.line_no,
      kind,
      component: header.component.clone(),
      alarm_code: alarm_code.to_string(),
      event_time: header.timestamp,
      detail,
    });
  }

  fn push_orphan(&mut self, orphan: Orphan) {
    self.out.stats.orphans += 1;
    self.out.orphans.push(orphan);
  }
}

/// Correlate a whole file's records in one call.
pub fn correlate<I>(file_id: &str, records: I) -> Result<CorrelationOutput, EtlError>
where
  I: IntoIterator<Item = ClassifiedRecord>,
{
  let mut correlator = Correlator::new(file_id);
  for record in records {
    correlator.feed(record)?;
  }
  Ok(correlator.finish())
}

fn tag_entry(kind: RecordKind, line: TagSetLine) -> LogEntry {
  LogEntry {
    kind,
    line_no: line.header.line_no,
    logged_at: line.header.timestamp,
    tag: line.tag_path(),
    component: line.header.component,
    value: line.value,
    by_component: line.by.component,
    by_operator: Some(line.by.operator),
  }
}

fn watchdog_entry(line: WatchdogLine) -> LogEntry {
  LogEntry {
    kind: RecordKind::Watchdog,
    line_no: line.header.line_no,
    logged_at: line.header.timestamp,
    component: line.header.component,
    tag: line.name,
    value: line.counter.to_string(),
    by_component: line.by_component,
    by_operator: None,
  }
}
