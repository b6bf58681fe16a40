//! Line classifier: one raw line in, one typed record out.
//!
//! Every line has the envelope `TIMESTAMP [COMPONENT] REST`; the shape of
//! `REST` picks the record kind. Matchers are tried in a fixed order and the
//! first hit wins. Classification is total: anything that fits no shape
//! comes back as `ClassifiedRecord::Unrecognized` with a reason.
//!
//! Each matcher has a loose pattern that claims the line and, where a claimed
//! line can still be malformed, a strict pattern for the claimed part.

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::timestamp;
use crate::types::*;

const BATCH_TAG_PREFIX: &str = "IX_BATCH_LOGDATA_";

fn pattern(re: &str) -> Regex {
  Regex::new(re).expect("static classifier pattern")
}

static ENVELOPE: Lazy<Regex> = Lazy::new(|| pattern(r"^(?P<ts>[^\[]*)\[(?P<component>[^\]]*)\](?P<rest>.*)$"));

static ACK: Lazy<Regex> =
  Lazy::new(|| pattern(r"^(?P<code>\S+)\s+ALARM\s+is\s+acknowledged\s+by(?:\s+(?P<tail>.*))?$"));
static ACK_TAIL: Lazy<Regex> = Lazy::new(|| pattern(r"^(?P<by>\S+)(?:\s+ACK)?$"));

static WATCHDOG: Lazy<Regex> =
  Lazy::new(|| pattern(r"^(?P<counter>\S+)\s+(?P<name>\S*Background_Schedule_WDG)\s+by\s+(?P<by>\S+)$"));
static WATCHDOG_COUNTER: Lazy<Regex> = Lazy::new(|| pattern(r"^(?P<n>[+-]?\d+):$"));

static TAG_SET: Lazy<Regex> = Lazy::new(|| pattern(r"^Pix32\.(?P<tail>.*)$"));
static TAG_ASSIGN: Lazy<Regex> = Lazy::new(|| pattern(r"^(?P<path>.*?) set to (?P<assignment>.*)$"));
static TAG_PATH: Lazy<Regex> = Lazy::new(|| pattern(r"^(?P<component>[^.]+)\.(?P<tag>.+)\.(?P<field>[^.]+)$"));
// The value may be empty or contain spaces; the attribution follows the last `by`.
static TAG_VALUE: Lazy<Regex> = Lazy::new(|| pattern(r"^(?:(?P<value>.*)\s)?by\s+(?P<by>\S+)$"));

static MSG: Lazy<Regex> = Lazy::new(|| pattern(r"^(?P<code>\S+)\s+CFN\s+MSG\.(?:\s+(?P<description>.*))?$"));
// The plant also writes `CODE ALARM ALARM ...` for a raise.
static CFN: Lazy<Regex> =
  Lazy::new(|| pattern(r"^(?P<code>\S+)\s+(?:CFN|ALARM)\s+ALARM(?:\s+(?P<description>.*))?$"));
static OK: Lazy<Regex> = Lazy::new(|| pattern(r"^(?P<code>\S+)\s+OK\s+A_OK(?:\s+(?P<description>.*))?$"));

static ATTRIBUTION: Lazy<Regex> = Lazy::new(|| pattern(r"^(?P<component>[^\s:]+)::(?P<operator>\S+)$"));

/// A matcher either claims the line or passes (`None`).
type Matcher = fn(&Header, &str) -> Option<Result<ClassifiedRecord, &'static str>>;

const MATCHERS: &[Matcher] = &[
  match_ack,
  match_watchdog,
  match_tag_set,
  match_msg,
  match_cfn,
  match_ok,
];

/// Classify one raw line.
pub fn classify(line: &RawLine) -> ClassifiedRecord {
  classify_text(line.line_no, &line.text)
}

/// Classify a line's text; `line_no` is carried into the record.
pub fn classify_text(line_no: u32, text: &str) -> ClassifiedRecord {
  let unrecognized = |reason| ClassifiedRecord::Unrecognized { line_no, reason };

  let text = text.trim_start_matches('\u{feff}').trim();
  if text.is_empty() {
    return unrecognized("blank line");
  }
  let (header, rest) = match split_envelope(line_no, text) {
    Ok(v) => v,
    Err(reason) => return unrecognized(reason),
  };

  for matcher in MATCHERS {
    match matcher(&header, rest) {
      Some(Ok(record)) => return record,
      Some(Err(reason)) => return unrecognized(reason),
      None => continue,
    }
  }
  unrecognized("unknown shape")
}

/// Split `TIMESTAMP [COMPONENT] REST` into a header and `REST`.
fn split_envelope(line_no: u32, text: &str) -> Result<(Header, &str), &'static str> {
  let caps = ENVELOPE.captures(text).ok_or("missing component")?;

  let timestamp: NaiveDateTime = timestamp::parse(&caps["ts"]).ok_or("bad timestamp")?;
  let component = caps["component"].trim();
  if component.is_empty() || component.contains(char::is_whitespace) {
    return Err("missing component");
  }

  let rest = caps.name("rest").map_or("", |m| m.as_str()).trim();
  Ok((
    Header {
      line_no,
      timestamp,
      component: component.to_string(),
    },
    rest,
  ))
}

// ---------------------------------------------------------------------------
// Matchers
// ---------------------------------------------------------------------------

/// `CODE ALARM is acknowledged by PC::OPER [ACK]`
fn match_ack(header: &Header, rest: &str) -> Option<Result<ClassifiedRecord, &'static str>> {
  let caps = ACK.captures(rest)?;
  let by = caps
    .name("tail")
    .and_then(|tail| ACK_TAIL.captures(tail.as_str()))
    .and_then(|tail| parse_attribution(&tail["by"]));
  let by = match by {
    Some(by) => by,
    None => return Some(Err("malformed acknowledgement")),
  };
  Some(Ok(ClassifiedRecord::Ack(AckLine {
    header: header.clone(),
    alarm_code: caps["code"].to_string(),
    by,
  })))
}

/// `-2147220484: FORM_Background_Schedule_WDG by PC`
fn match_watchdog(header: &Header, rest: &str) -> Option<Result<ClassifiedRecord, &'static str>> {
  let caps = WATCHDOG.captures(rest)?;
  let counter = WATCHDOG_COUNTER
    .captures(&caps["counter"])
    .and_then(|c| c["n"].parse::<i64>().ok());
  let counter = match counter {
    Some(c) => c,
    None => return Some(Err("malformed watchdog counter")),
  };
  Some(Ok(ClassifiedRecord::Watchdog(WatchdogLine {
    header: header.clone(),
    counter,
    name: caps["name"].to_string(),
    by_component: caps["by"].to_string(),
  })))
}

/// `Pix32.<component>.<tag>.<field> set to <value> by <component>::<operator>`
fn match_tag_set(header: &Header, rest: &str) -> Option<Result<ClassifiedRecord, &'static str>> {
  let caps = TAG_SET.captures(rest)?;
  Some(parse_tag_set(header, &caps["tail"]))
}

fn parse_tag_set(header: &Header, tail: &str) -> Result<ClassifiedRecord, &'static str> {
  let assign = TAG_ASSIGN.captures(tail).ok_or("malformed tag assignment")?;
  let path = TAG_PATH.captures(&assign["path"]).ok_or("malformed tag path")?;
  let value = TAG_VALUE
    .captures(assign["assignment"].trim())
    .ok_or("malformed tag assignment")?;
  let by = parse_attribution(&value["by"]).ok_or("malformed tag assignment")?;

  let line = TagSetLine {
    header: header.clone(),
    tag_component: path["component"].to_string(),
    tag: path["tag"].to_string(),
    field: path["field"].to_string(),
    value: value.name("value").map_or("", |m| m.as_str().trim()).to_string(),
    by,
  };
  Ok(if line.tag.starts_with(BATCH_TAG_PREFIX) {
    ClassifiedRecord::BatchLog(line)
  } else {
    ClassifiedRecord::NormalLog(line)
  })
}

/// `CODE CFN MSG. description`
fn match_msg(header: &Header, rest: &str) -> Option<Result<ClassifiedRecord, &'static str>> {
  let caps = MSG.captures(rest)?;
  Some(Ok(ClassifiedRecord::Msg(alarm_line(header, &caps))))
}

/// `CODE CFN ALARM description`
fn match_cfn(header: &Header, rest: &str) -> Option<Result<ClassifiedRecord, &'static str>> {
  let caps = CFN.captures(rest)?;
  Some(Ok(ClassifiedRecord::Cfn(alarm_line(header, &caps))))
}

/// `CODE OK A_OK description`
fn match_ok(header: &Header, rest: &str) -> Option<Result<ClassifiedRecord, &'static str>> {
  let caps = OK.captures(rest)?;
  Some(Ok(ClassifiedRecord::Ok(alarm_line(header, &caps))))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Raise/message/resolve lines share `code` and optional `description` groups.
fn alarm_line(header: &Header, caps: &Captures<'_>) -> AlarmLine {
  AlarmLine {
    header: header.clone(),
    alarm_code: caps["code"].to_string(),
    description: caps.name("description").map_or("", |m| m.as_str().trim()).to_string(),
  }
}

/// `PC520A00::FORM` -> attribution; both halves must be non-empty.
fn parse_attribution(s: &str) -> Option<Attribution> {
  let caps = ATTRIBUTION.captures(s.trim())?;
  Some(Attribution {
    component: caps["component"].to_string(),
    operator: caps["operator"].to_string(),
  })
}
