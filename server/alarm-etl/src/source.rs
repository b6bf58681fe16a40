//! File source: locate daily log files, read them with an encoding fallback
//! and hand back ordered lines plus a content fingerprint.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::EtlError;
use crate::fingerprint;
use crate::types::{Fingerprint, RawLine};

/// How a file's bytes were turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
  Utf8,
  /// ISO-8859-1: every byte maps to one char, so this never fails.
  Latin1,
}

impl Encoding {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Utf8 => "utf-8",
      Self::Latin1 => "latin-1",
    }
  }
}

/// One source file, fully read and decoded.
#[derive(Debug, Clone)]
pub struct SourceFile {
  /// File name, used as the file identity in the store.
  pub file_id: String,
  pub path: PathBuf,
  pub fingerprint: Fingerprint,
  pub encoding: Encoding,
  pub lines: Vec<String>,
}

impl SourceFile {
  /// Build a source from in-memory text (fixtures, stdin).
  pub fn from_text(file_id: impl Into<String>, text: &str) -> Self {
    let file_id = file_id.into();
    Self {
      path: PathBuf::from(&file_id),
      fingerprint: fingerprint::compute(text.as_bytes()),
      encoding: Encoding::Utf8,
      lines: split_lines(text),
      file_id,
    }
  }

  /// Lines numbered from 1.
  pub fn raw_lines(&self) -> impl Iterator<Item = RawLine> + '_ {
    self
      .lines
      .iter()
      .enumerate()
      .map(move |(i, text)| RawLine::new(self.file_id.clone(), i as u32 + 1, text.clone()))
  }

  pub fn date(&self) -> Option<NaiveDate> {
    file_date(&self.file_id)
  }
}

/// Regular files in `dir` with `extension` (case-insensitive), sorted by name.
pub fn list_log_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, EtlError> {
  let extension = extension.trim_start_matches('.');
  let entries = std::fs::read_dir(dir).map_err(|e| EtlError::io(dir, e))?;

  let mut files = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|e| EtlError::io(dir, e))?;
    let path = entry.path();
    let matches_ext = path
      .extension()
      .and_then(|e| e.to_str())
      .map(|e| e.eq_ignore_ascii_case(extension))
      .unwrap_or(false);
    if matches_ext && path.is_file() {
      files.push(path);
    }
  }
  files.sort();

  info!(dir = %dir.display(), count = files.len(), "log files found");
  Ok(files)
}

/// Read and decode one file. UTF-8 first, Latin-1 as the fallback.
pub fn read_source(path: &Path) -> Result<SourceFile, EtlError> {
  let bytes = std::fs::read(path).map_err(|e| EtlError::io(path, e))?;
  let file_id = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| path.display().to_string());

  let fingerprint = fingerprint::compute(&bytes);
  let (text, encoding) = decode(bytes);
  let lines = split_lines(&text);

  debug!(
    file = %file_id,
    lines = lines.len(),
    encoding = encoding.as_str(),
    fingerprint = %fingerprint,
    "source read"
  );

  Ok(SourceFile {
    file_id,
    path: path.to_path_buf(),
    fingerprint,
    encoding,
    lines,
  })
}

/// The calendar day in a `<YYYY-MM-DD>_<line>.log` file name.
pub fn file_date(file_name: &str) -> Option<NaiveDate> {
  let prefix = file_name.get(..10)?;
  NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

fn decode(bytes: Vec<u8>) -> (String, Encoding) {
  match String::from_utf8(bytes) {
    Ok(text) => (text, Encoding::Utf8),
    Err(e) => {
      let text = e.into_bytes().iter().map(|&b| char::from(b)).collect();
      (text, Encoding::Latin1)
    }
  }
}

fn split_lines(text: &str) -> Vec<String> {
  let text = text.strip_prefix('\u{feff}').unwrap_or(text);
  text
    .lines()
    .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn utf8_file_decodes_as_utf8() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("2025-10-05_formulacao.log");
    std::fs::write(&path, "linha um ção\r\nlinha dois\n").unwrap();

    let src = read_source(&path).unwrap();
    assert_eq!(src.encoding, Encoding::Utf8);
    assert_eq!(src.lines, vec!["linha um ção", "linha dois"]);
    assert_eq!(src.file_id, "2025-10-05_formulacao.log");
    assert_eq!(src.date(), NaiveDate::from_ymd_opt(2025, 10, 5));
  }

  #[test]
  fn invalid_utf8_falls_back_to_latin1() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.log");
    // "ação" in ISO-8859-1
    std::fs::write(&path, [b'a', 0xE7, 0xE3, b'o']).unwrap();

    let src = read_source(&path).unwrap();
    assert_eq!(src.encoding, Encoding::Latin1);
    assert_eq!(src.lines, vec!["ação"]);
  }

  #[test]
  fn fingerprint_is_over_raw_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.log");
    let b = dir.path().join("b.log");
    std::fs::write(&a, "same\n").unwrap();
    std::fs::write(&b, "same\n").unwrap();
    assert_eq!(read_source(&a).unwrap().fingerprint, read_source(&b).unwrap().fingerprint);
  }

  #[test]
  fn lists_only_matching_extension_sorted() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["2025-10-06_formulacao.log", "2025-10-05_formulacao.LOG", "notes.txt"] {
      std::fs::write(dir.path().join(name), "x").unwrap();
    }
    std::fs::create_dir(dir.path().join("nested.log")).unwrap();

    let files = list_log_files(dir.path(), ".log").unwrap();
    let names: Vec<_> = files
      .iter()
      .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
      .collect();
    assert_eq!(names, vec!["2025-10-05_formulacao.LOG", "2025-10-06_formulacao.log"]);
  }

  #[test]
  fn missing_directory_is_an_error() {
    let err = list_log_files(Path::new("/definitely/not/here"), "log").unwrap_err();
    assert!(matches!(err, EtlError::Io { .. }));
  }

  #[test]
  fn raw_lines_are_one_based() {
    let src = SourceFile::from_text("f.log", "a\nb\n");
    let lines: Vec<RawLine> = src.raw_lines().collect();
    assert_eq!(lines[0].line_no, 1);
    assert_eq!(lines[1].text, "b");
  }

  #[test]
  fn file_date_requires_date_prefix() {
    assert_eq!(file_date("formulacao.log"), None);
    assert_eq!(file_date("2025-13-01_formulacao.log"), None);
  }
}
