//! Structured error types for the alarm ETL.
//!
//! Line-level and correlation anomalies are not errors: they surface as
//! `ClassifiedRecord::Unrecognized` and `Orphan` values instead.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EtlError {
  #[error("io: {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("store: {0}")]
  Store(#[from] sqlx_core::Error),

  #[error("migration {version} ({description}): {reason}")]
  Migration {
    version: i64,
    description: String,
    reason: String,
  },

  #[error("out of order: {file_id}: line {current} after line {previous}")]
  OutOfOrder {
    file_id: String,
    previous: u32,
    current: u32,
  },

  #[error("corrupt row: {0}")]
  Corrupt(String),

  #[error("config: {0}")]
  Config(String),

  #[error("timeout: {file_id}: load exceeded {millis}ms")]
  Timeout { file_id: String, millis: u64 },
}

impl EtlError {
  pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }

  pub fn config(msg: impl Into<String>) -> Self {
    Self::Config(msg.into())
  }

  pub fn migration(version: i64, description: &str, reason: impl Into<String>) -> Self {
    Self::Migration {
      version,
      description: description.to_string(),
      reason: reason.into(),
    }
  }

  /// Store-side failures are worth another attempt; everything else is final.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Store(_) | Self::Timeout { .. })
  }
}
