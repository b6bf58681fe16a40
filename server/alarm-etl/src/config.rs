//! Pipeline configuration with sane defaults, overridable from `ALARM_ETL_*`.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::EtlError;

/// Tunables for reading, loading and parallelism.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Directory holding the daily `<YYYY-MM-DD>_formulacao.log` files.
  pub source_dir: PathBuf,
  /// SQLite URL, e.g. `sqlite://database/alarmes_formulacao.db` or `sqlite::memory:`.
  pub database_url: String,
  /// File extension to pick up (without the dot, case-insensitive).
  pub file_extension: String,
  /// Files processed concurrently.
  pub max_workers: usize,
  /// Extra load attempts after the first one fails.
  pub load_retries: u32,
  /// Backoff step between load attempts; attempt `n` waits `n * step`.
  pub retry_backoff_ms: u64,
  /// Upper bound for a single load attempt.
  pub load_timeout_secs: u64,
  /// How long SQLite waits on a locked database before giving up.
  pub busy_timeout_secs: u64,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      source_dir: PathBuf::from("logs_formulation"),
      database_url: "sqlite://database/alarmes_formulacao.db".into(),
      file_extension: "log".into(),
      max_workers: 4,
      load_retries: 3,
      retry_backoff_ms: 250,
      load_timeout_secs: 60,
      busy_timeout_secs: 5,
    }
  }
}

impl Config {
  /// Defaults overlaid with `ALARM_ETL_SOURCE_DIR`, `ALARM_ETL_DATABASE_URL`, ...
  pub fn from_env() -> Result<Self, EtlError> {
    let config: Config = envy::prefixed("ALARM_ETL_")
      .from_env()
      .map_err(|e| EtlError::config(format!("environment: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), EtlError> {
    if self.max_workers == 0 {
      return Err(EtlError::config("max_workers must be at least 1"));
    }
    if self.load_timeout_secs == 0 {
      return Err(EtlError::config("load_timeout_secs must be at least 1"));
    }
    if self.file_extension.trim_start_matches('.').is_empty() {
      return Err(EtlError::config("file_extension must not be empty"));
    }
    if self.database_url.is_empty() {
      return Err(EtlError::config("database_url must not be empty"));
    }
    Ok(())
  }

  pub fn retry_backoff(&self) -> Duration {
    Duration::from_millis(self.retry_backoff_ms)
  }

  pub fn load_timeout(&self) -> Duration {
    Duration::from_secs(self.load_timeout_secs)
  }

  pub fn busy_timeout(&self) -> Duration {
    Duration::from_secs(self.busy_timeout_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.max_workers, 4);
    assert_eq!(config.file_extension, "log");
  }

  #[test]
  fn zero_workers_rejected() {
    let config = Config {
      max_workers: 0,
      ..Config::default()
    };
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("max_workers"));
  }

  #[test]
  fn zero_load_timeout_rejected() {
    let config = Config {
      load_timeout_secs: 0,
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn bare_dot_extension_rejected() {
    let config = Config {
      file_extension: ".".into(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn env_overlay_keeps_unset_defaults() {
    let vars = vec![
      ("ALARM_ETL_MAX_WORKERS".to_string(), "8".to_string()),
      ("ALARM_ETL_SOURCE_DIR".to_string(), "/data/logs".to_string()),
    ];
    let config: Config = envy::prefixed("ALARM_ETL_").from_iter(vars).unwrap();
    assert_eq!(config.max_workers, 8);
    assert_eq!(config.source_dir, PathBuf::from("/data/logs"));
    assert_eq!(config.load_retries, 3);
  }
}
