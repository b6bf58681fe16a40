//! Formulation Alarm ETL
//!
//! Turns the formulation line's daily equipment logs into alarm lifecycles:
//! raise, optional message, acknowledgement, batch annotations and resolve,
//! correlated per file by (component, alarm code) and loaded into a
//! versioned SQLite store.
//!
//! Re-running over the same files is safe: processed files are tracked by
//! content fingerprint and every row is upserted on its natural key.

pub mod classify;
pub mod config;
pub mod correlate;
pub mod error;
pub mod fingerprint;
pub mod pipeline;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod timestamp;
pub mod types;

pub use classify::classify;
pub use config::Config;
pub use correlate::{correlate, CorrelationOutput, CorrelationStats, Correlator};
pub use error::EtlError;
pub use pipeline::{FileReport, FileStatus, Pipeline, RunReport};
pub use store::{LifecycleFilter, Store, Table};
pub use types::{AlarmLifecycle, ClassifiedRecord, LifecycleState, Orphan, OrphanKind, RawLine};
