//! `tasklane-core`: the data model shared by the scheduler and its hosts.
//!
//! Nothing in here is async: records, limits, retry decisions, errors and
//! configuration are plain values that the engine in `tasklane-scheduler`
//! owns and mutates.

pub mod config;
pub mod error;
pub mod limit;
pub mod network;
pub mod record;
pub mod retry;

pub use config::{DatabaseConfig, QueueConfig, TasklaneConfig};
pub use error::{ConfigError, ConstraintError, JobError, JobOutcome, RecordError};
pub use limit::Limit;
pub use network::{Connectivity, NetworkRequirement};
pub use record::{Fields, JobRecord, Params};
pub use retry::RetryDecision;
