//! `tasklane-scheduler`: per-job execution engine with constraint gating,
//! retry/backoff policy, periodic re-runs and SQLite persistence.
//!
//! # Overview
//!
//! A host builds a [`JobRecord`](tasklane_core::JobRecord), pairs it with a
//! [`Job`] implementation and submits both to a [`JobQueue`]. The queue wraps
//! them in an [`ExecutionEngine`], runs the schedule-time constraint checks,
//! and drives the engine on a tokio task that holds one slot of the job's
//! group until the job terminates.
//!
//! # Constraints
//!
//! | Constraint       | Schedule time        | Each run attempt                       |
//! |------------------|----------------------|----------------------------------------|
//! | `Deadline`       | -                    | fails once the deadline has passed     |
//! | `Delay`          | -                    | blocks, re-runs after a one-shot timer |
//! | `UniqueInstance` | dedup or override    | -                                      |
//! | `Network`        | -                    | blocks until connectivity suffices     |

pub mod clock;
pub mod connectivity;
pub mod constraint;
pub mod db;
pub mod engine;
pub mod error;
pub mod job;
pub mod queue;
pub mod registry;
pub mod store;

pub use clock::Clock;
pub use connectivity::{ConnectivityProvider, ManualConnectivity};
pub use engine::{ExecutionEngine, JobState};
pub use error::{Result, SchedulerError};
pub use job::{Completion, Job, JobContext};
pub use queue::{DroppedJob, JobHandle, JobQueue, QueueBuilder, RehydrateReport};
pub use registry::{JobFactory, JobRegistry};
pub use store::{JobStore, SqliteJobStore, StoredJob};
