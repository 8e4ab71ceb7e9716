//! Trawl
//!
//! The automation core of an attack-surface monitor: user-defined shell
//! pipes run periodically against a growing set of assets, their output
//! is templated into structured records, and genuinely new records raise
//! alerts.
//!
//! Architecture:
//! - Configuration: environment settings (database, redis, webhook)
//! - Scheduler: one loop per pipe selecting eligible assets and
//!   enqueueing jobs
//! - Worker: per-pipe pools consuming the queue and running the executor
//! - Executor: spawns the pipe's subprocess, streams stdout line by line
//!   through filter and templates into the store
//! - Notify: fire-and-forget webhook for freshly created records

pub mod config;
pub mod executor;
pub mod notify;
pub mod replay;
pub mod scheduler;
pub mod worker;
