//! Trawl Store
//!
//! The persistence boundary of the pipe runner. Everything that touches
//! rows goes through the [`Store`] trait so the executor and scheduler
//! stay unit-testable; two implementations ship: the Postgres-backed
//! [`PgStore`] and the [`PrintStore`] used for `--noDb` runs.

pub mod postgres;
pub mod print;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use trawl_core::data::{AlertType, Data};

pub use postgres::PgStore;
pub use print::PrintStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Capability set of the backing store.
///
/// Table and pipe names are trusted (a pipe executes arbitrary shell by
/// definition, so there is no smaller boundary to defend); all
/// user-supplied *values* are bound as parameters.
#[async_trait]
pub trait Store: Send + Sync {
    /// Ensures one asset table per name plus the `tasks`, `alerts` and
    /// `blocked` essentials. Idempotent.
    async fn setup_schema(&self, tables: &[String]) -> Result<()>;

    /// Appends a task marker.
    async fn add_task(&self, pipe: &str, ident: &str, note: Option<&str>) -> Result<()>;

    /// True iff no task for `(pipe, ident)` was recorded within the
    /// interval.
    async fn should_run(&self, pipe: &str, ident: &str, interval: Duration) -> Result<bool>;

    /// The scheduler's selection query: non-excluded rows of `table` with
    /// no recent task for this pipe, matching every `filter` equality and
    /// every `threshold` numeric bound over the JSON payload.
    async fn retrieve(
        &self,
        table: &str,
        pipe: &str,
        filter: &BTreeMap<String, String>,
        threshold: &BTreeMap<String, f64>,
        interval: Duration,
    ) -> Result<Vec<Data>>;

    /// All non-excluded rows of one target.
    async fn retrieve_by_target(
        &self,
        table: &str,
        filter: &BTreeMap<String, String>,
        target: &str,
    ) -> Result<Vec<Data>>;

    /// Distinct targets over the canonical asset table.
    async fn retrieve_targets(&self) -> Result<Vec<String>>;

    /// Domains that must never be written as an asset.
    async fn retrieve_blocked(&self) -> Result<Vec<String>>;

    /// Insert-or-ignore one record; returns whether a row was newly
    /// inserted. A non-empty `asset` in `result` overrides the input
    /// asset and is removed from the persisted JSON.
    async fn save(
        &self,
        table: &str,
        pipe: &str,
        id: &str,
        data: &Data,
        result: Map<String, Value>,
    ) -> Result<bool>;

    /// Appends an alert.
    async fn save_alert(
        &self,
        pipe: &str,
        ident: &str,
        message: &str,
        alert_type: AlertType,
    ) -> Result<()>;
}
