//! Domain types shared between the scheduler, the queue and the executor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One input record handed to the executor.
///
/// Structure shared between the scheduler (selects), the queue (carries)
/// and the executor (templates). The `data` column is an arbitrary JSON
/// object produced by whichever pipe discovered the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Data {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub pipe: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Data {
    /// Path of the batched input file, when this record was produced by an
    /// `as_file` scheduler run.
    pub fn as_file_path(&self) -> Option<&str> {
        self.data.get("as_file").and_then(Value::as_str)
    }
}

/// A task marker: records that a pipe was dispatched for an ident at a
/// point in time. Basis of the re-run interval enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub pipe: String,
    pub ident: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// Alert categories. Only newly created records raise alerts today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertType {
    Created,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::Created => "CREATED",
        }
    }
}

/// Flattens a record into the `input` template namespace: the record's
/// JSON payload enriched with its `asset` and `target`.
pub fn map_input(data: &Data) -> Map<String, Value> {
    let mut input = data.data.clone();
    input.insert("asset".to_string(), Value::String(data.asset.clone()));
    input.insert("target".to_string(), Value::String(data.target.clone()));
    input
}
