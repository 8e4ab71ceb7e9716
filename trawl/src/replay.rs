//! Replaying dumped job payloads.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use trawl_core::{Data, Pipe};
use trawl_store::Store;

use crate::executor;
use crate::notify::Notifier;

/// On-disk shape of a dumped job: `{Pipe, Data, Error}`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailedJob {
    pub pipe: Pipe,
    pub data: Data,
    pub error: String,
}

pub async fn run(path: &Path, store: &dyn Store, notifier: &Notifier) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let failed: FailedJob =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    info!(
        pipe = %failed.pipe.name,
        ident = %failed.data.id,
        original_error = %failed.error,
        "replaying failed job"
    );

    executor::process(&failed.pipe, &failed.data, store, notifier).await
}
