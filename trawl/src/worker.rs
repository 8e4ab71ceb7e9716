//! The worker supervisor: per-pipe pools consuming the queue.
//!
//! Each dispatched job writes its task marker before execution starts,
//! so a crash mid-job still backs off the next scheduler cycle until the
//! interval elapses (at-least-once with back-off).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info};

use trawl_core::IpBlacklist;
use trawl_core::Pipe;
use trawl_queue::{JobEnvelope, JobError, JobHandler, Queue};
use trawl_store::Store;

use crate::executor;
use crate::notify::Notifier;
use crate::replay::FailedJob;

pub async fn start(
    pipes: Vec<Pipe>,
    queue: Queue,
    store: Arc<dyn Store>,
    blacklist: Arc<IpBlacklist>,
    notifier: Notifier,
    save_failed: Option<PathBuf>,
) {
    let handler = Arc::new(PipeJobHandler {
        store,
        blacklist,
        notifier,
        save_failed,
    });
    let pools = queue.start_workers(&pipes, handler);
    futures::future::join_all(pools).await;
}

pub struct PipeJobHandler {
    store: Arc<dyn Store>,
    blacklist: Arc<IpBlacklist>,
    notifier: Notifier,
    save_failed: Option<PathBuf>,
}

#[async_trait]
impl JobHandler for PipeJobHandler {
    async fn dispatch(&self, envelope: &JobEnvelope) -> Result<()> {
        let (pipe, data) = envelope.decode().context("decoding job payload")?;

        // the canonical task-marker write: before execution starts, so
        // the interval guard holds even if this worker dies mid-job
        if !data.id.is_empty() {
            if let Err(err) = self.store.add_task(&pipe.name, &data.id, None).await {
                error!(pipe = %pipe.name, ident = %data.id, %err, "adding task marker failed");
            }
        }

        if !self.blacklist.is_valid_host(&data.asset).await {
            info!(
                pipe = %pipe.name,
                asset = %data.asset,
                "skipping asset resolving to a blocked address"
            );
            return Ok(());
        }

        executor::process(&pipe, &data, self.store.as_ref(), &self.notifier).await
    }

    async fn on_error(&self, envelope: &JobEnvelope, error: &JobError, exhausted: bool) {
        // a timed-out job already committed its per-line work
        if matches!(error, JobError::Timeout) {
            return;
        }

        error!(job = %envelope.id, retried = envelope.retried, %error, "handling job failed");

        if !exhausted {
            return;
        }
        let Some(dir) = &self.save_failed else { return };
        if let Err(err) = dump_failed(dir, envelope, error) {
            error!(%err, "saving failed job payload");
        }
    }
}

/// Writes the payload and error of an exhausted job to
/// `<dir>/failed-*.json` for later `--replay`.
fn dump_failed(dir: &Path, envelope: &JobEnvelope, error: &JobError) -> Result<()> {
    let (pipe, data) = envelope.decode().context("decoding job payload")?;
    let failed = FailedJob {
        pipe,
        data,
        error: error.to_string(),
    };
    let encoded = serde_json::to_vec_pretty(&failed).context("encoding failed job")?;

    let mut file = tempfile::Builder::new()
        .prefix("failed-")
        .suffix(".json")
        .keep(true)
        .tempfile_in(dir)
        .context("creating failed-job file")?;
    file.write_all(&encoded).context("writing failed-job file")?;

    info!(path = %file.path().display(), "saved failed job");
    Ok(())
}
