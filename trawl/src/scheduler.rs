//! The scheduler: one loop per pipe, selecting eligible assets from the
//! store and enqueueing jobs.
//!
//! Single-input pipes enqueue one job per selected row (the worker writes
//! the task marker at dispatch). `as_file` pipes batch all rows of one
//! target into a temp file and enqueue a single job per target; the
//! marker is written here at enqueue time because the ident is the
//! target, not any row's id, and collecting the batch is the expensive
//! part worth throttling.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use trawl_core::pipe::input_context;
use trawl_core::template;
use trawl_core::{Data, Pipe};
use trawl_queue::{Queue, QueueError};
use trawl_store::Store;

pub async fn start(pipes: Vec<Pipe>, store: Arc<dyn Store>, queue: Queue, sleep: Duration) {
    let mut loops = Vec::new();
    for pipe in pipes {
        info!(pipe = %pipe.name, "loaded pipe into scheduler");
        loops.push(tokio::spawn(run_pipe(
            pipe,
            Arc::clone(&store),
            queue.clone(),
            sleep,
        )));
    }
    futures::future::join_all(loops).await;
}

async fn run_pipe(pipe: Pipe, store: Arc<dyn Store>, queue: Queue, sleep: Duration) {
    loop {
        let result = if pipe.is_as_file() {
            run_as_file(&pipe, store.as_ref(), &queue).await
        } else {
            run_single(&pipe, store.as_ref(), &queue).await
        };
        if let Err(err) = result {
            error!(pipe = %pipe.name, %err, "scheduler iteration failed");
        }

        tokio::time::sleep(sleep).await;
    }
}

/// One job per target, bundling every row of that target into a temp
/// file, one rendered `as_file` line per row.
async fn run_as_file(pipe: &Pipe, store: &dyn Store, queue: &Queue) -> Result<()> {
    let template_body = pipe.input.as_file.as_deref().unwrap_or_default();
    let interval = pipe.interval();

    let targets = store
        .retrieve_targets()
        .await
        .context("retrieving targets")?;
    debug!(pipe = %pipe.name, targets = targets.len(), "retrieved targets for as_file");

    for target in targets {
        if !store.should_run(&pipe.name, &target, interval).await? {
            continue;
        }

        let rows = store
            .retrieve_by_target(&pipe.input.table, &pipe.input.filter, &target)
            .await
            .context("retrieving input rows")?;

        let mut file = tempfile::Builder::new()
            .prefix("trawl-")
            .tempfile()
            .context("creating temp file")?;

        let mut lines = 0usize;
        for row in &rows {
            let line = match template::render(template_body, &input_context(row)) {
                Ok(line) => line,
                Err(err) => {
                    warn!(pipe = %pipe.name, %err, "rendering as_file line failed");
                    continue;
                }
            };
            writeln!(file, "{line}").context("writing temp file")?;
            lines += 1;
        }

        if lines == 0 {
            // nothing to do; the empty temp file is dropped and removed
            continue;
        }

        let (_, path) = file.keep().context("persisting temp file")?;
        let mut data = Data {
            target: target.clone(),
            ..Default::default()
        };
        data.data.insert(
            "as_file".to_string(),
            Value::String(path.display().to_string()),
        );

        match queue.enqueue(pipe, &data).await {
            Ok(()) => {
                info!(pipe = %pipe.name, target = %target, lines, "enqueued as_file job");
                // marker written at enqueue: the ident is the target and
                // collecting the batch is the operation being throttled
                if let Err(err) = store.add_task(&pipe.name, &target, None).await {
                    error!(pipe = %pipe.name, target = %target, %err, "adding task marker failed");
                }
            }
            Err(QueueError::Duplicate) => {
                info!(pipe = %pipe.name, target = %target, "job already enqueued, skipping");
                let _ = std::fs::remove_file(&path);
            }
            Err(err) => {
                let _ = std::fs::remove_file(&path);
                return Err(err).context("enqueueing as_file job");
            }
        }
    }

    Ok(())
}

/// One job per eligible row, either from an input file or from a table.
async fn run_single(pipe: &Pipe, store: &dyn Store, queue: &Queue) -> Result<()> {
    let interval = pipe.interval();
    let mut enqueued = 0usize;
    let mut skipped = 0usize;

    if let Some(path) = pipe.input.file.as_deref().filter(|f| !f.is_empty()) {
        let target = Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading input file {path}"))?;

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !store.should_run(&pipe.name, line, interval).await? {
                skipped += 1;
                continue;
            }

            let data = Data {
                id: line.to_string(),
                asset: line.to_string(),
                target: target.clone(),
                ..Default::default()
            };
            match queue.enqueue(pipe, &data).await {
                Ok(()) => {
                    debug!(pipe = %pipe.name, ident = %data.id, "enqueued");
                    enqueued += 1;
                }
                Err(QueueError::Duplicate) => skipped += 1,
                Err(err) => return Err(err).context("enqueueing job"),
            }
        }
    } else {
        let rows = store
            .retrieve(
                &pipe.input.table,
                &pipe.name,
                &pipe.input.filter,
                &pipe.input.threshold,
                interval,
            )
            .await
            .context("retrieving input rows")?;

        for data in rows {
            match queue.enqueue(pipe, &data).await {
                Ok(()) => {
                    debug!(pipe = %pipe.name, ident = %data.id, "enqueued");
                    enqueued += 1;
                }
                Err(QueueError::Duplicate) => skipped += 1,
                Err(err) => return Err(err).context("enqueueing job"),
            }
        }
    }

    info!(pipe = %pipe.name, enqueued, skipped, "scheduler run");
    Ok(())
}
