//! The executor: runs one pipe against one input record.
//!
//! Spawns `bash -c <rendered cmd>`, streams stdout line by line, applies
//! the pipe's filter predicates, renders the output templates, persists
//! new records and raises alerts for genuine inserts. The pipe's timeout
//! bounds subprocess wall-clock; expiry kills the process and is not an
//! error — everything persisted up to that point stays committed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};

use trawl_core::data::AlertType;
use trawl_core::net::validate_domain;
use trawl_core::pipe::line_context;
use trawl_core::{Data, FilterVm, Pipe};
use trawl_store::Store;

use crate::notify::Notifier;

/// Removes the `as_file` staging file on every exit path, panics included.
struct TempFileGuard(PathBuf);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            error!(path = %self.0.display(), %err, "removing as_file temp file failed");
        }
    }
}

pub async fn process(
    pipe: &Pipe,
    data: &Data,
    store: &dyn Store,
    notifier: &Notifier,
) -> Result<()> {
    let started = Instant::now();

    let _cleanup = if pipe.is_as_file() {
        match data.as_file_path() {
            Some(path) => Some(TempFileGuard(PathBuf::from(path))),
            None => {
                error!(pipe = %pipe.name, "missing as_file entry in job data");
                None
            }
        }
    } else {
        None
    };

    let command = pipe.render_command(data).context("rendering pipe command")?;
    debug!(pipe = %pipe.name, cmd = %command, asset = %data.asset, "executing");

    let mut child = Command::new("bash")
        .arg("-c")
        .arg(&command)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("spawning pipe command")?;
    let stdout = child.stdout.take().context("capturing pipe stdout")?;

    let blocked: HashSet<String> = store
        .retrieve_blocked()
        .await
        .context("retrieving blocklist")?
        .into_iter()
        .collect();
    let vm = FilterVm::new().context("creating filter vm")?;

    let mut notify_lines: Vec<String> = Vec::new();
    let mut lines = BufReader::new(stdout).lines();
    let mut timed_out = false;

    let line_loop = async {
        while let Some(line) = lines
            .next_line()
            .await
            .context("reading pipe stdout")?
        {
            handle_line(pipe, data, store, &vm, &blocked, &mut notify_lines, &line).await;
        }
        Ok::<(), anyhow::Error>(())
    };

    match tokio::time::timeout(pipe.timeout(), line_loop).await {
        Ok(result) => result?,
        Err(_) => {
            timed_out = true;
            child.start_kill().ok();
            info!(pipe = %pipe.name, asset = %data.asset, "pipe command timed out");
        }
    }

    if !notify_lines.is_empty() {
        let text = format!("*[{}]*\n{}", pipe.name, notify_lines.join("\n"));
        if let Err(err) = notifier.notify(&text).await {
            error!(pipe = %pipe.name, %err, "webhook notification failed");
        }
    }

    match child.wait().await {
        Ok(status) if !status.success() && !timed_out => {
            error!(pipe = %pipe.name, %status, "pipe command failed");
        }
        Ok(_) => {}
        Err(err) => error!(pipe = %pipe.name, %err, "waiting for pipe command failed"),
    }

    info!(
        pipe = %pipe.name,
        asset = %data.asset,
        duration = ?started.elapsed(),
        "execution finished"
    );

    Ok(())
}

/// Handles one stdout line. Everything here is best-effort: template,
/// filter and storage failures log and drop the line, never the job.
async fn handle_line(
    pipe: &Pipe,
    data: &Data,
    store: &dyn Store,
    vm: &FilterVm,
    blocked: &HashSet<String>,
    notify_lines: &mut Vec<String>,
    line: &str,
) {
    if line.trim().is_empty() {
        return;
    }

    for (name, script) in &pipe.filter {
        match vm.matches(script, line) {
            Ok(true) => {
                debug!(pipe = %pipe.name, filter = %name, "filtered output line");
                return;
            }
            Ok(false) => {}
            Err(err) => {
                error!(pipe = %pipe.name, filter = %name, %err, "filter evaluation failed");
                return;
            }
        }
    }

    let ctx = line_context(data, line);
    let rendered = pipe.output_map(&ctx);

    let ident = match pipe.ident(&ctx) {
        Ok(ident) => ident,
        Err(err) => {
            error!(pipe = %pipe.name, %err, "rendering ident failed");
            return;
        }
    };
    if ident.is_empty() {
        error!(
            pipe = %pipe.name,
            ident_template = %pipe.output.ident,
            "resulting ident is empty, skipping"
        );
        return;
    }

    if pipe.debug {
        info!(
            pipe = %pipe.name,
            ident = %ident,
            output = %serde_json::Value::Object(rendered),
            "pipe debug"
        );
        return;
    }

    // a non-empty rendered asset overrides the input row's asset
    let asset = rendered
        .get("asset")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(&data.asset)
        .to_string();

    if let Err(err) = validate_domain(&asset) {
        error!(pipe = %pipe.name, ident = %ident, asset = %asset, %err, "invalid asset, skipping");
        return;
    }
    if blocked.contains(&asset) {
        info!(pipe = %pipe.name, asset = %asset, "asset is blocklisted, skipping");
        return;
    }

    let inserted = match store
        .save(&pipe.output.table, &pipe.name, &ident, data, rendered)
        .await
    {
        Ok(inserted) => inserted,
        Err(err) => {
            error!(pipe = %pipe.name, ident = %ident, %err, "saving record failed");
            return;
        }
    };
    if !inserted {
        return;
    }

    info!(pipe = %pipe.name, ident = %ident, "created record");

    let message = match pipe.alert_msg(&ctx) {
        Ok(message) => message,
        Err(err) => {
            error!(pipe = %pipe.name, %err, "rendering alert message failed");
            String::new()
        }
    };
    if !message.is_empty() {
        notify_lines.push(message.clone());
    }

    if let Err(err) = store
        .save_alert(&pipe.name, &ident, &message, AlertType::Created)
        .await
    {
        error!(pipe = %pipe.name, ident = %ident, %err, "saving alert failed");
    }
}
