//! Trawl Queue
//!
//! Redis-backed job bus between the scheduler and the workers. Each pipe
//! name is a distinct logical queue (one Redis list per pipe), consumed
//! by a worker pool of the pipe's configured concurrency.
//!
//! Enqueue carries three attributes: a uniqueness guard valid for the
//! pipe's interval (a second enqueue of an equal payload inside that
//! window fails with [`QueueError::Duplicate`]), a per-job timeout equal
//! to the pipe's timeout, and a bounded retry count.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use trawl_core::{Data, Pipe};

/// Maximum number of re-deliveries after a failed dispatch.
pub const MAX_RETRY: u32 = 3;

/// How long a blocking pop waits before looping; keeps workers responsive
/// to shutdown without busy-polling Redis.
const POP_TIMEOUT_SECS: f64 = 5.0;

const QUEUE_PREFIX: &str = "trawl:jobs:";
const UNIQUE_PREFIX: &str = "trawl:unique:";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job already enqueued")]
    Duplicate,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("encoding job payload failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Why a dispatched job failed; handed to [`JobHandler::on_error`].
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job timed out")]
    Timeout,
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// The wire envelope: the pipe definition and the input record travel as
/// two JSON strings so workers never reload YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: Uuid,
    pub pipe: String,
    pub data: String,
    #[serde(default)]
    pub retried: u32,
}

impl JobEnvelope {
    pub fn new(pipe: &Pipe, data: &Data) -> Result<Self, QueueError> {
        Ok(Self {
            id: Uuid::new_v4(),
            pipe: serde_json::to_string(pipe)?,
            data: serde_json::to_string(data)?,
            retried: 0,
        })
    }

    pub fn decode(&self) -> Result<(Pipe, Data), QueueError> {
        let pipe = serde_json::from_str(&self.pipe)?;
        let data = serde_json::from_str(&self.data)?;
        Ok((pipe, data))
    }
}

/// Per-job callbacks implemented by the worker supervisor.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn dispatch(&self, envelope: &JobEnvelope) -> anyhow::Result<()>;

    /// Invoked on every failed dispatch. `exhausted` is true when no
    /// further delivery will be attempted.
    async fn on_error(&self, envelope: &JobEnvelope, error: &JobError, exhausted: bool);
}

#[derive(Clone)]
pub struct Queue {
    conn: ConnectionManager,
}

impl Queue {
    /// Connects to Redis at `host:port`.
    pub async fn connect(addr: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(format!("redis://{addr}"))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Submits one job for a pipe. A second enqueue of an equal payload
    /// within the pipe's interval fails with [`QueueError::Duplicate`].
    pub async fn enqueue(&self, pipe: &Pipe, data: &Data) -> Result<(), QueueError> {
        let envelope = JobEnvelope::new(pipe, data)?;
        let mut conn = self.conn.clone();

        let digest = hex::encode(Sha256::digest(envelope.data.as_bytes()));
        let guard = format!("{UNIQUE_PREFIX}{}:{digest}", pipe.name);
        let ttl_ms = pipe.interval().as_millis().max(1) as u64;

        let claimed: Option<String> = redis::cmd("SET")
            .arg(&guard)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        if claimed.is_none() {
            return Err(QueueError::Duplicate);
        }

        push(&mut conn, &queue_key(&pipe.name), &envelope).await
    }

    /// Starts one worker pool per pipe, each consuming only that pipe's
    /// queue with the pipe's configured concurrency. The returned handles
    /// never resolve under normal operation.
    pub fn start_workers(
        &self,
        pipes: &[Pipe],
        handler: Arc<dyn JobHandler>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for pipe in pipes {
            debug!(pipe = %pipe.name, workers = pipe.workers(), "starting worker pool");
            for _ in 0..pipe.workers() {
                let worker = Worker {
                    conn: self.conn.clone(),
                    pipe: pipe.clone(),
                    handler: Arc::clone(&handler),
                };
                handles.push(tokio::spawn(worker.run()));
            }
        }
        handles
    }
}

fn queue_key(pipe: &str) -> String {
    format!("{QUEUE_PREFIX}{pipe}")
}

async fn push(
    conn: &mut ConnectionManager,
    key: &str,
    envelope: &JobEnvelope,
) -> Result<(), QueueError> {
    let payload = serde_json::to_string(envelope)?;
    let _: i64 = conn.lpush(key, payload).await?;
    Ok(())
}

struct Worker {
    conn: ConnectionManager,
    pipe: Pipe,
    handler: Arc<dyn JobHandler>,
}

impl Worker {
    async fn run(self) {
        let key = queue_key(&self.pipe.name);
        let job_timeout = self.pipe.timeout();
        let mut conn = self.conn.clone();

        loop {
            let popped: Result<Option<(String, String)>, redis::RedisError> =
                conn.brpop(&key, POP_TIMEOUT_SECS).await;

            let payload = match popped {
                Ok(Some((_, payload))) => payload,
                Ok(None) => continue,
                Err(err) => {
                    error!(pipe = %self.pipe.name, %err, "popping job failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let envelope: JobEnvelope = match serde_json::from_str(&payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!(pipe = %self.pipe.name, %err, "decoding job payload failed");
                    continue;
                }
            };

            debug!(job = %envelope.id, pipe = %self.pipe.name, retried = envelope.retried, "dispatching job");

            let outcome = match tokio::time::timeout(
                job_timeout,
                self.handler.dispatch(&envelope),
            )
            .await
            {
                Err(_) => Err(JobError::Timeout),
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(JobError::Handler(err)),
            };

            let Err(job_error) = outcome else { continue };

            // timeouts are final: the per-line work is already committed
            let retryable = matches!(job_error, JobError::Handler(_));
            let exhausted = !retryable || envelope.retried >= MAX_RETRY;
            self.handler.on_error(&envelope, &job_error, exhausted).await;

            if retryable && !exhausted {
                let mut next = envelope;
                next.retried += 1;
                if let Err(err) = push(&mut conn, &key, &next).await {
                    error!(pipe = %self.pipe.name, %err, "re-enqueueing failed job");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pipe() -> Pipe {
        Pipe {
            name: "http_detect".to_string(),
            command: "echo test".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn envelope_round_trips_pipe_and_data() {
        let pipe = sample_pipe();
        let data = Data {
            id: "example.com".to_string(),
            asset: "example.com".to_string(),
            target: "acme".to_string(),
            ..Default::default()
        };

        let envelope = JobEnvelope::new(&pipe, &data).unwrap();
        assert_eq!(envelope.retried, 0);

        let (decoded_pipe, decoded_data) = envelope.decode().unwrap();
        assert_eq!(decoded_pipe.name, "http_detect");
        assert_eq!(decoded_data.id, "example.com");
        assert_eq!(decoded_data.target, "acme");
    }

    #[test]
    fn envelope_wire_format_carries_two_json_strings() {
        let pipe = sample_pipe();
        let data = Data::default();
        let envelope = JobEnvelope::new(&pipe, &data).unwrap();

        let wire: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert!(wire["pipe"].is_string());
        assert!(wire["data"].is_string());

        // both sides must parse on their own
        let inner: serde_json::Value =
            serde_json::from_str(wire["pipe"].as_str().unwrap()).unwrap();
        assert_eq!(inner["name"], "http_detect");
    }

    #[test]
    fn queue_keys_are_per_pipe() {
        assert_eq!(queue_key("subfinder"), "trawl:jobs:subfinder");
        assert_ne!(queue_key("a"), queue_key("b"));
    }

    #[test]
    fn handler_errors_are_retryable_timeouts_are_not() {
        let timeout = JobError::Timeout;
        assert!(!matches!(timeout, JobError::Handler(_)));

        let failed = JobError::Handler(anyhow::anyhow!("boom"));
        assert!(matches!(failed, JobError::Handler(_)));
    }
}
