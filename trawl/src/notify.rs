//! Slack-style webhook notifications.
//!
//! One fire-and-forget POST per job with the pipe's freshly created
//! idents. Failures are the caller's to log; they never fail the job.

use std::time::Duration;

use serde_json::json;
use thiserror::Error;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook rejected the notification: {0}")]
    Rejected(String),
}

#[derive(Clone)]
pub struct Notifier {
    webhook: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("building webhook http client");
        Self { webhook, client }
    }

    /// POSTs `{"text": ...}` to the configured webhook. A missing webhook
    /// makes this a no-op; any body other than `ok` counts as rejection.
    pub async fn notify(&self, text: &str) -> Result<(), NotifyError> {
        let Some(url) = &self.webhook else {
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        let body = response.text().await?;
        if body != "ok" {
            return Err(NotifyError::Rejected(body));
        }
        Ok(())
    }
}
