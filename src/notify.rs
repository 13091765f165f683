//! Advisory webhook notification of a job's outcome.
//!
//! Notification has its own result type and never feeds back into the job
//! outcome: the synchronous response (or the email itself) is the primary
//! channel.

use crate::{config::Config, job::Outcome};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned HTTP {0}")]
    HttpStatus(u16),
}

pub trait Notifier: Sync {
    fn post(&self, url: &str, outcome: &Outcome) -> Result<(), NotifyError>;
}

pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, NotifyError> {
        Self::new(Duration::from_secs(cfg.webhook.timeout_seconds.max(1)))
    }
}

impl Notifier for WebhookNotifier {
    fn post(&self, url: &str, outcome: &Outcome) -> Result<(), NotifyError> {
        let resp = self.client.post(url).json(outcome).send()?;
        if !resp.status().is_success() {
            return Err(NotifyError::HttpStatus(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum NotificationStatus {
    Skipped,
    Delivered,
    Failed(String),
}

/// Posts `outcome` if a webhook was requested; failures are logged and
/// reported back only as a [`NotificationStatus`].
pub fn notify(notifier: &dyn Notifier, webhook_url: Option<&str>, outcome: &Outcome) -> NotificationStatus {
    let Some(url) = webhook_url.filter(|u| !u.trim().is_empty()) else {
        return NotificationStatus::Skipped;
    };
    match notifier.post(url, outcome) {
        Ok(()) => {
            info!(url, ok = outcome.ok, "webhook notified");
            NotificationStatus::Delivered
        }
        Err(e) => {
            warn!(url, error = %e, "webhook notification failed");
            NotificationStatus::Failed(e.to_string())
        }
    }
}
