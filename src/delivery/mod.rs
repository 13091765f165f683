//! Delivery of a packaged artifact over a size-constrained transport.
//!
//! The engine plans whole-or-chunked delivery from the transport's raw byte
//! budget, splits the artifact, and makes one send per part with bounded
//! retries. A part that fails after its last attempt ends the delivery;
//! parts already sent stay sent.

pub mod email;
pub mod link;
pub mod local;

use crate::{
    chunk_plan::{self, DeliveryPlan, Part},
    config::Config,
    error::{JobError, JobResult},
    job::DeliveredPart,
    package::Artifact,
};
use anyhow::{Result, bail};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub use email::{EmailMessage, EmailTransport, Mailer, SendGridMailer, SmtpMailer};
pub use link::LinkTransport;
pub use local::LocalTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("transport returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("bad address: {0}")]
    Address(String),

    #[error("message build error: {0}")]
    Build(String),

    #[error("no recipient for email delivery")]
    MissingRecipient,

    #[error("transport not configured: {0}")]
    NotConfigured(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a transport needs for one send.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub part: &'a Part,
    pub chunked: bool,
    pub artifact_name: &'a str,
    pub artifact_sha256: &'a str,
    pub recipient: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct Receipt {
    /// Download URL, for transports that produce one.
    pub locator: Option<String>,
}

pub trait Transport: Sync {
    fn name(&self) -> &'static str;

    /// Largest raw part size, or `None` if the transport takes any size.
    fn budget(&self) -> Option<u64>;

    /// Whether a send needs an email recipient.
    fn needs_recipient(&self) -> bool {
        false
    }

    /// Hard limit on the encoded payload, if the transport has one.
    fn ceiling(&self) -> Option<u64> {
        None
    }

    /// Size of `raw` bytes once encoded for the wire.
    fn encoded_len(&self, raw: u64) -> u64 {
        raw
    }

    fn send(&self, delivery: &Delivery<'_>) -> Result<Receipt, TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub plan_total: usize,
    pub locator: Option<String>,
    pub parts: Vec<DeliveredPart>,
}

pub struct DeliveryEngine<'t> {
    transport: &'t dyn Transport,
    max_attempts: u32,
    retry_delay: Duration,
}

impl<'t> DeliveryEngine<'t> {
    /// Fails if a full-budget part would not fit the transport ceiling once
    /// encoded.
    pub fn new(transport: &'t dyn Transport, max_attempts: u32, retry_delay: Duration) -> Result<Self> {
        if let (Some(budget), Some(ceiling)) = (transport.budget(), transport.ceiling()) {
            let encoded = transport.encoded_len(budget);
            if encoded > ceiling {
                bail!(
                    "{} budget {} bytes encodes to {} bytes, above ceiling {}",
                    transport.name(),
                    budget,
                    encoded,
                    ceiling
                );
            }
        }
        Ok(Self {
            transport,
            max_attempts: max_attempts.max(1),
            retry_delay,
        })
    }

    pub fn from_config(transport: &'t dyn Transport, cfg: &Config) -> Result<Self> {
        Self::new(
            transport,
            cfg.delivery.max_attempts,
            Duration::from_millis(cfg.delivery.retry_delay_ms),
        )
    }

    pub fn plan(&self, artifact: &Artifact) -> DeliveryPlan {
        DeliveryPlan::for_size(artifact.size, self.transport.budget())
    }

    /// Delivers parts with index `>= start_from` (1-based).
    pub fn deliver(
        &self,
        artifact: &Artifact,
        parts_dir: &Path,
        recipient: Option<&str>,
        start_from: usize,
    ) -> JobResult<DeliveryReport> {
        let plan = self.plan(artifact);
        let total = plan.total();
        let chunked = plan.is_chunked();
        info!(
            transport = self.transport.name(),
            bytes = artifact.size,
            parts = total,
            "delivery plan"
        );

        if start_from > total {
            return Err(JobError::validation(format!(
                "cannot start delivery at part {start_from}: artifact has {total} part(s)"
            )));
        }

        let parts = chunk_plan::split(artifact, &plan, parts_dir).map_err(|e| JobError::Delivery {
            part: None,
            total: Some(total),
            reason: format!("splitting artifact: {e}"),
        })?;

        let name = artifact.file_name();
        let mut report = DeliveryReport {
            plan_total: total,
            ..Default::default()
        };
        for part in parts.iter().filter(|p| p.index >= start_from.max(1)) {
            let delivery = Delivery {
                part,
                chunked,
                artifact_name: &name,
                artifact_sha256: &artifact.sha256,
                recipient,
            };
            let receipt = self.send_with_retry(&delivery).map_err(|e| JobError::Delivery {
                part: chunked.then_some(part.index),
                total: chunked.then_some(total),
                reason: e.to_string(),
            })?;
            if receipt.locator.is_some() {
                report.locator = receipt.locator;
            }
            report.parts.push(DeliveredPart {
                index: part.index,
                total,
                bytes: part.bytes,
                sha256: part.sha256.clone(),
            });
        }
        Ok(report)
    }

    fn send_with_retry(&self, delivery: &Delivery<'_>) -> Result<Receipt, TransportError> {
        let mut attempt = 1;
        loop {
            match self.transport.send(delivery) {
                Ok(receipt) => {
                    info!(
                        part = delivery.part.index,
                        total = delivery.part.total,
                        attempt,
                        "part delivered"
                    );
                    return Ok(receipt);
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        part = delivery.part.index,
                        attempt,
                        error = %e,
                        "delivery attempt failed, retrying"
                    );
                    std::thread::sleep(self.retry_delay * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        part = delivery.part.index,
                        attempts = attempt,
                        error = %e,
                        "delivery failed after all attempts"
                    );
                    return Err(e);
                }
            }
        }
    }
}
