use super::{Delivery, Receipt, Transport, TransportError};
use crate::config::Config;
use std::time::Duration;
use tracing::info;

/// Uploads the artifact to an anonymous file host (`PUT <base>/<name>`)
/// and returns the URL the host answers with. No size budget, so artifacts
/// always go up whole.
pub struct LinkTransport {
    client: reqwest::blocking::Client,
    upload_url: String,
}

impl LinkTransport {
    pub fn new(upload_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            upload_url: upload_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, TransportError> {
        Self::new(
            &cfg.link.upload_url,
            Duration::from_secs(cfg.link.timeout_seconds.max(1)),
        )
    }
}

impl Transport for LinkTransport {
    fn name(&self) -> &'static str {
        "link"
    }

    fn budget(&self) -> Option<u64> {
        None
    }

    fn send(&self, d: &Delivery<'_>) -> Result<Receipt, TransportError> {
        let url = format!("{}/{}", self.upload_url, d.artifact_name);
        let file = std::fs::File::open(&d.part.path)?;
        let resp = self.client.put(&url).body(file).send()?;
        let status = resp.status();
        let body = resp.text()?;
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        let locator = body.trim().to_string();
        if locator.is_empty() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body: "empty response from upload host".into(),
            });
        }
        info!(url = %locator, "artifact uploaded");
        Ok(Receipt {
            locator: Some(locator),
        })
    }
}
