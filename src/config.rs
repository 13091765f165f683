use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub reconstruction: Reconstruction,
    #[serde(default)]
    pub package: Package,
    #[serde(default)]
    pub delivery: Delivery,
    #[serde(default)]
    pub email: Email,
    #[serde(default)]
    pub link: Link,
    #[serde(default)]
    pub local: Local,
    #[serde(default)]
    pub webhook: Webhook,
    #[serde(default)]
    pub jobs: Jobs,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects configurations that could never deliver anything.
    ///
    /// The attachment budget is raw bytes; the transport sees the base64
    /// encoding of it, so the encoded length of a full-budget part must
    /// still fit under the hard ceiling.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.min_images == 0 {
            bail!("inputs.min_images must be at least 1");
        }
        if self.inputs.allowed_extensions.is_empty() {
            bail!("inputs.allowed_extensions must not be empty");
        }
        let fallback = &self.inputs.url_default_extension;
        if !self
            .inputs
            .allowed_extensions
            .iter()
            .any(|a| a.eq_ignore_ascii_case(fallback))
        {
            bail!("inputs.url_default_extension={fallback:?} is not in inputs.allowed_extensions");
        }
        if self.reconstruction.program.trim().is_empty() {
            bail!("reconstruction.program must not be empty");
        }
        if self.delivery.budget_bytes == 0 {
            bail!("delivery.budget_bytes must be greater than zero");
        }
        if self.delivery.max_attempts == 0 {
            bail!("delivery.max_attempts must be at least 1");
        }
        let encoded = base64_len(self.delivery.budget_bytes);
        if encoded > self.delivery.transport_ceiling_bytes {
            bail!(
                "delivery.budget_bytes={} encodes to {} bytes, above transport_ceiling_bytes={}",
                self.delivery.budget_bytes,
                encoded,
                self.delivery.transport_ceiling_bytes
            );
        }
        Ok(())
    }
}

/// Length of the padded base64 encoding of `raw` bytes.
pub fn base64_len(raw: u64) -> u64 {
    raw.div_ceil(3) * 4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub base_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            base_dir: "/tmp/model-courier-jobs".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Inputs {
    pub min_images: usize,
    pub allowed_extensions: Vec<String>,
    pub fetch_timeout_seconds: u64,
    pub url_default_extension: String,
}
impl Default for Inputs {
    fn default() -> Self {
        Self {
            min_images: 3,
            allowed_extensions: ["jpg", "jpeg", "png", "tif", "tiff"]
                .into_iter()
                .map(String::from)
                .collect(),
            fetch_timeout_seconds: 300,
            url_default_extension: "jpg".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Reconstruction {
    pub program: String,
    pub args: Vec<String>,
    pub max_image_size: u32,
    pub dense: bool,
    pub timeout_seconds: u64,
    pub env: BTreeMap<String, String>,
}
impl Default for Reconstruction {
    fn default() -> Self {
        Self {
            program: "/workspace/photogrammetry.sh".into(),
            args: vec![
                "{input}".into(),
                "{output}".into(),
                "{max_image_size}".into(),
                "{dense}".into(),
            ],
            max_image_size: 2000,
            dense: true,
            timeout_seconds: 0,
            env: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Package {
    pub archive_name: String,
}
impl Default for Package {
    fn default() -> Self {
        Self {
            archive_name: "model.zip".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Email,
    Link,
    /// Archive copied to `local.out_dir` and its path returned.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResendPolicy {
    /// Re-delivery starts at the part that failed.
    Resume,
    /// Re-delivery always sends every part again.
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Delivery {
    pub mode: DeliveryMode,
    pub budget_bytes: u64,
    pub transport_ceiling_bytes: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub resend_policy: ResendPolicy,
}
impl Default for Delivery {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Email,
            budget_bytes: 18 * 1024 * 1024,
            transport_ceiling_bytes: 25 * 1024 * 1024,
            max_attempts: 3,
            retry_delay_ms: 2000,
            resend_policy: ResendPolicy::Resume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailProvider {
    Sendgrid,
    Smtp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Email {
    pub provider: MailProvider,
    pub sender_email: String,
    pub sender_name: String,
    pub sendgrid_endpoint: String,
    pub sendgrid_api_key_env: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user_env: String,
    pub smtp_password_env: String,
    pub request_timeout_seconds: u64,
}
impl Default for Email {
    fn default() -> Self {
        Self {
            provider: MailProvider::Sendgrid,
            sender_email: "noreply@model-courier.local".into(),
            sender_name: "Model Courier".into(),
            sendgrid_endpoint: "https://api.sendgrid.com/v3/mail/send".into(),
            sendgrid_api_key_env: "SENDGRID_API_KEY".into(),
            smtp_host: "".into(),
            smtp_port: 587,
            smtp_user_env: "SMTP_USER".into(),
            smtp_password_env: "SMTP_PASSWORD".into(),
            request_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Link {
    pub upload_url: String,
    pub timeout_seconds: u64,
}
impl Default for Link {
    fn default() -> Self {
        Self {
            upload_url: "https://transfer.sh".into(),
            timeout_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Local {
    pub out_dir: String,
}
impl Default for Local {
    fn default() -> Self {
        Self {
            out_dir: "/tmp/model-courier-out".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Webhook {
    pub timeout_seconds: u64,
}
impl Default for Webhook {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Jobs {
    pub max_concurrent: usize,
    pub keep_workspace: bool,
}
impl Default for Jobs {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            keep_workspace: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
