//! Email delivery: one message per part, each with exactly one attachment.

use super::{Delivery, Receipt, Transport, TransportError};
use crate::config::{Config, MailProvider, base64_len};
use crate::util::human_bytes;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachment_name: String,
    pub attachment: Vec<u8>,
}

pub trait Mailer: Sync {
    fn send(&self, msg: &EmailMessage) -> Result<(), TransportError>;
}

impl<M: Mailer + ?Sized> Mailer for Box<M> {
    fn send(&self, msg: &EmailMessage) -> Result<(), TransportError> {
        (**self).send(msg)
    }
}

/// Builds the configured mailer.
pub fn mailer_from_config(cfg: &Config) -> Result<Box<dyn Mailer>, TransportError> {
    Ok(match cfg.email.provider {
        MailProvider::Sendgrid => Box::new(SendGridMailer::from_config(cfg)?),
        MailProvider::Smtp => Box::new(SmtpMailer::from_config(cfg)),
    })
}

pub struct EmailTransport<M: Mailer> {
    mailer: M,
    budget: u64,
    ceiling: u64,
}

impl<M: Mailer> EmailTransport<M> {
    pub fn new(mailer: M, budget: u64, ceiling: u64) -> Self {
        Self {
            mailer,
            budget,
            ceiling,
        }
    }

    pub fn from_config(mailer: M, cfg: &Config) -> Self {
        Self::new(
            mailer,
            cfg.delivery.budget_bytes,
            cfg.delivery.transport_ceiling_bytes,
        )
    }
}

pub fn subject_for(d: &Delivery<'_>) -> String {
    if d.chunked {
        format!("Your 3D model - Part {}/{}", d.part.index, d.part.total)
    } else {
        "Your 3D model is ready".to_string()
    }
}

pub fn body_for(d: &Delivery<'_>) -> String {
    if !d.chunked {
        return format!(
            "Thanks! Your 3D model is attached as {}.\n\nUnzip it to get the model files.\n",
            d.artifact_name
        );
    }
    format!(
        "Your 3D model was too large for a single email, so it was split into {total} parts.\n\
         This is part {index} of {total} ({size}, sha256 {part_sha}).\n\n\
         Once you have all {total} parts, save them in one folder and join them in order:\n\n\
         \x20   cat {name}.part* > {name}\n\n\
         (Windows: copy /b {name}.part* {name})\n\n\
         The joined file should have sha256 {sha}. Unzip it to get the model files.\n",
        total = d.part.total,
        index = d.part.index,
        size = human_bytes(d.part.bytes),
        part_sha = d.part.sha256,
        name = d.artifact_name,
        sha = d.artifact_sha256,
    )
}

impl<M: Mailer> Transport for EmailTransport<M> {
    fn name(&self) -> &'static str {
        "email"
    }

    fn budget(&self) -> Option<u64> {
        Some(self.budget)
    }

    fn needs_recipient(&self) -> bool {
        true
    }

    fn ceiling(&self) -> Option<u64> {
        Some(self.ceiling)
    }

    fn encoded_len(&self, raw: u64) -> u64 {
        base64_len(raw)
    }

    fn send(&self, d: &Delivery<'_>) -> Result<Receipt, TransportError> {
        let to = d.recipient.ok_or(TransportError::MissingRecipient)?;
        let attachment_name = d
            .part
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| d.artifact_name.to_string());
        let msg = EmailMessage {
            to: to.to_string(),
            subject: subject_for(d),
            body: body_for(d),
            attachment_name,
            attachment: std::fs::read(&d.part.path)?,
        };
        self.mailer.send(&msg)?;
        info!(to, subject = %msg.subject, "email sent");
        Ok(Receipt::default())
    }
}

/// SendGrid v3 `mail/send` over HTTPS.
pub struct SendGridMailer {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: Option<String>,
    from_email: String,
    from_name: String,
}

impl SendGridMailer {
    pub fn from_config(cfg: &Config) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.email.request_timeout_seconds.max(1)))
            .build()?;
        Ok(Self {
            client,
            endpoint: cfg.email.sendgrid_endpoint.clone(),
            api_key: std::env::var(&cfg.email.sendgrid_api_key_env)
                .ok()
                .filter(|k| !k.is_empty()),
            from_email: cfg.email.sender_email.clone(),
            from_name: cfg.email.sender_name.clone(),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    fn payload(&self, msg: &EmailMessage) -> serde_json::Value {
        serde_json::json!({
            "personalizations": [{ "to": [{ "email": msg.to }] }],
            "from": { "email": self.from_email, "name": self.from_name },
            "subject": msg.subject,
            "content": [{ "type": "text/plain", "value": msg.body }],
            "attachments": [{
                "content": STANDARD.encode(&msg.attachment),
                "type": "application/octet-stream",
                "filename": msg.attachment_name,
                "disposition": "attachment",
            }],
        })
    }
}

impl Mailer for SendGridMailer {
    fn send(&self, msg: &EmailMessage) -> Result<(), TransportError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| TransportError::NotConfigured("SendGrid API key not set".into()))?;
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(key)
            .json(&self.payload(msg))
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Plain SMTP with STARTTLS.
pub struct SmtpMailer {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    from_email: String,
    from_name: String,
    timeout: Duration,
}

impl SmtpMailer {
    pub fn from_config(cfg: &Config) -> Self {
        let e = &cfg.email;
        Self {
            host: e.smtp_host.clone(),
            port: e.smtp_port,
            user: std::env::var(&e.smtp_user_env).ok(),
            password: std::env::var(&e.smtp_password_env).ok(),
            from_email: e.sender_email.clone(),
            from_name: e.sender_name.clone(),
            timeout: Duration::from_secs(e.request_timeout_seconds.max(1)),
        }
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, msg: &EmailMessage) -> Result<(), TransportError> {
        use lettre::{
            Message, SmtpTransport, Transport as _,
            message::{Attachment, Mailbox, MultiPart, SinglePart, header::ContentType},
            transport::smtp::authentication::Credentials,
        };

        if self.host.is_empty() {
            return Err(TransportError::NotConfigured("email.smtp_host is empty".into()));
        }

        let from = Mailbox::new(
            Some(self.from_name.clone()),
            self.from_email
                .parse()
                .map_err(|e: lettre::address::AddressError| TransportError::Address(e.to_string()))?,
        );
        let to: Mailbox = msg
            .to
            .parse()
            .map_err(|e: lettre::address::AddressError| TransportError::Address(e.to_string()))?;
        let content_type = ContentType::parse("application/octet-stream")
            .map_err(|e| TransportError::Build(e.to_string()))?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(msg.subject.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(msg.body.clone()))
                    .singlepart(
                        Attachment::new(msg.attachment_name.clone())
                            .body(msg.attachment.clone(), content_type),
                    ),
            )
            .map_err(|e| TransportError::Build(e.to_string()))?;

        let mut builder = SmtpTransport::starttls_relay(&self.host)
            .map_err(|e| TransportError::Smtp(e.to_string()))?
            .port(self.port)
            .timeout(Some(self.timeout));
        if let (Some(user), Some(pass)) = (&self.user, &self.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        builder
            .build()
            .send(&email)
            .map_err(|e| TransportError::Smtp(e.to_string()))?;
        Ok(())
    }
}
