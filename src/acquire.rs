use crate::{
    config::Config,
    error::{JobError, JobResult},
    job::{ImageRef, JobRequest},
};
use regex::Regex;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static email regex")
});

/// Retrieves remote image bytes.
pub trait Fetcher: Sync {
    fn fetch(&self, url: &str) -> JobResult<Vec<u8>>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        Self::new(Duration::from_secs(cfg.inputs.fetch_timeout_seconds.max(1)))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> JobResult<Vec<u8>> {
        let fail = |reason: String| JobError::Fetch {
            url: url.to_string(),
            reason,
        };
        let resp = self.client.get(url).send().map_err(|e| fail(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {}", status.as_u16())));
        }
        let body = resp.bytes().map_err(|e| fail(e.to_string()))?;
        Ok(body.to_vec())
    }
}

/// An image that passed validation: where it comes from and the canonical
/// local name it will get.
#[derive(Debug, Clone)]
pub struct PlannedImage {
    pub source: ImageRef,
    pub file_name: String,
}

/// Checks the request shape without touching the filesystem or network.
pub fn validate(cfg: &Config, req: &JobRequest) -> JobResult<Vec<PlannedImage>> {
    let min = cfg.inputs.min_images;
    if req.images.len() < min {
        return Err(JobError::validation(format!(
            "need at least {min} images, got {}",
            req.images.len()
        )));
    }

    if let Some(email) = req.email.as_deref() {
        if !EMAIL_RE.is_match(email.trim()) {
            return Err(JobError::validation(format!("invalid email address: {email}")));
        }
    }

    if let Some(hook) = req.webhook_url.as_deref() {
        parse_http_url(hook)?;
    }

    let width = req.images.len().to_string().len().max(3);
    let mut planned = Vec::with_capacity(req.images.len());
    for (i, image) in req.images.iter().enumerate() {
        let ext = image_extension(cfg, image)?;
        if let ImageRef::Path { path } = image {
            if !path.is_file() {
                return Err(JobError::validation(format!(
                    "image file not found: {}",
                    path.display()
                )));
            }
        }
        planned.push(PlannedImage {
            source: image.clone(),
            file_name: format!("{:0width$}.{ext}", i + 1),
        });
    }
    Ok(planned)
}

fn image_extension(cfg: &Config, image: &ImageRef) -> JobResult<String> {
    let raw = match image {
        ImageRef::Bytes { filename, .. } => extension_of(filename),
        ImageRef::Path { path } => path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_string),
        ImageRef::Url { url } => {
            let parsed = parse_http_url(url)?;
            let last = parsed
                .path_segments()
                .and_then(|segs| segs.last())
                .unwrap_or_default()
                .to_string();
            match extension_of(&last) {
                Some(ext) => Some(ext),
                None => return Ok(cfg.inputs.url_default_extension.to_ascii_lowercase()),
            }
        }
    };

    let ext = raw
        .map(|e| e.to_ascii_lowercase())
        .ok_or_else(|| JobError::validation(format!("missing file extension: {}", image.label())))?;

    if cfg
        .inputs
        .allowed_extensions
        .iter()
        .any(|a| a.eq_ignore_ascii_case(&ext))
    {
        Ok(ext)
    } else {
        Err(JobError::validation(format!(
            "unsupported file type .{ext}: {}",
            image.label()
        )))
    }
}

fn extension_of(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_string())
}

fn parse_http_url(raw: &str) -> JobResult<Url> {
    let url = Url::parse(raw)
        .map_err(|e| JobError::validation(format!("invalid URL {raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(JobError::validation(format!(
            "unsupported URL scheme {other}: {raw}"
        ))),
    }
}

/// Materializes every planned image under `input_dir`. Any single failure
/// aborts the whole batch.
pub fn acquire(
    planned: &[PlannedImage],
    input_dir: &Path,
    fetcher: &dyn Fetcher,
) -> JobResult<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(planned.len());
    for image in planned {
        let dest = input_dir.join(&image.file_name);
        match &image.source {
            ImageRef::Bytes { data, .. } => std::fs::write(&dest, data)?,
            ImageRef::Path { path } => {
                std::fs::copy(path, &dest).map_err(|e| {
                    JobError::validation(format!("cannot read {}: {e}", path.display()))
                })?;
            }
            ImageRef::Url { url } => {
                debug!(url, dest = %dest.display(), "fetching image");
                let data = fetcher.fetch(url)?;
                std::fs::write(&dest, data)?;
            }
        }
        written.push(dest);
    }
    info!(count = written.len(), dir = %input_dir.display(), "inputs acquired");
    Ok(written)
}
