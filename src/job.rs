use crate::{config::Config, engine::ReconstructionParams, error::JobError, util::now_rfc3339};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// One image of an inbound request. A reference carries exactly one source:
/// a URL, a local path, or bytes with their file name.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ImageRef {
    Url { url: String },
    Path { path: PathBuf },
    Bytes { filename: String, data: Vec<u8> },
}

/// Wire shape of an [`ImageRef`]; every key optional so ambiguous objects
/// can be rejected instead of silently matching the first variant.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawImageRef {
    url: Option<String>,
    path: Option<PathBuf>,
    filename: Option<String>,
    data: Option<Vec<u8>>,
}

impl TryFrom<RawImageRef> for ImageRef {
    type Error = String;

    fn try_from(raw: RawImageRef) -> Result<Self, Self::Error> {
        match (raw.url, raw.path, raw.data, raw.filename) {
            (Some(url), None, None, None) => Ok(Self::Url { url }),
            (None, Some(path), None, None) => Ok(Self::Path { path }),
            (None, None, Some(data), Some(filename)) => Ok(Self::Bytes { filename, data }),
            (None, None, Some(_), None) => Err("image bytes need a filename".into()),
            (None, None, None, _) => Err("image needs one of url, path or data".into()),
            _ => Err("image must carry exactly one of url, path or data".into()),
        }
    }
}

impl<'de> Deserialize<'de> for ImageRef {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = RawImageRef::deserialize(d)?;
        Self::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl ImageRef {
    pub fn bytes(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes {
            filename: filename.into(),
            data: data.into(),
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::Url { url: url.into() }
    }

    /// Human-facing label used in validation messages.
    pub fn label(&self) -> String {
        match self {
            Self::Url { url } => url.clone(),
            Self::Path { path } => path.display().to_string(),
            Self::Bytes { filename, .. } => filename.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub max_image_size: Option<u32>,
    #[serde(default)]
    pub dense: Option<bool>,
}

impl JobRequest {
    pub fn params(&self, cfg: &Config) -> ReconstructionParams {
        ReconstructionParams {
            max_image_size: self
                .max_image_size
                .unwrap_or(cfg.reconstruction.max_image_size),
            dense: self.dense.unwrap_or(cfg.reconstruction.dense),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Validating,
    Acquiring,
    Reconstructing,
    Packaging,
    Delivering,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Forward-only lifecycle tracker for a single job.
#[derive(Debug)]
pub struct Lifecycle {
    job_id: String,
    state: JobState,
}

impl Lifecycle {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: JobState::Created,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Moves to `next`. Returns false (and stays put) for backwards moves or
    /// moves out of a terminal state.
    pub fn advance(&mut self, next: JobState) -> bool {
        if self.state.is_terminal() || next <= self.state {
            return false;
        }
        debug!(job_id = %self.job_id, from = ?self.state, to = ?next, "job state");
        self.state = next;
        true
    }

    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            debug!(job_id = %self.job_id, from = ?self.state, "job failed");
            self.state = JobState::Failed;
        }
    }
}

/// Cooperative cancellation shared between a caller and the job worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveredPart {
    pub index: usize,
    pub total: usize,
    pub bytes: u64,
    pub sha256: String,
}

/// Terminal record of a job; produced once and mirrored to the webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub ok: bool,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<DeliveredPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    pub finished_at: String,
}

impl Outcome {
    pub fn success(
        job_id: &str,
        req: &JobRequest,
        download_url: Option<String>,
        parts: Vec<DeliveredPart>,
    ) -> Self {
        Self {
            ok: true,
            job_id: job_id.to_string(),
            order_id: req.order_id.clone(),
            email: req.email.clone(),
            download_url,
            parts,
            error: None,
            error_kind: None,
            logs: None,
            finished_at: now_rfc3339(),
        }
    }

    pub fn failure(job_id: &str, req: &JobRequest, err: &JobError) -> Self {
        Self {
            ok: false,
            job_id: job_id.to_string(),
            order_id: req.order_id.clone(),
            email: req.email.clone(),
            download_url: None,
            parts: Vec::new(),
            error: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
            logs: err.logs().map(str::to_string),
            finished_at: now_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_only_moves_forward() {
        let mut lc = Lifecycle::new("j");
        assert!(lc.advance(JobState::Validating));
        assert!(lc.advance(JobState::Acquiring));
        assert!(!lc.advance(JobState::Validating));
        assert_eq!(lc.state(), JobState::Acquiring);
        lc.fail();
        assert_eq!(lc.state(), JobState::Failed);
        assert!(!lc.advance(JobState::Delivering));
    }

    #[test]
    fn image_refs_parse_from_request_json() {
        let raw = r#"{
            "images": [{"url": "https://x/a.jpg"}, {"path": "photos/b.png"}],
            "email": "a@b.co",
            "order_id": "ABC123"
        }"#;
        let req: JobRequest = serde_json::from_str(raw).unwrap();
        assert!(matches!(req.images[0], ImageRef::Url { .. }));
        assert!(matches!(req.images[1], ImageRef::Path { .. }));
        assert_eq!(req.order_id.as_deref(), Some("ABC123"));
    }

    #[test]
    fn image_with_two_sources_is_rejected() {
        for raw in [
            r#"{"url": "https://cdn.example/a.jpg", "filename": "a.jpg", "data": [1, 2, 3]}"#,
            r#"{"url": "https://cdn.example/a.jpg", "path": "/etc/passwd"}"#,
            r#"{"path": "a.jpg", "data": [1]}"#,
            r#"{"url": "https://cdn.example/a.jpg", "filename": "a.jpg"}"#,
            r#"{"data": [1, 2]}"#,
            r#"{}"#,
            r#"{"uri": "https://cdn.example/a.jpg"}"#,
        ] {
            assert!(serde_json::from_str::<ImageRef>(raw).is_err(), "accepted {raw}");
        }
    }

    #[test]
    fn bytes_image_parses_and_round_trips() {
        let img: ImageRef = serde_json::from_str(r#"{"filename": "a.jpg", "data": [1, 2]}"#).unwrap();
        assert!(matches!(&img, ImageRef::Bytes { filename, data } if filename == "a.jpg" && data == &vec![1, 2]));
        let back: ImageRef = serde_json::from_value(serde_json::to_value(&img).unwrap()).unwrap();
        assert_eq!(back.label(), "a.jpg");
    }

    #[test]
    fn request_with_ambiguous_image_fails_to_parse() {
        let raw = r#"{"images": [{"url": "https://x/a.jpg", "data": [1]}]}"#;
        assert!(serde_json::from_str::<JobRequest>(raw).is_err());
    }

    #[test]
    fn failure_outcome_carries_logs_and_correlation() {
        let req = JobRequest {
            order_id: Some("ord-9".into()),
            ..Default::default()
        };
        let err = JobError::Reconstruction {
            status: "exit status: 1".into(),
            logs: "boom".into(),
        };
        let out = Outcome::failure("j1", &req, &err);
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["order_id"], "ord-9");
        assert_eq!(v["logs"], "boom");
        assert_eq!(v["error_kind"], "reconstruction_error");
        assert!(v.get("download_url").is_none());
    }
}
