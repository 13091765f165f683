use thiserror::Error;

/// Terminal failure of a job. Every stage maps its failures onto one of
/// these; the variant decides what diagnostics travel with the outcome.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("reconstruction failed ({status})")]
    Reconstruction { status: String, logs: String },

    #[error("packaging failed: {0}")]
    Packaging(String),

    #[error("delivery failed{}: {reason}", part_label(.part, .total))]
    Delivery {
        part: Option<usize>,
        total: Option<usize>,
        reason: String,
    },

    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("job cancelled")]
    Cancelled,
}

fn part_label(part: &Option<usize>, total: &Option<usize>) -> String {
    match (part, total) {
        (Some(p), Some(t)) => format!(" on part {p}/{t}"),
        _ => String::new(),
    }
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn packaging(msg: impl Into<String>) -> Self {
        Self::Packaging(msg.into())
    }

    /// Stable tag for the outcome payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Fetch { .. } => "fetch_error",
            Self::Reconstruction { .. } => "reconstruction_error",
            Self::Packaging(_) => "packaging_error",
            Self::Delivery { .. } => "delivery_error",
            Self::Workspace(_) => "workspace_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Captured tool output, when the failure has any.
    pub fn logs(&self) -> Option<&str> {
        match self {
            Self::Reconstruction { logs, .. } => Some(logs.as_str()),
            _ => None,
        }
    }
}

pub type JobResult<T> = std::result::Result<T, JobError>;
