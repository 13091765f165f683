use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructionParams {
    /// Longest image side the tool should work at, in pixels.
    pub max_image_size: u32,
    pub dense: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExitState {
    Success,
    Failed { code: Option<i32> },
    SpawnFailed,
    TimedOut { seconds: u64 },
    Cancelled,
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed { code: Some(c) } => write!(f, "exit code {c}"),
            Self::Failed { code: None } => write!(f, "terminated by signal"),
            Self::SpawnFailed => write!(f, "could not start"),
            Self::TimedOut { seconds } => write!(f, "timed out after {seconds}s"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionResult {
    pub state: ExitState,
    /// Combined stdout and stderr, verbatim.
    pub logs: String,
    /// Set only when `state` is `Success`.
    pub output_dir: Option<PathBuf>,
}

impl ReconstructionResult {
    pub fn is_success(&self) -> bool {
        self.state == ExitState::Success
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDiag {
    pub program: String,
    pub resolved: Option<String>,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}
