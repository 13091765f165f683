//! Per-job directory trees under one process-wide base directory.
//!
//! Each job gets `<base>/<job_id>/{input,output,parts}`. Job ids are random
//! v4 UUIDs, so concurrent allocations never need coordination.

use crate::util::ensure_dir;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Random, collision-resistant job token.
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    /// Ensures the base directory exists. Call once at startup.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        ensure_dir(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn allocate(&self) -> std::io::Result<Workspace> {
        self.allocate_for(&new_job_id())
    }

    /// Allocates the tree for an id minted earlier with [`new_job_id`].
    pub fn allocate_for(&self, job_id: &str) -> std::io::Result<Workspace> {
        let job_id = job_id.to_string();
        let root = self.base_dir.join(&job_id);
        // create_dir (not _all) so an id clash surfaces instead of sharing a tree
        std::fs::create_dir(&root)?;
        let ws = Workspace { job_id, root };
        std::fs::create_dir(ws.input_dir())?;
        std::fs::create_dir(ws.output_dir())?;
        std::fs::create_dir(ws.parts_dir())?;
        debug!(job_id = %ws.job_id, root = %ws.root.display(), "workspace allocated");
        Ok(ws)
    }

    /// Best-effort recursive removal; safe to call repeatedly.
    pub fn release(&self, job_id: &str) {
        if job_id.is_empty() || job_id.contains(['/', '\\']) || job_id.starts_with('.') {
            warn!(job_id, "refusing to release suspicious job id");
            return;
        }
        let root = self.base_dir.join(job_id);
        match std::fs::remove_dir_all(&root) {
            Ok(()) => debug!(job_id, "workspace released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id, error = %e, "failed to remove workspace"),
        }
    }

    /// Allocates a workspace that is released when the guard drops, unless
    /// `keep` is set.
    pub fn allocate_guarded(
        &self,
        job_id: &str,
        keep: bool,
    ) -> std::io::Result<WorkspaceGuard<'_>> {
        let ws = self.allocate_for(job_id)?;
        Ok(WorkspaceGuard {
            manager: self,
            workspace: ws,
            keep,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub job_id: String,
    pub root: PathBuf,
}

impl Workspace {
    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    /// The only directory the reconstruction tool writes to.
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn parts_dir(&self) -> PathBuf {
        self.root.join("parts")
    }
}

pub struct WorkspaceGuard<'a> {
    manager: &'a WorkspaceManager,
    workspace: Workspace,
    keep: bool,
}

impl WorkspaceGuard<'_> {
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }
}

impl Drop for WorkspaceGuard<'_> {
    fn drop(&mut self) {
        if self.keep {
            debug!(job_id = %self.workspace.job_id, "retaining workspace");
            return;
        }
        self.manager.release(&self.workspace.job_id);
    }
}
