//! Hands the archive back to the caller on the local filesystem.

use super::{Delivery, Receipt, Transport, TransportError};
use crate::config::Config;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Destination {
    /// Exact path chosen by the caller.
    File(PathBuf),
    /// Directory shared by many jobs; files are named `<sha12>-<archive>`.
    Dir(PathBuf),
}

/// Copies the whole artifact to a caller-visible path and reports that path
/// as the locator. No size budget, so nothing is ever chunked.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    dest: Destination,
}

impl LocalTransport {
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            dest: Destination::File(path.into()),
        }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dest: Destination::Dir(dir.into()),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::in_dir(&cfg.local.out_dir)
    }

    fn target(&self, d: &Delivery<'_>) -> PathBuf {
        match &self.dest {
            Destination::File(path) => path.clone(),
            Destination::Dir(dir) => {
                let prefix: String = d.artifact_sha256.chars().take(12).collect();
                dir.join(format!("{prefix}-{}", d.artifact_name))
            }
        }
    }
}

/// Copies to a sibling temp file first so readers never see a partial archive.
fn copy_into_place(src: &Path, target: &Path) -> std::io::Result<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".into());
    let tmp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));
    if let Err(e) = std::fs::copy(src, &tmp).and_then(|_| std::fs::rename(&tmp, target)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    fn budget(&self) -> Option<u64> {
        None
    }

    fn send(&self, d: &Delivery<'_>) -> Result<Receipt, TransportError> {
        let target = self.target(d);
        copy_into_place(&d.part.path, &target)?;
        let target = std::fs::canonicalize(&target).unwrap_or(target);
        info!(path = %target.display(), bytes = d.part.bytes, "artifact written");
        Ok(Receipt {
            locator: Some(target.display().to_string()),
        })
    }
}
