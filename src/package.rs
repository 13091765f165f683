use crate::{
    error::{JobError, JobResult},
    util::hash_file,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

/// A single deliverable file with its size known up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

impl Artifact {
    /// Describes an existing file (used when re-delivering a retained archive).
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let size = std::fs::metadata(path)?.len();
        Ok(Self {
            path: path.to_path_buf(),
            size,
            sha256: hash_file(path)?,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string())
    }
}

/// Zips every regular file under `output_dir` into `dest`, with paths
/// relative to `output_dir` and entries in sorted order.
pub fn package(output_dir: &Path, dest: &Path) -> JobResult<Artifact> {
    let unreadable = |e: std::io::Error| {
        JobError::packaging(format!("cannot read {}: {e}", output_dir.display()))
    };

    let mut files = Vec::new();
    collect_files(output_dir, output_dir, &mut files).map_err(unreadable)?;
    if files.is_empty() {
        return Err(JobError::packaging(format!(
            "output directory is empty: {}",
            output_dir.display()
        )));
    }
    files.sort();

    let zip_err = |e: zip::result::ZipError| JobError::packaging(e.to_string());
    let out = File::create(dest)
        .map_err(|e| JobError::packaging(format!("create {}: {e}", dest.display())))?;
    let mut zw = ZipWriter::new(out);
    for rel in &files {
        let abs = output_dir.join(rel);
        let len = std::fs::metadata(&abs).map_err(unreadable)?.len();
        let opts = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(len >= u32::MAX as u64);
        zw.start_file(archive_name(rel), opts).map_err(zip_err)?;
        let mut src = File::open(&abs).map_err(unreadable)?;
        std::io::copy(&mut src, &mut zw).map_err(unreadable)?;
    }
    zw.finish().map_err(zip_err)?;

    let artifact = Artifact::from_path(dest)
        .map_err(|e| JobError::packaging(format!("stat {}: {e}", dest.display())))?;
    info!(
        files = files.len(),
        bytes = artifact.size,
        path = %artifact.path.display(),
        "artifact packaged"
    );
    Ok(artifact)
}

/// Symlinked directories are never descended into; a symlink to a regular
/// file is archived with the target's contents. Dangling links are skipped.
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;
        let is_file = if meta.file_type().is_symlink() {
            match std::fs::metadata(&path) {
                Ok(target) if target.is_file() => true,
                _ => {
                    warn!(path = %path.display(), "skipping symlink that is not a regular file");
                    false
                }
            }
        } else if meta.is_dir() {
            collect_files(root, &path, out)?;
            false
        } else {
            meta.is_file()
        };
        if is_file {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

/// Zip entry names always use `/`.
fn archive_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
