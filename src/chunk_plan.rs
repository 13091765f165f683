//! Whole-or-chunked delivery planning over an artifact's bytes.
//!
//! Reassembly: concatenate the part files in ascending index order
//! (`cat model.zip.part* > model.zip`; part names are zero-padded so shell
//! globs sort correctly), then unzip. The result is byte-identical to the
//! packaged artifact.

use crate::{package::Artifact, util::sha256_hex};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub index: usize, // 1-based
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryPlan {
    Whole {
        size: u64,
    },
    Chunked {
        size: u64,
        chunk_size: u64,
        total: usize,
        parts: Vec<ByteRange>,
    },
}

impl DeliveryPlan {
    /// `budget` of `None` means the transport has no size limit.
    pub fn for_size(size: u64, budget: Option<u64>) -> Self {
        let chunk_size = match budget {
            Some(b) if b > 0 && size > b => b,
            _ => return DeliveryPlan::Whole { size },
        };

        let mut parts = Vec::new();
        let mut offset = 0u64;
        while offset < size {
            let len = chunk_size.min(size - offset);
            parts.push(ByteRange {
                index: parts.len() + 1,
                offset,
                len,
            });
            offset += len;
        }

        DeliveryPlan::Chunked {
            size,
            chunk_size,
            total: parts.len(),
            parts,
        }
    }

    pub fn total(&self) -> usize {
        match self {
            DeliveryPlan::Whole { .. } => 1,
            DeliveryPlan::Chunked { total, .. } => *total,
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, DeliveryPlan::Chunked { .. })
    }
}

/// A materialized piece of the artifact, ready for one delivery call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub index: usize,
    pub total: usize,
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

pub fn part_file_name(artifact_name: &str, index: usize, total: usize) -> String {
    let width = total.to_string().len().max(2);
    format!("{artifact_name}.part{index:0width$}")
}

/// Writes each planned range of `artifact` into its own file under
/// `parts_dir`. A `Whole` plan yields the artifact itself as part 1/1.
pub fn split(artifact: &Artifact, plan: &DeliveryPlan, parts_dir: &Path) -> std::io::Result<Vec<Part>> {
    let ranges = match plan {
        DeliveryPlan::Whole { .. } => {
            return Ok(vec![Part {
                index: 1,
                total: 1,
                path: artifact.path.clone(),
                bytes: artifact.size,
                sha256: artifact.sha256.clone(),
            }]);
        }
        DeliveryPlan::Chunked { parts, .. } => parts,
    };

    let total = ranges.len();
    let name = artifact.file_name();
    let mut src = BufReader::new(File::open(&artifact.path)?);
    let mut out = Vec::with_capacity(total);
    for r in ranges {
        src.seek(SeekFrom::Start(r.offset))?;
        let mut buf = Vec::with_capacity(r.len as usize);
        (&mut src).take(r.len).read_to_end(&mut buf)?;
        if buf.len() as u64 != r.len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("artifact shorter than planned at part {}", r.index),
            ));
        }
        let path = parts_dir.join(part_file_name(&name, r.index, total));
        std::fs::write(&path, &buf)?;
        out.push(Part {
            index: r.index,
            total,
            path,
            bytes: r.len,
            sha256: sha256_hex(&buf),
        });
    }
    Ok(out)
}

/// Concatenates part files in the order given into `dest`; returns the
/// number of bytes written.
pub fn join(parts: &[PathBuf], dest: &Path) -> std::io::Result<u64> {
    let mut w = BufWriter::new(File::create(dest)?);
    let mut written = 0u64;
    for p in parts {
        let mut r = File::open(p)?;
        written += std::io::copy(&mut r, &mut w)?;
    }
    w.flush()?;
    Ok(written)
}
