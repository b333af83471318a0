//! Final assembly: ordered concat of part files, verification, checksums,
//! and the atomic rename into place.

use crate::config::CollisionPolicy;
use crate::error::{classify_io, ErrorKind, JobError};
use crate::job::{Job, RunState, SegmentState};
use crate::store;
use crate::url_model::next_free_path;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const COPY_BUF: usize = 1024 * 1024;

/// What a successful assembly produced.
#[derive(Debug, Clone)]
pub struct AssemblyOutput {
    pub final_path: PathBuf,
    pub bytes: u64,
    pub md5: Option<String>,
    pub sha256: Option<String>,
}

/// Concatenate the job's parts into the final file.
///
/// Pre-conditions are checked first: every segment `Done`, and for a known
/// total size the part sizes must add up exactly. On any failure the temp dir
/// is left intact for a later retry; only the `.partial` scratch file is
/// cleaned up. Cancellation mid-copy removes the scratch and reports
/// `Cancelled`.
pub fn assemble(
    job: &Job,
    collision: CollisionPolicy,
    checksums: bool,
) -> Result<AssemblyOutput, JobError> {
    let segments = job.segments();
    for slot in segments.iter() {
        if slot.state() != SegmentState::Done {
            return Err(JobError::new(
                ErrorKind::Internal,
                format!("segment {} not done at assembly", slot.index),
            ));
        }
    }

    let total_size = job.discovered().total_size;
    if let Some(total) = total_size {
        let sum: u64 = segments
            .iter()
            .map(|s| fs::metadata(&s.path).map(|m| m.len()).unwrap_or(0))
            .sum();
        if sum != total {
            return Err(JobError::new(
                ErrorKind::Internal,
                format!("part sizes sum to {} but total is {}", sum, total),
            ));
        }
    }

    let target = resolve_target(&job.final_path(), collision);
    let partial = scratch_path(&target);
    let sources: Vec<PathBuf> = segments.iter().map(|s| s.path.clone()).collect();

    let result = stream_concat(&sources, &partial, checksums, || {
        job.control.get() == RunState::Cancelled
    });

    let (bytes, md5, sha256) = match result {
        Ok(v) => v,
        Err(e) => {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
    };

    if let Some(total) = total_size {
        if bytes != total {
            let _ = fs::remove_file(&partial);
            return Err(JobError::new(
                ErrorKind::Internal,
                format!("assembled {} bytes, expected {}", bytes, total),
            ));
        }
    }

    if let Err(e) = fs::rename(&partial, &target) {
        let _ = fs::remove_file(&partial);
        return Err(JobError::new(classify_io(&e), e.to_string()));
    }

    // Parts are gone with the temp dir; the manifest goes with them.
    if let Err(e) = store::remove_temp_dir(&job.temp_dir) {
        tracing::warn!(job = %job.id, "leaving temp dir behind: {}", e);
    }

    Ok(AssemblyOutput {
        final_path: target,
        bytes,
        md5,
        sha256,
    })
}

/// Apply the collision policy to the configured final path.
pub(crate) fn resolve_target(wanted: &Path, collision: CollisionPolicy) -> PathBuf {
    match collision {
        CollisionPolicy::Overwrite => wanted.to_path_buf(),
        CollisionPolicy::Rename => next_free_path(wanted),
    }
}

fn scratch_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download.bin".to_string());
    name.push_str(".partial");
    target.with_file_name(name)
}

/// Streaming copy of `sources` in order into `dest`, with optional digests.
/// `cancelled` is polled between buffers.
pub fn stream_concat(
    sources: &[PathBuf],
    dest: &Path,
    checksums: bool,
    mut cancelled: impl FnMut() -> bool,
) -> Result<(u64, Option<String>, Option<String>), JobError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| JobError::new(classify_io(&e), e.to_string()))?;
    }
    let mut out =
        File::create(dest).map_err(|e| JobError::new(classify_io(&e), e.to_string()))?;
    let mut md5 = checksums.then(Md5::new);
    let mut sha256 = checksums.then(Sha256::new);
    let mut buf = vec![0u8; COPY_BUF];
    let mut written = 0u64;

    for src in sources {
        let mut f =
            File::open(src).map_err(|e| JobError::new(classify_io(&e), e.to_string()))?;
        loop {
            if cancelled() {
                return Err(JobError::new(ErrorKind::Cancelled, "cancelled during assembly"));
            }
            let n = f
                .read(&mut buf)
                .map_err(|e| JobError::new(classify_io(&e), e.to_string()))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])
                .map_err(|e| JobError::new(classify_io(&e), e.to_string()))?;
            if let Some(h) = md5.as_mut() {
                h.update(&buf[..n]);
            }
            if let Some(h) = sha256.as_mut() {
                h.update(&buf[..n]);
            }
            written += n as u64;
        }
    }

    out.sync_all()
        .map_err(|e| JobError::new(classify_io(&e), e.to_string()))?;

    Ok((
        written,
        md5.map(|h| hex::encode(h.finalize())),
        sha256.map(|h| hex::encode(h.finalize())),
    ))
}
