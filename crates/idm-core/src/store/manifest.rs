//! Per-job manifest: schema, atomic persist, load with clamping.

use super::{part_path, MANIFEST_NAME};
use crate::job::{
    ConnectionSettings, Discovered, Job, JobStatus, SegmentSlot, SegmentSource, SegmentState,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bump when the manifest layout changes incompatibly. Loaders refuse
/// anything newer than what they were built against.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSegment {
    pub index: usize,
    #[serde(flatten)]
    pub source: SegmentSource,
    pub bytes_written: u64,
    pub state: SegmentState,
}

/// Serialized job + segments, written to `<temp_dir>/manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub job_id: String,
    pub source_url: String,
    pub conn: ConnectionSettings,
    pub final_path: PathBuf,
    pub discovered: Discovered,
    pub max_connections: usize,
    pub segment_size_hint: u64,
    pub speed_ceiling: Option<u64>,
    pub status: JobStatus,
    pub segments: Vec<ManifestSegment>,
    pub media: Option<crate::video::MediaPlan>,
}

#[derive(Debug)]
pub enum ManifestError {
    /// Written by a newer build; refuse rather than misread.
    SchemaFuture(u32),
    Corrupt(String),
    Io(std::io::Error),
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::SchemaFuture(v) => {
                write!(f, "manifest schema {} is newer than supported {}", v, MANIFEST_VERSION)
            }
            ManifestError::Corrupt(msg) => write!(f, "manifest corrupt: {}", msg),
            ManifestError::Io(e) => write!(f, "manifest io: {}", e),
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManifestError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ManifestError {
    fn from(e: std::io::Error) -> Self {
        ManifestError::Io(e)
    }
}

impl Manifest {
    /// Capture the job's persistent state. In-flight segments are recorded as
    /// `Idle` so a future load resumes them from their clamped progress.
    pub fn from_job(job: &Job) -> Self {
        let segments = job
            .segments()
            .iter()
            .map(|slot| ManifestSegment {
                index: slot.index,
                source: slot.source.clone(),
                bytes_written: slot.bytes_written(),
                state: match slot.state() {
                    SegmentState::Done => SegmentState::Done,
                    _ => SegmentState::Idle,
                },
            })
            .collect();
        let d = job.discovered();
        Self {
            version: MANIFEST_VERSION,
            job_id: job.id.clone(),
            source_url: job.source_url.clone(),
            conn: job.conn(),
            final_path: job.final_path(),
            discovered: d,
            max_connections: job.policy.max_connections,
            segment_size_hint: job.policy.segment_size_hint,
            speed_ceiling: job.policy.speed_ceiling,
            status: job.status(),
            segments,
            media: job.media_plan(),
        }
    }

    /// Rebuild the runtime job this manifest describes. Segment progress is
    /// clamped against the part files actually on disk:
    /// - range parts longer than their range are corrupt → reset to 0;
    /// - media parts are only trusted when complete → partial ones reset;
    /// - everything else resumes from `min(disk_len, recorded)`.
    pub fn into_job(self, temp_dir: &Path) -> Job {
        let job = Job::restore(
            self.job_id,
            self.source_url,
            self.conn,
            self.final_path,
            self.discovered,
            self.max_connections,
            self.segment_size_hint,
            self.speed_ceiling,
            temp_dir.to_path_buf(),
            self.media,
        );
        let mut slots = Vec::with_capacity(self.segments.len());
        for seg in self.segments {
            let path = part_path(temp_dir, seg.index);
            let disk_len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let slot = SegmentSlot::new(seg.index, seg.source, path);
            match slot.source.declared_len() {
                Some(declared) if disk_len > declared => {
                    // Part outgrew its range: origin unknown, start over.
                    let _ = fs::remove_file(&slot.path);
                    slot.set_bytes_written(0);
                    slot.set_state(SegmentState::Idle);
                }
                Some(declared) => {
                    let bytes = disk_len.min(declared);
                    slot.set_bytes_written(bytes);
                    slot.set_state(if bytes == declared && declared > 0 {
                        SegmentState::Done
                    } else {
                        SegmentState::Idle
                    });
                }
                None => {
                    // Media fragment without a declared length: an append
                    // can't be validated, so only a finished part survives.
                    if seg.state == SegmentState::Done && disk_len == seg.bytes_written {
                        slot.set_bytes_written(disk_len);
                        slot.set_state(SegmentState::Done);
                    } else {
                        let _ = fs::remove_file(&slot.path);
                        slot.set_bytes_written(0);
                        slot.set_state(SegmentState::Idle);
                    }
                }
            }
            slots.push(Arc::new(slot));
        }
        job.set_segments(slots);
        job.sync_downloaded_from_segments();
        job
    }
}

/// Atomic write-via-temp-rename; a crash never leaves a partial manifest.
pub fn persist_manifest(manifest: &Manifest, temp_dir: &Path) -> Result<(), ManifestError> {
    let data = serde_json::to_vec_pretty(manifest)
        .map_err(|e| ManifestError::Corrupt(e.to_string()))?;
    let tmp = temp_dir.join(format!("{}.tmp", MANIFEST_NAME));
    fs::write(&tmp, data)?;
    fs::rename(&tmp, temp_dir.join(MANIFEST_NAME))?;
    Ok(())
}

/// Read and validate the manifest in `temp_dir`.
pub fn load_manifest(temp_dir: &Path) -> Result<Manifest, ManifestError> {
    let data = fs::read(temp_dir.join(MANIFEST_NAME))?;
    // Peek at the version before trusting the full schema.
    let probe: serde_json::Value =
        serde_json::from_slice(&data).map_err(|e| ManifestError::Corrupt(e.to_string()))?;
    let version = probe
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ManifestError::Corrupt("missing version field".into()))? as u32;
    if version > MANIFEST_VERSION {
        return Err(ManifestError::SchemaFuture(version));
    }
    serde_json::from_slice(&data).map_err(|e| ManifestError::Corrupt(e.to_string()))
}
