//! On-disk layout per job: part files plus a crash-safe manifest.
//!
//! ```text
//! <temp_dir>/
//!   manifest.json        // serialized job + segments
//!   part-000000          // segment 0 bytes
//!   part-000001
//!   ...
//! ```
//!
//! Parts are strictly appended by their owning worker; the manifest trails the
//! parts, and `load` clamps progress to what is actually on disk.

mod index;
mod manifest;

pub use index::JobIndex;
pub use manifest::{load_manifest, persist_manifest, Manifest, ManifestError, ManifestSegment, MANIFEST_VERSION};

use crate::job::SegmentSlot;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MANIFEST_NAME: &str = "manifest.json";

/// Part file name for a segment index (`part-000000`, `part-000001`, ...).
pub fn part_path(temp_dir: &Path, index: usize) -> PathBuf {
    temp_dir.join(format!("part-{:06}", index))
}

/// Create the job's temp dir if missing.
pub fn ensure_temp_dir(temp_dir: &Path) -> Result<()> {
    fs::create_dir_all(temp_dir)
        .with_context(|| format!("create temp dir {}", temp_dir.display()))
}

/// Delete the job's temp dir and everything in it.
pub fn remove_temp_dir(temp_dir: &Path) -> Result<()> {
    if temp_dir.exists() {
        fs::remove_dir_all(temp_dir)
            .with_context(|| format!("remove temp dir {}", temp_dir.display()))?;
    }
    Ok(())
}

/// Appending sink for one part file. Opened at the segment's recorded
/// progress; anything on disk past that point is cut off first, so the part
/// never contains bytes the manifest doesn't know the origin of.
pub struct PartSink {
    file: File,
    written: u64,
}

impl PartSink {
    /// Open `slot`'s part file for appending from `slot.bytes_written()`.
    pub fn open(slot: &SegmentSlot) -> std::io::Result<Self> {
        let resume_at = slot.bytes_written();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&slot.path)?;
        file.set_len(resume_at)?;
        let mut sink = Self {
            file,
            written: resume_at,
        };
        sink.file.seek(SeekFrom::Start(resume_at))?;
        Ok(sink)
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and fsync, consuming the sink.
    pub fn flush_and_close(mut self) -> std::io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

/// Preallocate a file to `size` bytes. Tries `posix_fallocate` for real block
/// allocation, falling back to `set_len`.
pub fn preallocate(file: &File, size: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let r = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
        if r == 0 {
            return Ok(());
        }
        tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
    }
    file.set_len(size).context("preallocate file")?;
    Ok(())
}
