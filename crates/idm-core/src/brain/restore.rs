//! Startup restore: enumerate persisted manifests and rebuild jobs.

use crate::config::EngineConfig;
use crate::error::{ErrorKind, JobError};
use crate::job::{Job, JobStatus};
use crate::store::{self, JobIndex, ManifestError};
use std::path::Path;
use std::sync::Arc;

/// One restored entry: a runnable job, or a stub recording why its manifest
/// could not be used.
pub(crate) enum Restored {
    Runnable(Arc<Job>),
    Broken { job: Arc<Job>, error: JobError },
}

/// Load every temp dir listed in `jobs.json`. Completed jobs were removed
/// from the index at finalize; anything else comes back either `Queued`
/// (resumable) or as a broken stub the scheduler marks `Error`.
pub(crate) fn load_all(cfg: &EngineConfig) -> Vec<Restored> {
    let index = JobIndex::load(&cfg.temp_root);
    let mut out = Vec::with_capacity(index.temp_dirs.len());
    for temp_dir in &index.temp_dirs {
        if !temp_dir.exists() {
            tracing::info!("dropping vanished temp dir {}", temp_dir.display());
            let _ = JobIndex::remove(&cfg.temp_root, temp_dir);
            continue;
        }
        match store::load_manifest(temp_dir) {
            Ok(manifest) => {
                if manifest.status == JobStatus::Completed {
                    let _ = JobIndex::remove(&cfg.temp_root, temp_dir);
                    continue;
                }
                let job = Arc::new(manifest.into_job(temp_dir));
                let restorable =
                    job.discovered().resumable || job.media_plan().is_some();
                if restorable {
                    out.push(Restored::Runnable(job));
                } else {
                    out.push(Restored::Broken {
                        job,
                        error: JobError::new(
                            ErrorKind::NotResumable,
                            "job is not resumable across restarts",
                        ),
                    });
                }
            }
            Err(e) => {
                let kind = match &e {
                    ManifestError::SchemaFuture(_) => ErrorKind::SchemaFuture,
                    _ => ErrorKind::ManifestCorrupt,
                };
                out.push(Restored::Broken {
                    job: Arc::new(stub_job(temp_dir)),
                    error: JobError::new(kind, e.to_string()),
                });
            }
        }
    }
    out
}

/// Placeholder record for a temp dir whose manifest is unusable; keeps the
/// failure visible in `list()` instead of silently dropping user data.
fn stub_job(temp_dir: &Path) -> Job {
    let id = temp_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown-job".to_string());
    Job::restore(
        id,
        String::new(),
        crate::job::ConnectionSettings {
            effective_url: String::new(),
            headers: Vec::new(),
            proxy: None,
            auth: None,
            cookie_header: None,
        },
        temp_dir.join("unknown"),
        Default::default(),
        1,
        1,
        None,
        temp_dir.to_path_buf(),
        None,
    )
}
