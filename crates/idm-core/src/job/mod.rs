//! The job record: one download request and everything known about it.
//!
//! A job is owned by the registry; workers get an `Arc` plus a segment index
//! and may only touch their own segment slot and the shared byte counter.
//! `status` is written by the scheduler alone.

pub mod segment;
pub mod stats;
mod status;

pub use segment::{plan_ranges, plan_segment_count, SegmentSlot, SegmentSource, SegmentState};
pub use stats::{eta_seconds, RateEstimator};
pub use status::JobStatus;

use crate::config::EngineConfig;
use crate::error::JobError;
use crate::transport::{BasicAuth, CancelToken, ProxyDescriptor};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub type JobId = String;

/// What a caller submits. Everything optional falls back to engine config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSpec {
    pub url: String,
    pub folder: Option<PathBuf>,
    pub filename: Option<String>,
    pub connections: Option<usize>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub referer: Option<String>,
    pub proxy: Option<ProxyDescriptor>,
    pub auth: Option<BasicAuth>,
    /// Value for the `Cookie:` request header.
    pub cookies: Option<String>,
    /// Per-job speed ceiling, bytes/s.
    pub speed_ceiling: Option<u64>,
}

impl DownloadSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            folder: None,
            filename: None,
            connections: None,
            headers: Vec::new(),
            referer: None,
            proxy: None,
            auth: None,
            cookies: None,
            speed_ceiling: None,
        }
    }
}

/// Per-job connection settings used to build every transport request.
/// Replaced wholesale when a refresh hands out a new direct URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub effective_url: String,
    pub headers: Vec<(String, String)>,
    pub proxy: Option<ProxyDescriptor>,
    pub auth: Option<BasicAuth>,
    pub cookie_header: Option<String>,
}

/// What the pre-flight probe learned about the resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Discovered {
    pub total_size: Option<u64>,
    pub resumable: bool,
    pub server_filename: Option<String>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Worker-visible run control for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Cancelled,
}

#[derive(Debug)]
pub struct ControlCell {
    state: AtomicU8,
    token: CancelToken,
}

impl ControlCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            token: CancelToken::new(),
        }
    }

    pub fn get(&self) -> RunState {
        match self.state.load(Ordering::Relaxed) {
            0 => RunState::Running,
            1 => RunState::Paused,
            _ => RunState::Cancelled,
        }
    }

    pub fn set(&self, s: RunState) {
        let v = match s {
            RunState::Running => 0,
            RunState::Paused => 1,
            RunState::Cancelled => 2,
        };
        self.state.store(v, Ordering::Relaxed);
        if s == RunState::Cancelled {
            self.token.cancel();
        }
    }

    /// Token for transport-level hard abort. Cancelled only on `Cancelled`,
    /// never on pause (pause drains at the next chunk boundary).
    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }
}

impl Default for ControlCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed per-job policy, resolved from the spec + engine config at submit.
#[derive(Debug, Clone, Copy)]
pub struct JobPolicy {
    pub max_connections: usize,
    pub segment_size_hint: u64,
    pub speed_ceiling: Option<u64>,
}

/// The registry-owned job record.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    /// Original URL as submitted (refresh re-derives from this).
    pub source_url: String,
    pub policy: JobPolicy,
    pub temp_dir: PathBuf,
    pub control: ControlCell,
    pub downloaded: AtomicU64,
    pub rate: RateEstimator,
    /// True when the submitter named the file; the probe's server filename
    /// then never overrides it.
    pub explicit_filename: bool,

    final_path: Mutex<PathBuf>,
    conn: Mutex<ConnectionSettings>,
    discovered: Mutex<Discovered>,
    status: Mutex<JobStatus>,
    segments: Mutex<Arc<Vec<Arc<SegmentSlot>>>>,
    last_error: Mutex<Option<JobError>>,
    media: Mutex<Option<crate::video::MediaPlan>>,
    /// Response cookies collected during the run; applied at job boundaries.
    cookie_log: Mutex<Vec<String>>,
    /// Timestamps of transient-failure re-admissions (cool-down cap).
    readmissions: Mutex<Vec<Instant>>,
}

impl Job {
    pub fn from_spec(id: JobId, spec: &DownloadSpec, cfg: &EngineConfig) -> Self {
        let mut headers = spec.headers.clone();
        if let Some(referer) = &spec.referer {
            headers.push(("Referer".to_string(), referer.clone()));
        }
        let folder = spec.folder.clone().unwrap_or_else(|| cfg.download_dir.clone());
        let explicit_filename = spec.filename.is_some();
        let initial_path = match &spec.filename {
            Some(name) => folder.join(name),
            None => folder,
        };
        Self {
            temp_dir: cfg.temp_root.join(&id),
            id,
            source_url: spec.url.clone(),
            explicit_filename,
            policy: JobPolicy {
                max_connections: spec.connections.unwrap_or(cfg.max_connections).max(1),
                segment_size_hint: cfg.segment_size_hint,
                speed_ceiling: spec.speed_ceiling,
            },
            control: ControlCell::new(),
            downloaded: AtomicU64::new(0),
            rate: RateEstimator::new(),
            final_path: Mutex::new(initial_path),
            conn: Mutex::new(ConnectionSettings {
                effective_url: spec.url.clone(),
                headers,
                proxy: spec.proxy.clone(),
                auth: spec.auth.clone(),
                cookie_header: spec.cookies.clone(),
            }),
            discovered: Mutex::new(Discovered::default()),
            status: Mutex::new(JobStatus::Pending),
            segments: Mutex::new(Arc::new(Vec::new())),
            last_error: Mutex::new(None),
            media: Mutex::new(None),
            cookie_log: Mutex::new(Vec::new()),
            readmissions: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild a job from persisted state (manifest restore). The job comes
    /// back `Queued`; the scheduler downgrades it to `Error` when it turns
    /// out not to be resumable.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: JobId,
        source_url: String,
        conn: ConnectionSettings,
        final_path: PathBuf,
        discovered: Discovered,
        max_connections: usize,
        segment_size_hint: u64,
        speed_ceiling: Option<u64>,
        temp_dir: PathBuf,
        media: Option<crate::video::MediaPlan>,
    ) -> Self {
        Self {
            id,
            source_url,
            policy: JobPolicy {
                max_connections: max_connections.max(1),
                segment_size_hint,
                speed_ceiling,
            },
            temp_dir,
            control: ControlCell::new(),
            downloaded: AtomicU64::new(0),
            rate: RateEstimator::new(),
            explicit_filename: true,
            final_path: Mutex::new(final_path),
            conn: Mutex::new(conn),
            discovered: Mutex::new(discovered),
            status: Mutex::new(JobStatus::Queued),
            segments: Mutex::new(Arc::new(Vec::new())),
            last_error: Mutex::new(None),
            media: Mutex::new(media),
            cookie_log: Mutex::new(Vec::new()),
            readmissions: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap()
    }

    /// Scheduler-only. Returns the old status when the transition is legal.
    pub fn set_status(&self, new: JobStatus) -> Option<JobStatus> {
        let mut s = self.status.lock().unwrap();
        let old = *s;
        if old == new || !old.can_transition(new) {
            return None;
        }
        *s = new;
        Some(old)
    }

    pub fn final_path(&self) -> PathBuf {
        self.final_path.lock().unwrap().clone()
    }

    pub fn set_final_path(&self, p: PathBuf) {
        *self.final_path.lock().unwrap() = p;
    }

    pub fn conn(&self) -> ConnectionSettings {
        self.conn.lock().unwrap().clone()
    }

    pub fn set_conn(&self, c: ConnectionSettings) {
        *self.conn.lock().unwrap() = c;
    }

    pub fn discovered(&self) -> Discovered {
        self.discovered.lock().unwrap().clone()
    }

    pub fn set_discovered(&self, d: Discovered) {
        *self.discovered.lock().unwrap() = d;
    }

    pub fn segments(&self) -> Arc<Vec<Arc<SegmentSlot>>> {
        Arc::clone(&self.segments.lock().unwrap())
    }

    /// Install the frozen segment set (admission or manifest restore).
    pub fn set_segments(&self, slots: Vec<Arc<SegmentSlot>>) {
        *self.segments.lock().unwrap() = Arc::new(slots);
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn add_downloaded(&self, n: u64) -> u64 {
        self.downloaded.fetch_add(n, Ordering::Relaxed) + n
    }

    /// Back out bytes when a media fragment restarts from scratch.
    pub fn sub_downloaded(&self, n: u64) {
        self.downloaded.fetch_sub(n, Ordering::Relaxed);
    }

    /// Recompute the byte counter from segment slots (resume/admission).
    pub fn sync_downloaded_from_segments(&self) {
        let sum: u64 = self.segments().iter().map(|s| s.bytes_written()).sum();
        self.downloaded.store(sum, Ordering::Relaxed);
    }

    pub fn last_error(&self) -> Option<JobError> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn set_last_error(&self, e: JobError) {
        *self.last_error.lock().unwrap() = Some(e);
    }

    pub fn media_plan(&self) -> Option<crate::video::MediaPlan> {
        self.media.lock().unwrap().clone()
    }

    pub fn set_media_plan(&self, plan: Option<crate::video::MediaPlan>) {
        *self.media.lock().unwrap() = plan;
    }

    pub fn log_cookies(&self, cookies: &[String]) {
        if !cookies.is_empty() {
            self.cookie_log.lock().unwrap().extend_from_slice(cookies);
        }
    }

    /// Drain the cookie log into the job's `Cookie` header. Job boundary only.
    pub fn apply_cookie_log(&self) {
        let drained: Vec<String> = std::mem::take(&mut *self.cookie_log.lock().unwrap());
        if drained.is_empty() {
            return;
        }
        let mut conn = self.conn.lock().unwrap();
        let mut parts: Vec<String> = conn
            .cookie_header
            .take()
            .map(|h| h.split("; ").map(str::to_string).collect())
            .unwrap_or_default();
        for raw in drained {
            // Keep only the name=value pair, drop attributes.
            if let Some(pair) = raw.split(';').next() {
                let pair = pair.trim();
                if pair.contains('=') {
                    parts.retain(|p| p.split('=').next() != pair.split('=').next());
                    parts.push(pair.to_string());
                }
            }
        }
        if !parts.is_empty() {
            conn.cookie_header = Some(parts.join("; "));
        }
    }

    /// Record a transient-failure re-admission; false when the hourly cap
    /// (3 per hour) is spent.
    pub fn note_readmission(&self) -> bool {
        let mut log = self.readmissions.lock().unwrap();
        // checked_sub: the monotonic clock may not reach back a full hour.
        if let Some(hour_ago) = Instant::now().checked_sub(std::time::Duration::from_secs(3600)) {
            log.retain(|t| *t > hour_ago);
        }
        if log.len() >= 3 {
            return false;
        }
        log.push(Instant::now());
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let d = self.discovered();
        let rate = self.rate.rate();
        let downloaded = self.downloaded_bytes();
        JobSnapshot {
            id: self.id.clone(),
            url: self.source_url.clone(),
            final_path: self.final_path(),
            status: self.status(),
            total_size: d.total_size,
            resumable: d.resumable,
            downloaded_bytes: downloaded,
            rate_bytes_per_sec: rate,
            eta_seconds: eta_seconds(downloaded, d.total_size, rate),
            last_error: self.last_error(),
        }
    }
}

/// Point-in-time view of one job, as returned by `list()`.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub url: String,
    pub final_path: PathBuf,
    pub status: JobStatus,
    pub total_size: Option<u64>,
    pub resumable: bool,
    pub downloaded_bytes: u64,
    pub rate_bytes_per_sec: f64,
    pub eta_seconds: Option<f64>,
    pub last_error: Option<JobError>,
}
