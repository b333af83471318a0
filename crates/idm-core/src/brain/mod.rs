//! The scheduler: job registry, admission control, and the control surface.
//!
//! A single cooperative loop owns every job's status. User commands and
//! internal notifications (probe done, driver finished, refresh finished,
//! cool-down expired) arrive on one channel; per-job work runs in spawned
//! tasks that report back instead of mutating scheduler state themselves.

mod driver;
mod prepare;
mod refresh;
mod restore;

use crate::config::{EngineConfig, HotKnobs};
use crate::error::{ErrorKind, JobError};
use crate::events::{EventBus, Observer};
use crate::extractor::InfoExtractor;
use crate::job::{DownloadSpec, Job, JobId, JobSnapshot, JobStatus, RunState};
use crate::limiter::RateLimiter;
use crate::muxer::MediaMuxer;
use crate::store::{self, JobIndex};
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Cool-down before a transiently-failed job is re-admitted.
const REQUEUE_COOLDOWN: Duration = Duration::from_secs(60);

/// How a driver run ended; consumed by the scheduler loop.
pub(crate) enum DriverOutcome {
    Completed,
    Paused,
    Cancelled,
    Failed(JobError),
    NeedsRefresh(JobError),
    RequeueTransient(JobError),
}

enum Msg {
    Submit {
        spec: Box<DownloadSpec>,
        reply: oneshot::Sender<Result<JobId>>,
    },
    Start {
        id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    Pause {
        id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    Remove {
        id: JobId,
        delete_files: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    Restore {
        reply: oneshot::Sender<usize>,
    },
    Kick,
    Prepared {
        id: JobId,
        result: Result<(), JobError>,
    },
    DriverFinished {
        id: JobId,
        outcome: DriverOutcome,
    },
    RefreshFinished {
        id: JobId,
        result: Result<(), JobError>,
    },
    CooldownOver {
        id: JobId,
    },
}

/// Handle to a running engine. Cheap to clone; the scheduler task lives for
/// the rest of the runtime.
#[derive(Clone)]
pub struct Engine {
    tx: mpsc::Sender<Msg>,
    events: EventBus,
    knobs: Arc<HotKnobs>,
    limiter: Arc<RateLimiter>,
}

impl Engine {
    /// Spawn the scheduler on the current tokio runtime.
    pub fn spawn(
        cfg: EngineConfig,
        extractor: Arc<dyn InfoExtractor>,
        muxer: Arc<dyn MediaMuxer>,
    ) -> Engine {
        let (tx, rx) = mpsc::channel(64);
        let events = EventBus::new(256);
        let knobs = Arc::new(HotKnobs::from_config(&cfg));
        let limiter = Arc::new(RateLimiter::new(cfg.global_speed_limit));
        let brain = Brain {
            cfg,
            extractor,
            muxer,
            events: events.clone(),
            knobs: Arc::clone(&knobs),
            limiter: Arc::clone(&limiter),
            tx: tx.clone(),
            registry: HashMap::new(),
            ready: VecDeque::new(),
            active: HashSet::new(),
            cooling: HashSet::new(),
            pending_removal: HashMap::new(),
            next_seq: 1,
        };
        tokio::spawn(brain.run(rx));
        Engine {
            tx,
            events,
            knobs,
            limiter,
        }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Msg,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("engine stopped"))?;
        rx.await.map_err(|_| anyhow!("engine stopped"))
    }

    /// Register a download. The job sits in `Pending` until `start`.
    pub async fn submit(&self, spec: DownloadSpec) -> Result<JobId> {
        self.call(|reply| Msg::Submit {
            spec: Box::new(spec),
            reply,
        })
        .await?
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.call(move |reply| Msg::Start { id, reply }).await?
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.call(move |reply| Msg::Pause { id, reply }).await?
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.call(move |reply| Msg::Cancel { id, reply }).await?
    }

    pub async fn remove(&self, id: &str, delete_files: bool) -> Result<()> {
        let id = id.to_string();
        self.call(move |reply| Msg::Remove {
            id,
            delete_files,
            reply,
        })
        .await?
    }

    /// Snapshot of every known job.
    pub async fn list(&self) -> Result<Vec<JobSnapshot>> {
        self.call(|reply| Msg::List { reply }).await
    }

    /// Enumerate persisted manifests and requeue what is resumable.
    /// Returns the number of jobs brought back.
    pub async fn restore_jobs(&self) -> Result<usize> {
        self.call(|reply| Msg::Restore { reply }).await
    }

    /// 0 = unlimited. Applies to bytes in flight immediately.
    pub fn set_global_speed_limit(&self, bytes_per_sec: u64) {
        self.knobs.set_global_speed_limit(bytes_per_sec);
        self.limiter.set_global_rate(bytes_per_sec);
    }

    /// Applies on the next admission cycle.
    pub fn set_max_concurrent(&self, n: usize) {
        self.knobs.set_max_concurrent_jobs(n);
        let _ = self.tx.try_send(Msg::Kick);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::events::EngineEvent> {
        self.events.subscribe()
    }

    pub fn attach_observer(&self, observer: Arc<dyn Observer>) -> tokio::task::JoinHandle<()> {
        self.events.attach_observer(observer)
    }
}

/// Scheduler-side status write with event emission. Illegal transitions are
/// dropped (and logged), never forced.
pub(crate) fn transition(events: &EventBus, job: &Job, new: JobStatus) -> bool {
    match job.set_status(new) {
        Some(old) => {
            tracing::info!(job = %job.id, "{} -> {}", old, new);
            events.state(&job.id, old, new);
            true
        }
        None => {
            tracing::debug!(job = %job.id, "ignored transition {} -> {}", job.status(), new);
            false
        }
    }
}

struct Brain {
    cfg: EngineConfig,
    extractor: Arc<dyn InfoExtractor>,
    muxer: Arc<dyn MediaMuxer>,
    events: EventBus,
    knobs: Arc<HotKnobs>,
    limiter: Arc<RateLimiter>,
    tx: mpsc::Sender<Msg>,
    registry: HashMap<JobId, Arc<Job>>,
    /// FIFO of jobs awaiting an admission slot.
    ready: VecDeque<JobId>,
    /// Jobs with a live driver.
    active: HashSet<JobId>,
    /// Queued jobs serving a transient-failure cool-down.
    cooling: HashSet<JobId>,
    /// Jobs to drop from the registry once their driver returns.
    pending_removal: HashMap<JobId, bool>,
    next_seq: u64,
}

impl Brain {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg);
            self.admit();
        }
        tracing::debug!("scheduler loop ended");
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Submit { spec, reply } => {
                let _ = reply.send(self.submit(*spec));
            }
            Msg::Start { id, reply } => {
                let _ = reply.send(self.start(&id));
            }
            Msg::Pause { id, reply } => {
                let _ = reply.send(self.pause(&id));
            }
            Msg::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(&id));
            }
            Msg::Remove {
                id,
                delete_files,
                reply,
            } => {
                let _ = reply.send(self.remove(&id, delete_files));
            }
            Msg::List { reply } => {
                let mut jobs: Vec<JobSnapshot> =
                    self.registry.values().map(|j| j.snapshot()).collect();
                jobs.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(jobs);
            }
            Msg::Restore { reply } => {
                let _ = reply.send(self.restore());
            }
            Msg::Kick => {}
            Msg::Prepared { id, result } => self.on_prepared(&id, result),
            Msg::DriverFinished { id, outcome } => self.on_driver_finished(&id, outcome),
            Msg::RefreshFinished { id, result } => self.on_refresh_finished(&id, result),
            Msg::CooldownOver { id } => {
                if self.cooling.remove(&id) && self.registry.contains_key(&id) {
                    self.ready.push_back(id);
                }
            }
        }
    }

    fn submit(&mut self, spec: DownloadSpec) -> Result<JobId> {
        if spec.url.trim().is_empty() {
            return Err(anyhow!("empty url"));
        }
        let id = format!("job-{:06}-{:04x}", self.next_seq, rand::random::<u16>());
        self.next_seq += 1;
        let job = Arc::new(Job::from_spec(id.clone(), &spec, &self.cfg));
        self.registry.insert(id.clone(), job);
        tracing::info!(job = %id, url = %spec.url, "submitted");
        Ok(id)
    }

    fn start(&mut self, id: &str) -> Result<()> {
        let job = self.job(id)?;
        match job.status() {
            JobStatus::Pending => {
                transition(&self.events, &job, JobStatus::Probing);
                self.spawn_prepare(job);
                Ok(())
            }
            JobStatus::Paused => {
                transition(&self.events, &job, JobStatus::Queued);
                self.ready.push_back(job.id.clone());
                Ok(())
            }
            other => Err(anyhow!("cannot start a {} job", other)),
        }
    }

    fn pause(&mut self, id: &str) -> Result<()> {
        let job = self.job(id)?;
        match job.status() {
            JobStatus::Running => {
                if !job.discovered().resumable && job.media_plan().is_none() {
                    let info = JobError::new(
                        ErrorKind::NotResumable,
                        "server does not support ranges; pausing would lose progress",
                    );
                    self.events.error(&job.id, &info);
                    return Err(anyhow!("job is not resumable"));
                }
                // Workers drain after their current chunk; the driver
                // persists the manifest and reports back.
                job.control.set(RunState::Paused);
                Ok(())
            }
            other => Err(anyhow!("cannot pause a {} job", other)),
        }
    }

    fn cancel(&mut self, id: &str) -> Result<()> {
        let job = self.job(id)?;
        if job.status().is_terminal() {
            return Err(anyhow!("job already finished"));
        }
        job.control.set(RunState::Cancelled);
        if !self.active.contains(id) {
            // No driver to report back; settle the state here.
            self.ready.retain(|r| r != id);
            self.cooling.remove(id);
            transition(&self.events, &job, JobStatus::Cancelled);
        }
        Ok(())
    }

    fn remove(&mut self, id: &str, delete_files: bool) -> Result<()> {
        let job = self.job(id)?;
        if self.active.contains(id) {
            job.control.set(RunState::Cancelled);
            self.pending_removal.insert(id.to_string(), delete_files);
            return Ok(());
        }
        if !job.status().is_terminal() {
            transition(&self.events, &job, JobStatus::Cancelled);
        }
        self.drop_job(id, delete_files);
        Ok(())
    }

    fn drop_job(&mut self, id: &str, delete_files: bool) {
        let Some(job) = self.registry.remove(id) else {
            return;
        };
        self.ready.retain(|r| r != id);
        self.cooling.remove(id);
        let _ = JobIndex::remove(&self.cfg.temp_root, &job.temp_dir);
        if delete_files {
            if let Err(e) = store::remove_temp_dir(&job.temp_dir) {
                tracing::warn!(job = %id, "temp dir removal failed: {}", e);
            }
        }
        tracing::info!(job = %id, "removed");
    }

    fn restore(&mut self) -> usize {
        let mut brought_back = 0;
        for entry in restore::load_all(&self.cfg) {
            match entry {
                restore::Restored::Runnable(job) => {
                    if self.registry.contains_key(&job.id) {
                        continue;
                    }
                    tracing::info!(job = %job.id, "restored from manifest");
                    self.ready.push_back(job.id.clone());
                    self.registry.insert(job.id.clone(), job);
                    brought_back += 1;
                }
                restore::Restored::Broken { job, error } => {
                    if self.registry.contains_key(&job.id) {
                        continue;
                    }
                    job.set_last_error(error.clone());
                    self.events.error(&job.id, &error);
                    // Restored as Queued; downgrade on the spot.
                    transition(&self.events, &job, JobStatus::Error);
                    self.registry.insert(job.id.clone(), job);
                }
            }
            self.next_seq += 1;
        }
        brought_back
    }

    fn admit(&mut self) {
        let cap = self.knobs.max_concurrent_jobs();
        while self.active.len() < cap {
            let Some(id) = self.next_admittable() else {
                break;
            };
            let Some(job) = self.registry.get(&id).cloned() else {
                continue;
            };
            if !transition(&self.events, &job, JobStatus::Running) {
                continue;
            }
            job.control.set(RunState::Running);
            self.active.insert(id.clone());
            let ctx = driver::DriverCtx {
                job,
                cfg: self.cfg.clone(),
                limiter: Arc::clone(&self.limiter),
                events: self.events.clone(),
                muxer: Arc::clone(&self.muxer),
            };
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let id = ctx.job.id.clone();
                let outcome = driver::run(ctx).await;
                let _ = tx.send(Msg::DriverFinished { id, outcome }).await;
            });
        }
    }

    /// Next queued job that is not cooling down.
    fn next_admittable(&mut self) -> Option<JobId> {
        while let Some(id) = self.ready.pop_front() {
            if self.cooling.contains(&id) {
                continue;
            }
            match self.registry.get(&id) {
                Some(job) if job.status() == JobStatus::Queued => return Some(id),
                _ => continue,
            }
        }
        None
    }

    fn spawn_prepare(&self, job: Arc<Job>) {
        let cfg = self.cfg.clone();
        let extractor = Arc::clone(&self.extractor);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let id = job.id.clone();
            let j = Arc::clone(&job);
            let result = tokio::task::spawn_blocking(move || {
                prepare::prepare_job(&j, &cfg, extractor.as_ref())
            })
            .await
            .unwrap_or_else(|e| {
                Err(JobError::new(
                    ErrorKind::Internal,
                    format!("probe task panicked: {}", e),
                ))
            });
            let _ = tx.send(Msg::Prepared { id, result }).await;
        });
    }

    fn on_prepared(&mut self, id: &str, result: Result<(), JobError>) {
        let Some(job) = self.registry.get(id).cloned() else {
            return;
        };
        if job.control.get() == RunState::Cancelled {
            transition(&self.events, &job, JobStatus::Cancelled);
            return;
        }
        match result {
            Ok(()) => {
                if transition(&self.events, &job, JobStatus::Queued) {
                    self.ready.push_back(id.to_string());
                }
            }
            Err(e) => self.fail_job(&job, e),
        }
    }

    fn on_driver_finished(&mut self, id: &str, outcome: DriverOutcome) {
        self.active.remove(id);
        let Some(job) = self.registry.get(id).cloned() else {
            return;
        };
        match outcome {
            DriverOutcome::Completed => {
                transition(&self.events, &job, JobStatus::Completed);
                let d = job.discovered();
                self.events.progress(
                    &job.id,
                    job.downloaded_bytes(),
                    d.total_size,
                    0.0,
                    Some(0.0),
                );
            }
            DriverOutcome::Paused => {
                transition(&self.events, &job, JobStatus::Paused);
            }
            DriverOutcome::Cancelled => {
                transition(&self.events, &job, JobStatus::Cancelled);
            }
            DriverOutcome::Failed(e) => self.fail_job(&job, e),
            DriverOutcome::NeedsRefresh(e) => {
                tracing::info!(job = %id, "link expired ({}), refreshing", e);
                transition(&self.events, &job, JobStatus::Refreshing);
                self.spawn_refresh(job);
            }
            DriverOutcome::RequeueTransient(e) => {
                tracing::info!(job = %id, "transient failure ({}), requeueing after cool-down", e);
                self.events.error(&job.id, &e);
                transition(&self.events, &job, JobStatus::Queued);
                self.cooling.insert(id.to_string());
                self.ready.push_back(id.to_string());
                let tx = self.tx.clone();
                let id = id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(REQUEUE_COOLDOWN).await;
                    let _ = tx.send(Msg::CooldownOver { id }).await;
                });
            }
        }
        if let Some(delete) = self.pending_removal.remove(id) {
            self.drop_job(id, delete);
        }
    }

    fn spawn_refresh(&self, job: Arc<Job>) {
        let cfg = self.cfg.clone();
        let extractor = Arc::clone(&self.extractor);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let id = job.id.clone();
            let j = Arc::clone(&job);
            let result = tokio::task::spawn_blocking(move || {
                refresh::refresh_job(&j, &cfg, extractor.as_ref())
            })
            .await
            .unwrap_or_else(|e| {
                Err(JobError::new(
                    ErrorKind::Internal,
                    format!("refresh task panicked: {}", e),
                ))
            });
            let _ = tx.send(Msg::RefreshFinished { id, result }).await;
        });
    }

    fn on_refresh_finished(&mut self, id: &str, result: Result<(), JobError>) {
        let Some(job) = self.registry.get(id).cloned() else {
            return;
        };
        if job.control.get() == RunState::Cancelled {
            transition(&self.events, &job, JobStatus::Cancelled);
            return;
        }
        match result {
            Ok(()) => {
                if transition(&self.events, &job, JobStatus::Queued) {
                    // Resumed jobs jump the queue; they already hold progress.
                    self.ready.push_front(id.to_string());
                }
            }
            Err(e) => self.fail_job(&job, e),
        }
    }

    fn fail_job(&mut self, job: &Arc<Job>, e: JobError) {
        tracing::warn!(job = %job.id, "failed: {}", e);
        job.set_last_error(e.clone());
        self.events.error(&job.id, &e);
        transition(&self.events, job, JobStatus::Error);
    }

    fn job(&self, id: &str) -> Result<Arc<Job>> {
        self.registry
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown job id {}", id))
    }
}
