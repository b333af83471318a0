//! Per-job driver: owns one admitted job from first worker to final file.
//!
//! The driver runs as a task spawned by the scheduler; workers run as
//! blocking tasks under it. It is the only scheduler-side code that touches
//! the job while it is `Running`/`Merging`.

use super::{transition, DriverOutcome};
use crate::assembler;
use crate::config::EngineConfig;
use crate::error::{ErrorKind, JobError};
use crate::events::EventBus;
use crate::job::{eta_seconds, Job, RunState, SegmentState};
use crate::limiter::RateLimiter;
use crate::muxer::MediaMuxer;
use crate::retry::RetryPolicy;
use crate::store::{self, JobIndex, Manifest};
use crate::video::{self, MediaKind, PipelineEnv, TrackSource};
use crate::worker::{run_segment, WorkerEnv, WorkerOutcome};
use crate::job::JobStatus;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct DriverCtx {
    pub job: Arc<Job>,
    pub cfg: EngineConfig,
    pub limiter: Arc<RateLimiter>,
    pub events: EventBus,
    pub muxer: Arc<dyn MediaMuxer>,
}

/// Progress tick cadence; the manifest persists every fourth tick.
const TICK: Duration = Duration::from_millis(500);
const PERSIST_EVERY: u32 = 4;

pub(crate) async fn run(ctx: DriverCtx) -> DriverOutcome {
    let job = &ctx.job;

    if let Err(e) = store::ensure_temp_dir(&job.temp_dir) {
        return DriverOutcome::Failed(JobError::new(ErrorKind::WritePermission, e.to_string()));
    }
    if let Err(e) = JobIndex::add(&ctx.cfg.temp_root, &job.temp_dir) {
        tracing::warn!(job = %job.id, "jobs.json update failed: {}", e);
    }

    // Job boundary: cookies observed last run become request cookies now.
    job.apply_cookie_log();
    job.rate.reset(job.downloaded_bytes());
    ctx.limiter
        .set_job_rate(&job.id, job.policy.speed_ceiling);

    let outcome = download_phase(&ctx).await;
    persist(job);

    let outcome = match outcome {
        DownloadPhase::AllDone => finish(&ctx).await,
        DownloadPhase::Paused => DriverOutcome::Paused,
        DownloadPhase::Cancelled => DriverOutcome::Cancelled,
        DownloadPhase::NeedsRefresh(e) => DriverOutcome::NeedsRefresh(e),
        DownloadPhase::Failed(e) => escalate_failure(&ctx, e),
    };

    ctx.limiter.remove_job(&job.id);
    outcome
}

enum DownloadPhase {
    AllDone,
    Paused,
    Cancelled,
    NeedsRefresh(JobError),
    Failed(JobError),
}

/// Pull idle segments through a soft-start worker pool until nothing is left
/// (or the job leaves `Running`).
async fn download_phase(ctx: &DriverCtx) -> DownloadPhase {
    let job = &ctx.job;
    let segments = job.segments();
    let env = WorkerEnv {
        connect_timeout: ctx.cfg.connect_timeout,
        read_timeout: ctx.cfg.read_timeout,
        verify_tls: ctx.cfg.verify_tls,
        retry: RetryPolicy {
            max_attempts: ctx.cfg.max_worker_retries.max(1),
            ..RetryPolicy::default()
        },
    };

    let mut pending: VecDeque<usize> = segments
        .iter()
        .filter(|s| s.state() != SegmentState::Done)
        .map(|s| s.index)
        .collect();
    if pending.is_empty() {
        return DownloadPhase::AllDone;
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(usize, WorkerOutcome)>();
    let mut active = 0usize;
    // Soft start: one connection first, another per completed segment, so a
    // throttling server is probed gently.
    let mut allowed = 1usize;
    let pool_cap = job.policy.max_connections.min(segments.len()).max(1);

    let mut paused = false;
    let mut cancelled = false;
    let mut refresh: Option<JobError> = None;
    let mut failure: Option<JobError> = None;

    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks = 0u32;

    loop {
        let draining =
            paused || cancelled || refresh.is_some() || failure.is_some();
        if !draining && job.control.get() == RunState::Running {
            while active < allowed.min(pool_cap) {
                let Some(index) = pending.pop_front() else {
                    break;
                };
                let slot = Arc::clone(&segments[index]);
                let job = Arc::clone(job);
                let limiter = Arc::clone(&ctx.limiter);
                let env = env.clone();
                let tx = tx.clone();
                active += 1;
                tokio::task::spawn_blocking(move || {
                    let outcome = run_segment(&job, &slot, &limiter, &env);
                    let _ = tx.send((slot.index, outcome));
                });
            }
        }

        if active == 0 {
            if pending.is_empty() || draining || job.control.get() != RunState::Running {
                break;
            }
        }

        tokio::select! {
            msg = rx.recv(), if active > 0 => {
                let Some((index, outcome)) = msg else { break };
                active -= 1;
                match outcome {
                    WorkerOutcome::Done => {
                        allowed = (allowed + 1).min(pool_cap);
                        tracing::debug!(job = %job.id, segment = index, "segment done");
                    }
                    WorkerOutcome::Paused => paused = true,
                    WorkerOutcome::Cancelled => cancelled = true,
                    WorkerOutcome::NeedsRefresh(e) => {
                        if refresh.is_none() {
                            refresh = Some(e);
                        }
                        // Drain the rest quickly; their URLs are dead too.
                        job.control.set(RunState::Paused);
                    }
                    WorkerOutcome::Failed(e) => {
                        if failure.is_none() {
                            failure = Some(e);
                        }
                        job.control.set(RunState::Paused);
                    }
                }
            }
            _ = ticker.tick() => {
                ticks = ticks.wrapping_add(1);
                emit_progress(ctx);
                if ticks % PERSIST_EVERY == 0 {
                    persist(job);
                }
            }
        }
    }

    emit_progress(ctx);

    if let Some(e) = refresh {
        // Workers were drained with a pause signal; undo it for the refresh
        // round-trip.
        if job.control.get() == RunState::Paused {
            job.control.set(RunState::Running);
        }
        return DownloadPhase::NeedsRefresh(e);
    }
    if let Some(e) = failure {
        if job.control.get() == RunState::Paused {
            job.control.set(RunState::Running);
        }
        return DownloadPhase::Failed(e);
    }
    if cancelled || job.control.get() == RunState::Cancelled {
        return DownloadPhase::Cancelled;
    }
    if paused || job.control.get() == RunState::Paused {
        return DownloadPhase::Paused;
    }

    if segments.iter().all(|s| s.state() == SegmentState::Done) {
        DownloadPhase::AllDone
    } else {
        DownloadPhase::Failed(JobError::new(
            ErrorKind::Internal,
            "download loop ended with unfinished segments",
        ))
    }
}

/// All segments are on disk: assemble (plain) or post-process (media).
async fn finish(ctx: &DriverCtx) -> DriverOutcome {
    let job = Arc::clone(&ctx.job);
    let plan = job.media_plan();

    match &plan {
        Some(plan) if plan.kind != MediaKind::Plain => {
            let audio = match &plan.audio {
                Some(track) => match download_audio_track(ctx, track).await {
                    Ok(path) => Some(path),
                    Err(outcome) => return outcome,
                },
                None => None,
            };

            transition(&ctx.events, &job, JobStatus::Merging);
            let env = PipelineEnv {
                connect_timeout: ctx.cfg.connect_timeout,
                read_timeout: ctx.cfg.read_timeout,
                verify_tls: ctx.cfg.verify_tls,
                write_metadata: ctx.cfg.write_metadata,
                collision: ctx.cfg.collision_policy,
            };
            let muxer = Arc::clone(&ctx.muxer);
            let j = Arc::clone(&job);
            let plan = plan.clone();
            let result = tokio::task::spawn_blocking(move || {
                video::post_process(&j, &plan, audio.as_deref(), muxer.as_ref(), &env)
            })
            .await;
            match flatten_join(result) {
                Ok(final_path) => {
                    job.set_final_path(final_path);
                    let _ = JobIndex::remove(&ctx.cfg.temp_root, &job.temp_dir);
                    DriverOutcome::Completed
                }
                Err(e) => fail_or_cancel(e),
            }
        }
        _ => {
            let collision = ctx.cfg.collision_policy;
            let checksums = ctx.cfg.verify_checksums;
            let j = Arc::clone(&job);
            let result = tokio::task::spawn_blocking(move || {
                assembler::assemble(&j, collision, checksums)
            })
            .await;
            match flatten_join(result) {
                Ok(out) => {
                    if let (Some(md5), Some(sha)) = (&out.md5, &out.sha256) {
                        tracing::info!(job = %job.id, md5 = %md5, sha256 = %sha, "checksums");
                    }
                    if let Some(plan) = &plan {
                        // Progressive media still gets tags and subtitles.
                        let env = PipelineEnv {
                            connect_timeout: ctx.cfg.connect_timeout,
                            read_timeout: ctx.cfg.read_timeout,
                            verify_tls: ctx.cfg.verify_tls,
                            write_metadata: ctx.cfg.write_metadata,
                            collision: ctx.cfg.collision_policy,
                        };
                        let plan = plan.clone();
                        let j = Arc::clone(&job);
                        let muxer = Arc::clone(&ctx.muxer);
                        let target = out.final_path.clone();
                        let _ = tokio::task::spawn_blocking(move || {
                            video::plain_extras(&j, &plan, &target, muxer.as_ref(), &env)
                        })
                        .await;
                    }
                    job.set_final_path(out.final_path);
                    let _ = JobIndex::remove(&ctx.cfg.temp_root, &job.temp_dir);
                    DriverOutcome::Completed
                }
                Err(e) => fail_or_cancel(e),
            }
        }
    }
}

/// Download the audio child track into the job's temp dir and return the
/// assembled intermediate file.
async fn download_audio_track(
    ctx: &DriverCtx,
    track: &TrackSource,
) -> Result<std::path::PathBuf, DriverOutcome> {
    let parent = &ctx.job;
    let child = super::prepare::audio_child_job(parent, track, &ctx.cfg)
        .map_err(DriverOutcome::Failed)?;
    let child = Arc::new(child);
    store::ensure_temp_dir(&child.temp_dir).map_err(|e| {
        DriverOutcome::Failed(JobError::new(ErrorKind::WritePermission, e.to_string()))
    })?;

    // The child shares the parent's control cell semantics through its own
    // cell; mirror pause/cancel by polling in its drain loop below.
    let child_ctx = DriverCtx {
        job: Arc::clone(&child),
        cfg: ctx.cfg.clone(),
        limiter: Arc::clone(&ctx.limiter),
        events: ctx.events.clone(),
        muxer: Arc::clone(&ctx.muxer),
    };

    // Propagate parent control into the child while it downloads.
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mirror = {
        let parent = Arc::clone(parent);
        let child = Arc::clone(&child);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let state = parent.control.get();
                if state != RunState::Running {
                    child.control.set(state);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };

    let phase = download_phase(&child_ctx).await;
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    mirror.abort();

    match phase {
        DownloadPhase::AllDone => {}
        DownloadPhase::Cancelled => return Err(DriverOutcome::Cancelled),
        // Parent pause arrived mid-child; video progress is already in the
        // manifest, the audio fragments restart next admission.
        DownloadPhase::Paused => return Err(DriverOutcome::Paused),
        DownloadPhase::NeedsRefresh(e) | DownloadPhase::Failed(e) => {
            return Err(DriverOutcome::Failed(JobError {
                kind: ErrorKind::TransportFatal,
                http_status: e.http_status,
                message: format!("audio track: {}", e.message),
            }));
        }
    }

    // Decrypt + concat the audio fragments into one file.
    let audio_plan = video::MediaPlan {
        kind: MediaKind::Hls,
        container_ext: String::new(),
        media_sequence: 0,
        audio: None,
        subtitles: Vec::new(),
        metadata: Default::default(),
        decryption_key_hex: track.decryption_key_hex.clone(),
    };
    let env = PipelineEnv {
        connect_timeout: ctx.cfg.connect_timeout,
        read_timeout: ctx.cfg.read_timeout,
        verify_tls: ctx.cfg.verify_tls,
        write_metadata: false,
        collision: ctx.cfg.collision_policy,
    };
    let out = ctx.job.temp_dir.join("audio-intermediate.bin");
    let child2 = Arc::clone(&child);
    let out2 = out.clone();
    let result = tokio::task::spawn_blocking(move || {
        video::concat_track(&child2, &audio_plan, &out2, &env)
    })
    .await;
    flatten_join(result).map_err(|e| fail_or_cancel(e))?;
    let _ = store::remove_temp_dir(&child.temp_dir);
    Ok(out)
}

fn fail_or_cancel(e: JobError) -> DriverOutcome {
    if e.kind == ErrorKind::Cancelled {
        DriverOutcome::Cancelled
    } else {
        DriverOutcome::Failed(e)
    }
}

/// Spec'd escalation: a transient failure on a resumable job requeues with a
/// cool-down (bounded per hour); everything else fails the job.
fn escalate_failure(ctx: &DriverCtx, e: JobError) -> DriverOutcome {
    let job = &ctx.job;
    let transient = e.kind == ErrorKind::TransportRetryable;
    let resumable = job.discovered().resumable || job.media_plan().is_some();
    if transient && resumable && job.note_readmission() {
        return DriverOutcome::RequeueTransient(e);
    }
    let hardened = if transient {
        JobError {
            kind: ErrorKind::TransportFatal,
            ..e
        }
    } else {
        e
    };
    DriverOutcome::Failed(hardened)
}

fn flatten_join<T>(
    r: Result<Result<T, JobError>, tokio::task::JoinError>,
) -> Result<T, JobError> {
    match r {
        Ok(inner) => inner,
        Err(join) => Err(JobError::new(
            ErrorKind::Internal,
            format!("task panicked: {}", join),
        )),
    }
}

fn emit_progress(ctx: &DriverCtx) {
    let job = &ctx.job;
    let downloaded = job.downloaded_bytes();
    let total = job.discovered().total_size;
    let rate = job.rate.sample(downloaded);
    ctx.events.progress(
        &job.id,
        downloaded,
        total,
        rate,
        eta_seconds(downloaded, total, rate),
    );
}

fn persist(job: &Job) {
    if !job.temp_dir.exists() {
        return;
    }
    if let Err(e) = store::persist_manifest(&Manifest::from_job(job), &job.temp_dir) {
        tracing::warn!(job = %job.id, "manifest persist failed: {}", e);
    }
}
