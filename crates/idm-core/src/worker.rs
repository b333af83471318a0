//! One worker, one segment: transport attempts with retry, rate limiting,
//! and cooperative pause/cancel.
//!
//! Runs on a plain thread (curl is blocking). The driver owns the thread
//! pool and reacts to the returned outcome; a worker never touches job
//! status or any segment but its own.

use crate::error::{classify_io, ErrorKind, JobError};
use crate::job::{Job, RunState, SegmentSlot, SegmentSource, SegmentState};
use crate::limiter::RateLimiter;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::PartSink;
use crate::transport::{
    self, Method, SinkControl, TransportError, TransportErrorKind, TransportRequest,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a worker's tenure over a segment ended.
#[derive(Debug)]
pub enum WorkerOutcome {
    /// Segment is complete on disk.
    Done,
    /// Job was paused; progress is recorded in the slot.
    Paused,
    /// Job was cancelled.
    Cancelled,
    /// Segment failed for good (retries exhausted or fatal error).
    Failed(JobError),
    /// The URL stopped serving our ranges; the job needs a refresh.
    NeedsRefresh(JobError),
}

/// Connection-independent knobs a worker needs, snapshotted by the driver.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub verify_tls: bool,
    pub retry: RetryPolicy,
}

/// Download one segment to its part file, retrying per policy.
pub fn run_segment(
    job: &Arc<Job>,
    slot: &Arc<SegmentSlot>,
    limiter: &Arc<RateLimiter>,
    env: &WorkerEnv,
) -> WorkerOutcome {
    slot.set_state(SegmentState::Downloading);
    slot.reset_attempts();
    loop {
        match job.control.get() {
            RunState::Running => {}
            RunState::Paused => {
                slot.set_state(SegmentState::Idle);
                return WorkerOutcome::Paused;
            }
            RunState::Cancelled => {
                slot.set_state(SegmentState::Idle);
                return WorkerOutcome::Cancelled;
            }
        }

        let attempt = slot.bump_attempts();
        match attempt_once(job, slot, limiter, env) {
            AttemptResult::Done => {
                slot.set_state(SegmentState::Done);
                return WorkerOutcome::Done;
            }
            AttemptResult::Paused => {
                slot.set_state(SegmentState::Idle);
                return WorkerOutcome::Paused;
            }
            AttemptResult::Cancelled => {
                slot.set_state(SegmentState::Idle);
                return WorkerOutcome::Cancelled;
            }
            AttemptResult::NeedsRefresh(err) => {
                slot.set_state(SegmentState::Idle);
                return WorkerOutcome::NeedsRefresh(err);
            }
            AttemptResult::Fatal(err) => {
                slot.set_state(SegmentState::Failed);
                return WorkerOutcome::Failed(err);
            }
            AttemptResult::Retryable(err) => match env.retry.decide(attempt, true) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::debug!(
                        job = %job.id,
                        segment = slot.index,
                        attempt,
                        "retrying after {:?}: {}",
                        delay,
                        err
                    );
                    if !sleep_observing_cancel(job, delay) {
                        continue; // control state changed; loop re-checks it
                    }
                }
                RetryDecision::NoRetry => {
                    slot.set_state(SegmentState::Failed);
                    // Kind stays retryable so the scheduler can tell a worn-
                    // out transient failure from a hard one (requeue policy).
                    return WorkerOutcome::Failed(JobError {
                        kind: ErrorKind::TransportRetryable,
                        http_status: err.http_status(),
                        message: format!("retries exhausted: {}", err),
                    });
                }
            },
        }
    }
}

enum AttemptResult {
    Done,
    Paused,
    Cancelled,
    Retryable(TransportError),
    Fatal(JobError),
    NeedsRefresh(JobError),
}

fn attempt_once(
    job: &Arc<Job>,
    slot: &Arc<SegmentSlot>,
    limiter: &Arc<RateLimiter>,
    env: &WorkerEnv,
) -> AttemptResult {
    let conn = job.conn();
    let etag = job.discovered().etag;

    // Anything but a byte-range segment restarts from zero on every attempt;
    // a half-written fragment or rangeless body can't be appended to safely.
    if !slot.source.supports_append() && slot.bytes_written() > 0 {
        job.sub_downloaded(slot.bytes_written());
        slot.set_bytes_written(0);
    }

    let mut req = TransportRequest {
        url: conn.effective_url.clone(),
        method: Method::Get,
        range: None,
        headers: conn.headers.clone(),
        proxy: conn.proxy.clone(),
        auth: conn.auth.clone(),
        cookie_header: conn.cookie_header.clone(),
        connect_timeout: env.connect_timeout,
        read_timeout: env.read_timeout,
        verify_tls: env.verify_tls,
        follow_redirects: true,
    };

    match &slot.source {
        SegmentSource::Range { .. } => {
            let Some((from, to)) = slot.missing_range() else {
                return AttemptResult::Done;
            };
            req.range = Some((from, to));
            if slot.bytes_written() > 0 {
                if let Some(etag) = &etag {
                    req.headers.push(("If-Range".to_string(), etag.clone()));
                }
            }
        }
        SegmentSource::Whole => {}
        SegmentSource::Media { url, byterange, .. } => {
            req.url = url.clone();
            req.range = *byterange;
        }
    }

    let sink = match PartSink::open(slot) {
        Ok(s) => s,
        Err(e) => {
            return AttemptResult::Fatal(JobError::new(classify_io(&e), e.to_string()));
        }
    };
    let sink_cell = Arc::new(Mutex::new(Some(sink)));
    let sink_cb = Arc::clone(&sink_cell);

    let io_error: Arc<Mutex<Option<std::io::Error>>> = Arc::new(Mutex::new(None));
    let io_error_cb = Arc::clone(&io_error);
    let cancel = job.control.cancel_token().clone();
    let cancel_sink = cancel.clone();
    let job_cb = Arc::clone(job);
    let slot_cb = Arc::clone(slot);
    let limiter_cb = Arc::clone(limiter);
    let expected = slot.source.declared_len();

    let result = transport::fetch(&req, &cancel, move |chunk, _cum| {
        match job_cb.control.get() {
            RunState::Running => {}
            RunState::Paused => return SinkControl::Pause,
            RunState::Cancelled => return SinkControl::Abort,
        }
        // Tokens are taken after the socket read, before the disk write;
        // overshoot is bounded by the chunk size.
        if !limiter_cb.acquire(chunk.len() as u64, &job_cb.id, &cancel_sink) {
            return SinkControl::Abort;
        }
        // Never write past the declared range; a misbehaving server may send
        // more than asked.
        let room = match expected {
            Some(total) => total.saturating_sub(slot_cb.bytes_written()),
            None => u64::MAX,
        };
        let take = (chunk.len() as u64).min(room) as usize;
        if take == 0 {
            return SinkControl::Abort;
        }
        let write = match sink_cb.lock().unwrap().as_mut() {
            Some(sink) => sink.write_chunk(&chunk[..take]),
            None => return SinkControl::Abort,
        };
        if let Err(e) = write {
            *io_error_cb.lock().unwrap() = Some(e);
            return SinkControl::Abort;
        }
        slot_cb.add_bytes(take as u64);
        job_cb.add_downloaded(take as u64);
        if take < chunk.len() {
            return SinkControl::Abort;
        }
        SinkControl::Continue
    });

    if let Some(sink) = sink_cell.lock().unwrap().take() {
        if let Err(e) = sink.flush_and_close() {
            return AttemptResult::Fatal(JobError::new(classify_io(&e), e.to_string()));
        }
    }
    if let Some(e) = io_error.lock().unwrap().take() {
        return AttemptResult::Fatal(JobError::new(classify_io(&e), e.to_string()));
    }

    match result {
        Ok(resp) => {
            job.log_cookies(&resp.set_cookies);
            match job.control.get() {
                RunState::Paused => AttemptResult::Paused,
                RunState::Cancelled => AttemptResult::Cancelled,
                RunState::Running => match expected {
                    Some(total) if slot.bytes_written() < total => {
                        // Server closed early; classify like a dropped
                        // connection so the retry policy applies.
                        AttemptResult::Retryable(short_transfer(slot.bytes_written(), total))
                    }
                    _ => AttemptResult::Done,
                },
            }
        }
        Err(e) => match e.kind {
            TransportErrorKind::Cancelled => match job.control.get() {
                RunState::Paused => AttemptResult::Paused,
                _ => AttemptResult::Cancelled,
            },
            TransportErrorKind::RangeRejected => AttemptResult::NeedsRefresh(JobError {
                kind: ErrorKind::RangeRejected,
                http_status: Some(416),
                message: e.message,
            }),
            TransportErrorKind::HttpStatus(code @ (403 | 410))
                if job.downloaded_bytes() > 0 =>
            {
                // A link that served us bytes and then starts refusing has
                // expired; ask for a refresh instead of failing.
                AttemptResult::NeedsRefresh(JobError {
                    kind: ErrorKind::TransportFatal,
                    http_status: Some(code),
                    message: e.message,
                })
            }
            _ if e.retryable => AttemptResult::Retryable(e),
            _ => AttemptResult::Fatal(JobError {
                kind: ErrorKind::TransportFatal,
                http_status: e.http_status(),
                message: e.message,
            }),
        },
    }
}

fn short_transfer(received: u64, expected: u64) -> TransportError {
    TransportError {
        kind: TransportErrorKind::ServerClosed,
        retryable: true,
        message: format!("short transfer: {} of {} bytes", received, expected),
    }
}

/// Sleep in slices, returning early (false) if the job leaves `Running`.
fn sleep_observing_cancel(job: &Job, total: Duration) -> bool {
    let slice = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if job.control.get() != RunState::Running {
            return false;
        }
        let nap = remaining.min(slice);
        std::thread::sleep(nap);
        remaining = remaining.saturating_sub(nap);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::job::DownloadSpec;

    fn env() -> WorkerEnv {
        WorkerEnv {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            verify_tls: false,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        }
    }

    #[test]
    fn paused_job_returns_immediately() {
        let cfg = EngineConfig::default();
        let job = Arc::new(Job::from_spec(
            "j1".into(),
            &DownloadSpec::new("http://127.0.0.1:1/unreachable"),
            &cfg,
        ));
        let slot = Arc::new(SegmentSlot::new(
            0,
            SegmentSource::Range { start: 0, end: 10 },
            std::env::temp_dir().join("idm-test-part-pause"),
        ));
        let limiter = Arc::new(RateLimiter::new(0));
        job.control.set(RunState::Paused);
        let out = run_segment(&job, &slot, &limiter, &env());
        assert!(matches!(out, WorkerOutcome::Paused));
        assert_eq!(slot.state(), SegmentState::Idle);
    }

    #[test]
    fn connection_failure_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::default();
        // Nothing listens on this port; every attempt fails fast.
        let job = Arc::new(Job::from_spec(
            "j2".into(),
            &DownloadSpec::new("http://127.0.0.1:9/refused"),
            &cfg,
        ));
        let slot = Arc::new(SegmentSlot::new(
            0,
            SegmentSource::Range { start: 0, end: 10 },
            dir.path().join("part-000000"),
        ));
        let limiter = Arc::new(RateLimiter::new(0));
        let out = run_segment(&job, &slot, &limiter, &env());
        match out {
            WorkerOutcome::Failed(e) => assert_eq!(e.kind, ErrorKind::TransportRetryable),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(slot.state(), SegmentState::Failed);
        assert!(slot.attempts() >= 2);
    }

    #[test]
    fn sleep_bails_on_state_change() {
        let cfg = EngineConfig::default();
        let job = Arc::new(Job::from_spec(
            "j3".into(),
            &DownloadSpec::new("http://example.com/x"),
            &cfg,
        ));
        let j = Arc::clone(&job);
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            j.control.set(RunState::Cancelled);
        });
        let t = std::time::Instant::now();
        let slept_fully = sleep_observing_cancel(&job, Duration::from_secs(10));
        h.join().unwrap();
        assert!(!slept_fully);
        assert!(t.elapsed() < Duration::from_secs(1));
    }
}
