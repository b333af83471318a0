//! Engine event bus.
//!
//! Workers and the scheduler publish tagged events on a broadcast channel;
//! a UI is one subscriber among many. `Observer` is a push-style adapter for
//! consumers that prefer callbacks over draining a channel.

use crate::error::{ErrorKind, JobError};
use crate::job::JobStatus;

/// Tagged event published by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Job status transition (old, new).
    State {
        job_id: String,
        old: JobStatus,
        new: JobStatus,
    },
    /// Periodic progress snapshot for one job.
    Progress {
        job_id: String,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        rate_bytes_per_sec: f64,
        eta_seconds: Option<f64>,
    },
    /// A job recorded an error (fatal or informational).
    Error {
        job_id: String,
        kind: ErrorKind,
        message: String,
    },
}

/// Push-model observer. Implementations must be cheap and non-blocking; they
/// are called from a forwarding task, never from a worker.
pub trait Observer: Send + Sync + 'static {
    fn on_state(&self, job_id: &str, old: JobStatus, new: JobStatus);
    fn on_progress(
        &self,
        job_id: &str,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        rate_bytes_per_sec: f64,
        eta_seconds: Option<f64>,
    );
    fn on_error(&self, job_id: &str, kind: ErrorKind, message: &str);
}

/// Broadcast sender shared engine-wide. Send failures mean nobody is
/// listening, which is fine.
#[derive(Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn state(&self, job_id: &str, old: JobStatus, new: JobStatus) {
        let _ = self.tx.send(EngineEvent::State {
            job_id: job_id.to_string(),
            old,
            new,
        });
    }

    pub fn progress(
        &self,
        job_id: &str,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        rate_bytes_per_sec: f64,
        eta_seconds: Option<f64>,
    ) {
        let _ = self.tx.send(EngineEvent::Progress {
            job_id: job_id.to_string(),
            downloaded_bytes,
            total_bytes,
            rate_bytes_per_sec,
            eta_seconds,
        });
    }

    pub fn error(&self, job_id: &str, err: &JobError) {
        let _ = self.tx.send(EngineEvent::Error {
            job_id: job_id.to_string(),
            kind: err.kind,
            message: err.message.clone(),
        });
    }

    /// Spawn a task forwarding every event to `observer` until the engine
    /// drops its last sender. Lagged receivers skip, they don't block.
    pub fn attach_observer(&self, observer: std::sync::Arc<dyn Observer>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(EngineEvent::State { job_id, old, new }) => {
                        observer.on_state(&job_id, old, new)
                    }
                    Ok(EngineEvent::Progress {
                        job_id,
                        downloaded_bytes,
                        total_bytes,
                        rate_bytes_per_sec,
                        eta_seconds,
                    }) => observer.on_progress(
                        &job_id,
                        downloaded_bytes,
                        total_bytes,
                        rate_bytes_per_sec,
                        eta_seconds,
                    ),
                    Ok(EngineEvent::Error {
                        job_id,
                        kind,
                        message,
                    }) => observer.on_error(&job_id, kind, &message),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "observer lagged, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_state_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.state("j1", JobStatus::Pending, JobStatus::Probing);
        match rx.recv().await.unwrap() {
            EngineEvent::State { job_id, old, new } => {
                assert_eq!(job_id, "j1");
                assert_eq!(old, JobStatus::Pending);
                assert_eq!(new, JobStatus::Probing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        bus.progress("j1", 10, Some(100), 1.0, Some(90.0));
    }
}
