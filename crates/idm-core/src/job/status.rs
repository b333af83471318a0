//! Job status and legal transitions.

use serde::{Deserialize, Serialize};

/// High-level job state. Only the scheduler writes it; workers emit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Probing,
    Queued,
    Running,
    Paused,
    Merging,
    Completed,
    Error,
    Cancelled,
    Refreshing,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Probing => "probing",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Merging => "merging",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Refreshing => "refreshing",
        }
    }

    /// Terminal states free scheduler slots and quiesce workers for good.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Whether the scheduler may move a job from `self` to `to`.
    ///
    /// `Cancelled` is reachable from any non-terminal state; the rest follows
    /// the state diagram: Pending→Probing→Queued→Running→{Paused, Merging,
    /// Refreshing, Completed}, Paused→Queued, Refreshing→Queued.
    pub fn can_transition(self, to: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        if to == Cancelled || to == Error {
            return true;
        }
        matches!(
            (self, to),
            (Pending, Probing)
                | (Probing, Queued)
                | (Queued, Running)
                | (Running, Paused)
                | (Running, Merging)
                | (Running, Refreshing)
                | (Running, Completed)
                // Transient-failure requeue (cool-down re-admission).
                | (Running, Queued)
                | (Merging, Completed)
                | (Paused, Queued)
                | (Refreshing, Queued)
                | (Probing, Refreshing)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        assert!(JobStatus::Pending.can_transition(JobStatus::Probing));
        assert!(JobStatus::Probing.can_transition(JobStatus::Queued));
        assert!(JobStatus::Queued.can_transition(JobStatus::Running));
        assert!(JobStatus::Running.can_transition(JobStatus::Merging));
        assert!(JobStatus::Merging.can_transition(JobStatus::Completed));
    }

    #[test]
    fn pause_resume_and_refresh_cycles() {
        assert!(JobStatus::Running.can_transition(JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition(JobStatus::Queued));
        assert!(JobStatus::Running.can_transition(JobStatus::Refreshing));
        assert!(JobStatus::Refreshing.can_transition(JobStatus::Queued));
    }

    #[test]
    fn terminal_states_are_sticky() {
        for t in [JobStatus::Completed, JobStatus::Error, JobStatus::Cancelled] {
            assert!(t.is_terminal());
            assert!(!t.can_transition(JobStatus::Queued));
            assert!(!t.can_transition(JobStatus::Cancelled));
        }
    }

    #[test]
    fn cancel_from_any_live_state() {
        for s in [
            JobStatus::Pending,
            JobStatus::Probing,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Merging,
            JobStatus::Refreshing,
        ] {
            assert!(s.can_transition(JobStatus::Cancelled));
        }
    }

    #[test]
    fn no_skipping_admission() {
        assert!(!JobStatus::Pending.can_transition(JobStatus::Running));
        assert!(!JobStatus::Paused.can_transition(JobStatus::Running));
    }
}
