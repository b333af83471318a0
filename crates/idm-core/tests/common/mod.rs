pub mod range_server;

use idm_core::config::EngineConfig;
use idm_core::events::EngineEvent;
use idm_core::job::JobStatus;
use idm_core::Engine;
use std::path::Path;
use std::time::Duration;

/// Engine config rooted in a scratch dir, tuned for fast tests.
pub fn test_config(root: &Path) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.download_dir = root.join("downloads");
    cfg.temp_root = root.join("temp");
    cfg.max_connections = 4;
    cfg.segment_size_hint = 16 * 1024;
    cfg.connect_timeout = Duration::from_secs(5);
    cfg.read_timeout = Duration::from_secs(5);
    cfg.verify_checksums = true;
    std::fs::create_dir_all(&cfg.download_dir).unwrap();
    cfg
}

/// Wait until `job_id` reaches `wanted` (or fail after `timeout`).
pub async fn wait_for_status(
    engine: &Engine,
    job_id: &str,
    wanted: JobStatus,
    timeout: Duration,
) {
    let mut rx = engine.subscribe();
    let deadline = tokio::time::Instant::now() + timeout;
    // The transition may already have happened; poll the snapshot first.
    loop {
        let jobs = engine.list().await.unwrap();
        if jobs.iter().any(|j| j.id == job_id && j.status == wanted) {
            return;
        }
        let next = tokio::time::timeout_at(deadline, rx.recv()).await;
        match next {
            Ok(Ok(EngineEvent::State { job_id: id, new, .. }))
                if id == job_id && new == wanted =>
            {
                return;
            }
            Ok(Ok(_)) => continue,
            Ok(Err(_)) => panic!("event bus closed before {} reached {}", job_id, wanted),
            Err(_) => {
                let jobs = engine.list().await.unwrap();
                let state = jobs
                    .iter()
                    .find(|j| j.id == job_id)
                    .map(|j| (j.status, j.last_error.clone()));
                panic!(
                    "timeout waiting for {} to reach {}; currently {:?}",
                    job_id, wanted, state
                );
            }
        }
    }
}
