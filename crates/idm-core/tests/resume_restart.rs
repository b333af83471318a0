//! Integration: pause/resume, restart-from-manifest, and dead-link refresh.

mod common;

use common::range_server;
use idm_core::extractor::{Extracted, InfoExtractor, NullExtractor};
use idm_core::job::JobStatus;
use idm_core::muxer::NoMuxer;
use idm_core::{DownloadSpec, Engine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_resume_round_trip_is_bit_exact() {
    let body = test_body(256 * 1024);
    let server = range_server::start_with_options(
        body.clone(),
        range_server::RangeServerOptions {
            etag: Some("\"stable\"".into()),
            ..Default::default()
        },
    );
    let root = tempdir().unwrap();
    let engine = Engine::spawn(
        common::test_config(root.path()),
        Arc::new(NullExtractor),
        Arc::new(NoMuxer),
    );
    engine.set_global_speed_limit(128 * 1024);

    let id = engine.submit(DownloadSpec::new(&server.url)).await.unwrap();
    engine.start(&id).await.unwrap();
    common::wait_for_status(&engine, &id, JobStatus::Running, Duration::from_secs(10)).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.pause(&id).await.unwrap();
    common::wait_for_status(&engine, &id, JobStatus::Paused, Duration::from_secs(10)).await;

    let paused_at = {
        let jobs = engine.list().await.unwrap();
        jobs.iter().find(|j| j.id == id).unwrap().downloaded_bytes
    };
    assert!(paused_at < body.len() as u64, "pause should precede completion");

    engine.set_global_speed_limit(0);
    engine.start(&id).await.unwrap();
    common::wait_for_status(&engine, &id, JobStatus::Completed, Duration::from_secs(30)).await;

    let jobs = engine.list().await.unwrap();
    let job = jobs.iter().find(|j| j.id == id).unwrap();
    assert_eq!(std::fs::read(&job.final_path).unwrap(), body);
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_resumes_from_manifest() {
    let body = test_body(256 * 1024);
    let server = range_server::start_with_options(
        body.clone(),
        range_server::RangeServerOptions {
            etag: Some("\"stable\"".into()),
            ..Default::default()
        },
    );
    let root = tempdir().unwrap();
    let cfg = common::test_config(root.path());

    // First engine: download partially, pause (persists the manifest), drop.
    let paused_at;
    {
        let engine = Engine::spawn(
            cfg.clone(),
            Arc::new(NullExtractor),
            Arc::new(NoMuxer),
        );
        engine.set_global_speed_limit(128 * 1024);
        let id = engine.submit(DownloadSpec::new(&server.url)).await.unwrap();
        engine.start(&id).await.unwrap();
        common::wait_for_status(&engine, &id, JobStatus::Running, Duration::from_secs(10)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        engine.pause(&id).await.unwrap();
        common::wait_for_status(&engine, &id, JobStatus::Paused, Duration::from_secs(10)).await;
        let jobs = engine.list().await.unwrap();
        paused_at = jobs.iter().find(|j| j.id == id).unwrap().downloaded_bytes;
    }

    // Second engine over the same directories: restore and finish.
    let engine = Engine::spawn(cfg, Arc::new(NullExtractor), Arc::new(NoMuxer));
    let restored = engine.restore_jobs().await.unwrap();
    assert_eq!(restored, 1);

    let jobs = engine.list().await.unwrap();
    assert_eq!(jobs.len(), 1);
    let id = jobs[0].id.clone();
    assert!(
        jobs[0].downloaded_bytes >= paused_at.saturating_sub(64 * 1024),
        "restored progress should be near the paused progress"
    );

    common::wait_for_status(&engine, &id, JobStatus::Completed, Duration::from_secs(30)).await;
    let jobs = engine.list().await.unwrap();
    let job = jobs.iter().find(|j| j.id == id).unwrap();
    assert_eq!(std::fs::read(&job.final_path).unwrap(), body);
}

/// Extractor that redirects refreshes to a second server.
struct RedirectingExtractor {
    fresh_url: Mutex<String>,
    refresh_calls: AtomicUsize,
}

impl InfoExtractor for RedirectingExtractor {
    fn extract(&self, url: &str) -> anyhow::Result<Extracted> {
        Ok(Extracted::PlainResource {
            url: url.to_string(),
        })
    }

    fn refresh(&self, _url: &str) -> anyhow::Result<Extracted> {
        self.refresh_calls.fetch_add(1, Ordering::Relaxed);
        Ok(Extracted::PlainResource {
            url: self.fresh_url.lock().unwrap().clone(),
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_link_refreshes_and_resumes() {
    let body = test_body(256 * 1024);
    let opts = range_server::RangeServerOptions {
        etag: Some("\"same-content\"".into()),
        ..Default::default()
    };
    let server_a = range_server::start_with_options(body.clone(), opts.clone());
    let server_b = range_server::start_with_options(body.clone(), opts);

    let extractor = Arc::new(RedirectingExtractor {
        fresh_url: Mutex::new(server_b.url.clone()),
        refresh_calls: AtomicUsize::new(0),
    });

    let root = tempdir().unwrap();
    let engine = Engine::spawn(
        common::test_config(root.path()),
        Arc::clone(&extractor) as Arc<dyn InfoExtractor>,
        Arc::new(NoMuxer),
    );
    engine.set_global_speed_limit(128 * 1024);

    let id = engine.submit(DownloadSpec::new(&server_a.url)).await.unwrap();
    engine.start(&id).await.unwrap();
    common::wait_for_status(&engine, &id, JobStatus::Running, Duration::from_secs(10)).await;

    // Mid-download the old link dies: every further range on A gets 416.
    tokio::time::sleep(Duration::from_millis(500)).await;
    server_a.force_416.store(true, Ordering::Relaxed);
    engine.set_global_speed_limit(0);

    common::wait_for_status(&engine, &id, JobStatus::Completed, Duration::from_secs(30)).await;
    assert!(
        extractor.refresh_calls.load(Ordering::Relaxed) >= 1,
        "refresh must have been consulted"
    );

    let jobs = engine.list().await.unwrap();
    let job = jobs.iter().find(|j| j.id == id).unwrap();
    assert_eq!(std::fs::read(&job.final_path).unwrap(), body);
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_to_changed_content_fails_the_job() {
    let body_a = test_body(128 * 1024);
    // Different size: the refresh validation must refuse to resume.
    let body_b = test_body(64 * 1024);
    let server_a = range_server::start_with_options(
        body_a,
        range_server::RangeServerOptions {
            etag: Some("\"a\"".into()),
            ..Default::default()
        },
    );
    let server_b = range_server::start_with_options(
        body_b,
        range_server::RangeServerOptions {
            etag: Some("\"b\"".into()),
            ..Default::default()
        },
    );

    let extractor = Arc::new(RedirectingExtractor {
        fresh_url: Mutex::new(server_b.url.clone()),
        refresh_calls: AtomicUsize::new(0),
    });

    let root = tempdir().unwrap();
    let engine = Engine::spawn(
        common::test_config(root.path()),
        Arc::clone(&extractor) as Arc<dyn InfoExtractor>,
        Arc::new(NoMuxer),
    );
    engine.set_global_speed_limit(64 * 1024);

    let id = engine.submit(DownloadSpec::new(&server_a.url)).await.unwrap();
    engine.start(&id).await.unwrap();
    common::wait_for_status(&engine, &id, JobStatus::Running, Duration::from_secs(10)).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    server_a.force_416.store(true, Ordering::Relaxed);
    engine.set_global_speed_limit(0);

    common::wait_for_status(&engine, &id, JobStatus::Error, Duration::from_secs(30)).await;
    let jobs = engine.list().await.unwrap();
    let job = jobs.iter().find(|j| j.id == id).unwrap();
    assert_eq!(
        job.last_error.as_ref().map(|e| e.kind),
        Some(idm_core::ErrorKind::ContentChanged)
    );
}
