//! Dead-link refresh: re-derive direct URLs and validate that the resource
//! is still the same bytes before resuming.

use super::prepare::{probe_env, request_from_conn};
use crate::config::EngineConfig;
use crate::error::{ErrorKind, JobError};
use crate::extractor::{Extracted, InfoExtractor, Protocol};
use crate::job::{Job, SegmentSlot, SegmentSource};
use crate::probe::probe;
use crate::video::{fetch_and_expand, MediaKind};
use std::sync::Arc;

/// Obtain fresh URLs/headers for `job` and validate them against what was
/// downloaded so far. Blocking; run on the blocking pool.
pub(crate) fn refresh_job(
    job: &Arc<Job>,
    cfg: &EngineConfig,
    extractor: &dyn InfoExtractor,
) -> Result<(), JobError> {
    let extracted = extractor
        .refresh(&job.source_url)
        .map_err(|e| JobError::new(ErrorKind::RefreshFailed, format!("extractor: {}", e)))?;

    match extracted {
        Extracted::PlainResource { url } => refresh_plain(job, cfg, url),
        Extracted::Media(info) => {
            let format = info.video_format().ok_or_else(|| {
                JobError::new(ErrorKind::RefreshFailed, "refresh returned no usable format")
            })?;
            let mut headers = job.conn().headers;
            for (k, v) in &format.http_headers {
                if !headers.iter().any(|(hk, _)| hk == k) {
                    headers.push((k.clone(), v.clone()));
                }
            }
            match (job.media_plan().map(|p| p.kind), format.protocol) {
                (Some(MediaKind::Hls), Protocol::Hls) => {
                    refresh_hls(job, cfg, format.url.clone(), headers)
                }
                _ => refresh_plain(job, cfg, format.url.clone()),
            }
        }
        Extracted::Playlist { .. } => Err(JobError::new(
            ErrorKind::RefreshFailed,
            "refresh returned a playlist",
        )),
    }
}

/// New direct URL for a byte-range job: probe it and require the same size
/// and validator before touching the connection settings.
fn refresh_plain(job: &Arc<Job>, cfg: &EngineConfig, url: String) -> Result<(), JobError> {
    let mut conn = job.conn();
    conn.effective_url = url;

    let result = probe(&conn, &probe_env(cfg), job.control.cancel_token())?;
    let old = job.discovered();

    if old.total_size.is_some() && result.total_size != old.total_size {
        return Err(JobError::new(
            ErrorKind::ContentChanged,
            format!(
                "size changed across refresh: {:?} -> {:?}",
                old.total_size, result.total_size
            ),
        ));
    }
    if let (Some(old_etag), Some(new_etag)) = (&old.etag, &result.etag) {
        if old_etag != new_etag {
            return Err(JobError::new(
                ErrorKind::ContentChanged,
                format!("etag changed across refresh: {} -> {}", old_etag, new_etag),
            ));
        }
    }

    conn.effective_url = result.effective_url.clone();
    let mut discovered = result.into_discovered();
    // Keep the filename decided at admission.
    discovered.server_filename = old.server_filename;
    job.set_discovered(discovered);
    job.set_conn(conn);
    tracing::info!(job = %job.id, "refreshed direct url");
    Ok(())
}

/// New playlist for an HLS job: fragment URLs are replaced wholesale, but the
/// sequence window must still match the frozen plan (a rewound or re-cut
/// playlist would silently corrupt the concat).
fn refresh_hls(
    job: &Arc<Job>,
    cfg: &EngineConfig,
    playlist_url: String,
    headers: Vec<(String, String)>,
) -> Result<(), JobError> {
    let mut conn = job.conn();
    conn.effective_url = playlist_url;
    conn.headers = headers;

    let req = request_from_conn(&conn, cfg);
    let expanded = fetch_and_expand(&req, job.control.cancel_token())
        .map_err(|e| JobError { kind: ErrorKind::RefreshFailed, ..e })?;

    let plan = job
        .media_plan()
        .ok_or_else(|| JobError::new(ErrorKind::Internal, "hls refresh without a media plan"))?;
    let old_segments = job.segments();

    if expanded.media_sequence != plan.media_sequence
        || expanded.segments.len() != old_segments.len()
    {
        return Err(JobError::new(
            ErrorKind::ContentChanged,
            format!(
                "playlist no longer aligns (sequence {} -> {}, {} -> {} fragments)",
                plan.media_sequence,
                expanded.media_sequence,
                old_segments.len(),
                expanded.segments.len()
            ),
        ));
    }

    // Same window: swap in the fresh URLs, keeping completed progress.
    let slots: Vec<Arc<SegmentSlot>> = expanded
        .segments
        .into_iter()
        .zip(old_segments.iter())
        .map(|(source, old)| {
            debug_assert!(matches!(source, SegmentSource::Media { .. }));
            let slot = SegmentSlot::new(old.index, source, old.path.clone());
            slot.set_bytes_written(old.bytes_written());
            slot.set_state(old.state());
            Arc::new(slot)
        })
        .collect();
    job.set_segments(slots);
    job.set_conn(conn);
    tracing::info!(job = %job.id, "refreshed hls playlist");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::extractor::NullExtractor;
    use crate::job::DownloadSpec;

    /// Extractor whose refresh always errors; the job must fail with
    /// `RefreshFailed`, not hang or panic.
    struct BrokenExtractor;

    impl InfoExtractor for BrokenExtractor {
        fn extract(&self, _: &str) -> anyhow::Result<Extracted> {
            anyhow::bail!("nope")
        }

        fn refresh(&self, _: &str) -> anyhow::Result<Extracted> {
            anyhow::bail!("expired beyond recovery")
        }
    }

    #[test]
    fn extractor_failure_maps_to_refresh_failed() {
        let cfg = EngineConfig::default();
        let job = Arc::new(Job::from_spec(
            "r1".into(),
            &DownloadSpec::new("http://example.com/gone"),
            &cfg,
        ));
        let err = refresh_job(&job, &cfg, &BrokenExtractor).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RefreshFailed);
    }

    #[test]
    fn plain_refresh_probe_failure_propagates() {
        let cfg = EngineConfig::default();
        // NullExtractor hands the URL back; the probe against a dead port
        // fails, which must surface as an error, not a silent resume.
        let job = Arc::new(Job::from_spec(
            "r2".into(),
            &DownloadSpec::new("http://127.0.0.1:9/dead"),
            &cfg,
        ));
        let err = refresh_job(&job, &cfg, &NullExtractor).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::ProbeFailed | ErrorKind::RefreshFailed
        ));
    }
}
