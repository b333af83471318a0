//! Probing and segment planning: everything that happens between `Probing`
//! and `Queued`. Blocking; the scheduler runs it on the blocking pool.

use crate::config::EngineConfig;
use crate::error::{ErrorKind, JobError};
use crate::extractor::{Extracted, Format, InfoExtractor, MediaInfo, Protocol};
use crate::job::{
    plan_ranges, plan_segment_count, ConnectionSettings, Discovered, Job, SegmentSlot,
    SegmentSource,
};
use crate::probe::{probe, ProbeEnv};
use crate::store;
use crate::transport::{Method, TransportRequest};
use crate::url_model::sanitize_filename;
use crate::video::{fetch_and_expand, MediaKind, MediaPlan, TrackSource};
use std::sync::Arc;

pub(crate) fn probe_env(cfg: &EngineConfig) -> ProbeEnv {
    ProbeEnv {
        connect_timeout: cfg.connect_timeout,
        read_timeout: cfg.read_timeout,
        verify_tls: cfg.verify_tls,
    }
}

pub(crate) fn request_from_conn(conn: &ConnectionSettings, cfg: &EngineConfig) -> TransportRequest {
    TransportRequest {
        url: conn.effective_url.clone(),
        method: Method::Get,
        range: None,
        headers: conn.headers.clone(),
        proxy: conn.proxy.clone(),
        auth: conn.auth.clone(),
        cookie_header: conn.cookie_header.clone(),
        connect_timeout: cfg.connect_timeout,
        read_timeout: cfg.read_timeout,
        verify_tls: cfg.verify_tls,
        follow_redirects: true,
    }
}

/// Resolve what the job actually downloads and freeze its segment set.
pub(crate) fn prepare_job(
    job: &Arc<Job>,
    cfg: &EngineConfig,
    extractor: &dyn InfoExtractor,
) -> Result<(), JobError> {
    let extracted = extractor
        .extract(&job.source_url)
        .map_err(|e| JobError::new(ErrorKind::ProbeFailed, format!("extractor: {}", e)))?;

    match extracted {
        Extracted::PlainResource { url } => prepare_plain(job, cfg, &url),
        Extracted::Media(info) => prepare_media(job, cfg, &info),
        Extracted::Playlist { .. } => Err(JobError::new(
            ErrorKind::ProbeFailed,
            "playlists must be expanded into individual submissions",
        )),
    }
}

fn prepare_plain(job: &Arc<Job>, cfg: &EngineConfig, url: &str) -> Result<(), JobError> {
    let mut conn = job.conn();
    conn.effective_url = url.to_string();

    let result = probe(&conn, &probe_env(cfg), job.control.cancel_token())?;

    conn.effective_url = result.effective_url.clone();
    if !job.explicit_filename {
        job.set_final_path(job.final_path().join(&result.server_filename));
    }
    let discovered = result.into_discovered();
    plan_plain_segments(job, &discovered);
    job.set_discovered(discovered);
    job.set_conn(conn);
    job.set_media_plan(None);
    Ok(())
}

/// Range segments for a resumable known size, one `Whole` segment otherwise.
fn plan_plain_segments(job: &Job, discovered: &Discovered) {
    let slots = match (discovered.resumable, discovered.total_size) {
        (true, Some(total)) => {
            let count = plan_segment_count(
                total,
                job.policy.segment_size_hint,
                job.policy.max_connections,
            );
            plan_ranges(total, count)
                .into_iter()
                .enumerate()
                .map(|(i, (start, end))| {
                    Arc::new(SegmentSlot::new(
                        i,
                        SegmentSource::Range { start, end },
                        store::part_path(&job.temp_dir, i),
                    ))
                })
                .collect()
        }
        _ => vec![Arc::new(SegmentSlot::new(
            0,
            SegmentSource::Whole,
            store::part_path(&job.temp_dir, 0),
        ))],
    };
    job.set_segments(slots);
}

fn prepare_media(job: &Arc<Job>, cfg: &EngineConfig, info: &MediaInfo) -> Result<(), JobError> {
    if info.is_live {
        return Err(JobError::new(
            ErrorKind::ProbeFailed,
            "live streams are not downloadable",
        ));
    }
    let format = info
        .video_format()
        .ok_or_else(|| JobError::new(ErrorKind::ProbeFailed, "no downloadable format"))?;

    let mut conn = job.conn();
    conn.effective_url = format.url.clone();
    for (k, v) in &format.http_headers {
        conn.headers.push((k.clone(), v.clone()));
    }

    if !job.explicit_filename {
        let name = sanitize_filename(&format!("{}.{}", info.title, info.ext));
        job.set_final_path(job.final_path().join(name));
    }

    let audio = info.audio_format().map(|f| track_source(f));
    let mut plan = MediaPlan {
        kind: MediaKind::Plain,
        container_ext: info.ext.clone(),
        media_sequence: 0,
        audio,
        subtitles: info.subtitles.clone(),
        metadata: info.metadata.clone(),
        decryption_key_hex: format.decryption_key.clone(),
    };

    match format.protocol {
        Protocol::Hls => {
            let req = request_from_conn(&conn, cfg);
            let expanded = fetch_and_expand(&req, job.control.cancel_token())?;
            plan.kind = MediaKind::Hls;
            plan.media_sequence = expanded.media_sequence;
            install_media_segments(job, expanded.segments);
            job.set_discovered(Discovered {
                total_size: None,
                resumable: false,
                server_filename: None,
                content_type: Some("video/MP2T".to_string()),
                etag: None,
                last_modified: None,
            });
        }
        Protocol::Dash if !format.fragments.is_empty() => {
            plan.kind = MediaKind::Dash;
            let sources = format
                .fragments
                .iter()
                .enumerate()
                .map(|(i, frag)| SegmentSource::Media {
                    url: frag.url.clone(),
                    sequence: i as u64,
                    byterange: frag.byte_range,
                    key_url: None,
                    iv_hex: None,
                })
                .collect();
            install_media_segments(job, sources);
            let total = format
                .fragments
                .iter()
                .map(|f| f.byte_range.map(|(s, e)| e.saturating_sub(s)))
                .sum::<Option<u64>>();
            job.set_discovered(Discovered {
                total_size: total.or(format.filesize),
                resumable: false,
                ..Default::default()
            });
        }
        Protocol::Http | Protocol::Dash => {
            // Progressive file; probe and segment like a plain download.
            let result = probe(&conn, &probe_env(cfg), job.control.cancel_token())?;
            conn.effective_url = result.effective_url.clone();
            let discovered = result.into_discovered();
            plan_plain_segments(job, &discovered);
            job.set_discovered(discovered);
            // A separate audio track still needs the merge pipeline.
            if plan.audio.is_some() {
                plan.kind = MediaKind::Dash;
            }
        }
        Protocol::Mhtml => {
            return Err(JobError::new(
                ErrorKind::ProbeFailed,
                "mhtml formats are not downloadable",
            ));
        }
    }

    job.set_conn(conn);
    let keep_plan = plan.kind != MediaKind::Plain
        || !plan.subtitles.is_empty()
        || plan.metadata.title.is_some();
    job.set_media_plan(keep_plan.then_some(plan));
    Ok(())
}

fn track_source(f: &Format) -> TrackSource {
    TrackSource {
        url: f.url.clone(),
        protocol: f.protocol,
        headers: f.http_headers.clone(),
        fragments: f.fragments.clone(),
        decryption_key_hex: f.decryption_key.clone(),
    }
}

fn install_media_segments(job: &Job, sources: Vec<SegmentSource>) {
    let slots = sources
        .into_iter()
        .enumerate()
        .map(|(i, source)| {
            Arc::new(SegmentSlot::new(
                i,
                source,
                store::part_path(&job.temp_dir, i),
            ))
        })
        .collect();
    job.set_segments(slots);
}

/// Build the in-memory child job for an audio track. Not registered in the
/// registry; it lives inside the parent's temp dir and the parent's driver.
pub(crate) fn audio_child_job(
    parent: &Arc<Job>,
    track: &TrackSource,
    cfg: &EngineConfig,
) -> Result<Job, JobError> {
    let parent_conn = parent.conn();
    let mut headers = parent_conn.headers.clone();
    for (k, v) in &track.headers {
        headers.push((k.clone(), v.clone()));
    }
    let conn = ConnectionSettings {
        effective_url: track.url.clone(),
        headers,
        proxy: parent_conn.proxy.clone(),
        auth: parent_conn.auth.clone(),
        cookie_header: parent_conn.cookie_header.clone(),
    };
    let temp_dir = parent.temp_dir.join("audio");
    let child = Job::restore(
        format!("{}-audio", parent.id),
        track.url.clone(),
        conn.clone(),
        temp_dir.join("unused"),
        Discovered::default(),
        parent.policy.max_connections,
        parent.policy.segment_size_hint,
        None,
        temp_dir,
        None,
    );

    match track.protocol {
        Protocol::Hls => {
            let req = request_from_conn(&conn, cfg);
            let expanded = fetch_and_expand(&req, parent.control.cancel_token())?;
            install_media_segments(&child, expanded.segments);
        }
        _ if !track.fragments.is_empty() => {
            let sources = track
                .fragments
                .iter()
                .enumerate()
                .map(|(i, frag)| SegmentSource::Media {
                    url: frag.url.clone(),
                    sequence: i as u64,
                    byterange: frag.byte_range,
                    key_url: None,
                    iv_hex: None,
                })
                .collect();
            install_media_segments(&child, sources);
        }
        _ => {
            child.set_segments(vec![Arc::new(SegmentSlot::new(
                0,
                SegmentSource::Whole,
                store::part_path(&child.temp_dir, 0),
            ))]);
        }
    }

    Ok(child)
}
