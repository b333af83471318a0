//! Post-download stages for media jobs: decrypt → concat → merge/remux →
//! tag → subtitles.

use super::decrypt::{decrypt_part_file, derive_iv, KeyCache};
use super::{MediaKind, MediaPlan};
use crate::assembler::{resolve_target, stream_concat};
use crate::config::CollisionPolicy;
use crate::error::{ErrorKind, JobError};
use crate::job::{Job, RunState, SegmentSource};
use crate::muxer::{MediaMuxer, MuxOutcome};
use crate::store;
use crate::transport::{self, CancelToken, Method, SinkControl, TransportRequest};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Knobs the pipeline inherits from the engine config.
#[derive(Debug, Clone, Copy)]
pub struct PipelineEnv {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub verify_tls: bool,
    pub write_metadata: bool,
    pub collision: CollisionPolicy,
}

/// Finish a media job whose segments are all downloaded.
///
/// `audio_intermediate` is the already-assembled audio track file when the
/// plan has a separate audio child. Returns the final path. On failure the
/// temp dir survives for a retry; on success it is removed.
pub fn post_process(
    job: &Job,
    plan: &MediaPlan,
    audio_intermediate: Option<&Path>,
    muxer: &dyn MediaMuxer,
    env: &PipelineEnv,
) -> Result<PathBuf, JobError> {
    if plan.kind == MediaKind::Plain {
        return Err(JobError::new(
            ErrorKind::Internal,
            "plain media takes the assembler path, not the pipeline",
        ));
    }

    decrypt_fragments(job, plan, env)?;

    let concat = job.temp_dir.join("video-concat.bin");
    let sources: Vec<PathBuf> = job.segments().iter().map(|s| s.path.clone()).collect();
    let cancelled = || job.control.get() == RunState::Cancelled;
    stream_concat(&sources, &concat, false, cancelled)?;
    check_cancel(job)?;

    let target = resolve_target(&job.final_path(), env.collision);

    let mux_result = match (audio_intermediate, plan.kind) {
        (Some(audio), _) => muxer.merge(&concat, audio, &target),
        (None, MediaKind::Hls) => muxer.mux_hls(&concat, &target),
        (None, _) => move_file(&concat, &target),
    };
    if let MuxOutcome::Error(msg) = mux_result {
        let _ = std::fs::remove_file(&target);
        return Err(JobError::new(ErrorKind::MuxFailed, msg));
    }
    check_cancel(job)?;

    if env.write_metadata && has_tags(plan) {
        // Tagging is cosmetic; a failure is logged, not fatal.
        if let MuxOutcome::Error(msg) = muxer.tag(&target, &plan.metadata) {
            tracing::warn!(job = %job.id, "metadata tagging failed: {}", msg);
        }
    }

    fetch_subtitles(job, plan, &target, env);

    if let Err(e) = store::remove_temp_dir(&job.temp_dir) {
        tracing::warn!(job = %job.id, "leaving temp dir behind: {}", e);
    }

    Ok(target)
}

/// Extras for progressive media that went through the plain assembler:
/// metadata tagging and subtitle sidecars still apply.
pub fn plain_extras(
    job: &Job,
    plan: &MediaPlan,
    target: &Path,
    muxer: &dyn MediaMuxer,
    env: &PipelineEnv,
) {
    if env.write_metadata && has_tags(plan) {
        if let MuxOutcome::Error(msg) = muxer.tag(target, &plan.metadata) {
            tracing::warn!(job = %job.id, "metadata tagging failed: {}", msg);
        }
    }
    fetch_subtitles(job, plan, target, env);
}

/// Decrypt a track's fragments and concatenate them into `out`, without any
/// muxer involvement. Used for audio child tracks.
pub fn concat_track(
    job: &Job,
    plan: &MediaPlan,
    out: &Path,
    env: &PipelineEnv,
) -> Result<(), JobError> {
    decrypt_fragments(job, plan, env)?;
    let sources: Vec<PathBuf> = job.segments().iter().map(|s| s.path.clone()).collect();
    let cancelled = || job.control.get() == RunState::Cancelled;
    stream_concat(&sources, out, false, cancelled)?;
    Ok(())
}

/// Decrypt every keyed fragment in place, fetching keys on first use.
fn decrypt_fragments(job: &Job, plan: &MediaPlan, env: &PipelineEnv) -> Result<(), JobError> {
    let cache = KeyCache::new();
    let template = key_request_template(job, env);
    let cancel = job.control.cancel_token();

    for slot in job.segments().iter() {
        check_cancel(job)?;
        let SegmentSource::Media {
            sequence,
            key_url: Some(key_url),
            iv_hex,
            ..
        } = &slot.source
        else {
            continue;
        };
        if let Some(hex_key) = &plan.decryption_key_hex {
            cache.seed_hex(key_url, hex_key)?;
        }
        let key = cache.get(key_url, &template, cancel)?;
        let iv = derive_iv(iv_hex.as_deref(), *sequence)?;
        decrypt_part_file(&slot.path, &key, &iv)?;
    }
    Ok(())
}

fn key_request_template(job: &Job, env: &PipelineEnv) -> TransportRequest {
    let conn = job.conn();
    TransportRequest {
        url: conn.effective_url,
        method: Method::Get,
        range: None,
        headers: conn.headers,
        proxy: conn.proxy,
        auth: conn.auth,
        cookie_header: conn.cookie_header,
        connect_timeout: env.connect_timeout,
        read_timeout: env.read_timeout,
        verify_tls: env.verify_tls,
        follow_redirects: true,
    }
}

/// Best-effort sidecar subtitle downloads next to the final file.
fn fetch_subtitles(job: &Job, plan: &MediaPlan, target: &Path, env: &PipelineEnv) {
    if plan.subtitles.is_empty() {
        return;
    }
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "subtitles".to_string());
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    for sub in &plan.subtitles {
        let mut req = key_request_template(job, env);
        req.url = sub.url.clone();
        let path = dir.join(format!("{}.{}.{}", stem, sub.lang, sub.ext));
        match download_to_file(&req, &path, job.control.cancel_token()) {
            Ok(()) => tracing::info!(job = %job.id, "subtitle saved: {}", path.display()),
            Err(e) => tracing::warn!(job = %job.id, lang = %sub.lang, "subtitle failed: {}", e),
        }
    }
}

fn download_to_file(
    req: &TransportRequest,
    path: &Path,
    cancel: &CancelToken,
) -> Result<(), JobError> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)
        .map_err(|e| JobError::new(ErrorKind::WritePermission, e.to_string()))?;
    let mut failed = None;
    transport::fetch(req, cancel, |chunk, _| {
        if let Err(e) = file.write_all(chunk) {
            failed = Some(e);
            return SinkControl::Abort;
        }
        SinkControl::Continue
    })
    .map_err(|e| JobError::new(ErrorKind::TransportFatal, e.to_string()))?;
    match failed {
        Some(e) => {
            let _ = std::fs::remove_file(path);
            Err(JobError::new(ErrorKind::WritePermission, e.to_string()))
        }
        None => Ok(()),
    }
}

fn move_file(from: &Path, to: &Path) -> MuxOutcome {
    if std::fs::rename(from, to).is_ok() {
        return MuxOutcome::Ok;
    }
    // Cross-device fallback.
    match std::fs::copy(from, to) {
        Ok(_) => {
            let _ = std::fs::remove_file(from);
            MuxOutcome::Ok
        }
        Err(e) => MuxOutcome::Error(format!("move {}: {}", from.display(), e)),
    }
}

fn check_cancel(job: &Job) -> Result<(), JobError> {
    if job.control.get() == RunState::Cancelled {
        return Err(JobError::new(ErrorKind::Cancelled, "cancelled during post-processing"));
    }
    Ok(())
}

fn has_tags(plan: &MediaPlan) -> bool {
    let m = &plan.metadata;
    m.title.is_some() || m.artist.is_some() || m.description.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::extractor::MediaMetadata;
    use crate::job::{DownloadSpec, SegmentSlot, SegmentState};
    use std::sync::{Arc, Mutex};

    /// Muxer that records calls and concatenates inputs so tests can check
    /// plumbing without ffmpeg.
    struct FakeMuxer {
        calls: Mutex<Vec<String>>,
    }

    impl FakeMuxer {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl MediaMuxer for FakeMuxer {
        fn merge(&self, video: &Path, audio: &Path, out: &Path) -> MuxOutcome {
            self.calls.lock().unwrap().push("merge".into());
            let mut data = std::fs::read(video).unwrap();
            data.extend(std::fs::read(audio).unwrap());
            std::fs::write(out, data).unwrap();
            MuxOutcome::Ok
        }

        fn mux_hls(&self, ts: &Path, out: &Path) -> MuxOutcome {
            self.calls.lock().unwrap().push("mux_hls".into());
            std::fs::copy(ts, out).unwrap();
            MuxOutcome::Ok
        }

        fn tag(&self, _: &Path, _: &MediaMetadata) -> MuxOutcome {
            self.calls.lock().unwrap().push("tag".into());
            MuxOutcome::Ok
        }
    }

    fn env() -> PipelineEnv {
        PipelineEnv {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            verify_tls: false,
            write_metadata: false,
            collision: CollisionPolicy::Rename,
        }
    }

    fn hls_job(root: &Path, fragments: &[&[u8]]) -> (Job, MediaPlan) {
        let mut cfg = EngineConfig::default();
        cfg.temp_root = root.join("tmp");
        cfg.download_dir = root.join("out");
        std::fs::create_dir_all(root.join("out")).unwrap();
        let job = Job::from_spec(
            "m1".into(),
            &DownloadSpec {
                filename: Some("clip.mp4".into()),
                ..DownloadSpec::new("http://example.com/index.m3u8")
            },
            &cfg,
        );
        std::fs::create_dir_all(&job.temp_dir).unwrap();
        let mut slots = Vec::new();
        for (i, data) in fragments.iter().enumerate() {
            let path = store::part_path(&job.temp_dir, i);
            std::fs::write(&path, data).unwrap();
            let slot = SegmentSlot::new(
                i,
                SegmentSource::Media {
                    url: format!("http://example.com/seg{}.ts", i),
                    sequence: i as u64,
                    byterange: None,
                    key_url: None,
                    iv_hex: None,
                },
                path,
            );
            slot.set_bytes_written(data.len() as u64);
            slot.set_state(SegmentState::Done);
            slots.push(Arc::new(slot));
        }
        job.set_segments(slots);
        let plan = MediaPlan {
            kind: MediaKind::Hls,
            container_ext: "mp4".into(),
            media_sequence: 0,
            audio: None,
            subtitles: Vec::new(),
            metadata: MediaMetadata::default(),
            decryption_key_hex: None,
        };
        (job, plan)
    }

    #[test]
    fn hls_concat_and_remux() {
        let root = tempfile::tempdir().unwrap();
        let (job, plan) = hls_job(root.path(), &[b"AAA", b"BBB", b"CCC"]);
        let muxer = FakeMuxer::new();
        let out = post_process(&job, &plan, None, &muxer, &env()).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"AAABBBCCC");
        assert_eq!(*muxer.calls.lock().unwrap(), vec!["mux_hls"]);
        assert!(!job.temp_dir.exists());
    }

    #[test]
    fn split_audio_invokes_merge() {
        let root = tempfile::tempdir().unwrap();
        let (job, mut plan) = hls_job(root.path(), &[b"VID"]);
        plan.audio = Some(super::super::TrackSource {
            url: "http://example.com/audio.m4a".into(),
            protocol: crate::extractor::Protocol::Http,
            headers: Vec::new(),
            fragments: Vec::new(),
            decryption_key_hex: None,
        });
        let audio_file = root.path().join("audio-int.bin");
        std::fs::write(&audio_file, b"AUD").unwrap();
        let muxer = FakeMuxer::new();
        let out = post_process(&job, &plan, Some(&audio_file), &muxer, &env()).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"VIDAUD");
        assert_eq!(*muxer.calls.lock().unwrap(), vec!["merge"]);
    }

    #[test]
    fn encrypted_fragments_are_decrypted_before_concat() {
        use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
        type Enc = cbc::Encryptor<aes::Aes128>;

        let root = tempfile::tempdir().unwrap();
        let key = [0x24u8; 16];
        let key_hex = hex::encode(key);
        let plain: Vec<&[u8]> = vec![b"frag-zero", b"frag-one!"];
        let mut encrypted = Vec::new();
        for (i, p) in plain.iter().enumerate() {
            let iv = derive_iv(None, i as u64).unwrap();
            let padded = (p.len() / 16 + 1) * 16;
            let mut buf = vec![0u8; padded];
            buf[..p.len()].copy_from_slice(p);
            let enc = Enc::new((&key).into(), (&iv).into())
                .encrypt_padded_mut::<Pkcs7>(&mut buf, p.len())
                .unwrap()
                .to_vec();
            encrypted.push(enc);
        }
        let frags: Vec<&[u8]> = encrypted.iter().map(|v| v.as_slice()).collect();
        let (job, mut plan) = hls_job(root.path(), &frags);
        // Mark fragments as keyed with the pre-shared key.
        let slots: Vec<Arc<SegmentSlot>> = job
            .segments()
            .iter()
            .enumerate()
            .map(|(i, old)| {
                let slot = SegmentSlot::new(
                    i,
                    SegmentSource::Media {
                        url: format!("http://example.com/seg{}.ts", i),
                        sequence: i as u64,
                        byterange: None,
                        key_url: Some("http://example.com/k.bin".into()),
                        iv_hex: None,
                    },
                    old.path.clone(),
                );
                slot.set_bytes_written(old.bytes_written());
                slot.set_state(SegmentState::Done);
                Arc::new(slot)
            })
            .collect();
        job.set_segments(slots);
        plan.decryption_key_hex = Some(key_hex);

        let muxer = FakeMuxer::new();
        let out = post_process(&job, &plan, None, &muxer, &env()).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"frag-zerofrag-one!");
    }

    #[test]
    fn cancel_mid_pipeline_keeps_temp_dir() {
        let root = tempfile::tempdir().unwrap();
        let (job, plan) = hls_job(root.path(), &[b"AAA"]);
        job.control.set(RunState::Cancelled);
        let muxer = FakeMuxer::new();
        let err = post_process(&job, &plan, None, &muxer, &env()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(job.temp_dir.exists());
    }
}
