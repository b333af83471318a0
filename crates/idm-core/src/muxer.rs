//! `MediaMuxer` contract: the external tool that merges and remuxes streams.
//!
//! The engine only knows this narrow surface; the default implementation
//! shells out to an ffmpeg-compatible binary. Calls are blocking and run on
//! the blocking pool.

use crate::extractor::MediaMetadata;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Outcome of one muxer invocation.
#[derive(Debug, Clone)]
pub enum MuxOutcome {
    Ok,
    Error(String),
}

impl MuxOutcome {
    pub fn into_result(self) -> Result<(), String> {
        match self {
            MuxOutcome::Ok => Ok(()),
            MuxOutcome::Error(msg) => Err(msg),
        }
    }
}

pub trait MediaMuxer: Send + Sync + 'static {
    /// Merge a video-only and an audio-only file into `out_path`.
    fn merge(&self, video_path: &Path, audio_path: &Path, out_path: &Path) -> MuxOutcome;

    /// Remux a concatenated transport stream into a clean container.
    fn mux_hls(&self, ts_path: &Path, out_path: &Path) -> MuxOutcome;

    /// Write tag metadata into `file` in place.
    fn tag(&self, file: &Path, metadata: &MediaMetadata) -> MuxOutcome;
}

/// Muxer backed by an ffmpeg-style command line tool.
pub struct CommandMuxer {
    binary: PathBuf,
}

impl CommandMuxer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&std::ffi::OsStr]) -> MuxOutcome {
        let output = Command::new(&self.binary).args(args).output();
        match output {
            Ok(out) if out.status.success() => MuxOutcome::Ok,
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let tail: String = stderr
                    .lines()
                    .rev()
                    .take(5)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect::<Vec<_>>()
                    .join("\n");
                MuxOutcome::Error(format!("{} exited with {}: {}", self.binary.display(), out.status, tail))
            }
            Err(e) => MuxOutcome::Error(format!("failed to launch {}: {}", self.binary.display(), e)),
        }
    }
}

impl MediaMuxer for CommandMuxer {
    fn merge(&self, video_path: &Path, audio_path: &Path, out_path: &Path) -> MuxOutcome {
        let args: Vec<&std::ffi::OsStr> = vec![
            "-y".as_ref(),
            "-i".as_ref(),
            video_path.as_os_str(),
            "-i".as_ref(),
            audio_path.as_os_str(),
            "-c".as_ref(),
            "copy".as_ref(),
            out_path.as_os_str(),
        ];
        self.run(&args)
    }

    fn mux_hls(&self, ts_path: &Path, out_path: &Path) -> MuxOutcome {
        let args: Vec<&std::ffi::OsStr> = vec![
            "-y".as_ref(),
            "-i".as_ref(),
            ts_path.as_os_str(),
            "-c".as_ref(),
            "copy".as_ref(),
            // TS timestamps often need regeneration after raw concat.
            "-bsf:a".as_ref(),
            "aac_adtstoasc".as_ref(),
            out_path.as_os_str(),
        ];
        self.run(&args)
    }

    fn tag(&self, file: &Path, metadata: &MediaMetadata) -> MuxOutcome {
        let tmp = tagged_scratch_path(file);
        let mut args: Vec<std::ffi::OsString> = vec![
            "-y".into(),
            "-i".into(),
            file.as_os_str().to_os_string(),
            "-c".into(),
            "copy".into(),
        ];
        if let Some(title) = &metadata.title {
            args.push("-metadata".into());
            args.push(format!("title={}", title).into());
        }
        if let Some(artist) = &metadata.artist {
            args.push("-metadata".into());
            args.push(format!("artist={}", artist).into());
        }
        if let Some(desc) = &metadata.description {
            args.push("-metadata".into());
            args.push(format!("comment={}", desc).into());
        }
        args.push(tmp.as_os_str().to_os_string());
        let refs: Vec<&std::ffi::OsStr> = args.iter().map(|a| a.as_os_str()).collect();
        match self.run(&refs) {
            MuxOutcome::Ok => match std::fs::rename(&tmp, file) {
                Ok(()) => MuxOutcome::Ok,
                Err(e) => MuxOutcome::Error(format!("replace tagged file: {}", e)),
            },
            err => {
                let _ = std::fs::remove_file(&tmp);
                err
            }
        }
    }
}

/// Scratch path for in-place tagging. The extension must survive: ffmpeg
/// picks the output container from it, so `clip.mkv` tags through
/// `clip.tagged.tmp.mkv`, never an `.mp4` intermediate.
fn tagged_scratch_path(file: &Path) -> PathBuf {
    let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
    file.with_extension(format!("tagged.tmp.{}", ext))
}

/// Muxer that refuses everything; for embedders without media support.
pub struct NoMuxer;

impl MediaMuxer for NoMuxer {
    fn merge(&self, _: &Path, _: &Path, _: &Path) -> MuxOutcome {
        MuxOutcome::Error("no muxer configured".into())
    }

    fn mux_hls(&self, _: &Path, _: &Path) -> MuxOutcome {
        MuxOutcome::Error("no muxer configured".into())
    }

    fn tag(&self, _: &Path, _: &MediaMetadata) -> MuxOutcome {
        MuxOutcome::Error("no muxer configured".into())
    }
}
