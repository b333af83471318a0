//! Segmented-video post-processing: HLS expansion, decryption, concat and
//! the merge plan handed to the external muxer.
//!
//! Plain progressive video needs nothing from this module beyond the
//! assembler; everything here is for `hls`/`dash` protocol formats.

mod decrypt;
mod pipeline;
mod playlist;

pub use decrypt::{decrypt_aes128_cbc, decrypt_part_file, derive_iv, KeyCache};
pub use pipeline::{concat_track, plain_extras, post_process, PipelineEnv};
pub use playlist::{expand_media_playlist, fetch_and_expand, ExpandedPlaylist};

use crate::extractor::{Fragment, MediaMetadata, Protocol, SubtitleTrack};
use serde::{Deserialize, Serialize};

/// Closed variant over the protocols the pipeline dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Progressive download; pipeline is a no-op.
    Plain,
    /// Media fragments that may need decryption, concat and a remux.
    Hls,
    /// Separate video/audio tracks merged after download.
    Dash,
}

/// One additional track (audio) downloaded as a child of the main job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSource {
    pub url: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub fragments: Vec<Fragment>,
    /// Pre-shared AES key (hex) from the extractor, when the track needs it.
    pub decryption_key_hex: Option<String>,
}

/// Everything the pipeline needs to finish a media job, frozen at admission
/// and persisted with the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPlan {
    pub kind: MediaKind,
    /// Container extension of the final file (`mp4`, `mkv`, ...).
    pub container_ext: String,
    /// `#EXT-X-MEDIA-SEQUENCE` of the video playlist; used for IV derivation
    /// and rewind detection on resume.
    pub media_sequence: u64,
    pub audio: Option<TrackSource>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleTrack>,
    #[serde(default)]
    pub metadata: MediaMetadata,
    /// Pre-shared AES key (hex) for the video track.
    pub decryption_key_hex: Option<String>,
}

impl MediaPlan {
    pub fn plain() -> Self {
        Self {
            kind: MediaKind::Plain,
            container_ext: String::new(),
            media_sequence: 0,
            audio: None,
            subtitles: Vec::new(),
            metadata: MediaMetadata::default(),
            decryption_key_hex: None,
        }
    }
}
