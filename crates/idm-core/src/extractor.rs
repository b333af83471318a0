//! `InfoExtractor` contract and the media description it produces.
//!
//! The engine never interprets site-specific streaming protocols itself; an
//! extractor turns a page URL into either a plain resource or a `MediaInfo`
//! with concrete format URLs. The engine calls `refresh` when a signed URL
//! expires mid-download.

use serde::{Deserialize, Serialize};

/// Delivery protocol of one format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Hls,
    Dash,
    Mhtml,
}

/// One media fragment listed by an extractor (DASH/fragmented formats).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub url: String,
    pub duration: Option<f64>,
    /// Half-open byte range within `url`, when the format packs fragments
    /// into one file.
    pub byte_range: Option<(u64, u64)>,
}

/// One downloadable rendition of the media.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Format {
    pub format_id: String,
    pub url: String,
    pub protocol: Protocol,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Average audio bitrate, kbit/s.
    pub abr: Option<f64>,
    /// Average video bitrate, kbit/s.
    pub vbr: Option<f64>,
    pub filesize: Option<u64>,
    #[serde(default)]
    pub fragments: Vec<Fragment>,
    #[serde(default)]
    pub http_headers: Vec<(String, String)>,
    /// Pre-shared AES key (hex) for formats the extractor already unlocked.
    pub decryption_key: Option<String>,
}

impl Format {
    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref().map_or(false, |c| c != "none")
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref().map_or(false, |c| c != "none")
    }
}

/// Subtitle track offered alongside the media.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleTrack {
    pub lang: String,
    pub url: String,
    pub ext: String,
}

/// Structured description of one media page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: String,
    pub ext: String,
    pub is_live: bool,
    pub formats: Vec<Format>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleTrack>,
    /// Format id the extractor (or user) selected for video.
    pub selected_format: Option<String>,
    /// Separate audio format id for split streams.
    pub selected_audio: Option<String>,
    #[serde(default)]
    pub metadata: MediaMetadata,
}

/// Tag data passed to the muxer after merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub description: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl MediaInfo {
    pub fn format(&self, id: &str) -> Option<&Format> {
        self.formats.iter().find(|f| f.format_id == id)
    }

    /// The format the pipeline should download as the main (video) stream.
    pub fn video_format(&self) -> Option<&Format> {
        match &self.selected_format {
            Some(id) => self.format(id),
            None => self.formats.iter().find(|f| f.has_video()),
        }
    }

    /// Separate audio track, when the selected video stream carries none.
    pub fn audio_format(&self) -> Option<&Format> {
        if let Some(id) = &self.selected_audio {
            return self.format(id);
        }
        let video = self.video_format()?;
        if video.has_audio() {
            return None;
        }
        self.formats.iter().find(|f| f.has_audio() && !f.has_video())
    }
}

/// What an extractor returns for a URL.
#[derive(Debug, Clone)]
pub enum Extracted {
    /// Nothing media-specific; download as a plain file.
    PlainResource { url: String },
    /// A single media item.
    Media(Box<MediaInfo>),
    /// A playlist of items; expansion is the embedder's concern.
    Playlist { entries: Vec<String> },
}

/// Metadata extraction boundary. Implementations are blocking; the engine
/// calls them from its blocking pool.
pub trait InfoExtractor: Send + Sync + 'static {
    fn extract(&self, url: &str) -> anyhow::Result<Extracted>;

    /// Re-derive direct URLs/headers after expiry. Same shape as `extract`,
    /// minus playlists.
    fn refresh(&self, url: &str) -> anyhow::Result<Extracted>;
}

/// Extractor for engines that only handle direct file URLs: everything is a
/// plain resource and a refresh hands back the original URL.
pub struct NullExtractor;

impl InfoExtractor for NullExtractor {
    fn extract(&self, url: &str) -> anyhow::Result<Extracted> {
        Ok(Extracted::PlainResource {
            url: url.to_string(),
        })
    }

    fn refresh(&self, url: &str) -> anyhow::Result<Extracted> {
        Ok(Extracted::PlainResource {
            url: url.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(id: &str, v: Option<&str>, a: Option<&str>) -> Format {
        Format {
            format_id: id.into(),
            url: format!("http://cdn/{}", id),
            protocol: Protocol::Http,
            vcodec: v.map(Into::into),
            acodec: a.map(Into::into),
            width: None,
            height: None,
            abr: None,
            vbr: None,
            filesize: None,
            fragments: Vec::new(),
            http_headers: Vec::new(),
            decryption_key: None,
        }
    }

    fn info(formats: Vec<Format>) -> MediaInfo {
        MediaInfo {
            title: "t".into(),
            ext: "mp4".into(),
            is_live: false,
            formats,
            subtitles: Vec::new(),
            selected_format: None,
            selected_audio: None,
            metadata: MediaMetadata::default(),
        }
    }

    #[test]
    fn muxed_format_needs_no_audio_track() {
        let mi = info(vec![fmt("22", Some("avc1"), Some("mp4a"))]);
        assert_eq!(mi.video_format().unwrap().format_id, "22");
        assert!(mi.audio_format().is_none());
    }

    #[test]
    fn split_streams_pick_audio_only_track() {
        let mi = info(vec![
            fmt("137", Some("avc1"), Some("none")),
            fmt("140", Some("none"), Some("mp4a")),
        ]);
        assert_eq!(mi.video_format().unwrap().format_id, "137");
        assert_eq!(mi.audio_format().unwrap().format_id, "140");
    }

    #[test]
    fn explicit_selection_wins() {
        let mut mi = info(vec![
            fmt("22", Some("avc1"), Some("mp4a")),
            fmt("137", Some("avc1"), Some("none")),
            fmt("140", Some("none"), Some("mp4a")),
        ]);
        mi.selected_format = Some("137".into());
        mi.selected_audio = Some("140".into());
        assert_eq!(mi.video_format().unwrap().format_id, "137");
        assert_eq!(mi.audio_format().unwrap().format_id, "140");
    }
}
