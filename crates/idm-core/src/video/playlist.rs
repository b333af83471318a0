//! HLS media playlist fetch and expansion into engine segments.

use crate::error::{ErrorKind, JobError};
use crate::job::SegmentSource;
use crate::transport::{self, CancelToken, TransportRequest};
use m3u8_rs::{Key, KeyMethod, Playlist};

/// Playlists bigger than this are not media playlists.
const PLAYLIST_LIMIT: usize = 8 * 1024 * 1024;

/// Result of expanding a media playlist.
#[derive(Debug)]
pub struct ExpandedPlaylist {
    pub media_sequence: u64,
    /// One `SegmentSource::Media` per fragment, in play order. An
    /// `#EXT-X-MAP` init section, when present, is fragment 0.
    pub segments: Vec<SegmentSource>,
}

/// Fetch `url` and expand it. The URL must point at a media playlist; master
/// playlists belong to the extractor's variant selection, not the engine.
pub fn fetch_and_expand(
    req: &TransportRequest,
    cancel: &CancelToken,
) -> Result<ExpandedPlaylist, JobError> {
    let (_, body) = transport::fetch_to_vec(req, cancel, PLAYLIST_LIMIT).map_err(|e| JobError {
        kind: ErrorKind::ProbeFailed,
        http_status: e.http_status(),
        message: format!("playlist fetch: {}", e),
    })?;
    expand_media_playlist(&body, &req.url)
}

/// Parse playlist bytes and turn every fragment into a segment source.
pub fn expand_media_playlist(
    bytes: &[u8],
    base_url: &str,
) -> Result<ExpandedPlaylist, JobError> {
    let playlist = m3u8_rs::parse_playlist_res(bytes).map_err(|e| {
        JobError::new(ErrorKind::ProbeFailed, format!("playlist parse: {:?}", e))
    })?;

    let media = match playlist {
        Playlist::MediaPlaylist(m) => m,
        Playlist::MasterPlaylist(_) => {
            return Err(JobError::new(
                ErrorKind::ProbeFailed,
                "got a master playlist; a media playlist URL is required",
            ));
        }
    };

    if !media.end_list {
        return Err(JobError::new(
            ErrorKind::ProbeFailed,
            "live playlist (no end marker); live streams are not downloadable",
        ));
    }

    let media_sequence = media.media_sequence;
    let mut segments = Vec::with_capacity(media.segments.len() + 1);
    let mut current_key: Option<(String, Option<String>)> = None;
    // `#EXT-X-BYTERANGE` without an offset continues the previous range.
    let mut byterange_cursor: u64 = 0;

    for (i, seg) in media.segments.iter().enumerate() {
        if let Some(key) = &seg.key {
            current_key = resolve_key(key, base_url)?;
        }

        // Init section: unencrypted header bytes fetched before fragment 0.
        if i == 0 {
            if let Some(map) = &seg.map {
                let url = join_url(base_url, &map.uri)?;
                let byterange = map.byte_range.as_ref().map(|br| {
                    let offset = br.offset.unwrap_or(0);
                    (offset, offset + br.length)
                });
                segments.push(SegmentSource::Media {
                    url,
                    sequence: media_sequence,
                    byterange,
                    key_url: None,
                    iv_hex: None,
                });
            }
        }

        let byterange = seg.byte_range.as_ref().map(|br| {
            let offset = br.offset.unwrap_or(byterange_cursor);
            byterange_cursor = offset + br.length;
            (offset, offset + br.length)
        });

        let (key_url, iv_hex) = match &current_key {
            Some((url, iv)) => (Some(url.clone()), iv.clone()),
            None => (None, None),
        };

        segments.push(SegmentSource::Media {
            url: join_url(base_url, &seg.uri)?,
            sequence: media_sequence + i as u64,
            byterange,
            key_url,
            iv_hex,
        });
    }

    if segments.is_empty() {
        return Err(JobError::new(ErrorKind::ProbeFailed, "playlist has no fragments"));
    }

    Ok(ExpandedPlaylist {
        media_sequence,
        segments,
    })
}

/// Resolve an `#EXT-X-KEY` into (key URL, explicit IV). `None` clears
/// encryption for subsequent fragments.
fn resolve_key(
    key: &Key,
    base_url: &str,
) -> Result<Option<(String, Option<String>)>, JobError> {
    match &key.method {
        KeyMethod::None => Ok(None),
        KeyMethod::AES128 => {
            let uri = key.uri.as_deref().ok_or_else(|| {
                JobError::new(ErrorKind::DecryptFailed, "AES-128 key tag without URI")
            })?;
            Ok(Some((join_url(base_url, uri)?, key.iv.clone())))
        }
        KeyMethod::SampleAES => Err(JobError::new(
            ErrorKind::DecryptFailed,
            "SAMPLE-AES streams are not supported",
        )),
        other => Err(JobError::new(
            ErrorKind::DecryptFailed,
            format!("unsupported key method {:?}", other),
        )),
    }
}

fn join_url(base: &str, relative: &str) -> Result<String, JobError> {
    if relative.starts_with("http://") || relative.starts_with("https://") {
        return Ok(relative.to_string());
    }
    let base = url::Url::parse(base)
        .map_err(|e| JobError::new(ErrorKind::ProbeFailed, format!("bad base url: {}", e)))?;
    base.join(relative)
        .map(|u| u.to_string())
        .map_err(|e| JobError::new(ErrorKind::ProbeFailed, format!("bad fragment url: {}", e)))
}
