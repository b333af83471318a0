//! Server filename derivation.
//!
//! A download's local name comes from Content-Disposition when the server
//! sends one, otherwise from the URL path, sanitized for the local filesystem.

mod disposition;

pub use disposition::parse_content_disposition_filename;

use std::path::{Path, PathBuf};

/// Default filename when URL path and Content-Disposition yield nothing usable.
const DEFAULT_FILENAME: &str = "download.bin";

/// Linux NAME_MAX.
const NAME_MAX: usize = 255;

/// Derives a safe filename for saving a download.
///
/// Prefers `Content-Disposition` (quoted, token, and RFC 5987 `filename*`
/// forms), else the last URL path segment, else `download.bin`.
pub fn derive_filename(url: &str, content_disposition: Option<&str>) -> String {
    let candidate = content_disposition
        .and_then(parse_content_disposition_filename)
        .filter(|s| !s.is_empty())
        .or_else(|| filename_from_url_path(url));

    match candidate.map(|c| sanitize_filename(&c)) {
        Some(s) if !s.is_empty() && s != "." && s != ".." => s,
        _ => DEFAULT_FILENAME.to_string(),
    }
}

/// Last non-empty path segment of a URL, or None for root/unparseable URLs.
pub fn filename_from_url_path(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path().split('/').filter(|s| !s.is_empty()).last()?;
    if segment == "." || segment == ".." {
        return None;
    }
    Some(segment.to_string())
}

/// Sanitizes a candidate filename for the local filesystem: path separators,
/// NUL and control characters become `_`, runs of `_` collapse, surrounding
/// dots/spaces are trimmed, and the result is capped at NAME_MAX bytes.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;
    for c in name.chars() {
        let mapped = match c {
            '\0' | '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        if mapped == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(mapped);
            prev_underscore = false;
        }
    }

    let trimmed = out.trim_matches(|c| c == ' ' || c == '.' || c == '_');
    if trimmed.len() <= NAME_MAX {
        return trimmed.to_string();
    }
    let mut take = NAME_MAX;
    while take > 0 && !trimmed.is_char_boundary(take) {
        take -= 1;
    }
    trimmed[..take].to_string()
}

/// Returns a path in `candidate`'s directory that does not exist yet, by
/// suffixing ` (1)`, ` (2)`, ... before the extension. Returns `candidate`
/// unchanged when it is free.
pub fn next_free_path(candidate: &Path) -> PathBuf {
    if !candidate.exists() {
        return candidate.to_path_buf();
    }
    let dir = candidate.parent().unwrap_or_else(|| Path::new(""));
    let name = candidate
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string());
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (name[..i].to_string(), name[i..].to_string()),
        _ => (name, String::new()),
    };
    for n in 1u32.. {
        let attempt = dir.join(format!("{} ({}){}", stem, n, ext));
        if !attempt.exists() {
            return attempt;
        }
    }
    unreachable!("next_free_path: exhausted suffixes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_from_url() {
        assert_eq!(
            derive_filename("https://example.com/pub/video.mp4", None),
            "video.mp4"
        );
        assert_eq!(
            derive_filename("https://example.com/file.zip?token=abc", None),
            "file.zip"
        );
    }

    #[test]
    fn disposition_wins_over_url() {
        assert_eq!(
            derive_filename(
                "https://example.com/archive.zip",
                Some("attachment; filename=\"real-name.tar.gz\"")
            ),
            "real-name.tar.gz"
        );
    }

    #[test]
    fn empty_and_reserved_fall_back() {
        assert_eq!(derive_filename("https://example.com/", None), "download.bin");
        assert_eq!(derive_filename("https://example.com/..", None), "download.bin");
    }

    #[test]
    fn sanitize_strips_separators_and_controls() {
        assert_eq!(sanitize_filename("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename("file\x00name.txt"), "file_name.txt");
        assert_eq!(sanitize_filename("  ..evil.. "), "evil");
    }

    #[test]
    fn next_free_path_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.iso");
        assert_eq!(next_free_path(&target), target);
        std::fs::write(&target, b"x").unwrap();
        assert_eq!(next_free_path(&target), dir.path().join("file (1).iso"));
        std::fs::write(dir.path().join("file (1).iso"), b"x").unwrap();
        assert_eq!(next_free_path(&target), dir.path().join("file (2).iso"));
    }

    #[test]
    fn next_free_path_no_extension() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("download");
        std::fs::write(&target, b"x").unwrap();
        assert_eq!(next_free_path(&target), dir.path().join("download (1)"));
    }
}
