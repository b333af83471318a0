//! Response header parsing for the probe.

/// Fields the probe cares about, pulled from one response's headers.
#[derive(Debug, Clone, Default)]
pub struct ParsedHeaders {
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_range_total: Option<u64>,
}

pub fn parse_headers(headers: &[(String, String)]) -> ParsedHeaders {
    let mut out = ParsedHeaders::default();
    for (name, value) in headers {
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            out.content_length = value.parse::<u64>().ok();
        } else if name.eq_ignore_ascii_case("accept-ranges") {
            out.accept_ranges = value.eq_ignore_ascii_case("bytes");
        } else if name.eq_ignore_ascii_case("content-type") {
            out.content_type = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-disposition") {
            out.content_disposition = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("etag") {
            out.etag = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("last-modified") {
            out.last_modified = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-range") {
            out.content_range_total = content_range_total(value);
        }
    }
    out
}

/// Total from `Content-Range: bytes 0-0/12345` (`*` total is unknown).
pub fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.split_once('/')?;
    let total = total.trim();
    if total == "*" {
        return None;
    }
    total.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_core_fields() {
        let parsed = parse_headers(&h(&[
            ("Content-Length", "12345"),
            ("Accept-Ranges", "bytes"),
            ("Content-Type", "video/mp4"),
            ("ETag", "\"v1\""),
            ("Last-Modified", "Tue, 01 Jan 2030 00:00:00 GMT"),
        ]));
        assert_eq!(parsed.content_length, Some(12345));
        assert!(parsed.accept_ranges);
        assert_eq!(parsed.content_type.as_deref(), Some("video/mp4"));
        assert_eq!(parsed.etag.as_deref(), Some("\"v1\""));
        assert!(parsed.last_modified.is_some());
    }

    #[test]
    fn accept_ranges_none_is_false() {
        let parsed = parse_headers(&h(&[("Accept-Ranges", "none")]));
        assert!(!parsed.accept_ranges);
    }

    #[test]
    fn case_insensitive_names() {
        let parsed = parse_headers(&h(&[("content-length", "7"), ("ACCEPT-RANGES", "bytes")]));
        assert_eq!(parsed.content_length, Some(7));
        assert!(parsed.accept_ranges);
    }

    #[test]
    fn content_range_totals() {
        assert_eq!(content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(content_range_total("bytes 100-199/1000"), Some(1000));
        assert_eq!(content_range_total("bytes */500"), Some(500));
        assert_eq!(content_range_total("bytes 0-0/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }
}
