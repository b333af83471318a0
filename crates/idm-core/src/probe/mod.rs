//! Pre-flight metadata probing.
//!
//! Learns total size, range support, validators, and the server's filename
//! before any segment planning happens. HEAD first; servers that block or
//! underreport on HEAD get a `Range: bytes=0-0` GET; as a last resort a plain
//! GET is started and dropped after the first chunk, just for its headers.

mod parse;

pub use parse::{content_range_total, parse_headers, ParsedHeaders};

use crate::error::{ErrorKind, JobError};
use crate::job::{ConnectionSettings, Discovered};
use crate::transport::{
    self, CancelToken, SinkControl, TransportErrorKind, TransportRequest,
};
use crate::url_model::derive_filename;
use std::time::Duration;

/// Everything the probe learned about one URL.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub total_size: Option<u64>,
    pub resumable: bool,
    pub accept_ranges: bool,
    pub effective_url: String,
    pub content_type: Option<String>,
    pub server_filename: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ProbeResult {
    pub fn into_discovered(self) -> Discovered {
        Discovered {
            total_size: self.total_size,
            resumable: self.resumable,
            server_filename: Some(self.server_filename),
            content_type: self.content_type,
            etag: self.etag,
            last_modified: self.last_modified,
        }
    }
}

/// Transport knobs the probe inherits from the engine config.
#[derive(Debug, Clone, Copy)]
pub struct ProbeEnv {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub verify_tls: bool,
}

fn base_request(conn: &ConnectionSettings, env: &ProbeEnv) -> TransportRequest {
    TransportRequest {
        url: conn.effective_url.clone(),
        method: transport::Method::Get,
        range: None,
        headers: conn.headers.clone(),
        proxy: conn.proxy.clone(),
        auth: conn.auth.clone(),
        cookie_header: conn.cookie_header.clone(),
        connect_timeout: env.connect_timeout,
        read_timeout: env.read_timeout,
        verify_tls: env.verify_tls,
        follow_redirects: true,
    }
}

struct Observation {
    parsed: ParsedHeaders,
    effective_url: String,
    /// 206 to a 0-0 range confirms resumability regardless of Accept-Ranges.
    ranged_206: bool,
}

fn observe_head(
    conn: &ConnectionSettings,
    env: &ProbeEnv,
    cancel: &CancelToken,
) -> Result<Observation, transport::TransportError> {
    let mut req = base_request(conn, env);
    req.method = transport::Method::Head;
    let resp = transport::fetch(&req, cancel, |_, _| SinkControl::Continue)?;
    Ok(Observation {
        parsed: parse_headers(&resp.headers),
        effective_url: resp.final_url,
        ranged_206: false,
    })
}

fn observe_range0(
    conn: &ConnectionSettings,
    env: &ProbeEnv,
    cancel: &CancelToken,
) -> Result<Observation, transport::TransportError> {
    let req = base_request(conn, env).with_range(0, 1);
    let resp = transport::fetch(&req, cancel, |_, _| SinkControl::Continue)?;
    let mut parsed = parse_headers(&resp.headers);
    let ranged_206 = resp.status_code == 206;
    if ranged_206 {
        if let Some(total) = parsed.content_range_total {
            parsed.content_length = Some(total);
        }
        parsed.accept_ranges = true;
    }
    Ok(Observation {
        parsed,
        effective_url: resp.final_url,
        ranged_206,
    })
}

/// Plain GET, dropped after the first body chunk; headers only.
fn observe_get_headers(
    conn: &ConnectionSettings,
    env: &ProbeEnv,
    cancel: &CancelToken,
) -> Result<Observation, transport::TransportError> {
    let req = base_request(conn, env);
    let resp = transport::fetch(&req, cancel, |_, _| SinkControl::Abort)?;
    Ok(Observation {
        parsed: parse_headers(&resp.headers),
        effective_url: resp.final_url,
        ranged_206: false,
    })
}

fn merge(primary: Observation, secondary: Option<Observation>) -> Observation {
    let Some(sec) = secondary else {
        return primary;
    };
    let mut p = primary;
    p.ranged_206 |= sec.ranged_206;
    p.parsed.accept_ranges |= sec.parsed.accept_ranges;
    if p.parsed.content_length.is_none() {
        p.parsed.content_length = sec.parsed.content_length;
    }
    if p.parsed.content_disposition.is_none() {
        p.parsed.content_disposition = sec.parsed.content_disposition;
    }
    if p.parsed.content_type.is_none() {
        p.parsed.content_type = sec.parsed.content_type;
    }
    if p.parsed.etag.is_none() {
        p.parsed.etag = sec.parsed.etag;
    }
    if p.parsed.last_modified.is_none() {
        p.parsed.last_modified = sec.parsed.last_modified;
    }
    p
}

/// Best-effort probe: HEAD, then ranged GET, then header-only GET.
pub fn probe(
    conn: &ConnectionSettings,
    env: &ProbeEnv,
    cancel: &CancelToken,
) -> Result<ProbeResult, JobError> {
    let head = observe_head(conn, env, cancel);

    let obs = match head {
        Ok(h) if h.parsed.accept_ranges && h.parsed.content_length.is_some() => h,
        Ok(h) => {
            // HEAD worked but is ambiguous; a ranged GET may still reveal
            // range support or a length.
            match observe_range0(conn, env, cancel) {
                Ok(r) => merge(r, Some(h)),
                Err(_) => h,
            }
        }
        Err(head_err) => match observe_range0(conn, env, cancel) {
            Ok(r) => r,
            Err(e) if matches!(e.kind, TransportErrorKind::RangeRejected) => {
                // Server ignores ranges outright; last resort for headers.
                observe_get_headers(conn, env, cancel)
                    .map_err(|e| probe_failed(&e))?
            }
            Err(_) => return Err(probe_failed(&head_err)),
        },
    };

    let resumable = (obs.ranged_206 || obs.parsed.accept_ranges)
        && obs.parsed.content_length.is_some();
    let server_filename = derive_filename(
        &obs.effective_url,
        obs.parsed.content_disposition.as_deref(),
    );

    Ok(ProbeResult {
        total_size: obs.parsed.content_length,
        resumable,
        accept_ranges: obs.ranged_206 || obs.parsed.accept_ranges,
        effective_url: obs.effective_url,
        content_type: obs.parsed.content_type,
        server_filename,
        etag: obs.parsed.etag,
        last_modified: obs.parsed.last_modified,
    })
}

fn probe_failed(e: &transport::TransportError) -> JobError {
    JobError {
        kind: ErrorKind::ProbeFailed,
        http_status: e.http_status(),
        message: e.to_string(),
    }
}
