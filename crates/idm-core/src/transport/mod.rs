//! Single HTTP(S) attempt over libcurl.
//!
//! One `fetch` call performs one request: optional byte range, custom headers,
//! proxy, basic auth, cookie header, TLS verification toggle. Body chunks are
//! handed to a sink callback which can continue, pause, or abort the transfer.
//! Cancellation is observed through curl's progress callback, so a stuck
//! transfer still notices a cancel within the poll interval.

mod request;

pub use request::{BasicAuth, Method, ProxyDescriptor, ProxyKind, TransportRequest};

use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Continuation decision returned by the chunk sink.
///
/// `Pause` and `Abort` both stop the transfer; `fetch` still returns the
/// response metadata with the partial `total_received`. The caller knows
/// which control it returned and acts accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkControl {
    Continue,
    /// Stop cleanly; bytes so far are kept.
    Pause,
    /// Stop now; the caller will discard or clamp.
    Abort,
}

/// Cooperative cancel flag shared between a controller and transfers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What a completed request reports back.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status_code: u32,
    pub final_url: String,
    /// Headers of the final response block (redirect blocks are discarded).
    pub headers: Vec<(String, String)>,
    pub total_received: u64,
    /// Raw `Set-Cookie` values observed on the final response.
    pub set_cookies: Vec<String>,
}

impl TransportResponse {
    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Failure classification for one transport attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Resolve,
    Connect,
    Tls,
    HttpStatus(u32),
    Timeout,
    /// Server answered 416 to our Range.
    RangeRejected,
    /// Connection dropped mid-body (or empty reply).
    ServerClosed,
    /// The local sink failed to accept bytes.
    WriteSink,
    /// The sink or cancel token stopped the transfer.
    Cancelled,
}

#[derive(Debug)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl TransportError {
    fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        let retryable = match kind {
            TransportErrorKind::Resolve
            | TransportErrorKind::Connect
            | TransportErrorKind::Tls
            | TransportErrorKind::Timeout
            | TransportErrorKind::ServerClosed => true,
            TransportErrorKind::HttpStatus(code) => {
                (500..600).contains(&code) || code == 408 || code == 429
            }
            TransportErrorKind::RangeRejected
            | TransportErrorKind::WriteSink
            | TransportErrorKind::Cancelled => false,
        };
        Self {
            kind,
            retryable,
            message: message.into(),
        }
    }

    pub fn http_status(&self) -> Option<u32> {
        match self.kind {
            TransportErrorKind::HttpStatus(code) => Some(code),
            TransportErrorKind::RangeRejected => Some(416),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

/// Performs one request, streaming body chunks into `sink` as
/// `(chunk, cumulative_bytes)`. Blocking; run on a worker thread.
pub fn fetch(
    req: &TransportRequest,
    cancel: &CancelToken,
    mut sink: impl FnMut(&[u8], u64) -> SinkControl,
) -> Result<TransportResponse, TransportError> {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut set_cookies: Vec<String> = Vec::new();
    let total = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let stopped_by_sink = Arc::new(AtomicBool::new(false));
    let last_status = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let range_ignored = Arc::new(AtomicBool::new(false));

    let mut easy = curl::easy::Easy::new();
    configure(&mut easy, req).map_err(|e| map_curl_error(&e, cancel, false))?;

    let perform_error: Option<curl::Error>;
    {
        let total_cb = Arc::clone(&total);
        let stopped = Arc::clone(&stopped_by_sink);
        let status_hdr = Arc::clone(&last_status);
        let status_body = Arc::clone(&last_status);
        let range_flag = Arc::clone(&range_ignored);
        let expects_partial = req.range.is_some();
        let cancel_cb = cancel.clone();

        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(line) = str::from_utf8(data) {
                    let line = line.trim_end();
                    // curl emits one header block per redirect hop; keep only
                    // the final block.
                    if line.starts_with("HTTP/") {
                        headers.clear();
                        set_cookies.clear();
                        let code = line
                            .split_whitespace()
                            .nth(1)
                            .and_then(|s| s.parse::<u32>().ok())
                            .unwrap_or(0);
                        status_hdr.store(code, Ordering::Relaxed);
                    } else if let Some((name, value)) = line.split_once(':') {
                        let name = name.trim();
                        let value = value.trim();
                        if name.eq_ignore_ascii_case("set-cookie") {
                            set_cookies.push(value.to_string());
                        }
                        headers.push((name.to_string(), value.to_string()));
                    }
                }
                true
            })
            .map_err(|e| map_curl_error(&e, cancel, false))?;
        transfer
            .write_function(move |data| {
                // A 200 to a ranged request means the server ignored (or
                // If-Range invalidated) the range; writing that body at our
                // offset would corrupt the part.
                if expects_partial && status_body.load(Ordering::Relaxed) == 200 {
                    range_flag.store(true, Ordering::Relaxed);
                    return Ok(0);
                }
                let cum = total_cb.fetch_add(data.len() as u64, Ordering::Relaxed) + data.len() as u64;
                match sink(data, cum) {
                    SinkControl::Continue => Ok(data.len()),
                    SinkControl::Pause | SinkControl::Abort => {
                        stopped.store(true, Ordering::Relaxed);
                        Ok(0)
                    }
                }
            })
            .map_err(|e| map_curl_error(&e, cancel, false))?;
        transfer
            .progress_function(move |_, _, _, _| !cancel_cb.is_cancelled())
            .map_err(|e| map_curl_error(&e, cancel, false))?;

        perform_error = transfer.perform().err();
    }

    if let Some(e) = perform_error {
        if range_ignored.load(Ordering::Relaxed) {
            return Err(TransportError::new(
                TransportErrorKind::RangeRejected,
                "server ignored byte range (200 to ranged request)",
            ));
        }
        // A sink-initiated stop is not a failure: the caller asked us to
        // quit and still wants the response metadata (status, headers).
        if !(stopped_by_sink.load(Ordering::Relaxed) && !cancel.is_cancelled()) {
            return Err(map_curl_error(
                &e,
                cancel,
                stopped_by_sink.load(Ordering::Relaxed),
            ));
        }
    }

    let status = {
        let code = easy.response_code().unwrap_or(0) as u32;
        if code != 0 {
            code
        } else {
            last_status.load(Ordering::Relaxed)
        }
    };
    let final_url = easy
        .effective_url()
        .ok()
        .flatten()
        .unwrap_or(req.url.as_str())
        .to_string();

    if status == 416 {
        return Err(TransportError::new(
            TransportErrorKind::RangeRejected,
            format!("server rejected range for {}", final_url),
        ));
    }
    if !(200..300).contains(&status) {
        return Err(TransportError::new(
            TransportErrorKind::HttpStatus(status),
            format!("HTTP {} for {}", status, final_url),
        ));
    }

    Ok(TransportResponse {
        status_code: status,
        final_url,
        headers,
        total_received: total.load(Ordering::Relaxed),
        set_cookies,
    })
}

/// Convenience wrapper buffering the whole body in memory. Meant for small
/// resources (playlists, AES keys); bodies beyond `limit` are cut off (the
/// response still reports the truncated byte count).
pub fn fetch_to_vec(
    req: &TransportRequest,
    cancel: &CancelToken,
    limit: usize,
) -> Result<(TransportResponse, Vec<u8>), TransportError> {
    let mut body = Vec::new();
    let resp = fetch(req, cancel, |chunk, _| {
        if body.len() + chunk.len() > limit {
            return SinkControl::Abort;
        }
        body.extend_from_slice(chunk);
        SinkControl::Continue
    })?;
    Ok((resp, body))
}

fn configure(easy: &mut curl::easy::Easy, req: &TransportRequest) -> Result<(), curl::Error> {
    easy.url(&req.url)?;
    match req.method {
        Method::Get => {}
        Method::Head => easy.nobody(true)?,
    }
    easy.follow_location(req.follow_redirects)?;
    easy.max_redirections(10)?;
    easy.connect_timeout(req.connect_timeout)?;
    // Idle-read abort instead of a wall-clock cap: a healthy slow transfer
    // keeps going, a stalled one dies after `read_timeout`.
    easy.low_speed_limit(1)?;
    easy.low_speed_time(req.read_timeout)?;
    easy.progress(true)?;
    easy.ssl_verify_peer(req.verify_tls)?;
    easy.ssl_verify_host(req.verify_tls)?;

    if let Some((start, end)) = req.range {
        // Half-open [start, end) to inclusive curl form.
        easy.range(&format!("{}-{}", start, end.saturating_sub(1)))?;
    }

    if let Some(proxy) = &req.proxy {
        easy.proxy(&format!("{}:{}", proxy.host, proxy.port))?;
        easy.proxy_type(match proxy.kind {
            ProxyKind::Http => curl::easy::ProxyType::Http,
            ProxyKind::Https => curl::easy::ProxyType::Http,
            ProxyKind::Socks4 => curl::easy::ProxyType::Socks4,
            ProxyKind::Socks5 => curl::easy::ProxyType::Socks5,
        })?;
        if let Some((user, pass)) = &proxy.auth {
            easy.proxy_username(user)?;
            easy.proxy_password(pass)?;
        }
    }

    if let Some(auth) = &req.auth {
        easy.username(&auth.username)?;
        easy.password(&auth.password)?;
    }

    if let Some(cookie) = &req.cookie_header {
        easy.cookie(cookie)?;
    }

    let mut list = curl::easy::List::new();
    for (k, v) in &req.headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))?;
    }
    if !req.headers.is_empty() {
        easy.http_headers(list)?;
    }
    Ok(())
}

fn map_curl_error(
    e: &curl::Error,
    cancel: &CancelToken,
    stopped_by_sink: bool,
) -> TransportError {
    let kind = if stopped_by_sink || cancel.is_cancelled() || e.is_aborted_by_callback() {
        TransportErrorKind::Cancelled
    } else if e.is_write_error() {
        TransportErrorKind::WriteSink
    } else if e.is_couldnt_resolve_host() || e.is_couldnt_resolve_proxy() {
        TransportErrorKind::Resolve
    } else if e.is_couldnt_connect() {
        TransportErrorKind::Connect
    } else if e.is_ssl_connect_error()
        || e.is_ssl_certproblem()
        || e.is_ssl_cipher()
        || e.is_ssl_cacert()
    {
        TransportErrorKind::Tls
    } else if e.is_operation_timedout() {
        TransportErrorKind::Timeout
    } else if e.is_got_nothing() || e.is_recv_error() || e.is_send_error() || e.is_partial_file() {
        TransportErrorKind::ServerClosed
    } else {
        TransportErrorKind::Connect
    };
    TransportError::new(kind, e.description().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_matrix() {
        assert!(TransportError::new(TransportErrorKind::Resolve, "").retryable);
        assert!(TransportError::new(TransportErrorKind::Timeout, "").retryable);
        assert!(TransportError::new(TransportErrorKind::ServerClosed, "").retryable);
        assert!(TransportError::new(TransportErrorKind::HttpStatus(503), "").retryable);
        assert!(TransportError::new(TransportErrorKind::HttpStatus(429), "").retryable);
        assert!(TransportError::new(TransportErrorKind::HttpStatus(408), "").retryable);
        assert!(!TransportError::new(TransportErrorKind::HttpStatus(404), "").retryable);
        assert!(!TransportError::new(TransportErrorKind::RangeRejected, "").retryable);
        assert!(!TransportError::new(TransportErrorKind::Cancelled, "").retryable);
    }

    #[test]
    fn range_error_reports_416() {
        let e = TransportError::new(TransportErrorKind::RangeRejected, "x");
        assert_eq!(e.http_status(), Some(416));
        let e = TransportError::new(TransportErrorKind::HttpStatus(500), "x");
        assert_eq!(e.http_status(), Some(500));
    }

    #[test]
    fn cancel_token_flips_once() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        t.cancel();
        assert!(t.is_cancelled());
        let t2 = t.clone();
        assert!(t2.is_cancelled());
    }
}
