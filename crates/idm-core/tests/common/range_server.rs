//! Minimal HTTP/1.1 fixture supporting HEAD and Range GET for engine tests.
//!
//! Serves a single static body with keep-alive, optional ETag and
//! Content-Disposition, and a switch that makes every ranged GET start
//! failing with 416 (expired-link simulation).

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct RangeServerOptions {
    /// If true, HEAD returns 405 (simulates servers that block HEAD).
    pub head_blocked: bool,
    /// If true, GET ignores Range and always returns 200 with the full body.
    pub no_ranges: bool,
    /// ETag header sent on every response.
    pub etag: Option<String>,
    /// Content-Disposition header sent on every response.
    pub content_disposition: Option<String>,
}

/// Handle to a running fixture server.
pub struct RangeServer {
    pub url: String,
    /// Flip to make all ranged GETs fail with 416.
    pub force_416: Arc<AtomicBool>,
    /// Total requests served.
    pub hits: Arc<AtomicUsize>,
}

pub fn start(body: Vec<u8>) -> RangeServer {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let force_416 = Arc::new(AtomicBool::new(false));
    let hits = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&force_416);
    let h = Arc::clone(&hits);
    std::thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let opts = opts.clone();
            let force_416 = Arc::clone(&f);
            let hits = Arc::clone(&h);
            std::thread::spawn(move || serve(stream, &body, &opts, &force_416, &hits));
        }
    });
    RangeServer {
        url: format!("http://127.0.0.1:{}/data.bin", port),
        force_416,
        hits,
    }
}

fn serve(
    mut stream: std::net::TcpStream,
    body: &[u8],
    opts: &RangeServerOptions,
    force_416: &AtomicBool,
    hits: &AtomicUsize,
) {
    let _ = stream.set_read_timeout(Some(std::time::Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(std::time::Duration::from_secs(5)));
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    // Keep-alive loop: one iteration per request on this connection.
    loop {
        let request = loop {
            if let Some(end) = find_header_end(&buf) {
                let head = String::from_utf8_lossy(&buf[..end]).into_owned();
                buf.drain(..end + 4);
                break head;
            }
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        hits.fetch_add(1, Ordering::Relaxed);
        let (method, range) = parse_request(&request);
        if !respond(&mut stream, body, opts, force_416, method, range) {
            return;
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn extra_headers(opts: &RangeServerOptions, ranges: bool) -> String {
    let mut out = String::new();
    if ranges && !opts.no_ranges {
        out.push_str("Accept-Ranges: bytes\r\n");
    }
    if let Some(etag) = &opts.etag {
        out.push_str(&format!("ETag: {}\r\n", etag));
    }
    if let Some(cd) = &opts.content_disposition {
        out.push_str(&format!("Content-Disposition: {}\r\n", cd));
    }
    out
}

/// Returns false when the connection should close.
fn respond(
    stream: &mut std::net::TcpStream,
    body: &[u8],
    opts: &RangeServerOptions,
    force_416: &AtomicBool,
    method: String,
    range: Option<(u64, u64)>,
) -> bool {
    let total = body.len() as u64;

    if method.eq_ignore_ascii_case("HEAD") {
        if opts.head_blocked {
            return write_all(stream, b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n");
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}\r\n",
            total,
            extra_headers(opts, true)
        );
        return write_all(stream, response.as_bytes());
    }

    if !method.eq_ignore_ascii_case("GET") {
        return write_all(stream, b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n");
    }

    match range {
        Some(_) if force_416.load(Ordering::Relaxed) => {
            let response = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\n{}\r\n",
                total,
                extra_headers(opts, true)
            );
            write_all(stream, response.as_bytes())
        }
        Some((start, end_incl)) if !opts.no_ranges => {
            let start = start.min(total);
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl {
                let response = format!(
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\n\r\n",
                    total
                );
                return write_all(stream, response.as_bytes());
            }
            let slice = &body[start as usize..=end_incl as usize];
            let response = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\n{}\r\n",
                slice.len(),
                start,
                end_incl,
                total,
                extra_headers(opts, true)
            );
            write_all(stream, response.as_bytes()) && write_all(stream, slice)
        }
        _ => {
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}\r\n",
                total,
                extra_headers(opts, false)
            );
            write_all(stream, response.as_bytes()) && write_all(stream, body)
        }
    }
}

fn write_all(stream: &mut std::net::TcpStream, data: &[u8]) -> bool {
    stream.write_all(data).is_ok()
}

/// Returns (method, optional (start, end_inclusive) for `Range: bytes=X-Y`).
fn parse_request(request: &str) -> (String, Option<(u64, u64)>) {
    let mut method = String::new();
    let mut range = None;
    for (i, line) in request.lines().enumerate() {
        let line = line.trim();
        if i == 0 {
            method = line.split_whitespace().next().unwrap_or("").to_string();
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("range") {
            continue;
        }
        let value = value.trim().to_ascii_lowercase();
        if let Some(spec) = value.strip_prefix("bytes=") {
            if let Some((a, b)) = spec.split_once('-') {
                let start = a.trim().parse::<u64>().unwrap_or(0);
                let end_incl = match b.trim() {
                    "" => u64::MAX,
                    s => s.parse::<u64>().unwrap_or(0),
                };
                range = Some((start, end_incl));
            }
        }
    }
    (method, range)
}
