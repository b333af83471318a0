//! Request description handed to `fetch`.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Https,
    Socks4,
    Socks5,
}

/// Proxy endpoint with optional credentials.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProxyDescriptor {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub auth: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Everything one transport attempt needs. Built by workers from the job's
/// connection settings plus the segment's missing range.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub method: Method,
    /// Half-open byte range `[start, end)`.
    pub range: Option<(u64, u64)>,
    pub headers: Vec<(String, String)>,
    pub proxy: Option<ProxyDescriptor>,
    pub auth: Option<BasicAuth>,
    /// Value for the `Cookie:` request header.
    pub cookie_header: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub verify_tls: bool,
    pub follow_redirects: bool,
}

impl TransportRequest {
    /// GET with library defaults; callers override fields as needed.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            range: None,
            headers: Vec::new(),
            proxy: None,
            auth: None,
            cookie_header: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            verify_tls: true,
            follow_redirects: true,
        }
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: Method::Head,
            ..Self::get(url)
        }
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let r = TransportRequest::get("http://x/");
        assert_eq!(r.method, Method::Get);
        assert!(r.follow_redirects);
        assert!(r.verify_tls);
        let h = TransportRequest::head("http://x/");
        assert_eq!(h.method, Method::Head);
    }

    #[test]
    fn range_builder_is_half_open() {
        let r = TransportRequest::get("http://x/").with_range(0, 100);
        assert_eq!(r.range, Some((0, 100)));
    }
}
