//! Job-level error taxonomy.
//!
//! Transport-level failures have their own type in `transport`; this module
//! covers what a job reports outward once a failure is final (or worth telling
//! the observer about).

use std::fmt;

/// Final classification of a job failure, surfaced via `Observer::on_error`
/// and stored as the job's `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Pre-flight probe could not determine anything usable about the URL.
    ProbeFailed,
    /// Server does not support ranges. Informational, not fatal.
    NotResumable,
    /// Transport failed but may succeed on retry (worker-internal).
    TransportRetryable,
    /// Transport failed permanently (carries HTTP status when applicable).
    TransportFatal,
    /// Server rejected our byte range (416).
    RangeRejected,
    /// Local disk is full.
    DiskFull,
    /// Destination is not writable.
    WritePermission,
    /// Size or etag changed across a URL refresh.
    ContentChanged,
    /// `InfoExtractor::refresh` itself failed.
    RefreshFailed,
    /// Manifest on disk is unreadable or inconsistent.
    ManifestCorrupt,
    /// AES decryption of a media segment failed.
    DecryptFailed,
    /// External muxer returned an error.
    MuxFailed,
    /// User cancelled. Not an error to the outside.
    Cancelled,
    /// Manifest written by a newer schema than this build understands.
    SchemaFuture,
    /// Unexpected programming fault caught at a worker boundary.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ProbeFailed => "probe failed",
            ErrorKind::NotResumable => "not resumable",
            ErrorKind::TransportRetryable => "transport error (retryable)",
            ErrorKind::TransportFatal => "transport error",
            ErrorKind::RangeRejected => "range rejected",
            ErrorKind::DiskFull => "disk full",
            ErrorKind::WritePermission => "write permission denied",
            ErrorKind::ContentChanged => "remote content changed",
            ErrorKind::RefreshFailed => "url refresh failed",
            ErrorKind::ManifestCorrupt => "manifest corrupt",
            ErrorKind::DecryptFailed => "decryption failed",
            ErrorKind::MuxFailed => "muxing failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::SchemaFuture => "manifest schema too new",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// The `(kind, http_status?, message)` triple a job carries after failing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub http_status: Option<u32>,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_status: None,
            message: message.into(),
        }
    }

    pub fn with_status(kind: ErrorKind, status: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_status: Some(status),
            message: message.into(),
        }
    }

    /// True for kinds that permanently end the job.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::NotResumable | ErrorKind::TransportRetryable | ErrorKind::Cancelled
        )
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.http_status {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for JobError {}

/// Map an I/O error from the storage layer to a job error kind.
pub fn classify_io(e: &std::io::Error) -> ErrorKind {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => ErrorKind::WritePermission,
        _ => {
            // ENOSPC has no stable ErrorKind on all toolchains; check errno.
            if e.raw_os_error() == Some(libc::ENOSPC) {
                ErrorKind::DiskFull
            } else {
                ErrorKind::Internal
            }
        }
    }
}
