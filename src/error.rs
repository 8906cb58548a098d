//! Error taxonomy for the downloader.
//!
//! Mirrors the teacher's `DownloadError` (`downloader.rs`): a small
//! `thiserror` enum covering the errors that can legitimately terminate a
//! download. Programming invariants (negative rate, uninitialized offset,
//! `start > end`) are deliberately *not* part of this enum — they panic,
//! per the error-handling design.

use thiserror::Error;

/// Fatal errors that abort the download. Split into setup vs. protocol only
/// for the purpose of choosing an exit code in `main`; callers otherwise
/// treat both the same way.
#[derive(Error, Debug)]
pub enum MultigetError {
    /// Bad arguments, TLS/HTTP2 dial failure, cannot open output or trace
    /// files. Abort before (or while) establishing the download.
    #[error("setup error: {0}")]
    Setup(String),

    /// The origin violated an assumption the scheduler cannot recover
    /// from: missing/duplicate/malformed `Content-Range`, or a status
    /// other than 200/206.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A genuine (non-truncation) I/O error while reading a response body
    /// or writing the destination file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<h2::Error> for MultigetError {
    fn from(err: h2::Error) -> Self {
        MultigetError::Protocol(err.to_string())
    }
}

impl From<http::Error> for MultigetError {
    fn from(err: http::Error) -> Self {
        MultigetError::Setup(err.to_string())
    }
}

impl MultigetError {
    /// Exit code convention used by `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            MultigetError::Setup(_) => 1,
            MultigetError::Protocol(_) => 2,
            MultigetError::Io(_) => 1,
        }
    }
}

/// Outcome of reading a response body to completion. `Truncated` is the
/// expected result of a choked stream and must never be treated as an
/// error (see spec §7's "Expected transport outcomes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOutcome {
    Complete,
    Truncated,
}
