//! Error types for request parsing.
//!
//! Parsing failures do not surface as `Result`s on the public feed path;
//! they fire the group's `on_parsing_error` hook and leave the parser in
//! its terminal state. The failed parser records which of these errors it
//! hit so the hook (or any later inspection) can tell them apart.

use thiserror::Error;

/// Failures surfaced through a group's `on_parsing_error` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The request line did not yield a method, URI and protocol triple.
    #[error("malformed request line")]
    MalformedRequest,

    /// The chunk size line did not start with a hex number, or the number
    /// overflowed.
    #[error("invalid chunk size line")]
    MalformedChunkSize,

    /// Bytes were fed to a parser whose request already finished.
    #[error("request already complete")]
    RequestComplete,
}
