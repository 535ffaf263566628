// Copyright (c) 2024-present, dedup-index contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::fmt;

/// Errors produced by the deduplication index.
///
/// Variants map directly onto the error taxonomy the index is specified
/// against: invalid arguments, overflow, corrupt data, out-of-memory,
/// I/O, bad cursor/record state and busy/suspended.
#[derive(Debug)]
pub enum Error {
    /// Out-of-range chapter number, bad magic, unexpected request type, ...
    InvalidArgument(&'static str),

    /// A delta list could not accept a new entry; the entry was dropped.
    ///
    /// Non-fatal: callers log and continue. Exposed as a variant (rather
    /// than only as a counter) so a caller that cares can match on it.
    Overflow,

    /// Magic mismatch, nonce mismatch, inconsistent zone headers, or a
    /// guard list mismatch on restore.
    CorruptData(&'static str),

    /// Memory could not be allocated for an operation. Never recovered
    /// from automatically.
    OutOfMemory,

    /// Underlying I/O failure. Sticky on writers: once set, every
    /// subsequent call against that writer returns the same error.
    Io(std::io::Error),

    /// Operation attempted on an invalidated cursor or a new (not found)
    /// record.
    BadState(&'static str),

    /// The controller is suspended or a rebuild was cancelled.
    Busy,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Overflow => write!(f, "delta list overflow"),
            Self::CorruptData(msg) => write!(f, "corrupt data: {msg}"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::BadState(msg) => write!(f, "bad state: {msg}"),
            Self::Busy => write!(f, "busy or suspended"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_mentions_kind() {
        assert!(Error::Overflow.to_string().contains("overflow"));
        assert!(Error::Busy.to_string().contains("busy"));
    }
}
