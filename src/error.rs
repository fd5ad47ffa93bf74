use std::io;

use thiserror::Error;

/// Failure of a single wire operation, classified by kind.
///
/// Retryability is decided on the variant, never on error text.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server error: status {0}")]
    Server(u16),

    #[error("upload offset conflict (status 409)")]
    OffsetConflict,

    #[error("checksum mismatch (status 460)")]
    ChecksumMismatch,

    #[error("client error: status {0}")]
    Client(u16),

    #[error("response missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid {header} header: {value:?}")]
    InvalidHeader {
        header: &'static str,
        value: String,
    },
}

impl ProtocolError {
    /// Whether repeating the same request may succeed.
    ///
    /// `OffsetConflict` is deliberately not retryable as-is: the caller must
    /// resync the offset with the server first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection(_) | Self::Server(_) | Self::ChecksumMismatch
        )
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Connection(err.to_string())
        }
    }

    pub(crate) fn from_status(status: reqwest::StatusCode) -> Self {
        match status.as_u16() {
            409 => Self::OffsetConflict,
            460 => Self::ChecksumMismatch,
            code if status.is_server_error() => Self::Server(code),
            code => Self::Client(code),
        }
    }
}

/// Terminal result of one upload invocation.
///
/// Retries and intermediate failures stay internal; exactly one of these is
/// returned per call. `Resumable` and `Cancelled` both leave a checkpoint
/// behind, so re-invoking continues from the last server-confirmed offset.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("upload creation failed: {0}")]
    Create(#[source] ProtocolError),

    #[error("chunk upload failed at offset {offset} after {attempts} attempts: {source}")]
    Resumable {
        offset: u64,
        attempts: u32,
        #[source]
        source: ProtocolError,
    },

    #[error("upload cancelled at offset {offset}")]
    Cancelled { offset: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(ProtocolError::Timeout.is_retryable());
        assert!(ProtocolError::Connection("reset by peer".into()).is_retryable());
        assert!(ProtocolError::Server(502).is_retryable());
        assert!(ProtocolError::ChecksumMismatch.is_retryable());
    }

    #[test]
    fn fatal_kinds_are_not_retryable() {
        assert!(!ProtocolError::Client(403).is_retryable());
        assert!(!ProtocolError::MissingHeader("Location").is_retryable());
        assert!(!ProtocolError::OffsetConflict.is_retryable());
    }

    #[test]
    fn status_classification() {
        use reqwest::StatusCode;
        assert!(matches!(
            ProtocolError::from_status(StatusCode::CONFLICT),
            ProtocolError::OffsetConflict
        ));
        assert!(matches!(
            ProtocolError::from_status(StatusCode::from_u16(460).unwrap()),
            ProtocolError::ChecksumMismatch
        ));
        assert!(matches!(
            ProtocolError::from_status(StatusCode::INTERNAL_SERVER_ERROR),
            ProtocolError::Server(500)
        ));
        assert!(matches!(
            ProtocolError::from_status(StatusCode::NOT_FOUND),
            ProtocolError::Client(404)
        ));
    }
}
