use std::io;

use http::Uri;

use crate::response::Response;

/// Errors produced while executing a request.
///
/// The variants follow the engine's classification rules: [`Error::Io`] and
/// [`Error::ConnectTimeout`] are transport-level and considered recoverable
/// by the retry layer, [`Error::Status`] is recoverable for a small set of
/// status codes, everything else fails the call immediately.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid user input, detected before any I/O happens.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Transport-level failure: DNS, connect, TLS, reset, EOF before
    /// response, read timeout.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// No connection could be acquired within the connect deadline.
    #[error("timeout acquiring connection")]
    ConnectTimeout,

    /// The server sent bytes that do not parse as HTTP/1.1.
    #[error("parse: {0}")]
    Parse(#[from] ParseError),

    /// The response carried an error status (4xx/5xx) and the call had
    /// `status_exception` enabled. The full response is retained.
    #[error("status {status}")]
    Status {
        /// The response status code.
        status: u16,
        /// The response that carried the status.
        response: Box<Response>,
    },

    /// More redirects than `redirect_limit` allows.
    #[error("too many redirects ({})", history.len())]
    TooManyRedirects {
        /// Every URI visited, in order.
        history: Vec<Uri>,
    },

    /// The call was aborted through its [`CancelToken`][crate::CancelToken].
    #[error("canceled")]
    Canceled,

    /// The serialization buffer cannot hold the longest request row.
    #[error("output too small to write request")]
    OutputOverflow,

    /// Attempt to stream request body data after the body was finished.
    #[error("request body written after finish")]
    BodyContentAfterFinish,

    /// Attempt to stream a larger request body than the declared
    /// `content-length`.
    #[error("request body larger than content-length")]
    BodyLargerThanContentLength,
}

impl Error {
    /// Whether the retry layer may re-issue the request after this error.
    ///
    /// Transport errors are always recoverable. Status errors are
    /// recoverable for 403, 408 and any 5xx. The caller still applies the
    /// idempotency and streamed-body guards on top of this.
    pub(crate) fn is_recoverable(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectTimeout => true,
            Error::Status { status, .. } => retryable_status(*status),
            _ => false,
        }
    }

    /// The response status, when this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Recover the response from a status error.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Error::Status { response, .. } => Some(*response),
            _ => None,
        }
    }

    pub(crate) fn timed_out(kind: &'static str) -> Error {
        Error::Io(io::Error::new(io::ErrorKind::TimedOut, kind))
    }
}

/// Whether a status code is in the retryable set {403, 408, 5xx}.
pub(crate) fn retryable_status(status: u16) -> bool {
    status == 403 || status == 408 || status >= 500
}

/// Malformed wire bytes. Never recoverable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The status line or a header field did not parse.
    #[error("http parse fail: {0}")]
    Prelude(String),

    /// More response headers than the parser is prepared to hold.
    #[error("http parse resulted in too many headers")]
    TooManyHeaders,

    /// The status line had no HTTP version.
    #[error("http response missing version")]
    MissingVersion,

    /// Only HTTP/1.0 and HTTP/1.1 responses are handled.
    #[error("unsupported http version")]
    UnsupportedVersion,

    /// The status code was missing or out of range.
    #[error("http response invalid status")]
    InvalidStatus,

    /// A 100 Continue response must not carry headers.
    #[error("received headers with 100-continue response")]
    HeadersWith100,

    /// Chunk length contained a non-ascii byte.
    #[error("chunk length is not ascii")]
    ChunkLenNotAscii,

    /// Chunk length was not valid hex.
    #[error("chunk length cannot be read as a number")]
    ChunkLenNotANumber,

    /// Expected CRLF in chunked framing.
    #[error("chunk expected crlf as next character")]
    ChunkExpectedCrLf,

    /// More than one `content-length` header with differing values.
    #[error("conflicting content-length headers")]
    ConflictingContentLength,

    /// `content-length` header was not a number.
    #[error("content-length header not a number")]
    BadContentLength,
}

impl From<httparse::Error> for ParseError {
    fn from(value: httparse::Error) -> Self {
        match value {
            httparse::Error::TooManyHeaders => ParseError::TooManyHeaders,
            e => ParseError::Prelude(e.to_string()),
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(value: httparse::Error) -> Self {
        Error::Parse(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        let io = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(io.is_recoverable());
        assert!(Error::ConnectTimeout.is_recoverable());

        assert!(!Error::Argument("bad".into()).is_recoverable());
        assert!(!Error::Parse(ParseError::TooManyHeaders).is_recoverable());
        assert!(!Error::Canceled.is_recoverable());
    }

    #[test]
    fn retryable_status_set() {
        assert!(retryable_status(403));
        assert!(retryable_status(408));
        assert!(retryable_status(500));
        assert!(retryable_status(503));
        assert!(!retryable_status(404));
        assert!(!retryable_status(200));
        assert!(!retryable_status(302));
    }

    #[test]
    fn from_httparse_error() {
        let error: ParseError = httparse::Error::HeaderName.into();
        assert!(matches!(error, ParseError::Prelude(_)));

        let error: ParseError = httparse::Error::TooManyHeaders.into();
        assert_eq!(error, ParseError::TooManyHeaders);
    }
}
