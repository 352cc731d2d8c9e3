//! Error types for the HTTP layer.

use thiserror::Error;

use crate::fastcgi::FastCgiError;
use crate::http::status;

/// A protocol-level failure that becomes an error page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status} {message}")]
pub struct HttpError {
    pub status: u16,
    pub message: String,
}

impl HttpError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Error carrying the standard description for `status`.
    pub fn from_status(status: u16) -> Self {
        Self::new(status, status::description(status))
    }
}

/// Failure while reading a request off the socket.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Malformed request. `recoverable` is true when the whole header block
    /// was consumed, no body was declared and the client allows keep-alive,
    /// so the connection can serve another request.
    #[error("bad request: {error}")]
    Http {
        error: HttpError,
        recoverable: bool,
        /// The request line, when one was read.
        request_line: Option<String>,
    },

    #[error("timed out waiting for request data")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure that ends the current request on a connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("read timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("headers already sent")]
    HeadersSent,

    #[error("upstream failure: {0}")]
    Upstream(#[from] FastCgiError),
}

impl From<RequestError> for ServerError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Http { error, .. } => ServerError::Http(error),
            RequestError::Timeout => ServerError::Timeout,
            RequestError::Io(e) => ServerError::Io(e),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ServerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ServerError::Timeout
    }
}

impl ServerError {
    /// Transport-level failures end the connection quietly.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ServerError::Timeout => true,
            ServerError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
