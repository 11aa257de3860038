//! Error taxonomy for in-memory HTTP exchanges.
//!
//! Errors are cloneable because a single terminal outcome is observed from
//! several places at once: the dispatcher, the client body reader and the
//! application's own pending reads.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for exchange operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the exchange model and the test host built on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("{0}")]
    NotSupported(&'static str),

    #[error("cannot access a disposed object: {0}")]
    ObjectDisposed(&'static str),

    #[error("{0}")]
    InvalidOperation(String),

    #[error("status code {0} is out of range, expected a value between 100 and 999")]
    StatusCodeOutOfRange(u16),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("the operation was canceled")]
    Cancelled,

    #[error("The application aborted the request.")]
    Aborted,

    #[error("The application reset the request with error code {code}.")]
    Reset { code: u32 },

    #[error("{0}")]
    Application(Arc<anyhow::Error>),

    #[error("error while copying content to a stream")]
    Transport(#[source] Box<Error>),

    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl Error {
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    pub fn application(err: anyhow::Error) -> Self {
        Self::Application(Arc::new(err))
    }

    /// Wrap a terminal error observed while reading a body that was already
    /// streaming. Client-side cancellation is reported as-is.
    pub fn transport(inner: Error) -> Self {
        match inner {
            Error::Cancelled | Error::Transport(_) => inner,
            other => Self::Transport(Box::new(other)),
        }
    }

    /// True for every cancellation-flavored error, including abort and reset,
    /// whether or not it was wrapped as a transport error.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Cancelled | Error::Aborted | Error::Reset { .. } => true,
            Error::Transport(inner) => inner.is_cancellation(),
            _ => false,
        }
    }

    /// The reset code carried by this error, looking through transport wrapping.
    pub fn reset_code(&self) -> Option<u32> {
        match self {
            Error::Reset { code } => Some(*code),
            Error::Transport(inner) => inner.reset_code(),
            _ => None,
        }
    }

    /// The original application failure, looking through transport wrapping.
    pub fn application_error(&self) -> Option<&anyhow::Error> {
        match self {
            Error::Application(err) => Some(err),
            Error::Transport(inner) => inner.application_error(),
            _ => None,
        }
    }

    /// The innermost error, stripping any transport wrapping.
    pub fn root(&self) -> &Error {
        match self {
            Error::Transport(inner) => inner.root(),
            other => other,
        }
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

impl From<http::uri::InvalidUri> for Error {
    fn from(err: http::uri::InvalidUri) -> Self {
        Self::InvalidUri(err.to_string())
    }
}
