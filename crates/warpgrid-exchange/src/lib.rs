//! WarpGrid in-memory HTTP exchange.
//!
//! The server-side half of the test host: everything one request/response
//! exchange needs without a socket.
//!
//! - [`HttpContext`] carries the request, the response and per-request state
//!   into the application pipeline.
//! - [`HttpResponse`] is the response state machine (status and headers
//!   mutable until start, on-starting callbacks, body writes, trailers).
//! - [`pipe`] is the bounded byte channel standing in for each direction of
//!   the connection.
//! - [`ExchangeHandle`] lets the dispatcher wait for the response head and
//!   finish, fail or cancel the exchange.
//! - [`WebSocket`] is a message-framed connection created on upgrade.
//!
//! # Abort model
//!
//! Each exchange has one request-aborted [`CancellationToken`]. It fires when
//! the application aborts or resets, when the client cancels, or when the
//! owning server is disposed. Body reads and writes select against it, so a
//! suspended operation on either side is released promptly.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

mod context;
mod error;
mod header;
pub mod pipe;
mod request;
mod response;
pub mod websocket;

pub use context::{
    ExchangeHandle, ExchangeOptions, ExchangeParts, HttpContext, Outcome, ResetFeature,
    UNREAD_REQUEST_BODY,
};
pub use error::{Error, Result};
pub use header::HeaderDictionary;
pub use pipe::{pipe, PipeReader, PipeWriter, ReadResult, ReaderCloser, DEFAULT_PIPE_CAPACITY};
pub use request::{HttpRequest, RequestBodyReader};
pub use response::{HttpResponse, OnStartingCallback, ResponseHead};
pub use websocket::{CloseFrame, Message, WebSocket, WebSocketState};
