//! warpgrid-testhost: in-process test host for WarpGrid applications.
//!
//! Runs an application pipeline in memory and dispatches HTTP requests to
//! it without opening a socket. Request and response bodies flow through
//! bounded in-memory pipes, so streaming, back-pressure, trailers, aborts
//! and resets behave the way they would over a connection.
//!
//! # Architecture
//!
//! ```text
//! TestClient / WebSocketClient
//!   │
//!   ▼
//! ClientHandler ── http::Request<RequestBody> → HttpContext
//!   │
//!   ├── spawn pipeline(HttpContext)        (RequestDelegate)
//!   ├── wait for the response to start
//!   │
//!   ▼
//! http::Response<ResponseBody>             (body bound to the response pipe)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use warpgrid_testhost::{request_delegate, TestServer};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let server = TestServer::new(request_delegate(|ctx| async move {
//!     let body = ctx.request().body().read_to_string().await?;
//!     ctx.response().write(format!("{body} POST Response")).await?;
//!     Ok(())
//! }));
//!
//! let response = server.create_client().post("/").body("Hello world").send().await?;
//! assert_eq!(response.into_body().text().await?, "Hello world POST Response");
//! # Ok(())
//! # }
//! ```

pub mod body;
pub mod client;
pub mod config;
pub mod content;
pub mod convert;
pub mod handler;
pub mod server;
pub mod websocket;

pub use body::ResponseBody;
pub use client::{RequestBuilder, TestClient};
pub use config::TestServerOptions;
pub use content::{Content, ContentProducer, ContentWriter, RequestBody};
pub use handler::{request_delegate, ClientHandler, ContextHook, ReasonPhrase, RequestDelegate};
pub use server::TestServer;
pub use websocket::WebSocketClient;

pub use warpgrid_exchange::{
    CloseFrame, Error, HttpContext, HttpRequest, HttpResponse, Message, ResetFeature, Result,
    WebSocket, WebSocketState, UNREAD_REQUEST_BODY,
};
