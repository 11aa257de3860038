//! The in-process test server.

use std::sync::Arc;

use http::{Response, Uri};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use warpgrid_exchange::{HttpContext, Result};

use crate::body::ResponseBody;
use crate::client::TestClient;
use crate::config::TestServerOptions;
use crate::handler::{ClientHandler, RequestDelegate};
use crate::websocket::WebSocketClient;

/// Hosts an application pipeline in memory.
///
/// The server owns the pipeline and hands out clients that dispatch to it.
/// Disposing the server (explicitly or by dropping it) fails later sends
/// with [`Error::ObjectDisposed`](warpgrid_exchange::Error::ObjectDisposed)
/// and aborts every request still in flight.
pub struct TestServer {
    app: RequestDelegate,
    options: Arc<TestServerOptions>,
    lifetime: CancellationToken,
}

impl TestServer {
    pub fn new(app: RequestDelegate) -> Self {
        Self::with_options(app, TestServerOptions::default())
    }

    pub fn with_options(app: RequestDelegate, options: TestServerOptions) -> Self {
        debug!(base_address = %options.base_address, "test server created");
        Self {
            app,
            options: Arc::new(options),
            lifetime: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &TestServerOptions {
        &self.options
    }

    pub fn base_address(&self) -> &Uri {
        &self.options.base_address
    }

    /// A handler dispatching request messages to the pipeline.
    pub fn create_handler(&self) -> ClientHandler {
        ClientHandler::new(self.app.clone(), self.options.clone(), self.lifetime.clone())
    }

    /// A client resolving relative URIs against the base address.
    pub fn create_client(&self) -> TestClient {
        TestClient::new(self.create_handler(), self.base_address().clone())
    }

    pub fn create_websocket_client(&self) -> WebSocketClient {
        WebSocketClient::new(self.create_handler(), self.base_address().clone())
    }

    /// Dispatch a request built directly on the context. `configure` sets the
    /// request up (method, path, headers...) before the pipeline runs.
    pub async fn send_context<F>(&self, configure: F) -> Result<Response<ResponseBody>>
    where
        F: FnOnce(&mut HttpContext),
    {
        self.create_handler().dispatch_context(configure).await
    }

    /// Stop accepting requests and abort those in flight. Idempotent.
    pub fn dispose(&self) {
        if !self.lifetime.is_cancelled() {
            debug!("test server disposed");
            self.lifetime.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.lifetime.is_cancelled()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for TestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestServer")
            .field("options", &self.options)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
