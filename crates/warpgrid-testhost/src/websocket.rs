//! WebSocket client over the in-memory bridge.
//!
//! The handshake is an ordinary request dispatched through the
//! [`ClientHandler`]; when the application accepts the upgrade the client
//! half of a connected [`WebSocket`] pair comes back over a oneshot channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::header::{
    HeaderValue, CONNECTION, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION,
    UPGRADE,
};
use http::uri::{Parts, Scheme};
use http::{Method, Request, StatusCode, Uri};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use warpgrid_exchange::{Error, Result, WebSocket};

use crate::content::RequestBody;
use crate::convert;
use crate::handler::ClientHandler;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

type RequestHook = Arc<dyn Fn(&mut Request<RequestBody>) + Send + Sync>;

/// Connects WebSockets to the application hosted by a test server.
#[derive(Clone)]
pub struct WebSocketClient {
    handler: ClientHandler,
    base_address: Uri,
    sub_protocols: Vec<String>,
    configure_request: Option<RequestHook>,
}

impl WebSocketClient {
    pub(crate) fn new(handler: ClientHandler, base_address: Uri) -> Self {
        Self {
            handler,
            base_address,
            sub_protocols: Vec::new(),
            configure_request: None,
        }
    }

    /// Offer `protocol` to the server. Repeat to offer several, most
    /// preferred first.
    pub fn with_sub_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.sub_protocols.push(protocol.into());
        self
    }

    /// Adjust the handshake request before it is sent.
    pub fn configure_request<F>(mut self, configure: F) -> Self
    where
        F: Fn(&mut Request<RequestBody>) + Send + Sync + 'static,
    {
        self.configure_request = Some(Arc::new(configure));
        self
    }

    pub fn sub_protocols(&self) -> &[String] {
        &self.sub_protocols
    }

    /// Perform the handshake against `uri` (`ws://`, `wss://`, `http(s)://`
    /// or relative to the base address).
    pub async fn connect(&self, uri: &str) -> Result<WebSocket> {
        self.connect_inner(uri, None).await
    }

    pub async fn connect_cancellable(
        &self,
        uri: &str,
        token: &CancellationToken,
    ) -> Result<WebSocket> {
        self.connect_inner(uri, Some(token)).await
    }

    async fn connect_inner(&self, uri: &str, token: Option<&CancellationToken>) -> Result<WebSocket> {
        let request = self.handshake_request(uri)?;
        let (upgrade, accepted) = oneshot::channel();

        let response = self.handler.dispatch(&request, token, Some(upgrade)).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(Error::invalid_operation(format!(
                "Incomplete handshake, status code: {}",
                response.status().as_u16()
            )));
        }
        let mut body = response.into_body();
        body.release();

        let socket = accepted
            .await
            .map_err(|_| Error::WebSocket("the server did not complete the upgrade".into()))?;
        debug!(sub_protocol = ?socket.sub_protocol(), "websocket connected");
        Ok(socket)
    }

    fn handshake_request(&self, uri: &str) -> Result<Request<RequestBody>> {
        let uri = http_uri(convert::resolve_uri(&self.base_address, uri)?)?;

        let mut request = Request::new(RequestBody::empty());
        *request.method_mut() = Method::GET;
        *request.uri_mut() = uri;
        let headers = request.headers_mut();
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(SEC_WEBSOCKET_KEY, HeaderValue::from_str(&next_key())?);
        if !self.sub_protocols.is_empty() {
            headers.insert(
                SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(&self.sub_protocols.join(", "))?,
            );
        }

        if let Some(configure) = &self.configure_request {
            configure(&mut request);
        }
        Ok(request)
    }
}

impl std::fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("base_address", &self.base_address)
            .field("sub_protocols", &self.sub_protocols)
            .finish()
    }
}

/// Map `ws` to `http` and `wss` to `https`.
fn http_uri(uri: Uri) -> Result<Uri> {
    let scheme = match uri.scheme_str() {
        Some("ws") => Scheme::HTTP,
        Some("wss") => Scheme::HTTPS,
        _ => return Ok(uri),
    };
    let mut parts = Parts::from(uri);
    parts.scheme = Some(scheme);
    Uri::from_parts(parts).map_err(|e| Error::InvalidUri(e.to_string()))
}

/// A unique 16-byte key, hex encoded.
fn next_key() -> String {
    let n = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
    let mut key = [0u8; 16];
    key[8..].copy_from_slice(&n.to_be_bytes());
    hex::encode(key)
}
