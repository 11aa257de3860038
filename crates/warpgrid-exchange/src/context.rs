//! Per-request context and exchange bookkeeping.
//!
//! [`HttpContext::new_exchange`] creates everything one request needs:
//! the context handed to the application, the [`ExchangeHandle`] the
//! dispatcher keeps, and the client-side pipe ends (request body writer,
//! response body reader).
//!
//! # Terminal outcome
//!
//! Every exchange ends exactly once, with the first of:
//!
//! | Outcome     | Trigger                                         |
//! |-------------|-------------------------------------------------|
//! | `Completed` | pipeline returned `Ok` and the response started |
//! | `Failed`    | pipeline error, panic, or on-starting failure   |
//! | `Aborted`   | [`HttpContext::abort`]                          |
//! | `Reset`     | [`ResetFeature::reset`]                         |
//! | `Cancelled` | the client gave up                              |
//!
//! Later triggers are ignored. Anything but `Completed` fires the
//! request-aborted token and fails the response body with the matching
//! error.
//!
//! When the pipeline returns, the request body reader is closed. A read the
//! application still has pending (e.g. from a task that outlived the
//! pipeline) fails with [`UNREAD_REQUEST_BODY`] and so does the exchange.

use std::sync::{Arc, OnceLock};

use http::{Extensions, HeaderMap, Version};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pipe::{pipe, PipeReader, PipeWriter, ReaderCloser, DEFAULT_PIPE_CAPACITY};
use crate::request::{HttpRequest, RequestBodyReader};
use crate::response::{HttpResponse, Progress, ResponseHead};
use crate::websocket::WebSocket;

/// Reported when the pipeline returns while a request body read is pending.
pub const UNREAD_REQUEST_BODY: &str =
    "The application completed without reading the entire request body.";

/// How an exchange ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed,
    Failed(Error),
    Aborted,
    Reset(u32),
    Cancelled,
}

impl Outcome {
    /// The error a reader of the response observes for this outcome.
    pub fn error(&self) -> Option<Error> {
        match self {
            Outcome::Completed => None,
            Outcome::Failed(err) => Some(err.clone()),
            Outcome::Aborted => Some(Error::Aborted),
            Outcome::Reset(code) => Some(Error::Reset { code: *code }),
            Outcome::Cancelled => Some(Error::Cancelled),
        }
    }
}

/// Settings for a new exchange.
#[derive(Debug)]
pub struct ExchangeOptions {
    pub allow_synchronous_io: bool,
    pub request_buffer_size: usize,
    pub response_buffer_size: usize,
    /// When set, the request-aborted token is a child of this token.
    pub parent_token: Option<CancellationToken>,
    /// Channel for the client half of an accepted WebSocket. Its presence is
    /// what makes the request a WebSocket request.
    pub websocket_upgrade: Option<oneshot::Sender<WebSocket>>,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            allow_synchronous_io: false,
            request_buffer_size: DEFAULT_PIPE_CAPACITY,
            response_buffer_size: DEFAULT_PIPE_CAPACITY,
            parent_token: None,
            websocket_upgrade: None,
        }
    }
}

/// Everything created for one exchange.
#[derive(Debug)]
pub struct ExchangeParts {
    /// Handed to the application pipeline.
    pub context: HttpContext,
    /// Kept by the dispatcher.
    pub handle: ExchangeHandle,
    /// The client writes request content here.
    pub request_body: PipeWriter,
    /// The client reads response content here.
    pub response_body: PipeReader,
}

struct Exchange {
    outcome: OnceLock<Outcome>,
    aborted: CancellationToken,
    response: HttpResponse,
    request_body: ReaderCloser,
    upgrade: Mutex<Option<oneshot::Sender<WebSocket>>>,
}

impl Exchange {
    /// Record `outcome` if none was recorded yet and propagate it.
    fn terminate(&self, outcome: Outcome) -> bool {
        if self.outcome.set(outcome.clone()).is_err() {
            return false;
        }
        match outcome.error() {
            None => self.response.body().complete(),
            Some(err) => {
                debug!(error = %err, "exchange terminated");
                self.aborted.cancel();
                self.response.body().abort(err);
            }
        }
        self.response.freeze_trailers();
        self.response.finish_progress();
        true
    }
}

/// The dispatcher's handle to an exchange. Cheap to clone.
#[derive(Clone)]
pub struct ExchangeHandle {
    exchange: Arc<Exchange>,
}

impl ExchangeHandle {
    /// Wait until the response head is committed or the exchange ends.
    ///
    /// Returns the head when the response started. An exchange that ended
    /// before starting returns its terminal error.
    pub async fn response_started(&self) -> Result<ResponseHead> {
        let response = &self.exchange.response;
        let mut progress = response.subscribe_progress();
        // The sender lives as long as the response, which this handle keeps.
        let _ = progress.wait_for(|p| *p != Progress::Pending).await;

        if response.is_committed() {
            return Ok(response.head());
        }
        match self.outcome() {
            Some(Outcome::Completed) => Ok(response.head()),
            Some(outcome) => Err(outcome.error().unwrap_or(Error::Cancelled)),
            // An on-starting callback failed; the pipeline may still be running.
            None => Err(response.start_failure().unwrap_or_else(|| {
                Error::invalid_operation("exchange finished without recording an outcome")
            })),
        }
    }

    /// Finish after the pipeline returned.
    ///
    /// The request body reader is closed first. On success the response is
    /// started if it has not been (running any on-starting callbacks) and
    /// the body is completed, unless a request body read was still pending.
    pub async fn finish(&self, result: anyhow::Result<()>) {
        let read_pending = self
            .exchange
            .request_body
            .close_with(Error::invalid_operation(UNREAD_REQUEST_BODY));
        match result {
            Ok(()) if read_pending => {
                debug!("pipeline returned with a request body read pending");
                self.exchange
                    .terminate(Outcome::Failed(Error::invalid_operation(UNREAD_REQUEST_BODY)));
            }
            Ok(()) => match self.exchange.response.start().await {
                Ok(()) => {
                    if self.exchange.terminate(Outcome::Completed) {
                        debug!("exchange completed");
                    }
                }
                Err(err) => {
                    self.exchange.terminate(Outcome::Failed(err));
                }
            },
            Err(err) => {
                debug!(error = %err, "application failed");
                // Exchange errors propagated by the application keep their kind.
                let err = match err.downcast::<Error>() {
                    Ok(err) => err,
                    Err(err) => Error::application(err),
                };
                self.exchange.terminate(Outcome::Failed(err));
            }
        }
    }

    /// Fail the exchange with `error` unless it already ended.
    pub fn fail(&self, error: Error) {
        self.exchange.terminate(Outcome::Failed(error));
    }

    /// The client gave up on the exchange.
    pub fn cancel(&self) {
        if self.exchange.terminate(Outcome::Cancelled) {
            debug!("exchange cancelled by the client");
        }
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.exchange.outcome.get().cloned()
    }

    pub fn is_finished(&self) -> bool {
        self.exchange.outcome.get().is_some()
    }

    /// Fires when the request is aborted for any reason.
    pub fn aborted(&self) -> CancellationToken {
        self.exchange.aborted.clone()
    }

    /// Snapshot of the response trailers.
    pub fn trailers(&self) -> HeaderMap {
        self.exchange.response.trailers()
    }
}

impl std::fmt::Debug for ExchangeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeHandle")
            .field("outcome", &self.exchange.outcome.get())
            .finish()
    }
}

/// Per-request context handed to the application pipeline.
pub struct HttpContext {
    request: HttpRequest,
    response: HttpResponse,
    exchange: Arc<Exchange>,
    items: Extensions,
    execution_context: Extensions,
}

impl HttpContext {
    /// Create a context with its dispatcher handle and client-side pipe ends.
    pub fn new_exchange(options: ExchangeOptions) -> ExchangeParts {
        let aborted = match &options.parent_token {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (request_writer, request_reader) = pipe(options.request_buffer_size);
        let (response_writer, response_reader) = pipe(options.response_buffer_size);

        let response = HttpResponse::new(
            response_writer,
            aborted.clone(),
            options.allow_synchronous_io,
        );
        let exchange = Arc::new(Exchange {
            outcome: OnceLock::new(),
            aborted: aborted.clone(),
            response: response.clone(),
            request_body: request_reader.closer(),
            upgrade: Mutex::new(options.websocket_upgrade),
        });
        let request = HttpRequest::new(RequestBodyReader::new(
            request_reader,
            aborted,
            options.allow_synchronous_io,
        ));

        ExchangeParts {
            context: HttpContext {
                request,
                response,
                exchange: exchange.clone(),
                items: Extensions::new(),
                execution_context: Extensions::new(),
            },
            handle: ExchangeHandle { exchange },
            request_body: request_writer,
            response_body: response_reader,
        }
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut HttpRequest {
        &mut self.request
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// Per-request bag for application state.
    pub fn items(&self) -> &Extensions {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut Extensions {
        &mut self.items
    }

    /// Caller-scoped values flowed in from the client request. Empty unless
    /// the server preserves the execution context.
    pub fn execution_context(&self) -> &Extensions {
        &self.execution_context
    }

    pub fn set_execution_context(&mut self, values: Extensions) {
        self.execution_context = values;
    }

    /// Fires when the request is aborted, reset, cancelled by the client or
    /// its server is disposed.
    pub fn request_aborted(&self) -> CancellationToken {
        self.exchange.aborted.clone()
    }

    /// Abort the request. Before the response started the client's send
    /// fails; afterwards the client's body read fails.
    pub fn abort(&self) {
        if self.exchange.terminate(Outcome::Aborted) {
            debug!("application aborted the request");
        }
    }

    /// The stream-reset capability, only present for HTTP/2 and HTTP/3.
    pub fn reset_feature(&self) -> Option<ResetFeature> {
        match self.request.protocol() {
            Version::HTTP_2 | Version::HTTP_3 => Some(ResetFeature {
                exchange: self.exchange.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_websocket_request(&self) -> bool {
        self.exchange.upgrade.lock().is_some()
    }

    /// Subprotocols offered by the client, in preference order.
    pub fn requested_websocket_protocols(&self) -> Vec<String> {
        self.request
            .headers()
            .get_all(http::header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// Accept the WebSocket upgrade, answering `101 Switching Protocols`.
    pub async fn accept_websocket(&self, sub_protocol: Option<&str>) -> Result<WebSocket> {
        let upgrade = self
            .exchange
            .upgrade
            .lock()
            .take()
            .ok_or_else(|| Error::invalid_operation("Not a WebSocket request or already accepted."))?;

        self.response.set_status(101)?;
        self.response.headers_mut(|headers| -> Result<()> {
            headers.insert(http::header::CONNECTION.as_str(), "Upgrade")?;
            headers.insert(http::header::UPGRADE.as_str(), "websocket")?;
            if let Some(protocol) = sub_protocol {
                headers.insert(http::header::SEC_WEBSOCKET_PROTOCOL.as_str(), protocol)?;
            }
            Ok(())
        })??;

        let (server, client) = WebSocket::pair(sub_protocol.map(str::to_owned));
        if upgrade.send(client).is_err() {
            return Err(Error::Cancelled);
        }
        self.response.start().await?;
        debug!(sub_protocol = ?sub_protocol, "websocket accepted");
        Ok(server)
    }
}

impl std::fmt::Debug for HttpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpContext")
            .field("request", &self.request)
            .field("response", &self.response)
            .finish()
    }
}

/// Lets the application reset an HTTP/2 or HTTP/3 stream with an error code.
#[derive(Clone)]
pub struct ResetFeature {
    exchange: Arc<Exchange>,
}

impl ResetFeature {
    pub fn reset(&self, error_code: u32) {
        if self.exchange.terminate(Outcome::Reset(error_code)) {
            debug!(error_code, "application reset the request");
        }
    }
}

impl std::fmt::Debug for ResetFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetFeature").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> ExchangeParts {
        HttpContext::new_exchange(ExchangeOptions::default())
    }

    #[tokio::test]
    async fn completion_starts_an_unstarted_response() {
        let parts = exchange();
        parts.handle.finish(Ok(())).await;

        let head = parts.handle.response_started().await.unwrap();
        assert_eq!(head.status, http::StatusCode::OK);
        assert!(parts.context.response().has_started());
        assert!(matches!(parts.handle.outcome(), Some(Outcome::Completed)));
        assert!(parts.response_body.read_to_end().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_before_start_is_returned_to_the_dispatcher() {
        let parts = exchange();
        parts.handle.finish(Err(anyhow::anyhow!("boom"))).await;

        let err = parts.handle.response_started().await.unwrap_err();
        assert_eq!(err.application_error().unwrap().to_string(), "boom");
    }

    #[tokio::test]
    async fn failure_after_start_reaches_the_body_reader() {
        let parts = exchange();
        parts.context.response().write("partial").await.unwrap();
        parts.handle.response_started().await.unwrap();

        parts.handle.finish(Err(anyhow::anyhow!("late"))).await;
        assert_eq!(parts.response_body.read_chunk().await.unwrap().unwrap(), "partial");
        let err = parts.response_body.read_chunk().await.unwrap_err();
        assert!(matches!(err, Error::Application(_)));
    }

    #[tokio::test]
    async fn abort_before_start_fails_the_send() {
        let parts = exchange();
        let aborted = parts.context.request_aborted();
        parts.context.abort();

        assert!(aborted.is_cancelled());
        let err = parts.handle.response_started().await.unwrap_err();
        assert!(matches!(err, Error::Aborted));

        // The response can no longer start.
        assert!(matches!(
            parts.context.response().write("x").await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn first_outcome_wins() {
        let parts = exchange();
        parts.context.abort();
        parts.handle.finish(Err(anyhow::anyhow!("ignored"))).await;
        parts.handle.cancel();
        assert!(matches!(parts.handle.outcome(), Some(Outcome::Aborted)));
    }

    #[tokio::test]
    async fn reset_feature_depends_on_protocol() {
        let mut parts = exchange();
        assert!(parts.context.reset_feature().is_none());

        parts.context.request_mut().set_protocol(Version::HTTP_2);
        assert!(parts.context.reset_feature().is_some());
        parts.context.request_mut().set_protocol(Version::HTTP_3);
        let reset = parts.context.reset_feature().unwrap();

        reset.reset(12345);
        let err = parts.handle.response_started().await.unwrap_err();
        assert_eq!(err.reset_code(), Some(12345));
    }

    #[tokio::test]
    async fn parent_token_aborts_the_request() {
        let parent = CancellationToken::new();
        let parts = HttpContext::new_exchange(ExchangeOptions {
            parent_token: Some(parent.clone()),
            ..ExchangeOptions::default()
        });
        parent.cancel();
        assert!(parts.context.request_aborted().is_cancelled());
    }

    #[tokio::test]
    async fn trailers_freeze_when_the_exchange_ends() {
        let parts = exchange();
        parts.context.response().append_trailer("X-One", "1").unwrap();
        parts.handle.finish(Ok(())).await;

        assert_eq!(parts.handle.trailers().get("x-one").unwrap(), "1");
        assert!(parts.context.response().append_trailer("X-Two", "2").is_err());
    }

    #[tokio::test]
    async fn websocket_requires_an_upgrade_channel() {
        let parts = exchange();
        assert!(!parts.context.is_websocket_request());
        assert!(matches!(
            parts.context.accept_websocket(None).await,
            Err(Error::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn accepting_a_websocket_answers_101() {
        let (tx, rx) = oneshot::channel();
        let mut parts = HttpContext::new_exchange(ExchangeOptions {
            websocket_upgrade: Some(tx),
            ..ExchangeOptions::default()
        });
        parts
            .context
            .request_mut()
            .headers_mut()
            .insert(http::header::SEC_WEBSOCKET_PROTOCOL, "alpha, beta".parse().unwrap());

        assert!(parts.context.is_websocket_request());
        assert_eq!(
            parts.context.requested_websocket_protocols(),
            vec!["alpha".to_string(), "beta".to_string()]
        );

        let _server = parts.context.accept_websocket(Some("beta")).await.unwrap();
        let head = parts.handle.response_started().await.unwrap();
        assert_eq!(head.status, http::StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(head.headers.get("sec-websocket-protocol").unwrap(), "beta");

        let client = rx.await.unwrap();
        assert_eq!(client.sub_protocol(), Some("beta"));
    }

    #[tokio::test]
    async fn pending_request_read_at_completion_fails_the_exchange() {
        let parts = exchange();
        parts.context.response().flush().await.unwrap();

        let context = Arc::new(parts.context);
        let reader = tokio::spawn({
            let context = context.clone();
            async move {
                let mut buf = [0u8; 8];
                context.request().body().read(&mut buf).await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        parts.handle.finish(Ok(())).await;

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), UNREAD_REQUEST_BODY);
        assert!(matches!(
            parts.handle.outcome(),
            Some(Outcome::Failed(Error::InvalidOperation(_)))
        ));
        assert!(parts.request_body.is_reader_closed());
        assert!(parts.response_body.read_to_end().await.is_err());
    }

    #[tokio::test]
    async fn unread_request_body_alone_is_not_an_error() {
        let parts = exchange();
        parts.request_body.write("ignored").await.unwrap();
        parts.handle.finish(Ok(())).await;

        assert!(matches!(parts.handle.outcome(), Some(Outcome::Completed)));
        assert!(matches!(
            parts.request_body.write("more").await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn on_starting_failure_reaches_the_dispatcher_while_the_app_runs() {
        let parts = exchange();
        parts
            .context
            .response()
            .on_starting(|_| async { Err::<(), _>(anyhow::anyhow!("no start")) })
            .unwrap();
        assert!(parts.context.response().write("x").await.is_err());

        // The pipeline has not returned, yet the dispatcher already knows.
        let err = parts.handle.response_started().await.unwrap_err();
        assert_eq!(err.to_string(), "no start");
        assert!(parts.handle.outcome().is_none());

        parts.handle.finish(Ok(())).await;
        assert!(matches!(parts.handle.outcome(), Some(Outcome::Failed(_))));
    }
}
