//! Client handler: dispatches request messages to the application pipeline.
//!
//! `ClientHandler` plays the part a network connection plays for a real
//! server. Each send builds a fresh [`HttpContext`] from the request
//! message, streams the request content through the request pipe, runs the
//! pipeline on its own task and returns as soon as the response has
//! started, with a body bound to the response pipe.
//!
//! # Flow
//!
//! ```text
//! send(request)
//!   │
//!   ├── project request → HttpContext (path base, decoded path, headers)
//!   ├── spawn content producer ──▶ request pipe ──▶ app reads body
//!   ├── spawn pipeline(context)
//!   │
//!   ├── wait: response started │ exchange ended │ caller cancelled
//!   │
//!   ▼
//! http::Response<ResponseBody>  ◀── response pipe ◀── app writes body
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::{Request, Response, Version};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use warpgrid_exchange::{
    Error, ExchangeHandle, ExchangeOptions, ExchangeParts, HttpContext, PipeReader, PipeWriter,
    Result, WebSocket,
};

use crate::body::ResponseBody;
use crate::config::TestServerOptions;
use crate::content::{Content, ContentWriter, RequestBody};
use crate::convert;

/// The application pipeline: invoked once per request with its context.
pub type RequestDelegate =
    Arc<dyn Fn(HttpContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Adjusts a freshly built context before the pipeline sees it.
pub type ContextHook = Arc<dyn Fn(&mut HttpContext) + Send + Sync>;

/// Wrap an async closure as a [`RequestDelegate`].
pub fn request_delegate<F, Fut>(app: F) -> RequestDelegate
where
    F: Fn(HttpContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |context| Box::pin(app(context)))
}

/// Reason phrase set by the application, attached to response extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonPhrase(pub String);

/// Sends request messages to the application without a socket.
///
/// Cheap to clone. Every send is independent, so the same request message
/// can be sent any number of times.
#[derive(Clone)]
pub struct ClientHandler {
    app: RequestDelegate,
    options: Arc<TestServerOptions>,
    /// Fires when the owning server is disposed.
    lifetime: CancellationToken,
    configure_context: Option<ContextHook>,
}

impl ClientHandler {
    pub(crate) fn new(
        app: RequestDelegate,
        options: Arc<TestServerOptions>,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            app,
            options,
            lifetime,
            configure_context: None,
        }
    }

    /// Run `hook` on every context after it was built from the request
    /// message, e.g. to override the path base.
    pub fn with_context_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut HttpContext) + Send + Sync + 'static,
    {
        self.configure_context = Some(Arc::new(hook));
        self
    }

    /// Send `request` and wait until the application starts the response.
    pub async fn send(&self, request: &Request<RequestBody>) -> Result<Response<ResponseBody>> {
        self.dispatch(request, None, None).await
    }

    /// Like [`send`](Self::send). Firing `token` before the response started
    /// fails the send with [`Error::Cancelled`] and aborts the request.
    pub async fn send_cancellable(
        &self,
        request: &Request<RequestBody>,
        token: &CancellationToken,
    ) -> Result<Response<ResponseBody>> {
        self.dispatch(request, Some(token), None).await
    }

    /// Synchronous sends are not supported by the in-memory transport.
    pub fn send_blocking(&self, _request: &Request<RequestBody>) -> Result<Response<ResponseBody>> {
        Err(Error::NotSupported(
            "synchronous send is not supported, use send instead",
        ))
    }

    pub(crate) async fn dispatch(
        &self,
        request: &Request<RequestBody>,
        token: Option<&CancellationToken>,
        websocket_upgrade: Option<tokio::sync::oneshot::Sender<WebSocket>>,
    ) -> Result<Response<ResponseBody>> {
        self.ensure_alive()?;
        let content = request.body().content();
        if content.is_some_and(Content::is_disposed) {
            return Err(Error::ObjectDisposed("request content"));
        }

        let uri = convert::absolute_uri(&self.options.base_address, request.uri())?;
        let ExchangeParts {
            mut context,
            handle,
            request_body,
            response_body,
        } = HttpContext::new_exchange(self.exchange_options(websocket_upgrade));

        convert::apply_request(&mut context, request, &uri, self.options.path_base())?;
        if self.options.preserve_execution_context {
            context.set_execution_context(request.extensions().clone());
        }
        if let Some(configure) = &self.configure_context {
            configure(&mut context);
        }

        match content {
            Some(content) => spawn_content(content.clone(), request_body, handle.clone()),
            None => request_body.complete(),
        }

        let version = request.version();
        self.spawn_pipeline(context, handle.clone());
        wait_for_response(handle, response_body, version, token).await
    }

    /// Dispatch a context built by `configure` instead of a request message.
    /// The request has no body.
    pub(crate) async fn dispatch_context<F>(&self, configure: F) -> Result<Response<ResponseBody>>
    where
        F: FnOnce(&mut HttpContext),
    {
        self.ensure_alive()?;
        let ExchangeParts {
            mut context,
            handle,
            request_body,
            response_body,
        } = HttpContext::new_exchange(self.exchange_options(None));
        request_body.complete();
        configure(&mut context);

        let version = context.request().protocol();
        self.spawn_pipeline(context, handle.clone());
        wait_for_response(handle, response_body, version, None).await
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.lifetime.is_cancelled() {
            return Err(Error::ObjectDisposed("TestServer"));
        }
        Ok(())
    }

    fn exchange_options(
        &self,
        websocket_upgrade: Option<tokio::sync::oneshot::Sender<WebSocket>>,
    ) -> ExchangeOptions {
        ExchangeOptions {
            allow_synchronous_io: self.options.allow_synchronous_io,
            request_buffer_size: self.options.request_buffer_size,
            response_buffer_size: self.options.response_buffer_size,
            parent_token: Some(self.lifetime.clone()),
            websocket_upgrade,
        }
    }

    fn spawn_pipeline(&self, context: HttpContext, handle: ExchangeHandle) {
        let span = info_span!(
            "request",
            method = %context.request().method(),
            path = %context.request().path(),
        );
        let app = self.app.clone();
        let lifetime = self.lifetime.clone();

        tokio::spawn(
            async move {
                debug!("invoking application");
                // The delegate is called inside the guarded future so a panic
                // while building the future is caught as well.
                let mut invocation =
                    pin!(AssertUnwindSafe(async move { app(context).await }).catch_unwind());

                let outcome = tokio::select! {
                    biased;
                    _ = lifetime.cancelled() => None,
                    outcome = &mut invocation => Some(outcome),
                };
                let outcome = match outcome {
                    Some(outcome) => outcome,
                    None => {
                        // Fail first so the application observes the abort,
                        // then let it unwind on its own.
                        debug!("server disposed with the request in flight");
                        handle.fail(Error::ObjectDisposed("TestServer"));
                        invocation.await
                    }
                };

                let result = outcome.unwrap_or_else(|panic| {
                    Err(anyhow::anyhow!("application panicked: {}", panic_message(&*panic)))
                });
                handle.finish(result).await;
            }
            .instrument(span),
        );
    }
}

impl std::fmt::Debug for ClientHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandler")
            .field("base_address", &self.options.base_address)
            .field("disposed", &self.lifetime.is_cancelled())
            .finish()
    }
}

/// Stream `content` into the request pipe on its own task.
///
/// Content the application stopped reading is not an error. A producer that
/// fails on its own fails the exchange, so the client sees the failure.
fn spawn_content(content: Content, pipe: PipeWriter, handle: ExchangeHandle) {
    let pipe = Arc::new(pipe);
    let writer = ContentWriter::new(pipe.clone(), handle.aborted());
    tokio::spawn(async move {
        match content.produce(writer).await {
            Ok(()) => pipe.complete(),
            Err(err) => {
                let cancelled = err
                    .downcast_ref::<Error>()
                    .is_some_and(Error::is_cancellation);
                if cancelled {
                    debug!("request content was not fully consumed");
                    pipe.abort(Error::Cancelled);
                } else {
                    warn!(error = %err, "request content producer failed");
                    let err = Error::application(err);
                    pipe.abort(err.clone());
                    handle.fail(err);
                }
            }
        }
    });
}

async fn wait_for_response(
    handle: ExchangeHandle,
    response_body: PipeReader,
    version: Version,
    token: Option<&CancellationToken>,
) -> Result<Response<ResponseBody>> {
    let head = match token {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    handle.cancel();
                    return Err(Error::Cancelled);
                }
                head = handle.response_started() => head?,
            }
        }
        None => handle.response_started().await?,
    };

    let mut response = Response::new(ResponseBody::new(response_body, handle));
    *response.status_mut() = head.status;
    *response.version_mut() = version;
    *response.headers_mut() = head.headers;
    if let Some(phrase) = head.reason_phrase {
        response.extensions_mut().insert(ReasonPhrase(phrase));
    }
    debug!(status = head.status.as_u16(), "response started");
    Ok(response)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
