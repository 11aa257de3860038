//! Response state machine.
//!
//! [`HttpResponse`] is the application's handle to one response. It tracks
//! whether the response has started, guards the status line and headers,
//! runs on-starting callbacks and owns the writing half of the response
//! body pipe.
//!
//! # States
//!
//! ```text
//! NotStarted ──start()──▶ Started
//!      │                     │
//!      │ status, reason,     │ headers frozen, body bytes flow,
//!      │ headers mutable     │ trailers appendable until the exchange ends
//! ```
//!
//! The start transition happens on an explicit [`HttpResponse::start`], a
//! [`flush`](HttpResponse::flush), the first body write,
//! [`complete`](HttpResponse::complete), or when the pipeline returns
//! without having started. It runs the registered on-starting callbacks in
//! registration order, freezes the headers and then reports the head to the
//! dispatcher.

use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::header::HeaderDictionary;
use crate::pipe::PipeWriter;

/// A callback run once, immediately before the response starts.
pub type OnStartingCallback =
    Box<dyn FnOnce(HttpResponse) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

tokio::task_local! {
    /// Identity of the response whose on-starting callbacks this task runs.
    static STARTING: usize;
}

const SYNC_IO_DISALLOWED: &str =
    "Synchronous operations are disallowed. Use the async API or set allow_synchronous_io to true.";

/// How far the exchange has progressed, as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Pending,
    Started,
    Finished,
}

/// The committed status line and headers of a started response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason_phrase: Option<String>,
    pub headers: HeaderMap,
}

struct ResponseState {
    status: StatusCode,
    reason_phrase: Option<String>,
    headers: HeaderDictionary,
    trailers: HeaderDictionary,
    has_started: bool,
    /// Set when an on-starting callback failed the start.
    start_failure: Option<Error>,
    on_starting: Vec<OnStartingCallback>,
}

pub(crate) struct ResponseShared {
    state: Mutex<ResponseState>,
    /// Serializes concurrent start attempts so callbacks run exactly once.
    start_lock: tokio::sync::Mutex<()>,
    /// Set once the head was started without a callback failure.
    committed: AtomicBool,
    progress: watch::Sender<Progress>,
    body: PipeWriter,
    aborted: CancellationToken,
    allow_synchronous_io: bool,
}

/// The application's handle to a response. Cheap to clone; all clones
/// share the same state.
#[derive(Clone)]
pub struct HttpResponse {
    shared: Arc<ResponseShared>,
}

impl HttpResponse {
    pub(crate) fn new(
        body: PipeWriter,
        aborted: CancellationToken,
        allow_synchronous_io: bool,
    ) -> Self {
        let (progress, _) = watch::channel(Progress::Pending);
        Self {
            shared: Arc::new(ResponseShared {
                state: Mutex::new(ResponseState {
                    status: StatusCode::OK,
                    reason_phrase: None,
                    headers: HeaderDictionary::new(),
                    trailers: HeaderDictionary::new(),
                    has_started: false,
                    start_failure: None,
                    on_starting: Vec::new(),
                }),
                start_lock: tokio::sync::Mutex::new(()),
                committed: AtomicBool::new(false),
                progress,
                body,
                aborted,
                allow_synchronous_io,
            }),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.shared.state.lock().status
    }

    /// Set the status code. Codes below 100 are always rejected; any change
    /// after the response started is an invalid operation.
    pub fn set_status(&self, code: u16) -> Result<()> {
        if code < 100 {
            return Err(Error::StatusCodeOutOfRange(code));
        }
        let status = StatusCode::from_u16(code).map_err(|_| Error::StatusCodeOutOfRange(code))?;
        let mut state = self.shared.state.lock();
        ensure_not_started(&state, "StatusCode")?;
        state.status = status;
        Ok(())
    }

    pub fn reason_phrase(&self) -> Option<String> {
        self.shared.state.lock().reason_phrase.clone()
    }

    pub fn set_reason_phrase(&self, phrase: impl Into<String>) -> Result<()> {
        let mut state = self.shared.state.lock();
        ensure_not_started(&state, "ReasonPhrase")?;
        state.reason_phrase = Some(phrase.into());
        Ok(())
    }

    pub fn has_started(&self) -> bool {
        self.shared.state.lock().has_started
    }

    /// First value of response header `name`.
    pub fn header(&self, name: &str) -> Option<String> {
        self.shared.state.lock().headers.get(name).map(str::to_owned)
    }

    /// Snapshot of the response headers.
    pub fn headers(&self) -> HeaderMap {
        self.shared.state.lock().headers.as_map().clone()
    }

    /// Mutate the headers in place. Fails once the response has started.
    pub fn headers_mut<R>(&self, f: impl FnOnce(&mut HeaderDictionary) -> R) -> Result<R> {
        let mut state = self.shared.state.lock();
        ensure_not_started(&state, "Headers")?;
        Ok(f(&mut state.headers))
    }

    pub fn insert_header(&self, name: &str, value: &str) -> Result<()> {
        self.shared.state.lock().headers.insert(name, value)
    }

    pub fn append_header(&self, name: &str, value: &str) -> Result<()> {
        self.shared.state.lock().headers.append(name, value)
    }

    /// Register a callback to run right before the response starts.
    ///
    /// Callbacks run in registration order and receive a handle to this
    /// response, so they may still adjust status and headers.
    pub fn on_starting<F, Fut>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(HttpResponse) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.has_started {
            return Err(Error::invalid_operation(
                "OnStarting cannot be set, response has already started.",
            ));
        }
        state
            .on_starting
            .push(Box::new(move |response| Box::pin(callback(response))));
        Ok(())
    }

    /// Start the response if it has not started yet.
    ///
    /// If a callback fails, the response is marked started but never
    /// committed: the dispatcher is told at once, and this and every later
    /// start, flush or write return the failure. Starting the response from
    /// one of its own on-starting callbacks is an invalid operation.
    pub async fn start(&self) -> Result<()> {
        if let Some(result) = self.start_result() {
            return result;
        }
        if STARTING.try_with(|id| *id == self.id()).unwrap_or(false) {
            return Err(Error::invalid_operation(
                "The response cannot be started from its own on-starting callback.",
            ));
        }
        if self.shared.aborted.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let _guard = self.shared.start_lock.lock().await;
        if let Some(result) = self.start_result() {
            return result;
        }

        let mut failure = None;
        loop {
            // Callbacks may register further callbacks; drain until empty.
            let callbacks = mem::take(&mut self.shared.state.lock().on_starting);
            if callbacks.is_empty() {
                break;
            }
            for callback in callbacks {
                if failure.is_some() {
                    break;
                }
                if let Err(err) = STARTING.scope(self.id(), callback(self.clone())).await {
                    failure = Some(err);
                }
            }
            if failure.is_some() {
                self.shared.state.lock().on_starting.clear();
                break;
            }
        }

        // Exchange errors raised inside a callback keep their kind.
        let failure = failure.map(|err| err.downcast::<Error>().unwrap_or_else(Error::application));
        let status = {
            let mut state = self.shared.state.lock();
            state.has_started = true;
            state.start_failure = failure.clone();
            state.headers.freeze();
            state.status
        };

        if let Some(err) = failure {
            debug!(error = %err, "on-starting callback failed");
            self.shared.progress.send_replace(Progress::Finished);
            return Err(err);
        }

        self.shared.committed.store(true, Ordering::Release);
        self.shared.progress.send_if_modified(|progress| {
            if *progress == Progress::Pending {
                *progress = Progress::Started;
                true
            } else {
                false
            }
        });
        debug!(status = status.as_u16(), "response started");
        Ok(())
    }

    /// Start the response without writing body bytes.
    pub async fn flush(&self) -> Result<()> {
        self.start().await
    }

    /// Write body bytes, starting the response first if needed.
    ///
    /// Fails with [`Error::Cancelled`] once the request was aborted or the
    /// client stopped reading.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.start().await?;
        self.shared
            .body
            .write_cancellable(data, &self.shared.aborted)
            .await
    }

    /// Blocking variant of [`write`](Self::write), only permitted when the
    /// server allows synchronous IO.
    ///
    /// Must be called from a multi-threaded tokio runtime.
    pub fn write_blocking(&self, data: impl Into<Bytes>) -> Result<()> {
        if !self.shared.allow_synchronous_io {
            return Err(Error::invalid_operation(SYNC_IO_DISALLOWED));
        }
        let data = data.into();
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(self.write(data)))
    }

    /// Start the response and end the body. Later writes fail.
    pub async fn complete(&self) -> Result<()> {
        self.start().await?;
        self.shared.body.complete();
        Ok(())
    }

    /// Trailers are always available on the in-memory transport.
    pub fn supports_trailers(&self) -> bool {
        true
    }

    /// Announce a trailer through the `Trailer` response header.
    pub fn declare_trailer(&self, name: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        ensure_not_started(&state, "Headers")?;
        state.headers.append(http::header::TRAILER.as_str(), name)
    }

    pub fn append_trailer(&self, name: &str, value: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.trailers.is_read_only() {
            return Err(Error::invalid_operation(
                "Trailers are read-only, the response has completed.",
            ));
        }
        state.trailers.append(name, value)
    }

    /// Snapshot of the trailers appended so far.
    pub fn trailers(&self) -> HeaderMap {
        self.shared.state.lock().trailers.as_map().clone()
    }

    /// `Some` once started: `Ok` if committed, the callback failure otherwise.
    fn start_result(&self) -> Option<Result<()>> {
        let state = self.shared.state.lock();
        state
            .has_started
            .then(|| state.start_failure.clone().map_or(Ok(()), Err))
    }

    pub(crate) fn start_failure(&self) -> Option<Error> {
        self.shared.state.lock().start_failure.clone()
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.shared.committed.load(Ordering::Acquire)
    }

    pub(crate) fn head(&self) -> ResponseHead {
        let state = self.shared.state.lock();
        ResponseHead {
            status: state.status,
            reason_phrase: state.reason_phrase.clone(),
            headers: state.headers.as_map().clone(),
        }
    }

    pub(crate) fn freeze_trailers(&self) {
        self.shared.state.lock().trailers.freeze();
    }

    pub(crate) fn body(&self) -> &PipeWriter {
        &self.shared.body
    }

    pub(crate) fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.shared.progress.subscribe()
    }

    pub(crate) fn finish_progress(&self) {
        self.shared.progress.send_replace(Progress::Finished);
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("HttpResponse")
            .field("status", &state.status)
            .field("has_started", &state.has_started)
            .finish()
    }
}

fn ensure_not_started(state: &ResponseState, what: &str) -> Result<()> {
    if state.has_started {
        return Err(Error::invalid_operation(format!(
            "{what} cannot be set, response has already started."
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipe::{pipe, PipeReader};

    fn response() -> (HttpResponse, PipeReader) {
        let (writer, reader) = pipe(1024);
        (HttpResponse::new(writer, CancellationToken::new(), false), reader)
    }

    #[test]
    fn defaults() {
        let (response, _body) = response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.reason_phrase(), None);
        assert!(response.headers().is_empty());
        assert!(!response.has_started());
    }

    #[test]
    fn status_below_100_is_out_of_range() {
        let (response, _body) = response();
        for code in [0u16, 1, 99] {
            assert!(matches!(
                response.set_status(code),
                Err(Error::StatusCodeOutOfRange(c)) if c == code
            ));
        }
        response.set_status(100).unwrap();
        response.set_status(204).unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn status_and_reason_are_locked_after_start() {
        let (response, _body) = response();
        response.set_reason_phrase("Custom").unwrap();
        response.start().await.unwrap();

        assert!(matches!(response.set_status(201), Err(Error::InvalidOperation(_))));
        assert!(matches!(
            response.set_reason_phrase("Other"),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(response.set_status(42), Err(Error::StatusCodeOutOfRange(42))));
        assert_eq!(response.reason_phrase().as_deref(), Some("Custom"));
    }

    #[tokio::test]
    async fn headers_freeze_with_start() {
        let (response, _body) = response();
        response.insert_header("X-Before", "1").unwrap();
        response.start().await.unwrap();

        assert!(matches!(
            response.insert_header("X-After", "1"),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            response.headers_mut(|h| h.len()),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(response.header("x-before").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn on_starting_runs_once_in_registration_order() {
        let (response, _body) = response();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            response
                .on_starting(move |resp| async move {
                    order.lock().push(i);
                    resp.append_header("X-Order", &i.to_string())?;
                    Ok(())
                })
                .unwrap();
        }

        response.start().await.unwrap();
        response.start().await.unwrap();

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(
            response.headers().get_all("x-order").iter().count(),
            3,
            "callbacks ran exactly once"
        );
    }

    #[tokio::test]
    async fn on_starting_after_start_is_invalid() {
        let (response, _body) = response();
        response.start().await.unwrap();
        let result = response.on_starting(|_| async { Ok(()) });
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn failing_callback_surfaces_and_still_starts() {
        let (response, _body) = response();
        response
            .on_starting(|_| async { Err::<(), _>(anyhow::anyhow!("callback failed")) })
            .unwrap();

        let mut progress = response.subscribe_progress();
        let err = response.start().await.unwrap_err();
        assert_eq!(err.to_string(), "callback failed");
        assert!(response.has_started());
        assert!(!response.is_committed());
        assert!(matches!(
            response.insert_header("X-Late", "1"),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(*progress.borrow_and_update(), Progress::Finished);

        // Later writes report the same failure instead of streaming.
        let err = response.write("swallowed").await.unwrap_err();
        assert_eq!(err.to_string(), "callback failed");
        assert_eq!(response.start_failure().unwrap().to_string(), "callback failed");
    }

    #[tokio::test]
    async fn callback_starting_its_own_response_fails_fast() {
        let (response, _body) = response();
        response
            .on_starting(|resp| async move {
                resp.flush().await?;
                Ok(())
            })
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), response.start())
            .await
            .expect("start deadlocked on a nested start");
        let err = result.unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(
            err.to_string(),
            "The response cannot be started from its own on-starting callback."
        );
        assert!(!response.is_committed());
    }

    #[tokio::test]
    async fn concurrent_starts_run_callbacks_once() {
        let (response, _body) = response();
        let runs = Arc::new(Mutex::new(0));
        {
            let runs = runs.clone();
            response
                .on_starting(move |_| async move {
                    *runs.lock() += 1;
                    tokio::task::yield_now().await;
                    Ok(())
                })
                .unwrap();
        }

        let other = response.clone();
        let (a, b) = tokio::join!(response.start(), other.start());
        a.unwrap();
        b.unwrap();
        assert_eq!(*runs.lock(), 1);
    }

    #[tokio::test]
    async fn first_write_starts_the_response() {
        let (response, body) = response();
        response.write("hello").await.unwrap();
        assert!(response.has_started());
        assert!(response.is_committed());

        let mut buf = [0u8; 16];
        let read = body.read(&mut buf).await.unwrap();
        assert_eq!(read, crate::pipe::ReadResult::Data(5));
    }

    #[tokio::test]
    async fn write_after_abort_is_cancelled() {
        let (writer, _reader) = pipe(1024);
        let aborted = CancellationToken::new();
        let response = HttpResponse::new(writer, aborted.clone(), false);
        aborted.cancel();

        assert!(matches!(response.start().await, Err(Error::Cancelled)));
        assert!(!response.has_started());
        assert!(matches!(response.write("x").await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn write_blocking_requires_synchronous_io() {
        let (response, _body) = response();
        assert!(matches!(
            response.write_blocking("x"),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_blocking_when_allowed() {
        let (writer, reader) = pipe(1024);
        let response = HttpResponse::new(writer, CancellationToken::new(), true);
        response.write_blocking("sync").unwrap();
        response.complete().await.unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), "sync");
    }

    #[tokio::test]
    async fn trailers_are_declared_and_appended() {
        let (response, _body) = response();
        assert!(response.supports_trailers());
        response.declare_trailer("X-Checksum").unwrap();
        response.start().await.unwrap();
        assert!(matches!(
            response.declare_trailer("X-Late"),
            Err(Error::InvalidOperation(_))
        ));

        response.append_trailer("X-Checksum", "abc").unwrap();
        assert_eq!(response.headers().get("trailer").unwrap(), "X-Checksum");
        assert_eq!(response.trailers().get("x-checksum").unwrap(), "abc");

        response.freeze_trailers();
        assert!(matches!(
            response.append_trailer("X-Other", "1"),
            Err(Error::InvalidOperation(_))
        ));
    }
}
