//! Client-side request content.
//!
//! [`Content`] is either a buffer of known length or a producer that streams
//! bytes of unknown length into the request pipe. The dispatcher derives the
//! framing headers from that distinction: a known length becomes
//! `Content-Length`, an unknown one `Transfer-Encoding: chunked`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::HeaderMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use warpgrid_exchange::{Error, PipeWriter, Result};

/// Streams request bytes into the exchange.
pub type ContentProducer =
    Arc<dyn Fn(ContentWriter) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
enum Source {
    Buffered(Bytes),
    Streamed(ContentProducer),
}

/// Request content plus its content headers.
///
/// Clones share the disposed flag, so disposing any clone makes every later
/// send with this content fail.
#[derive(Clone)]
pub struct Content {
    source: Source,
    headers: HeaderMap,
    disposed: Arc<AtomicBool>,
}

impl Content {
    /// Content of known length.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::from_source(Source::Buffered(data.into()))
    }

    /// Content of unknown length, produced on every send.
    pub fn streaming<F, Fut>(producer: F) -> Self
    where
        F: Fn(ContentWriter) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_source(Source::Streamed(Arc::new(move |writer| {
            Box::pin(producer(writer))
        })))
    }

    fn from_source(source: Source) -> Self {
        Self {
            source,
            headers: HeaderMap::new(),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add a content header such as `Content-Type`.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// `Some` for buffered content, `None` for streamed content.
    pub fn content_length(&self) -> Option<u64> {
        match &self.source {
            Source::Buffered(data) => Some(data.len() as u64),
            Source::Streamed(_) => None,
        }
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Copy this content into `writer`.
    pub(crate) async fn produce(&self, writer: ContentWriter) -> anyhow::Result<()> {
        match &self.source {
            Source::Buffered(data) => {
                writer.write(data.clone()).await?;
                Ok(())
            }
            Source::Streamed(producer) => producer(writer).await,
        }
    }
}

impl std::fmt::Debug for Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Content")
            .field("content_length", &self.content_length())
            .field("headers", &self.headers)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Handle a streaming producer writes request bytes through.
#[derive(Clone)]
pub struct ContentWriter {
    pipe: Arc<PipeWriter>,
    aborted: CancellationToken,
}

impl ContentWriter {
    pub(crate) fn new(pipe: Arc<PipeWriter>, aborted: CancellationToken) -> Self {
        Self { pipe, aborted }
    }

    /// Write a chunk, waiting while the application has not caught up.
    /// Fails with [`Error::Cancelled`] once the request is aborted.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.pipe.write_cancellable(data, &self.aborted).await
    }

    /// Zero-length write: fails if the request was aborted or the
    /// application stopped reading.
    pub async fn flush(&self) -> Result<()> {
        self.write(Bytes::new()).await
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_cancelled()
    }
}

impl std::fmt::Debug for ContentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentWriter")
            .field("pipe", &self.pipe)
            .finish()
    }
}

/// The body of a client request message: optional [`Content`].
#[derive(Debug, Clone, Default)]
pub struct RequestBody(Option<Content>);

impl RequestBody {
    pub fn empty() -> Self {
        Self(None)
    }

    /// JSON content with `Content-Type: application/json`.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let data = serde_json::to_vec(value)
            .map_err(|e| Error::invalid_operation(format!("failed to serialize JSON: {e}")))?;
        Ok(Self(Some(Content::new(data).with_header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))))
    }

    pub fn content(&self) -> Option<&Content> {
        self.0.as_ref()
    }
}

impl From<Content> for RequestBody {
    fn from(content: Content) -> Self {
        Self(Some(content))
    }
}

impl From<()> for RequestBody {
    fn from(_: ()) -> Self {
        Self(None)
    }
}

impl From<Bytes> for RequestBody {
    fn from(data: Bytes) -> Self {
        Self(Some(Content::new(data)))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(data: Vec<u8>) -> Self {
        Self(Some(Content::new(data)))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Self(Some(Content::new(text)))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Self(Some(Content::new(text)))
    }
}
