use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, Version};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::pipe::{PipeReader, ReadResult};

/// The server-side view of an incoming request.
///
/// Every field is settable so the dispatcher (and context configuration
/// hooks) can shape the request before the pipeline sees it. The body is
/// read through the request pipe; reads fail with [`Error::Cancelled`] once
/// the request is aborted.
#[derive(Debug)]
pub struct HttpRequest {
    method: Method,
    scheme: String,
    host: String,
    path_base: String,
    path: String,
    query_string: String,
    protocol: Version,
    headers: HeaderMap,
    body: RequestBodyReader,
}

impl HttpRequest {
    pub(crate) fn new(body: RequestBodyReader) -> Self {
        Self {
            method: Method::GET,
            scheme: "http".to_string(),
            host: String::new(),
            path_base: String::new(),
            path: "/".to_string(),
            query_string: String::new(),
            protocol: Version::HTTP_11,
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn set_scheme(&mut self, scheme: impl Into<String>) {
        self.scheme = scheme.into();
    }

    pub fn is_https(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("https")
    }

    /// The `host[:port]` the request was addressed to.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    /// The part of the path the application is mounted at, without a
    /// trailing slash. Empty when mounted at the root.
    pub fn path_base(&self) -> &str {
        &self.path_base
    }

    pub fn set_path_base(&mut self, path_base: impl Into<String>) {
        self.path_base = path_base.into();
    }

    /// The decoded path below [`path_base`](Self::path_base).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    /// The raw query string including the leading `?`, or empty.
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn set_query_string(&mut self, query: impl Into<String>) {
        self.query_string = query.into();
    }

    pub fn protocol(&self) -> Version {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: Version) {
        self.protocol = protocol;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// First value of request header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The declared `Content-Length`, if any. Requests streamed with
    /// `Transfer-Encoding: chunked` have none.
    pub fn content_length(&self) -> Option<u64> {
        self.header(http::header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn body(&self) -> &RequestBodyReader {
        &self.body
    }
}

/// Reader for the request body as supplied by the client.
#[derive(Debug)]
pub struct RequestBodyReader {
    reader: PipeReader,
    aborted: CancellationToken,
    allow_synchronous_io: bool,
}

impl RequestBodyReader {
    pub(crate) fn new(
        reader: PipeReader,
        aborted: CancellationToken,
        allow_synchronous_io: bool,
    ) -> Self {
        Self {
            reader,
            aborted,
            allow_synchronous_io,
        }
    }

    /// Read into `buf`, returning the number of bytes read (0 at end).
    ///
    /// A zero-length `buf` waits until data is available without consuming it.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let result = self.reader.read_cancellable(buf, &self.aborted).await;
        match result.map_err(|err| self.release_error(err))? {
            ReadResult::Data(n) => Ok(n),
            ReadResult::Eof => Ok(0),
        }
    }

    /// Next chunk as written by the client, or `None` at end.
    pub async fn chunk(&self) -> Result<Option<Bytes>> {
        let result = tokio::select! {
            biased;
            _ = self.aborted.cancelled() => Err(Error::Cancelled),
            chunk = self.reader.read_chunk() => chunk,
        };
        result.map_err(|err| self.release_error(err))
    }

    pub async fn read_to_end(&self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }

    /// Read the whole body as UTF-8 text.
    pub async fn read_to_string(&self) -> Result<String> {
        let bytes = self.read_to_end().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::invalid_operation("request body is not valid UTF-8"))
    }

    /// A read released because the pipeline completed fails with that
    /// reason, even though the request-aborted token fires with it.
    fn release_error(&self, err: Error) -> Error {
        match err {
            Error::Cancelled => self.reader.closed_error().unwrap_or(err),
            other => other,
        }
    }

    /// Blocking variant of [`read`](Self::read), only permitted when the
    /// server allows synchronous IO.
    ///
    /// Must be called from a multi-threaded tokio runtime.
    pub fn read_blocking(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.allow_synchronous_io {
            return Err(Error::invalid_operation(
                "Synchronous operations are disallowed. Use the async API or set allow_synchronous_io to true.",
            ));
        }
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(self.read(buf)))
    }
}
