//! Client-side response body.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use http::HeaderMap;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use warpgrid_exchange::{Error, ExchangeHandle, PipeReader, ReadResult, Result};

/// Streaming body of a response produced by the test host.
///
/// Reads pull bytes straight from the response pipe, so they suspend until
/// the application writes. Failures the application causes after the
/// response started surface as [`Error::Transport`] wrapping the cause.
///
/// Trailers become visible once a read has observed the end of the body.
/// Dropping the body before the end cancels the exchange, which releases an
/// application blocked on a write.
pub struct ResponseBody {
    reader: PipeReader,
    exchange: ExchangeHandle,
    trailers: Option<HeaderMap>,
    released: bool,
}

impl ResponseBody {
    pub(crate) fn new(reader: PipeReader, exchange: ExchangeHandle) -> Self {
        Self {
            reader,
            exchange,
            trailers: None,
            released: false,
        }
    }

    /// Read into `buf`, returning the number of bytes read. Returns 0 at the
    /// end of the body; a zero-length `buf` waits until data is available.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.reader.read(buf).await {
            Ok(ReadResult::Data(n)) => Ok(n),
            Ok(ReadResult::Eof) => {
                self.reached_end();
                Ok(0)
            }
            Err(err) => Err(Error::transport(err)),
        }
    }

    /// Like [`read`](Self::read); firing `token` cancels the whole exchange.
    pub async fn read_cancellable(
        &mut self,
        buf: &mut [u8],
        token: &CancellationToken,
    ) -> Result<usize> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.exchange.cancel();
                Err(Error::Cancelled)
            }
            result = self.read(buf) => result,
        }
    }

    /// Next chunk as written by the application, or `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match self.reader.read_chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.reached_end();
                Ok(None)
            }
            Err(err) => Err(Error::transport(err)),
        }
    }

    /// Read the rest of the body.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }

    /// Read the rest of the body as UTF-8 text.
    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::invalid_operation("response body is not valid UTF-8"))
    }

    /// Read the rest of the body and deserialize it as JSON.
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::invalid_operation(format!("failed to deserialize JSON: {e}")))
    }

    /// Trailers sent by the application. Empty until the end of the body has
    /// been read.
    pub fn trailers(&self) -> HeaderMap {
        self.trailers.clone().unwrap_or_default()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.trailers.is_some()
    }

    /// Convert into a stream of chunks. The stream ends after the first
    /// error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut body = match state {
                Some(body) => body,
                None => return None,
            };
            match body.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(body))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Detach from the exchange so dropping the body no longer cancels it.
    pub(crate) fn release(&mut self) {
        self.released = true;
    }

    fn reached_end(&mut self) {
        if self.trailers.is_none() {
            self.trailers = Some(self.exchange.trailers());
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if self.trailers.is_none() && !self.released {
            self.exchange.cancel();
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("end_of_stream", &self.is_end_of_stream())
            .field("exchange", &self.exchange)
            .finish()
    }
}
