//! In-memory duplex pipe bridge.
//!
//! A [`pipe`] is a bounded, unidirectional byte channel standing in for one
//! direction of a network connection. The test host uses two of them per
//! exchange: the request body (client writes, application reads) and the
//! response body (application writes, client reads).
//!
//! # Back-pressure
//!
//! A write is accepted while fewer than `capacity` bytes are buffered; the
//! whole chunk is appended even if it overshoots. Once the buffer is at or
//! above capacity, writers suspend until the reader drains it, the reader
//! closes, or the write is cancelled.
//!
//! # Termination
//!
//! The writer ends the stream with [`PipeWriter::complete`] or fails it with
//! [`PipeWriter::abort`]. The reader gives up with [`PipeReader::close`],
//! which discards buffered bytes and fails pending and future writes with
//! [`Error::Cancelled`]. Dropping an endpoint completes (writer) or closes
//! (reader) it. All of these are idempotent.
//!
//! A [`ReaderCloser`] closes the reader from outside the task that owns it,
//! failing reads with a chosen error and reporting whether one was pending.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Default pipe capacity (64 KB).
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Outcome of a single read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    /// `n` bytes were copied. `n` is 0 only for a zero-length buffer, which
    /// signals that data became available without consuming any of it.
    Data(usize),
    /// The writer completed and every buffered byte has been consumed.
    Eof,
}

/// Create a pipe whose writers suspend once `capacity` bytes are buffered.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            chunks: VecDeque::new(),
            buffered: 0,
            capacity: capacity.max(1),
            end: None,
            reader_closed: false,
            closed_error: None,
            pending_reads: 0,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

struct Shared {
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
}

struct State {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    capacity: usize,
    /// `None` while the writer is open, `Some(Ok)` once completed,
    /// `Some(Err)` once aborted.
    end: Option<Result<()>>,
    reader_closed: bool,
    /// What reads return once the reader was closed by a [`ReaderCloser`].
    closed_error: Option<Error>,
    pending_reads: usize,
}

impl State {
    fn read_error(&self) -> Error {
        self.closed_error
            .clone()
            .unwrap_or(Error::ObjectDisposed("pipe reader"))
    }
}

impl Shared {
    fn wake_all(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// Writing half of a [`pipe`].
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Append `data`, suspending while the pipe is full.
    ///
    /// A zero-length write appends nothing but still reports a closed reader
    /// or a finished writer, so it can be used as an ordering checkpoint.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        loop {
            // Created before the state check so a wakeup between the check
            // and the await is not lost.
            let writable = self.shared.writable.notified();
            {
                let mut state = self.shared.state.lock();
                if state.reader_closed {
                    return Err(Error::Cancelled);
                }
                match &state.end {
                    Some(Ok(())) => {
                        return Err(Error::invalid_operation(
                            "cannot write to a pipe after it was completed",
                        ));
                    }
                    Some(Err(_)) => return Err(Error::Cancelled),
                    None => {}
                }
                if data.is_empty() {
                    return Ok(());
                }
                if state.buffered < state.capacity {
                    state.buffered += data.len();
                    state.chunks.push_back(data);
                    drop(state);
                    self.shared.readable.notify_waiters();
                    return Ok(());
                }
            }
            writable.await;
        }
    }

    /// Like [`write`](Self::write), failing with [`Error::Cancelled`] as soon
    /// as `token` fires. An already-cancelled token fails even zero-length
    /// writes.
    pub async fn write_cancellable(
        &self,
        data: impl Into<Bytes>,
        token: &CancellationToken,
    ) -> Result<()> {
        let data = data.into();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = self.write(data) => result,
        }
    }

    /// Mark the end of data. Buffered bytes stay readable.
    pub fn complete(&self) {
        let mut state = self.shared.state.lock();
        if state.end.is_none() {
            state.end = Some(Ok(()));
            drop(state);
            self.shared.wake_all();
        }
    }

    /// Fail the stream: pending and future reads return `error` once the
    /// buffered bytes are gone. Has no effect after [`complete`](Self::complete).
    pub fn abort(&self, error: Error) {
        let mut state = self.shared.state.lock();
        if state.end.is_none() {
            state.end = Some(Err(error));
            drop(state);
            self.shared.wake_all();
        }
    }

    /// True once the reading side closed or was dropped.
    pub fn is_reader_closed(&self) -> bool {
        self.shared.state.lock().reader_closed
    }

    /// True once the writer completed or aborted.
    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().end.is_some()
    }

    /// Bytes written but not yet read.
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffered
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Reading half of a [`pipe`].
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Copy available bytes into `buf`, suspending until data, end-of-stream
    /// or an abort error is available.
    ///
    /// A zero-length `buf` is a pure readiness check: it stays pending until
    /// data arrives (returning `Data(0)` without consuming anything) or the
    /// stream ends (returning `Eof`).
    pub async fn read(&self, buf: &mut [u8]) -> Result<ReadResult> {
        let _pending = PendingRead::new(&self.shared);
        loop {
            let readable = self.shared.readable.notified();
            {
                let mut state = self.shared.state.lock();
                if state.reader_closed {
                    return Err(state.read_error());
                }
                if !state.chunks.is_empty() {
                    if buf.is_empty() {
                        return Ok(ReadResult::Data(0));
                    }
                    let copied = copy_into(&mut state, buf);
                    drop(state);
                    self.shared.writable.notify_waiters();
                    return Ok(ReadResult::Data(copied));
                }
                match &state.end {
                    Some(Ok(())) => return Ok(ReadResult::Eof),
                    Some(Err(err)) => return Err(err.clone()),
                    None => {}
                }
            }
            readable.await;
        }
    }

    /// Like [`read`](Self::read), failing with [`Error::Cancelled`] as soon
    /// as `token` fires.
    pub async fn read_cancellable(
        &self,
        buf: &mut [u8],
        token: &CancellationToken,
    ) -> Result<ReadResult> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = self.read(buf) => result,
        }
    }

    /// Take the next buffered chunk as written, or `None` at end-of-stream.
    pub async fn read_chunk(&self) -> Result<Option<Bytes>> {
        let _pending = PendingRead::new(&self.shared);
        loop {
            let readable = self.shared.readable.notified();
            {
                let mut state = self.shared.state.lock();
                if state.reader_closed {
                    return Err(state.read_error());
                }
                if let Some(chunk) = state.chunks.pop_front() {
                    state.buffered -= chunk.len();
                    drop(state);
                    self.shared.writable.notify_waiters();
                    return Ok(Some(chunk));
                }
                match &state.end {
                    Some(Ok(())) => return Ok(None),
                    Some(Err(err)) => return Err(err.clone()),
                    None => {}
                }
            }
            readable.await;
        }
    }

    /// Read until end-of-stream and return everything as one buffer.
    pub async fn read_to_end(&self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.read_chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }

    /// Stop reading. Buffered bytes are discarded and writers are released
    /// with [`Error::Cancelled`].
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if !state.reader_closed {
            state.reader_closed = true;
            state.chunks.clear();
            state.buffered = 0;
            drop(state);
            self.shared.wake_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().reader_closed
    }

    /// The error a [`ReaderCloser`] closed this reader with, if any.
    pub fn closed_error(&self) -> Option<Error> {
        self.shared.state.lock().closed_error.clone()
    }

    pub fn closer(&self) -> ReaderCloser {
        ReaderCloser {
            shared: self.shared.clone(),
        }
    }

    /// True when the writer completed and nothing is left to read.
    pub fn is_end_of_stream(&self) -> bool {
        let state = self.shared.state.lock();
        state.chunks.is_empty() && matches!(state.end, Some(Ok(())))
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Closes a [`PipeReader`] without owning it.
#[derive(Clone)]
pub struct ReaderCloser {
    shared: Arc<Shared>,
}

impl ReaderCloser {
    /// Close the reader: pending and future reads fail with `error` and
    /// writers are released with [`Error::Cancelled`].
    ///
    /// Returns true if a read was pending at that moment. Has no effect on a
    /// reader that is already closed.
    pub fn close_with(&self, error: Error) -> bool {
        let mut state = self.shared.state.lock();
        if state.reader_closed {
            return false;
        }
        let pending = state.pending_reads > 0;
        state.reader_closed = true;
        state.closed_error = Some(error);
        state.chunks.clear();
        state.buffered = 0;
        drop(state);
        self.shared.wake_all();
        pending
    }
}

impl std::fmt::Debug for ReaderCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderCloser").finish_non_exhaustive()
    }
}

/// Counts a read as pending for as long as it is alive.
struct PendingRead<'a> {
    shared: &'a Shared,
}

impl<'a> PendingRead<'a> {
    fn new(shared: &'a Shared) -> Self {
        shared.state.lock().pending_reads += 1;
        Self { shared }
    }
}

impl Drop for PendingRead<'_> {
    fn drop(&mut self) {
        self.shared.state.lock().pending_reads -= 1;
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("buffered", &self.buffered())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader")
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn copy_into(state: &mut State, buf: &mut [u8]) -> usize {
    let mut copied = 0;
    while copied < buf.len() {
        let Some(front) = state.chunks.front_mut() else {
            break;
        };
        let n = front.len().min(buf.len() - copied);
        buf[copied..copied + n].copy_from_slice(&front[..n]);
        front.advance(n);
        copied += n;
        if front.is_empty() {
            state.chunks.pop_front();
        }
    }
    state.buffered -= copied;
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let (writer, reader) = pipe(1024);
        writer.write("Hello world").await.unwrap();
        writer.complete();

        let mut buf = [0u8; 64];
        assert_eq!(reader.read(&mut buf).await.unwrap(), ReadResult::Data(11));
        assert_eq!(&buf[..11], b"Hello world");
        assert_eq!(reader.read(&mut buf).await.unwrap(), ReadResult::Eof);
        assert!(reader.is_end_of_stream());
    }

    #[tokio::test]
    async fn partial_reads_preserve_order() {
        let (writer, reader) = pipe(1024);
        writer.write("abc").await.unwrap();
        writer.write("defg").await.unwrap();
        writer.complete();

        let mut buf = [0u8; 2];
        let mut out = Vec::new();
        loop {
            match reader.read(&mut buf).await.unwrap() {
                ReadResult::Data(n) => out.extend_from_slice(&buf[..n]),
                ReadResult::Eof => break,
            }
        }
        assert_eq!(out, b"abcdefg");
    }

    #[tokio::test]
    async fn zero_length_read_waits_for_data() {
        let (writer, reader) = pipe(1024);
        let reader = Arc::new(reader);

        let waiter = tokio::spawn({
            let reader = reader.clone();
            async move { reader.read(&mut []).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "zero-length read must stay pending");

        writer.write("x").await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), ReadResult::Data(0));

        // Nothing was consumed by the zero-length read.
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), ReadResult::Data(1));
    }

    #[tokio::test]
    async fn zero_length_read_reports_eof() {
        let (writer, reader) = pipe(16);
        writer.complete();
        assert_eq!(reader.read(&mut []).await.unwrap(), ReadResult::Eof);
    }

    #[tokio::test]
    async fn writer_suspends_when_full_until_drained() {
        let (writer, reader) = pipe(8);
        writer.write(vec![1u8; 8]).await.unwrap();

        let writer = Arc::new(writer);
        let pending = tokio::spawn({
            let writer = writer.clone();
            async move { writer.write(vec![2u8; 4]).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished(), "write must wait for the reader");

        let mut buf = [0u8; 8];
        reader.read(&mut buf).await.unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(writer.buffered(), 4);
    }

    #[tokio::test]
    async fn closing_reader_releases_pending_write() {
        let (writer, reader) = pipe(4);
        writer.write(vec![0u8; 4]).await.unwrap();

        let pending = tokio::spawn(async move { writer.write(vec![0u8; 4]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        reader.close();
        reader.close();
        assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn dropping_reader_releases_pending_write() {
        let (writer, reader) = pipe(4);
        writer.write(vec![0u8; 4]).await.unwrap();

        let pending = tokio::spawn(async move { writer.write(vec![0u8; 4]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(reader);
        assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn cancelled_write_fails_promptly() {
        let (writer, _reader) = pipe(4);
        writer.write(vec![0u8; 4]).await.unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let result = writer.write_cancellable(vec![0u8; 4], &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn cancelled_token_fails_zero_length_write() {
        let (writer, _reader) = pipe(4);
        let token = CancellationToken::new();
        token.cancel();
        let result = writer.write_cancellable(Bytes::new(), &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn cancelled_read_fails_promptly() {
        let (_writer, reader) = pipe(4);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let mut buf = [0u8; 4];
        let result = reader.read_cancellable(&mut buf, &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn abort_surfaces_after_buffered_data() {
        let (writer, reader) = pipe(64);
        writer.write("tail").await.unwrap();
        writer.abort(Error::Aborted);

        assert_eq!(reader.read_chunk().await.unwrap().unwrap(), "tail");
        assert!(matches!(reader.read_chunk().await, Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn abort_after_complete_is_ignored() {
        let (writer, reader) = pipe(64);
        writer.complete();
        writer.abort(Error::Aborted);
        assert!(reader.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_after_complete_is_invalid() {
        let (writer, _reader) = pipe(64);
        writer.complete();
        assert!(matches!(
            writer.write("late").await,
            Err(Error::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn dropping_writer_completes() {
        let (writer, reader) = pipe(64);
        writer.write("last").await.unwrap();
        drop(writer);
        assert_eq!(reader.read_to_end().await.unwrap(), "last");
    }

    #[tokio::test]
    async fn closer_fails_a_pending_read_and_reports_it() {
        let (writer, reader) = pipe(64);
        let closer = reader.closer();
        let reader = Arc::new(reader);

        let pending = tokio::spawn({
            let reader = reader.clone();
            async move { reader.read_chunk().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(closer.close_with(Error::invalid_operation("gone")));
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "gone");
        assert!(matches!(writer.write("x").await, Err(Error::Cancelled)));

        // Already closed: nothing pending, error unchanged.
        assert!(!closer.close_with(Error::Aborted));
        assert_eq!(reader.read(&mut [0u8; 4]).await.unwrap_err().to_string(), "gone");
    }

    #[tokio::test]
    async fn closer_without_pending_read_reports_none() {
        let (_writer, reader) = pipe(64);
        assert!(!reader.closer().close_with(Error::Cancelled));
        assert!(reader.is_closed());
    }
}
