//! Message-framed WebSocket over in-memory channels.
//!
//! [`WebSocket::pair`] returns two connected endpoints. The test host hands
//! one to the application when it accepts an upgrade and the other to the
//! client that requested it. No frames are encoded: messages travel as
//! values, and the close handshake is tracked per endpoint.
//!
//! ```text
//!            send Close                    recv Close
//!   Open ───────────────▶ CloseSent ───────────────────▶ Closed
//!    │                                                     ▲
//!    │ recv Close                     send Close           │
//!    └──────────────────▶ CloseReceived ───────────────────┘
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

/// Messages buffered per direction before `send` waits.
const MESSAGE_BUFFER: usize = 32;

/// Well-known close status codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// A WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Close(Option<CloseFrame>),
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }
}

/// Status and description carried by a close message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(close_code::NORMAL, "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    Open,
    CloseSent,
    CloseReceived,
    Closed,
    Aborted,
}

/// One endpoint of an in-memory WebSocket connection.
#[derive(Debug)]
pub struct WebSocket {
    outgoing: Option<mpsc::Sender<Message>>,
    incoming: mpsc::Receiver<Message>,
    state: WebSocketState,
    close_frame: Option<CloseFrame>,
    sub_protocol: Option<String>,
}

impl WebSocket {
    /// Create two connected endpoints sharing the negotiated subprotocol.
    pub fn pair(sub_protocol: Option<String>) -> (WebSocket, WebSocket) {
        let (a_tx, b_rx) = mpsc::channel(MESSAGE_BUFFER);
        let (b_tx, a_rx) = mpsc::channel(MESSAGE_BUFFER);
        (
            WebSocket::new(a_tx, a_rx, sub_protocol.clone()),
            WebSocket::new(b_tx, b_rx, sub_protocol),
        )
    }

    fn new(
        outgoing: mpsc::Sender<Message>,
        incoming: mpsc::Receiver<Message>,
        sub_protocol: Option<String>,
    ) -> Self {
        Self {
            outgoing: Some(outgoing),
            incoming,
            state: WebSocketState::Open,
            close_frame: None,
            sub_protocol,
        }
    }

    pub fn state(&self) -> WebSocketState {
        self.state
    }

    /// The subprotocol the server selected, if any.
    pub fn sub_protocol(&self) -> Option<&str> {
        self.sub_protocol.as_deref()
    }

    /// The close frame received from the peer, if any.
    pub fn close_frame(&self) -> Option<&CloseFrame> {
        self.close_frame.as_ref()
    }

    /// Send a data message. A [`Message::Close`] is treated as
    /// [`close_output`](Self::close_output).
    pub async fn send(&mut self, message: Message) -> Result<()> {
        if let Message::Close(frame) = message {
            return self.close_output(frame).await;
        }
        if !matches!(self.state, WebSocketState::Open | WebSocketState::CloseReceived) {
            return Err(Error::invalid_operation(format!(
                "cannot send a message in the {:?} state",
                self.state
            )));
        }
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| Error::invalid_operation("the send side has already been closed"))?;
        if outgoing.send(message).await.is_err() {
            self.state = WebSocketState::Aborted;
            return Err(Error::WebSocket("the remote endpoint has gone away".into()));
        }
        Ok(())
    }

    /// Receive the next message.
    ///
    /// A close message moves the endpoint to `CloseReceived` (or `Closed`
    /// when a close was already sent) and is returned to the caller. A peer
    /// that disappears without a close message is an error.
    pub async fn recv(&mut self) -> Result<Message> {
        if !matches!(self.state, WebSocketState::Open | WebSocketState::CloseSent) {
            return Err(Error::invalid_operation(format!(
                "cannot receive a message in the {:?} state",
                self.state
            )));
        }
        match self.incoming.recv().await {
            Some(Message::Close(frame)) => {
                self.close_frame = frame.clone();
                self.state = match self.state {
                    WebSocketState::CloseSent => WebSocketState::Closed,
                    _ => WebSocketState::CloseReceived,
                };
                debug!(state = ?self.state, "websocket close received");
                Ok(Message::Close(frame))
            }
            Some(message) => Ok(message),
            None => {
                self.state = WebSocketState::Aborted;
                self.outgoing = None;
                Err(Error::WebSocket(
                    "The remote party closed the WebSocket connection without completing the close handshake."
                        .into(),
                ))
            }
        }
    }

    /// Send a close message without waiting for the peer's close.
    pub async fn close_output(&mut self, frame: Option<CloseFrame>) -> Result<()> {
        let next = match self.state {
            WebSocketState::Open => WebSocketState::CloseSent,
            WebSocketState::CloseReceived => WebSocketState::Closed,
            state => {
                return Err(Error::invalid_operation(format!(
                    "cannot close the output in the {state:?} state"
                )));
            }
        };
        if let Some(outgoing) = self.outgoing.take() {
            // A peer that is already gone cannot observe the close; the
            // local state still advances.
            let _ = outgoing.send(Message::Close(frame)).await;
        }
        self.state = next;
        debug!(state = ?self.state, "websocket close sent");
        Ok(())
    }

    /// Complete the close handshake: send a close message and wait for the
    /// peer's, discarding any data messages received meanwhile.
    pub async fn close(&mut self, frame: Option<CloseFrame>) -> Result<()> {
        if matches!(self.state, WebSocketState::Open | WebSocketState::CloseReceived) {
            self.close_output(frame).await?;
        }
        while self.state == WebSocketState::CloseSent {
            self.recv().await?;
        }
        Ok(())
    }

    /// Tear the connection down without a close handshake.
    pub fn abort(&mut self) {
        if self.state != WebSocketState::Closed {
            self.state = WebSocketState::Aborted;
        }
        self.outgoing = None;
        self.incoming.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_flow_both_ways() {
        let (mut server, mut client) = WebSocket::pair(None);

        client.send(Message::text("ping")).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Message::text("ping"));

        server.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            Message::Binary(Bytes::from_static(&[1, 2, 3]))
        );
    }

    #[tokio::test]
    async fn close_handshake_reaches_closed_on_both_sides() {
        let (mut server, mut client) = WebSocket::pair(Some("chat".into()));
        assert_eq!(client.sub_protocol(), Some("chat"));

        client
            .close_output(Some(CloseFrame::new(close_code::NORMAL, "bye")))
            .await
            .unwrap();
        assert_eq!(client.state(), WebSocketState::CloseSent);

        let received = server.recv().await.unwrap();
        assert!(received.is_close());
        assert_eq!(server.state(), WebSocketState::CloseReceived);
        assert_eq!(server.close_frame().unwrap().reason, "bye");

        server.close(Some(CloseFrame::normal())).await.unwrap();
        assert_eq!(server.state(), WebSocketState::Closed);

        client.close(None).await.unwrap();
        assert_eq!(client.state(), WebSocketState::Closed);
        assert_eq!(client.close_frame().unwrap().code, close_code::NORMAL);
    }

    #[tokio::test]
    async fn send_after_close_is_invalid() {
        let (_server, mut client) = WebSocket::pair(None);
        client.close_output(None).await.unwrap();
        assert!(matches!(
            client.send(Message::text("late")).await,
            Err(Error::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn vanished_peer_is_an_error() {
        let (server, mut client) = WebSocket::pair(None);
        drop(server);
        assert!(matches!(client.recv().await, Err(Error::WebSocket(_))));
        assert_eq!(client.state(), WebSocketState::Aborted);
    }

    #[tokio::test]
    async fn abort_ends_the_peer() {
        let (mut server, mut client) = WebSocket::pair(None);
        client.abort();
        assert_eq!(client.state(), WebSocketState::Aborted);
        assert!(matches!(server.recv().await, Err(Error::WebSocket(_))));
    }
}
