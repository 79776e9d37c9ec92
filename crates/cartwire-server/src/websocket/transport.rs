//! Transport boundary between the lifecycle manager and a socket.
//!
//! The lifecycle manager only sees [`Frame`]s through the
//! [`MessageSource`] / [`MessageSink`] halves. Deadlines are applied by the
//! caller; implementations simply await the underlying socket.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::errors::TransportError;

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// One transport-level frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text, carrying one serialized envelope.
    Text(String),
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Orderly close.
    Close,
}

/// Receiving half of a transport.
#[async_trait]
pub trait MessageSource: Send {
    /// Next frame, or `None` once the peer has gone away.
    async fn read_message(&mut self) -> Result<Option<Frame>>;
}

/// Sending half of a transport.
#[async_trait]
pub trait MessageSink: Send {
    /// Write one frame.
    async fn write_message(&mut self, frame: Frame) -> Result<()>;

    /// Close the transport. Closing twice is not an error.
    async fn close(&mut self) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// axum WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// Reading half of an upgraded axum socket.
pub struct WsSource {
    inner: SplitStream<WebSocket>,
}

/// Writing half of an upgraded axum socket.
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into transport halves.
pub fn split_websocket(socket: WebSocket) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    (WsSource { inner: stream }, WsSink { inner: sink })
}

#[async_trait]
impl MessageSource for WsSource {
    async fn read_message(&mut self) -> Result<Option<Frame>> {
        let Some(message) = self.inner.next().await else {
            return Ok(None);
        };
        let frame = match message? {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(bytes) => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|_| TransportError::InvalidUtf8)?;
                Frame::Text(text)
            }
            Message::Ping(_) => Frame::Ping,
            Message::Pong(_) => Frame::Pong,
            Message::Close(_) => Frame::Close,
        };
        Ok(Some(frame))
    }
}

#[async_trait]
impl MessageSink for WsSink {
    async fn write_message(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Ping => Message::Ping(Bytes::new()),
            Frame::Pong => Message::Pong(Bytes::new()),
            Frame::Close => Message::Close(None),
        };
        self.inner.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // the peer may already be gone; a failed close frame is not worth reporting
        let _ = self.inner.send(Message::Close(None)).await;
        self.inner.close().await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory transport backed by two bounded channels.
///
/// The server side is split into a [`ChannelSource`] and [`ChannelSink`];
/// the far end is driven through a [`ChannelPeer`]. A sink write blocks
/// while the peer leaves its inbox full, which makes write deadlines
/// observable in tests.
pub struct ChannelTransport {
    /// Frames sent by the peer.
    pub source: ChannelSource,
    /// Frames for the peer.
    pub sink: ChannelSink,
}

impl ChannelTransport {
    /// Create a transport and its peer. Each direction holds `capacity`
    /// frames.
    pub fn new(capacity: usize) -> (Self, ChannelPeer) {
        let (to_server, from_peer) = mpsc::channel(capacity.max(1));
        let (to_peer, from_server) = mpsc::channel(capacity.max(1));
        let transport = Self {
            source: ChannelSource { rx: from_peer },
            sink: ChannelSink {
                tx: Some(to_peer),
            },
        };
        let peer = ChannelPeer {
            tx: Some(to_server),
            rx: from_server,
        };
        (transport, peer)
    }
}

/// Server-side reading half of a [`ChannelTransport`].
pub struct ChannelSource {
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn read_message(&mut self) -> Result<Option<Frame>> {
        Ok(self.rx.recv().await)
    }
}

/// Server-side writing half of a [`ChannelTransport`].
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn write_message(&mut self, frame: Frame) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(TransportError::Closed);
        };
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(Frame::Close);
        }
        Ok(())
    }
}

/// Far end of a [`ChannelTransport`].
pub struct ChannelPeer {
    tx: Option<mpsc::Sender<Frame>>,
    rx: mpsc::Receiver<Frame>,
}

impl ChannelPeer {
    /// Send a frame to the server.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(TransportError::Closed);
        };
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Send a text frame to the server.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Frame::Text(text.into())).await
    }

    /// Next frame from the server, `None` once the server side is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next text frame, skipping pings.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await? {
                Frame::Text(text) => return Some(text),
                Frame::Ping | Frame::Pong => {}
                Frame::Close => return None,
            }
        }
    }

    /// Hang up: the server's next read returns `None`.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (transport, mut peer) = ChannelTransport::new(4);
        let ChannelTransport {
            mut source,
            mut sink,
        } = transport;

        peer.send_text("hello").await.unwrap();
        assert_eq!(
            source.read_message().await.unwrap(),
            Some(Frame::Text("hello".into()))
        );

        sink.write_message(Frame::Text("world".into())).await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Text("world".into())));
    }

    #[tokio::test]
    async fn hang_up_ends_the_source() {
        let (transport, mut peer) = ChannelTransport::new(4);
        let mut source = transport.source;
        peer.hang_up();
        assert_eq!(source.read_message().await.unwrap(), None);
        assert_matches!(peer.send(Frame::Ping).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn closed_sink_rejects_writes() {
        let (transport, mut peer) = ChannelTransport::new(4);
        let mut sink = transport.sink;
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert_matches!(
            sink.write_message(Frame::Ping).await,
            Err(TransportError::Closed)
        );
        assert_eq!(peer.recv().await, Some(Frame::Close));
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn full_peer_inbox_blocks_writes() {
        let (transport, _peer) = ChannelTransport::new(1);
        let mut sink = transport.sink;
        sink.write_message(Frame::Ping).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_secs(1), sink.write_message(Frame::Ping)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn recv_text_skips_probes() {
        let (transport, mut peer) = ChannelTransport::new(4);
        let mut sink = transport.sink;
        sink.write_message(Frame::Ping).await.unwrap();
        sink.write_message(Frame::Text("x".into())).await.unwrap();
        assert_eq!(peer.recv_text().await.as_deref(), Some("x"));
    }
}
