// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Message transports carrying one frame per message
//!
//! The handler consumes raw message bytes rather than parsed frames so
//! that a message which fails to parse can be answered on the same
//! connection instead of tearing the transport down.

use futures::{
  future::{BoxFuture, FutureExt},
  SinkExt, StreamExt,
};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_tungstenite::{
  tungstenite::{Error as WsError, Message},
  WebSocketStream,
};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("Connection closed")]
  ConnectionClosed,
  #[error("Transport failure: {0}")]
  Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
  #[error("Failure serializing frame: {0}")]
  Encoding(#[from] serde_json::Error),
}

/// A persistent bidirectional message transport delivering whole messages.
///
/// `recv` resolving to [`TransportError::ConnectionClosed`] marks the end
/// of the connection; `close` is idempotent and must not fail on an
/// already-closed peer.
pub trait FrameTransport: Send {
  fn recv(&mut self) -> BoxFuture<'_, Result<Vec<u8>, TransportError>>;

  fn send(&mut self, message: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>>;

  fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// [`FrameTransport`] over a websocket; each frame rides one text message.
pub struct WebSocketTransport<S> {
  inner: WebSocketStream<S>,
}

impl<S> WebSocketTransport<S> {
  pub fn new(inner: WebSocketStream<S>) -> Self {
    Self { inner }
  }
}

impl<S> FrameTransport for WebSocketTransport<S>
where
  S: AsyncRead + AsyncWrite + Send + Unpin,
{
  fn recv(&mut self) -> BoxFuture<'_, Result<Vec<u8>, TransportError>> {
    async move {
      loop {
        match self.inner.next().await {
          None => return Err(TransportError::ConnectionClosed),
          Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
            return Err(TransportError::ConnectionClosed)
          }
          Some(Err(e)) => return Err(TransportError::Transport(Box::new(e))),
          Some(Ok(Message::Text(text))) => return Ok(text.as_bytes().to_vec()),
          Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
          Some(Ok(Message::Close(_))) => return Err(TransportError::ConnectionClosed),
          // Websocket-level ping/pong is answered by tungstenite itself
          Some(Ok(_)) => continue,
        }
      }
    }
    .boxed()
  }

  fn send(&mut self, message: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      let message = match String::from_utf8(message) {
        Ok(text) => Message::text(text),
        Err(raw) => Message::binary(raw.into_bytes()),
      };
      match self.inner.send(message).await {
        Ok(()) => Ok(()),
        Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
          Err(TransportError::ConnectionClosed)
        }
        Err(e) => Err(TransportError::Transport(Box::new(e))),
      }
    }
    .boxed()
  }

  fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      match self.inner.close(None).await {
        Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
        Err(e) => Err(TransportError::Transport(Box::new(e))),
      }
    }
    .boxed()
  }
}

/// One end of an entangled in-process transport pair.
pub struct DuplexTransport {
  to_remote: Option<UnboundedSender<Vec<u8>>>,
  from_remote: UnboundedReceiver<Vec<u8>>,
}

/// Produces two entangled [`DuplexTransport`] ends; messages sent on one
/// arrive on the other. Closing either end ends the peer's `recv` stream
/// once buffered messages drain.
pub fn duplex() -> (DuplexTransport, DuplexTransport) {
  let (left_up, right_down) = mpsc::unbounded_channel();
  let (right_up, left_down) = mpsc::unbounded_channel();
  (
    DuplexTransport {
      to_remote: Some(left_up),
      from_remote: left_down,
    },
    DuplexTransport {
      to_remote: Some(right_up),
      from_remote: right_down,
    },
  )
}

impl FrameTransport for DuplexTransport {
  fn recv(&mut self) -> BoxFuture<'_, Result<Vec<u8>, TransportError>> {
    async move {
      self
        .from_remote
        .recv()
        .await
        .ok_or(TransportError::ConnectionClosed)
    }
    .boxed()
  }

  fn send(&mut self, message: Vec<u8>) -> BoxFuture<'_, Result<(), TransportError>> {
    futures::future::ready(
      self
        .to_remote
        .as_ref()
        .ok_or(TransportError::ConnectionClosed)
        .and_then(|sender| {
          sender
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)
        }),
    )
    .boxed()
  }

  fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
    self.to_remote.take();
    futures::future::ready(Ok(())).boxed()
  }
}
