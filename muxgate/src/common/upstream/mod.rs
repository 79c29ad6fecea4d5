// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Upstream relay: per-session node bindings and per-stream connections
//!
//! A session is bound to exactly one upstream node at handshake time;
//! every stream opened on that session dials the bound node. Variants
//! share one contract so the handler never cares whether bytes reach a
//! real node or an in-process fake.

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod cipher;
pub mod fake;
pub mod outline;
pub mod store;

pub use fake::FakeUpstream;
pub use outline::OutlineUpstream;
pub use store::{SessionStore, StoreError};

/// Routing and credential metadata for the node a session relays through.
///
/// Produced once by the session validator, consumed by
/// [`Upstream::bind_session`], and optionally persisted by a
/// [`SessionStore`] keyed by session id.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeBinding {
  #[serde(default)]
  pub node_id: i64,
  pub host: String,
  pub port: u16,
  #[serde(default)]
  pub method: String,
  #[serde(default)]
  pub secret: String,
  #[serde(default)]
  pub region: String,
  #[serde(default)]
  pub pool: String,
  #[serde(default)]
  pub access_key_id: String,
  #[serde(default)]
  pub access_url: String,
}

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
  #[error("No node binding found for session")]
  SessionNotBound,
  #[error("Session has no live connection table")]
  SessionNotFound,
  #[error("Stream is not open")]
  StreamNotFound,
  #[error("Stream id already has a live connection")]
  StreamExists,
  #[error("Unsupported cipher method: {0}")]
  UnsupportedCipher(String),
  #[error("Upstream dial failure: {0}")]
  Dial(#[source] std::io::Error),
  #[error("Upstream closed the connection")]
  UpstreamClosed,
  #[error("Upstream I/O deadline exceeded")]
  DeadlineExceeded,
  #[error("Upstream I/O failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("Session store failure: {0}")]
  Store(#[from] StoreError),
}

impl UpstreamError {
  /// Short token used as a metrics label for the failure.
  pub fn reason(&self) -> &'static str {
    match self {
      UpstreamError::SessionNotBound => "session_not_bound",
      UpstreamError::SessionNotFound => "session_not_found",
      UpstreamError::StreamNotFound => "stream_not_found",
      UpstreamError::StreamExists => "stream_exists",
      UpstreamError::UnsupportedCipher(_) => "unsupported_cipher",
      UpstreamError::Dial(_) => "dial",
      UpstreamError::UpstreamClosed => "upstream_closed",
      UpstreamError::DeadlineExceeded => "deadline_exceeded",
      UpstreamError::Io(_) => "io",
      UpstreamError::Store(_) => "store",
    }
  }
}

/// One live byte connection to an upstream node, plain or enciphered.
pub trait UpstreamConnection: Send {
  fn write_all<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, std::io::Result<()>>;

  /// Reads at most `buf.len()` bytes; `Ok(0)` marks a clean end of stream.
  fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, std::io::Result<usize>>;

  fn shutdown(&mut self) -> BoxFuture<'_, std::io::Result<()>>;
}

/// Adapts any plain byte stream into an [`UpstreamConnection`].
pub struct PlainConnection<S>(pub S);

impl<S> UpstreamConnection for PlainConnection<S>
where
  S: AsyncRead + AsyncWrite + Send + Unpin,
{
  fn write_all<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, std::io::Result<()>> {
    AsyncWriteExt::write_all(&mut self.0, data).boxed()
  }

  fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, std::io::Result<usize>> {
    AsyncReadExt::read(&mut self.0, buf).boxed()
  }

  fn shutdown(&mut self) -> BoxFuture<'_, std::io::Result<()>> {
    AsyncWriteExt::shutdown(&mut self.0).boxed()
  }
}

/// The relay contract shared by every upstream variant.
///
/// All failures are scoped to the offending session or stream; an error
/// from any operation must never affect sibling streams.
pub trait Upstream: Send + Sync {
  /// Associates the session with a node; an idempotent upsert, persisted
  /// to the session store before the in-memory table is updated.
  fn bind_session<'a>(
    &'a self,
    session_id: &'a str,
    binding: NodeBinding,
  ) -> BoxFuture<'a, Result<(), UpstreamError>>;

  /// Closes every live connection owned by the session, drops its binding
  /// and deletes any persisted record.
  fn unbind_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<(), UpstreamError>>;

  /// Resolves the session's binding (memory first, then store with
  /// cache-fill) and dials one connection for the stream id.
  fn open_stream<'a>(
    &'a self,
    session_id: &'a str,
    stream_id: &'a str,
  ) -> BoxFuture<'a, Result<(), UpstreamError>>;

  /// Writes the whole payload, then performs exactly one bounded read.
  /// An empty result means "no response yet", not end of stream.
  fn write<'a>(
    &'a self,
    session_id: &'a str,
    stream_id: &'a str,
    data: &'a [u8],
  ) -> BoxFuture<'a, Result<Vec<u8>, UpstreamError>>;

  /// Closes and removes the stream's connection; no-op if absent.
  fn close_stream<'a>(
    &'a self,
    session_id: &'a str,
    stream_id: &'a str,
  ) -> BoxFuture<'a, Result<(), UpstreamError>>;
}
