// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Relay to real upstream nodes over TCP, optionally enciphered
//!
//! Bindings and live connections are tracked per session. The binding
//! table is backed by an optional [`SessionStore`]; a stream opened on a
//! session this instance has never bound falls back to the store and
//! fills the local table on a hit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::cipher::{CipherMethod, CipherStream};
use super::store::SessionStore;
use super::{NodeBinding, PlainConnection, Upstream, UpstreamConnection, UpstreamError};

/// Single bounded read buffer; responses longer than this are delivered
/// across subsequent writes.
const READ_BUFFER_SIZE: usize = 64 * 1024;

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials one connection to a bound node. Swapped out in tests.
pub trait Dialer: Send + Sync {
  fn dial<'a>(
    &'a self,
    binding: &'a NodeBinding,
  ) -> BoxFuture<'a, Result<Box<dyn UpstreamConnection>, UpstreamError>>;
}

/// Dials the node over TCP, wrapping the socket per the binding's
/// cipher method.
pub struct TcpDialer;

impl Dialer for TcpDialer {
  fn dial<'a>(
    &'a self,
    binding: &'a NodeBinding,
  ) -> BoxFuture<'a, Result<Box<dyn UpstreamConnection>, UpstreamError>> {
    async move {
      // Reject unknown ciphers before paying for the dial
      let method = CipherMethod::from_name(&binding.method)?;
      let stream = TcpStream::connect((binding.host.as_str(), binding.port))
        .await
        .map_err(UpstreamError::Dial)?;
      Ok(match method {
        CipherMethod::None => Box::new(PlainConnection(stream)) as Box<dyn UpstreamConnection>,
        CipherMethod::ChaCha20IetfPoly1305 => {
          Box::new(CipherStream::new(stream, &binding.secret))
        }
      })
    }
    .boxed()
  }
}

type SharedConnection = Arc<Mutex<Box<dyn UpstreamConnection>>>;

#[derive(Default)]
struct Tables {
  bindings: HashMap<String, NodeBinding>,
  // session id -> stream id -> connection
  streams: HashMap<String, HashMap<String, SharedConnection>>,
}

/// Upstream variant relaying to outline-style nodes.
pub struct OutlineUpstream {
  dialer: Box<dyn Dialer>,
  store: Option<Box<dyn SessionStore>>,
  tables: Mutex<Tables>,
  io_timeout: Duration,
}

impl OutlineUpstream {
  pub fn new(io_timeout: Option<Duration>) -> Self {
    Self::with_dialer_and_store(Box::new(TcpDialer), None, io_timeout)
  }

  pub fn with_store(store: Box<dyn SessionStore>, io_timeout: Option<Duration>) -> Self {
    Self::with_dialer_and_store(Box::new(TcpDialer), Some(store), io_timeout)
  }

  pub fn with_dialer_and_store(
    dialer: Box<dyn Dialer>,
    store: Option<Box<dyn SessionStore>>,
    io_timeout: Option<Duration>,
  ) -> Self {
    Self {
      dialer,
      store,
      tables: Mutex::new(Tables::default()),
      io_timeout: io_timeout.unwrap_or(DEFAULT_IO_TIMEOUT),
    }
  }

  /// Binding lookup with store fallback and cache fill.
  async fn resolve_binding(&self, session_id: &str) -> Result<NodeBinding, UpstreamError> {
    if let Some(binding) = self.tables.lock().await.bindings.get(session_id) {
      return Ok(binding.clone());
    }
    let Some(store) = &self.store else {
      return Err(UpstreamError::SessionNotBound);
    };
    let Some(binding) = store.load(session_id).await? else {
      return Err(UpstreamError::SessionNotBound);
    };
    let mut tables = self.tables.lock().await;
    Ok(
      tables
        .bindings
        .entry(session_id.to_owned())
        .or_insert(binding)
        .clone(),
    )
  }

  async fn connection(
    &self,
    session_id: &str,
    stream_id: &str,
  ) -> Result<SharedConnection, UpstreamError> {
    let tables = self.tables.lock().await;
    let streams = tables
      .streams
      .get(session_id)
      .ok_or(UpstreamError::SessionNotFound)?;
    streams
      .get(stream_id)
      .cloned()
      .ok_or(UpstreamError::StreamNotFound)
  }
}

impl Upstream for OutlineUpstream {
  fn bind_session<'a>(
    &'a self,
    session_id: &'a str,
    binding: NodeBinding,
  ) -> BoxFuture<'a, Result<(), UpstreamError>> {
    async move {
      // Persist first so a crash between the two writes loses nothing
      if let Some(store) = &self.store {
        store.save(session_id, &binding).await?;
      }
      self
        .tables
        .lock()
        .await
        .bindings
        .insert(session_id.to_owned(), binding);
      Ok(())
    }
    .boxed()
  }

  fn unbind_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<(), UpstreamError>> {
    async move {
      let conns: Vec<SharedConnection> = {
        let mut tables = self.tables.lock().await;
        tables.bindings.remove(session_id);
        tables
          .streams
          .remove(session_id)
          .map(|streams| streams.into_values().collect())
          .unwrap_or_default()
      };
      for conn in conns {
        // Shutdown failures do not block the rest of the teardown
        let _ = conn.lock().await.shutdown().await;
      }
      if let Some(store) = &self.store {
        store.delete(session_id).await?;
      }
      Ok(())
    }
    .boxed()
  }

  fn open_stream<'a>(
    &'a self,
    session_id: &'a str,
    stream_id: &'a str,
  ) -> BoxFuture<'a, Result<(), UpstreamError>> {
    async move {
      let binding = self.resolve_binding(session_id).await?;
      let conn = self.dialer.dial(&binding).await?;
      let replaced = {
        let mut tables = self.tables.lock().await;
        let streams = tables.streams.entry(session_id.to_owned()).or_default();
        if streams.contains_key(stream_id) {
          Some(conn)
        } else {
          streams.insert(stream_id.to_owned(), Arc::new(Mutex::new(conn)));
          None
        }
      };
      if let Some(mut conn) = replaced {
        let _ = conn.shutdown().await;
        return Err(UpstreamError::StreamExists);
      }
      Ok(())
    }
    .boxed()
  }

  fn write<'a>(
    &'a self,
    session_id: &'a str,
    stream_id: &'a str,
    data: &'a [u8],
  ) -> BoxFuture<'a, Result<Vec<u8>, UpstreamError>> {
    async move {
      let conn = self.connection(session_id, stream_id).await?;
      let mut conn = conn.lock().await;
      tokio::time::timeout(self.io_timeout, conn.write_all(data))
        .await
        .map_err(|_| UpstreamError::DeadlineExceeded)??;
      let mut buf = vec![0u8; READ_BUFFER_SIZE];
      match tokio::time::timeout(self.io_timeout, conn.read(&mut buf)).await {
        // The node often has nothing to say yet; hand back silence
        Err(_) => Ok(Vec::new()),
        Ok(Ok(0)) => Err(UpstreamError::UpstreamClosed),
        Ok(Ok(n)) => {
          buf.truncate(n);
          Ok(buf)
        }
        Ok(Err(e)) => Err(UpstreamError::Io(e)),
      }
    }
    .boxed()
  }

  fn close_stream<'a>(
    &'a self,
    session_id: &'a str,
    stream_id: &'a str,
  ) -> BoxFuture<'a, Result<(), UpstreamError>> {
    async move {
      let conn = {
        let mut tables = self.tables.lock().await;
        tables
          .streams
          .get_mut(session_id)
          .and_then(|streams| streams.remove(stream_id))
      };
      if let Some(conn) = conn {
        let _ = conn.lock().await.shutdown().await;
      }
      Ok(())
    }
    .boxed()
  }
}
