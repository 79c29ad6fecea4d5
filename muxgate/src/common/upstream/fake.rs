// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-process upstream for local runs and handler tests
//!
//! Keeps the full binding/stream bookkeeping of the real relay so error
//! paths behave identically, but never opens a socket; writes echo the
//! payload back (or nothing, when echo is off).

use std::collections::{HashMap, HashSet};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Mutex;

use super::{NodeBinding, Upstream, UpstreamError};

#[derive(Default)]
struct Tables {
  bindings: HashMap<String, NodeBinding>,
  streams: HashMap<String, HashSet<String>>,
}

pub struct FakeUpstream {
  tables: Mutex<Tables>,
  echo: bool,
}

impl FakeUpstream {
  pub fn new(echo: bool) -> Self {
    Self {
      tables: Mutex::new(Tables::default()),
      echo,
    }
  }

  pub async fn is_bound(&self, session_id: &str) -> bool {
    self.tables.lock().await.bindings.contains_key(session_id)
  }

  pub async fn open_streams(&self, session_id: &str) -> usize {
    self
      .tables
      .lock()
      .await
      .streams
      .get(session_id)
      .map(HashSet::len)
      .unwrap_or(0)
  }
}

impl Default for FakeUpstream {
  fn default() -> Self {
    Self::new(true)
  }
}

impl Upstream for FakeUpstream {
  fn bind_session<'a>(
    &'a self,
    session_id: &'a str,
    binding: NodeBinding,
  ) -> BoxFuture<'a, Result<(), UpstreamError>> {
    async move {
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
      let mut tables = self.tables.lock().await;
      tables.bindings.remove(session_id);
      tables.streams.remove(session_id);
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
      let mut tables = self.tables.lock().await;
      if !tables.bindings.contains_key(session_id) {
        return Err(UpstreamError::SessionNotBound);
      }
      let streams = tables.streams.entry(session_id.to_owned()).or_default();
      if !streams.insert(stream_id.to_owned()) {
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
      let tables = self.tables.lock().await;
      let streams = tables
        .streams
        .get(session_id)
        .ok_or(UpstreamError::SessionNotFound)?;
      if !streams.contains(stream_id) {
        return Err(UpstreamError::StreamNotFound);
      }
      Ok(if self.echo { data.to_vec() } else { Vec::new() })
    }
    .boxed()
  }

  fn close_stream<'a>(
    &'a self,
    session_id: &'a str,
    stream_id: &'a str,
  ) -> BoxFuture<'a, Result<(), UpstreamError>> {
    async move {
      if let Some(streams) = self.tables.lock().await.streams.get_mut(session_id) {
        streams.remove(stream_id);
      }
      Ok(())
    }
    .boxed()
  }
}
