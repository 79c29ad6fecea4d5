// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};

use super::{NodeBinding, SessionStore, StoreError};

/// Process-lifetime binding store; retention ends when the process does.
#[derive(Default)]
pub struct MemoryStore {
  bindings: DashMap<String, NodeBinding>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.bindings.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bindings.is_empty()
  }
}

impl SessionStore for MemoryStore {
  fn save<'a>(
    &'a self,
    session_id: &'a str,
    binding: &'a NodeBinding,
  ) -> BoxFuture<'a, Result<(), StoreError>> {
    self
      .bindings
      .insert(session_id.to_owned(), binding.clone());
    futures::future::ready(Ok(())).boxed()
  }

  fn load<'a>(
    &'a self,
    session_id: &'a str,
  ) -> BoxFuture<'a, Result<Option<NodeBinding>, StoreError>> {
    let found = self.bindings.get(session_id).map(|b| b.value().clone());
    futures::future::ready(Ok(found)).boxed()
  }

  fn delete<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
    self.bindings.remove(session_id);
    futures::future::ready(Ok(())).boxed()
  }
}
