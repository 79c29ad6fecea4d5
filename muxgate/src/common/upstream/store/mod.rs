// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Pluggable persistence of session-to-node bindings
//!
//! A store lets a stream be opened against a binding established by a
//! different handler instance, or before a process restart, at the cost
//! of one store round trip on cache miss. "Not found" is a normal
//! outcome and is never reported as an error.

use futures::future::BoxFuture;

use super::NodeBinding;

mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "redis-store")]
pub mod redis;
#[cfg(feature = "redis-store")]
pub use redis::RedisStore;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
  #[error("Failure serializing node binding: {0}")]
  Serialization(#[from] serde_json::Error),
  #[cfg(feature = "redis-store")]
  #[error("Store backend failure: {0}")]
  Redis(#[from] fred::error::RedisError),
}

pub trait SessionStore: Send + Sync {
  fn save<'a>(
    &'a self,
    session_id: &'a str,
    binding: &'a NodeBinding,
  ) -> BoxFuture<'a, Result<(), StoreError>>;

  fn load<'a>(&'a self, session_id: &'a str)
    -> BoxFuture<'a, Result<Option<NodeBinding>, StoreError>>;

  fn delete<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}
