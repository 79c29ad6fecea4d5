// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::time::Duration;

use fred::prelude::*;
use futures::future::{BoxFuture, FutureExt};

use super::{NodeBinding, SessionStore, StoreError};

/// Binding store backed by Redis; one key per session id, JSON value,
/// expiring after the configured time-to-live.
pub struct RedisStore {
  client: RedisClient,
  ttl: Duration,
  key_prefix: String,
}

impl RedisStore {
  pub fn new(client: RedisClient, ttl: Duration) -> Self {
    Self {
      client,
      ttl,
      key_prefix: String::from("gateway:sessions"),
    }
  }

  pub fn with_key_prefix(client: RedisClient, ttl: Duration, key_prefix: String) -> Self {
    Self {
      client,
      ttl,
      key_prefix,
    }
  }

  fn key(&self, session_id: &str) -> String {
    format!("{}:{}", self.key_prefix, session_id)
  }

  fn expiration(&self) -> Expiration {
    // Only whole seconds count toward redis expiry
    Expiration::EX(self.ttl.as_secs().try_into().unwrap_or(i64::MAX))
  }
}

impl SessionStore for RedisStore {
  fn save<'a>(
    &'a self,
    session_id: &'a str,
    binding: &'a NodeBinding,
  ) -> BoxFuture<'a, Result<(), StoreError>> {
    async move {
      let payload = serde_json::to_string(binding)?;
      self
        .client
        .set::<(), _, _>(self.key(session_id), payload, Some(self.expiration()), None, false)
        .await?;
      Ok(())
    }
    .boxed()
  }

  fn load<'a>(
    &'a self,
    session_id: &'a str,
  ) -> BoxFuture<'a, Result<Option<NodeBinding>, StoreError>> {
    async move {
      let value: Option<String> = self.client.get(self.key(session_id)).await?;
      Ok(match value {
        Some(value) => Some(serde_json::from_str(&value)?),
        None => None,
      })
    }
    .boxed()
  }

  fn delete<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
    async move {
      self.client.del::<u64, _>(self.key(session_id)).await?;
      Ok(())
    }
    .boxed()
  }
}
