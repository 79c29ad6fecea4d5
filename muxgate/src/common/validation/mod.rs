// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Session-token validation against the control plane
//!
//! A validator exchanges an opaque session token for the identity and
//! routing facts the handler needs: the session id to register, the
//! device id, the stream allowance and the node the session relays
//! through. Rejection and backend failure are kept apart so the handler
//! can answer the client differently.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::common::upstream::NodeBinding;

pub mod http;
pub use http::HttpSessionValidator;

/// The control plane's verdict on a session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedSession {
  pub session_id: String,
  #[serde(default)]
  pub device_id: String,
  #[serde(default)]
  pub max_streams: usize,
  #[serde(rename = "node")]
  pub binding: NodeBinding,
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
  /// The control plane understood the token and said no.
  #[error("Session token rejected: {reason}")]
  Rejected { reason: String },
  /// The verdict could not be obtained.
  #[error("Validation backend failure: {0}")]
  Backend(#[source] anyhow::Error),
}

pub trait SessionValidator: Send + Sync {
  fn validate<'a>(
    &'a self,
    session_token: &'a str,
  ) -> BoxFuture<'a, Result<ValidatedSession, ValidationError>>;
}
