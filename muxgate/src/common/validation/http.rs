// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;

use super::{SessionValidator, ValidatedSession, ValidationError};

const VALIDATE_PATH: &str = "/internal/gateway/validate-session";
const INTERNAL_SECRET_HEADER: &str = "X-Internal-Secret";

#[derive(Serialize)]
struct ValidateRequest<'a> {
  session_token: &'a str,
}

/// Validator backed by the control plane's internal HTTP API.
///
/// One POST per validation, no retry; the caller's handshake deadline is
/// the retry policy.
pub struct HttpSessionValidator {
  client: reqwest::Client,
  endpoint: String,
  internal_secret: Option<String>,
}

impl HttpSessionValidator {
  pub fn new(
    base_url: &str,
    internal_secret: Option<String>,
    timeout: Duration,
  ) -> Result<Self, ValidationError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| ValidationError::Backend(e.into()))?;
    Ok(Self {
      client,
      endpoint: format!("{}{}", base_url.trim_end_matches('/'), VALIDATE_PATH),
      internal_secret,
    })
  }
}

impl SessionValidator for HttpSessionValidator {
  fn validate<'a>(
    &'a self,
    session_token: &'a str,
  ) -> BoxFuture<'a, Result<ValidatedSession, ValidationError>> {
    async move {
      let mut request = self
        .client
        .post(&self.endpoint)
        .json(&ValidateRequest { session_token });
      if let Some(secret) = &self.internal_secret {
        request = request.header(INTERNAL_SECRET_HEADER, secret);
      }
      let response = request
        .send()
        .await
        .map_err(|e| ValidationError::Backend(e.into()))?;
      match response.status() {
        reqwest::StatusCode::OK => response
          .json::<ValidatedSession>()
          .await
          .map_err(|e| ValidationError::Backend(e.into())),
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
          Err(ValidationError::Rejected {
            reason: response.text().await.unwrap_or_default(),
          })
        }
        status => Err(ValidationError::Backend(anyhow::anyhow!(
          "Unexpected validation response status {status}"
        ))),
      }
    }
    .boxed()
  }
}
