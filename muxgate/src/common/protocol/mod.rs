// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire frames exchanged with gateway clients, and the handler driving them
//!
//! Every transport message carries exactly one JSON-encoded [`Frame`],
//! discriminated by its `type` field. Stream payloads travel as base64
//! text in `stream_data` frames so that arbitrary bytes survive the
//! text-oriented transport.

use serde::{Deserialize, Serialize};

pub mod handler;
pub mod transport;

pub use handler::ProtocolHandler;
pub use transport::{FrameTransport, TransportError};

/// Error codes surfaced to clients in [`Frame::Error`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
  /// The first message was not a well-formed hello frame
  BadHello,
  /// The hello carried a protocol version the gateway does not speak
  BadVersion,
  /// Session-token validation failed or could not be performed
  AuthFailed,
  /// Session registration or node binding failed during the handshake
  SessionError,
  /// A stream operation failed at the registry or the upstream relay
  StreamError,
  /// A stream frame referenced an unknown stream or carried bad fields
  BadStream,
  /// A message could not be parsed as any frame
  BadFrame,
  /// A parseable frame with a discriminant the gateway does not handle
  Unsupported,
}

impl ErrorCode {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorCode::BadHello => "bad_hello",
      ErrorCode::BadVersion => "bad_version",
      ErrorCode::AuthFailed => "auth_failed",
      ErrorCode::SessionError => "session_error",
      ErrorCode::StreamError => "stream_error",
      ErrorCode::BadStream => "bad_stream",
      ErrorCode::BadFrame => "bad_frame",
      ErrorCode::Unsupported => "unsupported",
    }
  }
}

impl std::fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One client-facing protocol message; a tagged union over the frame set.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
  Hello {
    session_token: String,
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client: Option<String>,
  },
  Ready {
    session_id: String,
    max_streams: usize,
  },
  Error {
    code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
  },
  StreamOpen {
    stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
  },
  StreamData {
    stream_id: String,
    data: String,
  },
  StreamClose {
    stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
  },
  Ping,
  Pong,
}

/// The discriminant-only view of a message, used to classify messages
/// which fail to parse as a full [`Frame`].
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
  #[serde(rename = "type")]
  pub kind: String,
}

impl Frame {
  pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(self)
  }

  pub fn decode(raw: &[u8]) -> Result<Frame, serde_json::Error> {
    serde_json::from_slice(raw)
  }

  pub fn error(code: ErrorCode, message: impl Into<String>) -> Frame {
    Frame::Error {
      code,
      message: Some(message.into()),
    }
  }
}

/// Encodes raw stream bytes for the `data` field of a `stream_data` frame.
pub fn encode_data(payload: &[u8]) -> String {
  use base64::Engine;
  base64::engine::general_purpose::STANDARD.encode(payload)
}

/// Decodes the `data` field of a `stream_data` frame back into raw bytes.
pub fn decode_data(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
  use base64::Engine;
  base64::engine::general_purpose::STANDARD.decode(data)
}
