// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-connection protocol state machine
//!
//! One handler instance drives one client connection from hello to
//! teardown, strictly sequentially: a frame is fully handled before the
//! next is read. Frame-scoped failures answer with an error frame and
//! keep the connection; transport failures end it. Teardown is the sole
//! cleanup path once a session exists, and runs exactly once.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use tracing::Instrument;

use super::transport::FrameTransport;
use super::{decode_data, encode_data, Envelope, ErrorCode, Frame};
use crate::common::sessions::{Session, SessionManager};
use crate::common::upstream::Upstream;
use crate::common::validation::{SessionValidator, ValidationError};

pub struct ProtocolHandler {
  sessions: Arc<SessionManager>,
  upstream: Arc<dyn Upstream>,
  validator: Arc<dyn SessionValidator>,
  protocol_version: String,
}

impl ProtocolHandler {
  pub fn new(
    sessions: Arc<SessionManager>,
    upstream: Arc<dyn Upstream>,
    validator: Arc<dyn SessionValidator>,
    protocol_version: String,
  ) -> Self {
    Self {
      sessions,
      upstream,
      validator,
      protocol_version,
    }
  }

  /// Drives the connection to completion. Consumes the transport; when
  /// this returns, every resource the connection held has been released.
  pub async fn run<T: FrameTransport>(&self, mut transport: T) {
    let span = tracing::info_span!(
      "connection",
      session_id = tracing::field::Empty,
      device_id = tracing::field::Empty,
    );
    async {
      let Some(session) = self.handshake(&mut transport).await else {
        let _ = transport.close().await;
        return;
      };
      let current = tracing::Span::current();
      current.record("session_id", session.id.as_str());
      current.record("device_id", session.device_id.as_str());
      tracing::info!("Session started");

      self.serve(&mut transport, &session.id).await;
      self.teardown(&mut transport, &session).await;
    }
    .instrument(span)
    .await
  }

  /// Runs the hello exchange. `Some` means a session was registered and
  /// bound and must be torn down by the caller; `None` means nothing was
  /// left behind.
  async fn handshake<T: FrameTransport>(&self, transport: &mut T) -> Option<Session> {
    let started = Instant::now();
    let raw = transport.recv().await.ok()?;

    let hello = Frame::decode(&raw);
    let (session_token, version) = match hello {
      Ok(Frame::Hello {
        session_token,
        version,
        ..
      }) if !session_token.is_empty() && !version.is_empty() => (session_token, version),
      _ => {
        counter!("gateway_handshakes_total", "result" => "error").increment(1);
        self
          .send_error(transport, ErrorCode::BadHello, "Expected a hello frame")
          .await;
        return None;
      }
    };

    if version != self.protocol_version {
      counter!("gateway_handshakes_total", "result" => "bad_version").increment(1);
      self
        .send_error(
          transport,
          ErrorCode::BadVersion,
          format!("Unsupported protocol version {version}"),
        )
        .await;
      return None;
    }

    let verdict = match self.validator.validate(&session_token).await {
      Ok(verdict) => verdict,
      Err(ValidationError::Rejected { reason }) => {
        tracing::info!(%reason, "Session token rejected");
        counter!("gateway_handshakes_total", "result" => "rejected").increment(1);
        self
          .send_error(transport, ErrorCode::AuthFailed, "Session token rejected")
          .await;
        return None;
      }
      Err(ValidationError::Backend(error)) => {
        tracing::warn!(%error, "Session validation unavailable");
        counter!("gateway_handshakes_total", "result" => "error").increment(1);
        self
          .send_error(transport, ErrorCode::AuthFailed, "Validation unavailable")
          .await;
        return None;
      }
    };

    let session = match self.sessions.create_session(
      &verdict.session_id,
      &verdict.device_id,
      verdict.max_streams,
    ) {
      Ok(session) => session,
      Err(error) => {
        tracing::warn!(%error, session_id = %verdict.session_id, "Session registration failed");
        counter!("gateway_handshakes_total", "result" => "error").increment(1);
        self
          .send_error(transport, ErrorCode::SessionError, "Session registration failed")
          .await;
        return None;
      }
    };

    if let Err(error) = self
      .upstream
      .bind_session(&session.id, verdict.binding)
      .await
    {
      tracing::warn!(%error, session_id = %session.id, "Node binding failed");
      // The session must not outlive a failed bind
      self.sessions.close_session(&session.id);
      counter!("gateway_handshakes_total", "result" => "error").increment(1);
      self
        .send_error(transport, ErrorCode::SessionError, "Node binding failed")
        .await;
      return None;
    }

    let max_streams = if session.max_streams > 0 {
      session.max_streams
    } else {
      self.sessions.default_max_streams()
    };
    let ready = Frame::Ready {
      session_id: session.id.clone(),
      max_streams,
    };
    // A failed ready send still hands the session to teardown
    let _ = self.send(transport, &ready).await;

    counter!("gateway_handshakes_total", "result" => "accepted").increment(1);
    histogram!("gateway_handshake_duration_seconds").record(started.elapsed().as_secs_f64());
    gauge!("gateway_active_sessions").set(self.sessions.active_sessions() as f64);
    Some(session)
  }

  /// The ready-state frame loop; returns when the transport ends.
  async fn serve<T: FrameTransport>(&self, transport: &mut T, session_id: &str) {
    loop {
      let raw = match transport.recv().await {
        Ok(raw) => raw,
        Err(_) => return,
      };
      let frame = match Frame::decode(&raw) {
        Ok(frame) => frame,
        Err(_) => {
          let code = classify_unparsed(&raw);
          if !self
            .send_frame_error(transport, code, "Malformed frame")
            .await
          {
            return;
          }
          continue;
        }
      };
      if !self.dispatch(transport, session_id, frame).await {
        return;
      }
    }
  }

  /// Handles one parsed frame; false means the transport is dead.
  async fn dispatch<T: FrameTransport>(
    &self,
    transport: &mut T,
    session_id: &str,
    frame: Frame,
  ) -> bool {
    match frame {
      Frame::StreamOpen { stream_id, target } => {
        self
          .handle_stream_open(transport, session_id, &stream_id, target.as_deref())
          .await
      }
      Frame::StreamData { stream_id, data } => {
        self
          .handle_stream_data(transport, session_id, &stream_id, &data)
          .await
      }
      Frame::StreamClose { stream_id, reason } => {
        self
          .handle_stream_close(session_id, &stream_id, reason.as_deref())
          .await;
        true
      }
      Frame::Ping => self.send(transport, &Frame::Pong).await,
      // Unsolicited pongs and client-reported errors are informational
      Frame::Pong => true,
      Frame::Error { code, message } => {
        tracing::debug!(code = %code, ?message, "Client reported an error");
        true
      }
      Frame::Hello { .. } | Frame::Ready { .. } => {
        self
          .send_frame_error(transport, ErrorCode::Unsupported, "Unexpected frame in session")
          .await
      }
    }
  }

  async fn handle_stream_open<T: FrameTransport>(
    &self,
    transport: &mut T,
    session_id: &str,
    stream_id: &str,
    target: Option<&str>,
  ) -> bool {
    if stream_id.is_empty() {
      counter!("gateway_stream_opens_total", "result" => "bad_stream").increment(1);
      return self
        .send_frame_error(transport, ErrorCode::BadStream, "Stream id must not be empty")
        .await;
    }
    tracing::debug!(stream_id, target, "Opening stream");
    if let Err(error) = self.sessions.open_stream(session_id, stream_id) {
      counter!("gateway_stream_opens_total", "result" => error.reason()).increment(1);
      return self
        .send_frame_error(transport, ErrorCode::StreamError, error.to_string())
        .await;
    }
    if let Err(error) = self.upstream.open_stream(session_id, stream_id).await {
      tracing::warn!(%error, stream_id, "Upstream refused the stream");
      counter!("gateway_stream_opens_total", "result" => error.reason()).increment(1);
      counter!("gateway_upstream_errors_total", "operation" => "open").increment(1);
      // The stream must be open in both registries or neither
      self.sessions.close_stream(session_id, stream_id);
      return self
        .send_frame_error(transport, ErrorCode::StreamError, "Failed to open stream")
        .await;
    }
    counter!("gateway_stream_opens_total", "result" => "ok").increment(1);
    gauge!("gateway_active_streams").set(self.sessions.active_streams() as f64);
    true
  }

  async fn handle_stream_data<T: FrameTransport>(
    &self,
    transport: &mut T,
    session_id: &str,
    stream_id: &str,
    data: &str,
  ) -> bool {
    if !self.sessions.has_stream(session_id, stream_id) {
      return self
        .send_frame_error(transport, ErrorCode::BadStream, "Unknown stream id")
        .await;
    }
    let payload = match decode_data(data) {
      Ok(payload) => payload,
      Err(_) => {
        return self
          .send_frame_error(transport, ErrorCode::BadStream, "Undecodable stream data")
          .await;
      }
    };
    counter!("gateway_bytes_in_total").increment(payload.len() as u64);
    let response = match self.upstream.write(session_id, stream_id, &payload).await {
      Ok(response) => response,
      Err(error) => {
        tracing::warn!(%error, stream_id, "Upstream write failed");
        counter!("gateway_stream_errors_total", "reason" => error.reason()).increment(1);
        counter!("gateway_upstream_errors_total", "operation" => "write").increment(1);
        // The stream stays open; the client decides whether to retry
        return self
          .send_frame_error(transport, ErrorCode::StreamError, "Upstream write failed")
          .await;
      }
    };
    if response.is_empty() {
      return true;
    }
    counter!("gateway_bytes_out_total").increment(response.len() as u64);
    self
      .send(
        transport,
        &Frame::StreamData {
          stream_id: stream_id.to_owned(),
          data: encode_data(&response),
        },
      )
      .await
  }

  async fn handle_stream_close(&self, session_id: &str, stream_id: &str, reason: Option<&str>) {
    tracing::debug!(stream_id, reason, "Closing stream");
    if let Err(error) = self.upstream.close_stream(session_id, stream_id).await {
      tracing::warn!(%error, stream_id, "Upstream close failed");
      counter!("gateway_upstream_errors_total", "operation" => "close").increment(1);
    }
    self.sessions.close_stream(session_id, stream_id);
    counter!("gateway_stream_closes_total").increment(1);
    gauge!("gateway_active_streams").set(self.sessions.active_streams() as f64);
  }

  /// Releases everything the connection holds: remaining relay streams,
  /// the node binding, the session registration, then the transport.
  async fn teardown<T: FrameTransport>(&self, transport: &mut T, session: &Session) {
    for stream_id in self.sessions.open_stream_ids(&session.id) {
      if let Err(error) = self.upstream.close_stream(&session.id, &stream_id).await {
        tracing::warn!(%error, stream_id, "Stream close failed during teardown");
      }
    }
    if let Err(error) = self.upstream.unbind_session(&session.id).await {
      tracing::warn!(%error, "Session unbind failed during teardown");
    }
    self.sessions.close_session(&session.id);
    let _ = transport.close().await;

    gauge!("gateway_active_sessions").set(self.sessions.active_sessions() as f64);
    gauge!("gateway_active_streams").set(self.sessions.active_streams() as f64);
    if let Ok(elapsed) = session.started_at.elapsed() {
      histogram!("gateway_session_duration_seconds").record(elapsed.as_secs_f64());
    }
    tracing::info!("Session ended");
  }

  async fn send<T: FrameTransport>(&self, transport: &mut T, frame: &Frame) -> bool {
    let encoded = match frame.encode() {
      Ok(encoded) => encoded,
      Err(error) => {
        tracing::warn!(%error, "Failed to encode frame");
        return true;
      }
    };
    transport.send(encoded).await.is_ok()
  }

  /// Sends an error frame during the handshake, where send failures are
  /// already terminal for the caller.
  async fn send_error<T: FrameTransport>(
    &self,
    transport: &mut T,
    code: ErrorCode,
    message: impl Into<String>,
  ) {
    let _ = self.send(transport, &Frame::error(code, message)).await;
  }

  /// Sends a frame-scoped error in the ready loop; false means the
  /// transport is dead and the loop must end.
  async fn send_frame_error<T: FrameTransport>(
    &self,
    transport: &mut T,
    code: ErrorCode,
    message: impl Into<String>,
  ) -> bool {
    self.send(transport, &Frame::error(code, message)).await
  }
}

/// Picks the error code for a message that failed to parse as a frame:
/// recognizable stream frames with bad fields are stream-scoped, other
/// known discriminants are malformed, unknown discriminants are
/// unsupported.
fn classify_unparsed(raw: &[u8]) -> ErrorCode {
  match serde_json::from_slice::<Envelope>(raw) {
    Err(_) => ErrorCode::BadFrame,
    Ok(envelope) => match envelope.kind.as_str() {
      "stream_open" | "stream_data" | "stream_close" => ErrorCode::BadStream,
      "hello" | "ready" | "error" | "ping" | "pong" => ErrorCode::BadFrame,
      _ => ErrorCode::Unsupported,
    },
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use futures::future::{BoxFuture, FutureExt};

  use super::super::transport::{duplex, DuplexTransport, FrameTransport};
  use super::{classify_unparsed, ErrorCode, Frame, ProtocolHandler};
  use crate::common::protocol::{decode_data, encode_data};
  use crate::common::sessions::SessionManager;
  use crate::common::upstream::{FakeUpstream, NodeBinding, Upstream, UpstreamError};
  use crate::common::validation::{
    SessionValidator, ValidatedSession, ValidationError,
  };

  const VERSION: &str = "1";
  const GOOD_TOKEN: &str = "good-token";

  struct StaticValidator {
    max_streams: usize,
  }

  impl SessionValidator for StaticValidator {
    fn validate<'a>(
      &'a self,
      session_token: &'a str,
    ) -> BoxFuture<'a, Result<ValidatedSession, ValidationError>> {
      let verdict = if session_token == GOOD_TOKEN {
        Ok(ValidatedSession {
          session_id: "sess-1".into(),
          device_id: "dev-1".into(),
          max_streams: self.max_streams,
          binding: NodeBinding {
            host: "node.example".into(),
            port: 8388,
            ..Default::default()
          },
        })
      } else {
        Err(ValidationError::Rejected {
          reason: "unknown token".into(),
        })
      };
      futures::future::ready(verdict).boxed()
    }
  }

  struct Fixture {
    sessions: Arc<SessionManager>,
    upstream: Arc<FakeUpstream>,
    client: DuplexTransport,
    handler: tokio::task::JoinHandle<()>,
  }

  fn start(max_streams: usize) -> Fixture {
    start_with(Arc::new(FakeUpstream::new(true)), max_streams)
  }

  fn start_with(upstream: Arc<FakeUpstream>, max_streams: usize) -> Fixture {
    let sessions = Arc::new(SessionManager::new(16));
    let handler = ProtocolHandler::new(
      sessions.clone(),
      upstream.clone(),
      Arc::new(StaticValidator { max_streams }),
      VERSION.into(),
    );
    let (client, server) = duplex();
    let handler = tokio::spawn(async move { handler.run(server).await });
    Fixture {
      sessions,
      upstream,
      client,
      handler,
    }
  }

  async fn send(client: &mut DuplexTransport, frame: Frame) {
    client.send(frame.encode().unwrap()).await.unwrap();
  }

  async fn recv(client: &mut DuplexTransport) -> Frame {
    Frame::decode(&client.recv().await.unwrap()).unwrap()
  }

  async fn handshake(client: &mut DuplexTransport) -> (String, usize) {
    send(
      client,
      Frame::Hello {
        session_token: GOOD_TOKEN.into(),
        version: VERSION.into(),
        client: Some("test".into()),
      },
    )
    .await;
    match recv(client).await {
      Frame::Ready {
        session_id,
        max_streams,
      } => (session_id, max_streams),
      other => panic!("Expected ready, got {:?}", other),
    }
  }

  async fn expect_error(client: &mut DuplexTransport, code: ErrorCode) {
    match recv(client).await {
      Frame::Error { code: got, .. } => assert_eq!(got, code),
      other => panic!("Expected error({:?}), got {:?}", code, other),
    }
  }

  #[tokio::test]
  async fn full_session_lifecycle() {
    let mut fx = start(4);
    let (session_id, max_streams) = handshake(&mut fx.client).await;
    assert_eq!(session_id, "sess-1");
    assert_eq!(max_streams, 4);
    assert!(fx.upstream.is_bound("sess-1").await);

    send(
      &mut fx.client,
      Frame::StreamOpen {
        stream_id: "s1".into(),
        target: None,
      },
    )
    .await;
    send(
      &mut fx.client,
      Frame::StreamData {
        stream_id: "s1".into(),
        data: encode_data(b"ping"),
      },
    )
    .await;
    match recv(&mut fx.client).await {
      Frame::StreamData { stream_id, data } => {
        assert_eq!(stream_id, "s1");
        assert_eq!(decode_data(&data).unwrap(), b"ping");
      }
      other => panic!("Expected echoed stream_data, got {:?}", other),
    }

    send(
      &mut fx.client,
      Frame::StreamClose {
        stream_id: "s1".into(),
        reason: Some("done".into()),
      },
    )
    .await;
    fx.client.close().await.unwrap();
    fx.handler.await.unwrap();

    assert_eq!(fx.sessions.active_sessions(), 0);
    assert!(!fx.upstream.is_bound("sess-1").await);
  }

  #[tokio::test]
  async fn non_hello_first_frame_is_bad_hello() {
    let mut fx = start(4);
    send(&mut fx.client, Frame::Ping).await;
    expect_error(&mut fx.client, ErrorCode::BadHello).await;
    fx.handler.await.unwrap();
    assert_eq!(fx.sessions.active_sessions(), 0);
  }

  #[tokio::test]
  async fn empty_token_is_bad_hello() {
    let mut fx = start(4);
    send(
      &mut fx.client,
      Frame::Hello {
        session_token: "".into(),
        version: VERSION.into(),
        client: None,
      },
    )
    .await;
    expect_error(&mut fx.client, ErrorCode::BadHello).await;
    fx.handler.await.unwrap();
  }

  #[tokio::test]
  async fn version_mismatch_is_bad_version() {
    let mut fx = start(4);
    send(
      &mut fx.client,
      Frame::Hello {
        session_token: GOOD_TOKEN.into(),
        version: "0".into(),
        client: None,
      },
    )
    .await;
    expect_error(&mut fx.client, ErrorCode::BadVersion).await;
    fx.handler.await.unwrap();
  }

  #[tokio::test]
  async fn rejected_token_is_auth_failed_and_binds_nothing() {
    let mut fx = start(4);
    send(
      &mut fx.client,
      Frame::Hello {
        session_token: "bad-token".into(),
        version: VERSION.into(),
        client: None,
      },
    )
    .await;
    expect_error(&mut fx.client, ErrorCode::AuthFailed).await;
    fx.handler.await.unwrap();
    assert_eq!(fx.sessions.active_sessions(), 0);
    assert!(!fx.upstream.is_bound("sess-1").await);
  }

  #[tokio::test]
  async fn duplicate_session_id_is_session_error() {
    let sessions = Arc::new(SessionManager::new(16));
    // Occupy the id the validator will hand out
    sessions.create_session("sess-1", "other", 0).unwrap();
    let upstream = Arc::new(FakeUpstream::new(true));
    let handler = ProtocolHandler::new(
      sessions.clone(),
      upstream,
      Arc::new(StaticValidator { max_streams: 4 }),
      VERSION.into(),
    );
    let (mut client, server) = duplex();
    let handler = tokio::spawn(async move { handler.run(server).await });

    send(
      &mut client,
      Frame::Hello {
        session_token: GOOD_TOKEN.into(),
        version: VERSION.into(),
        client: None,
      },
    )
    .await;
    expect_error(&mut client, ErrorCode::SessionError).await;
    handler.await.unwrap();
    // The pre-existing session is untouched
    assert_eq!(sessions.active_sessions(), 1);
  }

  struct BindFailingUpstream(FakeUpstream);

  impl Upstream for BindFailingUpstream {
    fn bind_session<'a>(
      &'a self,
      _session_id: &'a str,
      _binding: NodeBinding,
    ) -> BoxFuture<'a, Result<(), UpstreamError>> {
      futures::future::ready(Err(UpstreamError::Dial(std::io::Error::other("refused")))).boxed()
    }
    fn unbind_session<'a>(
      &'a self,
      session_id: &'a str,
    ) -> BoxFuture<'a, Result<(), UpstreamError>> {
      self.0.unbind_session(session_id)
    }
    fn open_stream<'a>(
      &'a self,
      session_id: &'a str,
      stream_id: &'a str,
    ) -> BoxFuture<'a, Result<(), UpstreamError>> {
      self.0.open_stream(session_id, stream_id)
    }
    fn write<'a>(
      &'a self,
      session_id: &'a str,
      stream_id: &'a str,
      data: &'a [u8],
    ) -> BoxFuture<'a, Result<Vec<u8>, UpstreamError>> {
      self.0.write(session_id, stream_id, data)
    }
    fn close_stream<'a>(
      &'a self,
      session_id: &'a str,
      stream_id: &'a str,
    ) -> BoxFuture<'a, Result<(), UpstreamError>> {
      self.0.close_stream(session_id, stream_id)
    }
  }

  #[tokio::test]
  async fn bind_failure_unregisters_the_session() {
    let sessions = Arc::new(SessionManager::new(16));
    let handler = ProtocolHandler::new(
      sessions.clone(),
      Arc::new(BindFailingUpstream(FakeUpstream::new(true))),
      Arc::new(StaticValidator { max_streams: 4 }),
      VERSION.into(),
    );
    let (mut client, server) = duplex();
    let handler = tokio::spawn(async move { handler.run(server).await });

    send(
      &mut client,
      Frame::Hello {
        session_token: GOOD_TOKEN.into(),
        version: VERSION.into(),
        client: None,
      },
    )
    .await;
    expect_error(&mut client, ErrorCode::SessionError).await;
    handler.await.unwrap();
    assert_eq!(sessions.active_sessions(), 0);
  }

  #[tokio::test]
  async fn relay_open_failure_rolls_the_registry_back() {
    // The fake relay rejects duplicate ids; the second open with a fresh
    // registry id exercises the rollback path
    let mut fx = start(4);
    handshake(&mut fx.client).await;
    send(
      &mut fx.client,
      Frame::StreamOpen {
        stream_id: "s1".into(),
        target: None,
      },
    )
    .await;
    // A ping/pong barrier guarantees the open has been processed
    send(&mut fx.client, Frame::Ping).await;
    assert_eq!(recv(&mut fx.client).await, Frame::Pong);
    // Desynchronize the two registries to force a relay-side failure
    fx.sessions.close_stream("sess-1", "s1");
    send(
      &mut fx.client,
      Frame::StreamOpen {
        stream_id: "s1".into(),
        target: None,
      },
    )
    .await;
    expect_error(&mut fx.client, ErrorCode::StreamError).await;
    assert!(!fx.sessions.has_stream("sess-1", "s1"));
    fx.client.close().await.unwrap();
    fx.handler.await.unwrap();
  }

  #[tokio::test]
  async fn empty_stream_id_is_bad_stream() {
    let mut fx = start(4);
    handshake(&mut fx.client).await;
    send(
      &mut fx.client,
      Frame::StreamOpen {
        stream_id: "".into(),
        target: None,
      },
    )
    .await;
    expect_error(&mut fx.client, ErrorCode::BadStream).await;
    // The connection survives a frame-scoped error
    send(&mut fx.client, Frame::Ping).await;
    assert_eq!(recv(&mut fx.client).await, Frame::Pong);
    assert_eq!(fx.sessions.active_streams(), 0);
    fx.client.close().await.unwrap();
    fx.handler.await.unwrap();
  }

  #[tokio::test]
  async fn duplicate_open_leaves_one_stream() {
    let mut fx = start(4);
    handshake(&mut fx.client).await;
    send(
      &mut fx.client,
      Frame::StreamOpen {
        stream_id: "s1".into(),
        target: None,
      },
    )
    .await;
    send(
      &mut fx.client,
      Frame::StreamOpen {
        stream_id: "s1".into(),
        target: None,
      },
    )
    .await;
    expect_error(&mut fx.client, ErrorCode::StreamError).await;
    // The original stream still carries data
    send(
      &mut fx.client,
      Frame::StreamData {
        stream_id: "s1".into(),
        data: encode_data(b"still here"),
      },
    )
    .await;
    match recv(&mut fx.client).await {
      Frame::StreamData { data, .. } => assert_eq!(decode_data(&data).unwrap(), b"still here"),
      other => panic!("Expected echoed stream_data, got {:?}", other),
    }
    assert_eq!(fx.sessions.active_streams(), 1);
    fx.client.close().await.unwrap();
    fx.handler.await.unwrap();
  }

  #[tokio::test]
  async fn stream_limit_is_stream_error() {
    let mut fx = start(1);
    handshake(&mut fx.client).await;
    send(
      &mut fx.client,
      Frame::StreamOpen {
        stream_id: "s1".into(),
        target: None,
      },
    )
    .await;
    send(
      &mut fx.client,
      Frame::StreamOpen {
        stream_id: "s2".into(),
        target: None,
      },
    )
    .await;
    expect_error(&mut fx.client, ErrorCode::StreamError).await;
    assert_eq!(fx.sessions.active_streams(), 1);
    fx.client.close().await.unwrap();
    fx.handler.await.unwrap();
  }

  #[tokio::test]
  async fn data_on_unknown_stream_is_bad_stream() {
    let mut fx = start(4);
    handshake(&mut fx.client).await;
    send(
      &mut fx.client,
      Frame::StreamData {
        stream_id: "never-opened".into(),
        data: encode_data(b"x"),
      },
    )
    .await;
    expect_error(&mut fx.client, ErrorCode::BadStream).await;
    fx.client.close().await.unwrap();
    fx.handler.await.unwrap();
  }

  #[tokio::test]
  async fn undecodable_data_is_bad_stream() {
    let mut fx = start(4);
    handshake(&mut fx.client).await;
    send(
      &mut fx.client,
      Frame::StreamOpen {
        stream_id: "s1".into(),
        target: None,
      },
    )
    .await;
    send(
      &mut fx.client,
      Frame::StreamData {
        stream_id: "s1".into(),
        data: "not base64 !!!".into(),
      },
    )
    .await;
    expect_error(&mut fx.client, ErrorCode::BadStream).await;
    fx.client.close().await.unwrap();
    fx.handler.await.unwrap();
  }

  #[tokio::test]
  async fn stream_close_is_idempotent_and_silent() {
    let mut fx = start(4);
    handshake(&mut fx.client).await;
    send(
      &mut fx.client,
      Frame::StreamClose {
        stream_id: "never-opened".into(),
        reason: None,
      },
    )
    .await;
    // No error frame follows; the next exchange proceeds normally
    send(&mut fx.client, Frame::Ping).await;
    assert_eq!(recv(&mut fx.client).await, Frame::Pong);
    fx.client.close().await.unwrap();
    fx.handler.await.unwrap();
  }

  #[tokio::test]
  async fn unparsed_messages_are_classified() {
    assert_eq!(classify_unparsed(b"not json"), ErrorCode::BadFrame);
    assert_eq!(
      classify_unparsed(br#"{"type":"stream_data"}"#),
      ErrorCode::BadStream
    );
    assert_eq!(
      classify_unparsed(br#"{"type":"hello"}"#),
      ErrorCode::BadFrame
    );
    assert_eq!(
      classify_unparsed(br#"{"type":"teleport"}"#),
      ErrorCode::Unsupported
    );
    assert_eq!(classify_unparsed(br#"{"no_type":1}"#), ErrorCode::BadFrame);
  }

  #[tokio::test]
  async fn unknown_discriminant_is_unsupported() {
    let mut fx = start(4);
    handshake(&mut fx.client).await;
    fx.client
      .send(br#"{"type":"teleport","where":"away"}"#.to_vec())
      .await
      .unwrap();
    expect_error(&mut fx.client, ErrorCode::Unsupported).await;
    fx.client.close().await.unwrap();
    fx.handler.await.unwrap();
  }

  #[tokio::test]
  async fn garbage_in_session_is_bad_frame() {
    let mut fx = start(4);
    handshake(&mut fx.client).await;
    fx.client.send(b"}{ not json".to_vec()).await.unwrap();
    expect_error(&mut fx.client, ErrorCode::BadFrame).await;
    fx.client.close().await.unwrap();
    fx.handler.await.unwrap();
  }

  #[tokio::test]
  async fn abrupt_disconnect_tears_everything_down() {
    let mut fx = start(4);
    handshake(&mut fx.client).await;
    send(
      &mut fx.client,
      Frame::StreamOpen {
        stream_id: "s1".into(),
        target: None,
      },
    )
    .await;
    send(
      &mut fx.client,
      Frame::StreamOpen {
        stream_id: "s2".into(),
        target: None,
      },
    )
    .await;
    // Client vanishes without closing its streams
    drop(fx.client);
    fx.handler.await.unwrap();

    assert_eq!(fx.sessions.active_sessions(), 0);
    assert_eq!(fx.sessions.active_streams(), 0);
    assert!(!fx.upstream.is_bound("sess-1").await);
    assert_eq!(fx.upstream.open_streams("sess-1").await, 0);
  }
}
