// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Gateway binary: configuration, logging, metrics export and the
//! websocket accept loop wiring the library components together.

mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fred::prelude::*;
use metrics_exporter_prometheus::PrometheusBuilder;

use muxgate::common::protocol::transport::WebSocketTransport;
use muxgate::common::protocol::ProtocolHandler;
use muxgate::common::sessions::SessionManager;
use muxgate::common::upstream::store::{MemoryStore, RedisStore, SessionStore};
use muxgate::common::upstream::{FakeUpstream, OutlineUpstream, Upstream};
use muxgate::common::validation::{HttpSessionValidator, SessionValidator};

use crate::config::{Config, LogFormat, StoreMode, UpstreamMode};

fn init_logging(config: &Config) -> anyhow::Result<()> {
  let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
    .context("Log level must be a valid tracing filter")?;
  match config.log_format {
    LogFormat::Json => tracing_subscriber::fmt()
      .with_env_filter(filter)
      .json()
      .init(),
    LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
  }
  Ok(())
}

async fn build_store(config: &Config) -> anyhow::Result<Box<dyn SessionStore>> {
  Ok(match config.store {
    StoreMode::Memory => Box::new(MemoryStore::new()),
    StoreMode::Redis => {
      let redis_config =
        RedisConfig::from_url(&config.redis_url).context("Redis URL must parse")?;
      let client = RedisClient::new(redis_config, None, None);
      client.connect();
      client
        .wait_for_connect()
        .await
        .context("Redis must be reachable at startup")?;
      tracing::info!(url = %config.redis_url, "Session store connected");
      Box::new(RedisStore::new(client, config.store_ttl()))
    }
  })
}

async fn build_upstream(config: &Config) -> anyhow::Result<Arc<dyn Upstream>> {
  Ok(match config.upstream {
    UpstreamMode::Fake => Arc::new(FakeUpstream::new(true)),
    UpstreamMode::Outline => {
      let store = build_store(config).await?;
      Arc::new(OutlineUpstream::with_store(store, Some(config.io_timeout())))
    }
  })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = Config::parse();
  init_logging(&config)?;

  if !config.disable_metrics {
    PrometheusBuilder::new()
      .with_http_listener(config.metrics_addr)
      .install()
      .context("Prometheus exporter failed to start")?;
    tracing::info!(addr = %config.metrics_addr, "Metrics exporter listening");
  }

  let validator: Arc<dyn SessionValidator> = Arc::new(HttpSessionValidator::new(
    &config.backend_url,
    config.internal_secret.clone(),
    config.backend_timeout(),
  )?);
  let upstream = build_upstream(&config).await?;
  let sessions = Arc::new(SessionManager::new(config.max_streams));
  let handler = Arc::new(ProtocolHandler::new(
    sessions.clone(),
    upstream,
    validator,
    config.protocol_version.clone(),
  ));

  let listener = tokio::net::TcpListener::bind(config.listen)
    .await
    .with_context(|| format!("Failed to bind {}", config.listen))?;
  tracing::info!(listen = %config.listen, upstream = ?config.upstream, "Gateway listening");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        tracing::info!(
          active_sessions = sessions.active_sessions(),
          "Shutdown requested"
        );
        break;
      }
      accepted = listener.accept() => {
        let (stream, peer) = accepted.context("Listener accept failure")?;
        let handler = handler.clone();
        tokio::spawn(async move {
          match tokio_tungstenite::accept_async(stream).await {
            Ok(websocket) => handler.run(WebSocketTransport::new(websocket)).await,
            Err(error) => tracing::debug!(%error, %peer, "Websocket handshake failed"),
          }
        });
      }
    }
  }
  Ok(())
}
