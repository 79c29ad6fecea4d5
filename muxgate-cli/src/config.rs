// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
pub enum UpstreamMode {
  /// In-process echo relay; no node is dialed
  Fake,
  /// Relay to real nodes over TCP
  Outline,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
pub enum StoreMode {
  Memory,
  Redis,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
  Plain,
  Json,
}

/// Gateway configuration; every flag can also come from the environment.
#[derive(Debug, Parser)]
#[command(name = "muxgate", about = "Multiplexing tunnel gateway")]
pub struct Config {
  /// Address the websocket listener binds
  #[arg(long, env = "MUXGATE_LISTEN", default_value = "0.0.0.0:8080")]
  pub listen: SocketAddr,

  /// Base URL of the control plane validating session tokens
  #[arg(long, env = "MUXGATE_BACKEND_URL", default_value = "http://127.0.0.1:9000")]
  pub backend_url: String,

  /// Shared secret sent to the control plane on every validation call
  #[arg(long, env = "MUXGATE_INTERNAL_SECRET")]
  pub internal_secret: Option<String>,

  /// Validation request timeout, in seconds
  #[arg(long, env = "MUXGATE_BACKEND_TIMEOUT_SECS", default_value_t = 5)]
  pub backend_timeout_secs: u64,

  #[arg(long, env = "MUXGATE_UPSTREAM", value_enum, default_value_t = UpstreamMode::Outline)]
  pub upstream: UpstreamMode,

  #[arg(long, env = "MUXGATE_STORE", value_enum, default_value_t = StoreMode::Memory)]
  pub store: StoreMode,

  #[arg(long, env = "MUXGATE_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
  pub redis_url: String,

  /// Lifetime of persisted session bindings, in seconds
  #[arg(long, env = "MUXGATE_STORE_TTL_SECS", default_value_t = 86_400)]
  pub store_ttl_secs: u64,

  /// Upstream write/read deadline, in seconds
  #[arg(long, env = "MUXGATE_IO_TIMEOUT_SECS", default_value_t = 10)]
  pub io_timeout_secs: u64,

  /// Open-stream cap for sessions whose validation carries no cap
  #[arg(long, env = "MUXGATE_MAX_STREAMS", default_value_t = 16)]
  pub max_streams: usize,

  #[arg(long, env = "MUXGATE_LOG_LEVEL", default_value = "info")]
  pub log_level: String,

  #[arg(long, env = "MUXGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Plain)]
  pub log_format: LogFormat,

  /// Disable the prometheus exporter
  #[arg(long, env = "MUXGATE_DISABLE_METRICS")]
  pub disable_metrics: bool,

  #[arg(long, env = "MUXGATE_METRICS_ADDR", default_value = "0.0.0.0:9091")]
  pub metrics_addr: SocketAddr,

  /// Protocol version accepted in hello frames
  #[arg(long, env = "MUXGATE_PROTOCOL_VERSION", default_value = "1")]
  pub protocol_version: String,
}

impl Config {
  pub fn backend_timeout(&self) -> Duration {
    Duration::from_secs(self.backend_timeout_secs)
  }

  pub fn store_ttl(&self) -> Duration {
    Duration::from_secs(self.store_ttl_secs)
  }

  pub fn io_timeout(&self) -> Duration {
    Duration::from_secs(self.io_timeout_secs)
  }
}
