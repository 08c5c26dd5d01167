//! `tracing` initialization for the agent. No OpenTelemetry exporter:
//! `yeetd` is a single host agent with no metrics/tracing backend in scope
//! (see DESIGN.md for the drop note). Structured, leveled logging via
//! `tracing` is still mandatory.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Error,
  Warn,
  Info,
  Debug,
  Trace,
}

impl From<LogLevel> for tracing::Level {
  fn from(value: LogLevel) -> Self {
    match value {
      LogLevel::Error => tracing::Level::ERROR,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Trace => tracing::Level::TRACE,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioLogMode {
  Standard,
  Json,
  None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
  pub level: LogLevel,
  pub stdio: StdioLogMode,
  pub pretty: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    LogConfig { level: LogLevel::Info, stdio: StdioLogMode::Standard, pretty: false }
  }
}

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let level_filter = LevelFilter::from(tracing::Level::from(config.level));
  let registry = Registry::default().with(level_filter);

  match (config.stdio, config.pretty) {
    (StdioLogMode::None, _) => Ok(()),
    (StdioLogMode::Json, _) => {
      registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    }
    (StdioLogMode::Standard, true) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .pretty()
          .with_file(false)
          .with_line_number(false),
      )
      .try_init(),
    (StdioLogMode::Standard, false) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_file(false)
          .with_line_number(false),
      )
      .try_init(),
  }
  .context("failed to init logger")
}
