//! Service lifecycle supervision. Both the docker-compose and systemd
//! variants expose the same surface so the RPC dispatcher never has to
//! branch on `ServiceKind`.

pub mod compose;
pub mod cron;
pub mod systemd;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use yeet_entities::Log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  Running,
  Stopped,
  Unknown,
}

impl Status {
  /// Normalizes a raw docker/systemd state string into the three-way
  /// status. "Running" subsumes both "running" and "restarting".
  pub fn from_raw(raw: &str) -> Status {
    match raw {
      "running" | "restarting" | "active" | "deactivating" => Status::Running,
      "created" | "paused" | "dead" | "removing" | "exited" | "stopped"
      | "inactive" | "failed" => Status::Stopped,
      _ => Status::Unknown,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
  pub follow: bool,
  pub lines: Option<usize>,
  /// Supplemental filter: only log lines at or after this millisecond
  /// timestamp.
  pub since: Option<i64>,
}

#[async_trait]
pub trait Supervisor: Send + Sync {
  async fn install(&self, pull: bool) -> Result<Log>;
  async fn up(&self, pull: bool) -> Result<Log>;
  async fn pull(&self) -> Result<Log>;
  async fn update(&self) -> Result<Log>;
  async fn remove(&self) -> Result<Log>;
  async fn down(&self) -> Result<Log>;
  async fn start(&self) -> Result<Log>;
  async fn stop(&self) -> Result<Log>;
  async fn restart(&self) -> Result<Log>;
  async fn status(&self) -> Result<BTreeMap<String, Status>>;
  async fn logs(&self, opts: LogOptions) -> Result<Vec<Log>>;
}
