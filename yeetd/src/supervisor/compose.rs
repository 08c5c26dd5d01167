use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use command::run_yeet_command;
use tokio::fs;
use tracing::instrument;
use yeet_entities::Log;

use super::{systemd::SystemdSupervisor, LogOptions, Status, Supervisor};

/// The internal registry presents as this host; compose files that only
/// reference images under it never need a real pull.
pub const INTERNAL_REGISTRY_HOST: &str = "registry.yeet.internal";

pub struct ComposeSupervisor {
  service: String,
  project_dir: PathBuf,
  compose_file: PathBuf,
  run_dir: PathBuf,
  network_overlay: Option<PathBuf>,
  env_file_src: Option<PathBuf>,
  env_materialized: AtomicBool,
}

impl ComposeSupervisor {
  pub fn new(
    service: impl Into<String>,
    project_dir: impl Into<PathBuf>,
    compose_file: impl Into<PathBuf>,
    run_dir: impl Into<PathBuf>,
  ) -> Self {
    ComposeSupervisor {
      service: service.into(),
      project_dir: project_dir.into(),
      compose_file: compose_file.into(),
      run_dir: run_dir.into(),
      network_overlay: None,
      env_file_src: None,
      env_materialized: AtomicBool::new(false),
    }
  }

  pub fn with_network_overlay(mut self, path: impl Into<PathBuf>) -> Self {
    self.network_overlay = Some(path.into());
    self
  }

  pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
    self.env_file_src = Some(path.into());
    self
  }

  fn project_name(&self) -> String {
    format!("catch-{}", self.service)
  }

  fn unit_name(&self) -> String {
    format!("catch-{}", self.service)
  }

  /// The systemd unit that fronts this compose project: `ExecStart` drives
  /// `up`, `ExecStop` drives `down`, so `systemctl --user start/stop` map
  /// onto the compose lifecycle the way they do for a plain binary unit.
  fn controlling_unit(&self) -> SystemdSupervisor {
    SystemdSupervisor::new(
      self.unit_name(),
      self.run_dir.clone(),
      self.project_dir.clone(),
      format!("{} up -d --pull never", self.base_args()),
    )
    .with_exec_stop(format!("{} down", self.base_args()))
  }

  async fn ensure_env_materialized(&self) -> Result<()> {
    let Some(src) = &self.env_file_src else { return Ok(()) };
    if self.env_materialized.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    let dest = self.project_dir.join(".env");
    fs::copy(src, &dest)
      .await
      .with_context(|| format!("failed to materialize env file at {}", dest.display()))?;
    Ok(())
  }

  fn base_args(&self) -> String {
    let mut s = format!(
      "compose --project-name {} --project-directory {} --file {}",
      self.project_name(),
      self.project_dir.display(),
      self.compose_file.display(),
    );
    if let Some(overlay) = &self.network_overlay {
      s.push_str(&format!(" --file {}", overlay.display()));
    }
    s
  }

  #[instrument(skip(self))]
  async fn run(&self, stage: &str, args: &str) -> Log {
    let cmd = format!("{} {args}", self.base_args());
    run_yeet_command(stage, Path::new(&self.project_dir), cmd).await
  }

  /// True if every image reference in the compose file names only the
  /// internal registry host — in which case a network pull would never
  /// succeed (it doesn't answer DNS) and must be skipped.
  async fn references_only_internal_registry(&self) -> Result<bool> {
    let text = fs::read_to_string(&self.compose_file)
      .await
      .with_context(|| format!("failed to read {}", self.compose_file.display()))?;
    let doc: serde_yaml_ng::Value = serde_yaml_ng::from_str(&text)
      .with_context(|| format!("{} is not valid YAML", self.compose_file.display()))?;
    let Some(services) = doc.get("services").and_then(|v| v.as_mapping()) else {
      return Ok(false);
    };
    let mut saw_image = false;
    for (_, svc) in services {
      if let Some(image) = svc.get("image").and_then(|v| v.as_str()) {
        saw_image = true;
        if !image.starts_with(INTERNAL_REGISTRY_HOST) {
          return Ok(false);
        }
      }
    }
    Ok(saw_image)
  }
}

#[async_trait]
impl Supervisor for ComposeSupervisor {
  #[instrument(skip(self))]
  async fn install(&self, pull: bool) -> Result<Log> {
    self.ensure_env_materialized().await?;
    if pull {
      let _ = self.run("pre-pull", "pull").await;
    }
    let down = self.run("down", "down --remove-orphans").await;
    if !down.success {
      return Ok(down);
    }
    self.controlling_unit().install(pull).await
  }

  #[instrument(skip(self))]
  async fn up(&self, pull: bool) -> Result<Log> {
    self.ensure_env_materialized().await?;
    let internal_only = self.references_only_internal_registry().await.unwrap_or(false);
    let pull_flag = if !pull {
      "--pull never"
    } else if internal_only {
      "--pull never"
    } else {
      "--pull always"
    };
    Ok(self.run("up", &format!("up -d {pull_flag}")).await)
  }

  #[instrument(skip(self))]
  async fn pull(&self) -> Result<Log> {
    Ok(self.run("pull", "pull").await)
  }

  #[instrument(skip(self))]
  async fn update(&self) -> Result<Log> {
    let running = matches!(self.status().await?.values().next(), Some(Status::Running));
    let internal_only = self.references_only_internal_registry().await.unwrap_or(false);
    if running && !internal_only {
      let _ = self.run("pre-pull", "pull").await;
    }
    Ok(self.run("update", "up -d --pull always").await)
  }

  #[instrument(skip(self))]
  async fn remove(&self) -> Result<Log> {
    Ok(self.run("remove", "down --remove-orphans --volumes").await)
  }

  #[instrument(skip(self))]
  async fn down(&self) -> Result<Log> {
    Ok(self.run("down", "down").await)
  }

  #[instrument(skip(self))]
  async fn start(&self) -> Result<Log> {
    Ok(self.run("start", "start").await)
  }

  #[instrument(skip(self))]
  async fn stop(&self) -> Result<Log> {
    Ok(self.run("stop", "stop").await)
  }

  #[instrument(skip(self))]
  async fn restart(&self) -> Result<Log> {
    Ok(self.run("restart", "restart").await)
  }

  #[instrument(skip(self))]
  async fn status(&self) -> Result<BTreeMap<String, Status>> {
    let log = self.run("status", "ps --format json").await;
    if !log.success {
      return Ok(BTreeMap::new());
    }
    let mut statuses = BTreeMap::new();
    for line in log.stdout.lines().filter(|l| !l.trim().is_empty()) {
      let Ok(entry) = serde_json::from_str::<serde_json::Value>(line) else { continue };
      let (Some(name), Some(state)) = (
        entry.get("Service").and_then(|v| v.as_str()),
        entry.get("State").and_then(|v| v.as_str()),
      ) else {
        continue;
      };
      statuses.insert(name.to_string(), Status::from_raw(state));
    }
    Ok(statuses)
  }

  #[instrument(skip(self))]
  async fn logs(&self, opts: LogOptions) -> Result<Vec<Log>> {
    let mut args = "logs --no-color".to_string();
    if opts.follow {
      args.push_str(" --follow");
    }
    if let Some(n) = opts.lines {
      args.push_str(&format!(" --tail {n}"));
    }
    if let Some(since_ms) = opts.since {
      args.push_str(&format!(" --since {}", since_ms / 1000));
    }
    Ok(vec![self.run("logs", &args).await])
  }
}
