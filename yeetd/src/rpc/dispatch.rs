//! Maps an `ExecRequest`'s argv onto a supervisor operation, a payload
//! install, or a one-shot shell command. Streaming/PTY execution
//! (`rpc::exec::spawn`) is reserved for commands that need a live child
//! process (`run` without a payload, `docker pull`, `tailscale`, `ip`); the
//! rest complete synchronously and hand back a `Log`/`Log` list/status map
//! for the caller to turn into frames.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use command::run_yeet_command;
use yeet_entities::{ArtifactKind, ArtifactRef, Log, ServiceKind, YeetError};

use crate::{
  artifact::Layout,
  detect::{self, FileKind, HostOs},
  store::Store,
  supervisor::{LogOptions, Status, Supervisor},
};

/// Builds the concrete `Supervisor` for a service. Kept as a trait so
/// `dispatch.rs` never depends on `supervisor::compose`/`supervisor::systemd`
/// directly — `main.rs` is the only place that wires the concrete types
/// together, mirroring the `ComposeInstaller` split in the registry module.
pub trait SupervisorFactory: Send + Sync {
  fn build(&self, service: &str, kind: ServiceKind, schedule: Option<&str>) -> Box<dyn Supervisor>;
}

pub enum Outcome {
  Log(Log),
  Logs(Vec<Log>),
  Status(BTreeMap<String, Status>),
}

pub struct Dispatcher {
  store: Arc<Store>,
  layout: Arc<Layout>,
  factory: Arc<dyn SupervisorFactory>,
}

impl Dispatcher {
  pub fn new(store: Arc<Store>, layout: Arc<Layout>, factory: Arc<dyn SupervisorFactory>) -> Self {
    Dispatcher { store, layout, factory }
  }

  async fn supervisor_for(&self, service: &str) -> Result<Box<dyn Supervisor>, YeetError> {
    let view = self.store.get().await.map_err(|e| YeetError::infra(e.to_string()))?;
    let svc = view
      .services
      .get(service)
      .ok_or_else(|| YeetError::user(format!("unknown service {service}")))?;
    Ok(self.factory.build(service, svc.kind, svc.schedule.as_deref()))
  }

  /// Handles every command except `run`/`stage`/`cron`, which carry an
  /// uploaded payload and go through `install_payload` once the caller has
  /// drained the payload off the stdin frames.
  pub async fn dispatch(&self, service: &str, args: &[String]) -> Result<Outcome, YeetError> {
    let Some(command) = args.first().map(String::as_str) else {
      return Err(YeetError::user("missing command"));
    };
    match command {
      "status" => {
        let sup = self.supervisor_for(service).await?;
        let status = sup.status().await.map_err(|e| YeetError::transient(e.to_string()))?;
        Ok(Outcome::Status(status))
      }
      "logs" | "events" => {
        let sup = self.supervisor_for(service).await?;
        let opts = parse_log_options(&args[1..]);
        let logs = sup.logs(opts).await.map_err(|e| YeetError::transient(e.to_string()))?;
        Ok(Outcome::Logs(logs))
      }
      "mount" => self.shell_in_service_dir(service, "mount", &args[1..]).await,
      "umount" => self.shell_in_service_dir(service, "umount", &args[1..]).await,
      "docker" => self.docker_subcommand(service, &args[1..]).await,
      "tailscale" | "ip" => self.shell_in_service_dir(service, command, &args[1..]).await,
      "env" => {
        let view = self.store.get().await.map_err(|e| YeetError::infra(e.to_string()))?;
        let svc = view
          .services
          .get(service)
          .ok_or_else(|| YeetError::user(format!("unknown service {service}")))?;
        let path = svc
          .artifacts
          .get(ArtifactKind::Env, ArtifactRef::Latest)
          .cloned()
          .unwrap_or_else(|| self.layout.env_dir(service));
        Ok(Outcome::Log(Log::simple("env", path.display().to_string())))
      }
      "run" | "stage" | "cron" => Err(YeetError::user(format!(
        "{command} carries an uploaded payload; call install_payload instead"
      ))),
      other => Err(YeetError::user(format!("unknown command {other}"))),
    }
  }

  async fn docker_subcommand(&self, service: &str, args: &[String]) -> Result<Outcome, YeetError> {
    let Some(verb) = args.first() else {
      return Err(YeetError::user("docker subcommand missing (pull|update)"));
    };
    match verb.as_str() {
      "pull" => {
        let sup = self.supervisor_for(service).await?;
        let log = sup.pull().await.map_err(|e| YeetError::transient(e.to_string()))?;
        Ok(Outcome::Log(log))
      }
      "update" => {
        let sup = self.supervisor_for(service).await?;
        let log = sup.update().await.map_err(|e| YeetError::transient(e.to_string()))?;
        Ok(Outcome::Log(log))
      }
      other => Err(YeetError::user(format!("unknown docker subcommand {other}"))),
    }
  }

  async fn shell_in_service_dir(&self, service: &str, program: &str, args: &[String]) -> Result<Outcome, YeetError> {
    let cmd = format!("{program} {}", args.join(" "));
    let dir = self.layout.service_dir(service);
    let log = run_yeet_command(program, Path::new(&dir), cmd).await;
    Ok(Outcome::Log(log))
  }

  /// Classifies and promotes an uploaded payload, then drives the
  /// supervisor. `stage_only` leaves the new generation staged without
  /// starting it (the `stage` command); `cron_expr` persists a schedule for
  /// the `cron` command, consumed by the next `supervisor_for` lookup via
  /// `SupervisorFactory::build`.
  pub async fn install_payload(
    &self,
    service: &str,
    kind: ServiceKind,
    staged_file: &Path,
    payload_file_name: &str,
    pull: bool,
    stage_only: bool,
    cron_expr: Option<&str>,
  ) -> Result<Log, YeetError> {
    let raw = tokio::fs::read(staged_file).await.map_err(|e| YeetError::infra(e.to_string()))?;
    let (file_kind, content) = detect::classify_through_zstd(payload_file_name, &raw)
      .map_err(|e| YeetError::validation(e.to_string()))?;
    if matches!(file_kind, FileKind::Binary | FileKind::MachO) {
      detect::check_binary_arch(file_kind, &content, HostOs::Linux, detect::host_arch())
        .map_err(|e| YeetError::validation(e.to_string()))?;
    }
    let artifact_kind = artifact_kind_for(file_kind)
      .ok_or_else(|| YeetError::user(format!("unsupported payload type for {payload_file_name}")))?;
    if content != raw {
      tokio::fs::write(staged_file, &content).await.map_err(|e| YeetError::infra(e.to_string()))?;
    }

    self
      .layout
      .ensure_service_dirs(service)
      .await
      .map_err(|e| YeetError::infra(e.to_string()))?;

    let next_gen = self
      .store
      .mutate_service(service, kind, |svc| {
        svc.latest_generation += 1;
        if let Some(expr) = cron_expr {
          svc.schedule = Some(expr.to_string());
        }
        Ok(svc.latest_generation)
      })
      .await
      .map_err(|e| YeetError::infra(e.to_string()))?;

    let dest = self
      .layout
      .promote(service, artifact_kind, staged_file, ArtifactRef::Gen(next_gen))
      .await
      .map_err(|e| YeetError::infra(e.to_string()))?;

    self
      .store
      .mutate_service(service, kind, |svc| {
        svc.artifacts.set(artifact_kind, ArtifactRef::Gen(next_gen), dest.clone());
        svc.artifacts.set(artifact_kind, ArtifactRef::Latest, dest.clone());
        Ok(())
      })
      .await
      .map_err(|e| YeetError::infra(e.to_string()))?;

    if stage_only {
      return Ok(Log::simple("stage", format!("staged generation {next_gen} for {service}")));
    }

    let view = self.store.get().await.map_err(|e| YeetError::infra(e.to_string()))?;
    let schedule = view.services.get(service).and_then(|s| s.schedule.as_deref());
    let sup = self.factory.build(service, kind, schedule);
    sup.install(pull).await.map_err(|e| YeetError::transient(e.to_string()))?;
    let log = sup.up(pull).await.map_err(|e| YeetError::transient(e.to_string()))?;
    self
      .store
      .mutate_service(service, kind, |svc| {
        svc.current_generation = next_gen;
        Ok(())
      })
      .await
      .map_err(|e| YeetError::infra(e.to_string()))?;
    Ok(log)
  }
}

fn artifact_kind_for(kind: FileKind) -> Option<ArtifactKind> {
  match kind {
    FileKind::Binary | FileKind::MachO => Some(ArtifactKind::Binary),
    FileKind::DockerCompose => Some(ArtifactKind::ComposeYml),
    FileKind::TypeScript => Some(ArtifactKind::MainTs),
    FileKind::Python => Some(ArtifactKind::MainPy),
    FileKind::Zstd | FileKind::Script | FileKind::Tarball => None,
  }
}

fn parse_log_options(rest: &[String]) -> LogOptions {
  let mut opts = LogOptions::default();
  let mut i = 0;
  while i < rest.len() {
    match rest[i].as_str() {
      "--follow" | "-f" => opts.follow = true,
      "--lines" | "-n" => {
        if let Some(n) = rest.get(i + 1).and_then(|s| s.parse().ok()) {
          opts.lines = Some(n);
          i += 1;
        }
      }
      "--since" => {
        if let Some(ts) = rest.get(i + 1).and_then(|s| s.parse().ok()) {
          opts.since = Some(ts);
          i += 1;
        }
      }
      _ => {}
    }
    i += 1;
  }
  opts
}
