use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use command::run_yeet_command;
use tokio::fs;
use tracing::instrument;
use yeet_entities::Log;

use super::{cron::cron_to_calendar, LogOptions, Status, Supervisor};

pub struct SystemdSupervisor {
  unit_name: String,
  run_dir: PathBuf,
  exec_start: String,
  exec_stop: Option<String>,
  /// `simple` for a long-running process, `oneshot` for a unit whose
  /// `ExecStart` hands off to another supervisor (e.g. a compose stack)
  /// and whose liveness is tracked via `RemainAfterExit` instead.
  unit_type: &'static str,
  working_directory: PathBuf,
  /// A 5-field cron expression, if this unit runs on a schedule rather than
  /// continuously.
  schedule: Option<String>,
}

impl SystemdSupervisor {
  pub fn new(
    unit_name: impl Into<String>,
    run_dir: impl Into<PathBuf>,
    working_directory: impl Into<PathBuf>,
    exec_start: impl Into<String>,
  ) -> Self {
    SystemdSupervisor {
      unit_name: unit_name.into(),
      run_dir: run_dir.into(),
      working_directory: working_directory.into(),
      exec_start: exec_start.into(),
      exec_stop: None,
      unit_type: "simple",
      schedule: None,
    }
  }

  pub fn with_schedule(mut self, cron_expr: impl Into<String>) -> Self {
    self.schedule = Some(cron_expr.into());
    self
  }

  /// Marks this unit as `oneshot`/`RemainAfterExit` and gives it an
  /// `ExecStop`, for units that front another supervisor (compose) rather
  /// than running a long-lived process of their own.
  pub fn with_exec_stop(mut self, exec_stop: impl Into<String>) -> Self {
    self.exec_stop = Some(exec_stop.into());
    self.unit_type = "oneshot";
    self
  }

  fn service_unit_path(&self) -> PathBuf {
    self.run_dir.join(format!("{}.service", self.unit_name))
  }

  fn timer_unit_path(&self) -> PathBuf {
    self.run_dir.join(format!("{}.timer", self.unit_name))
  }

  fn service_unit_contents(&self) -> String {
    let mut service = format!(
      "Type={ty}\nWorkingDirectory={wd}\nExecStart={exec}\n",
      ty = self.unit_type,
      wd = self.working_directory.display(),
      exec = self.exec_start,
    );
    if let Some(exec_stop) = &self.exec_stop {
      service.push_str(&format!("ExecStop={exec_stop}\n"));
      service.push_str("RemainAfterExit=yes\n");
    } else {
      service.push_str("Restart=on-failure\n");
    }
    format!(
      "[Unit]\nDescription=yeet service {name}\n\n[Service]\n{service}\n[Install]\nWantedBy=default.target\n",
      name = self.unit_name,
    )
  }

  fn timer_unit_contents(&self, calendar: &str) -> String {
    format!(
      "[Unit]\nDescription=timer for yeet service {name}\n\n[Timer]\nOnCalendar={calendar}\nPersistent=true\n\n[Install]\nWantedBy=timers.target\n",
      name = self.unit_name,
    )
  }

  async fn write_units(&self) -> Result<()> {
    fs::create_dir_all(&self.run_dir)
      .await
      .with_context(|| format!("failed to create {}", self.run_dir.display()))?;
    fs::write(self.service_unit_path(), self.service_unit_contents())
      .await
      .context("failed to write service unit file")?;
    if let Some(expr) = &self.schedule {
      let calendar = cron_to_calendar(expr)?;
      fs::write(self.timer_unit_path(), self.timer_unit_contents(&calendar))
        .await
        .context("failed to write timer unit file")?;
    }
    Ok(())
  }

  fn unit_names(&self) -> Vec<String> {
    let mut names = vec![format!("{}.service", self.unit_name)];
    if self.schedule.is_some() {
      names.push(format!("{}.timer", self.unit_name));
    }
    names
  }

  #[instrument(skip(self))]
  async fn systemctl(&self, stage: &str, verb: &str) -> Log {
    let units = self.unit_names().join(" ");
    let cmd = format!("systemctl --user {verb} {units}");
    run_yeet_command(stage, Path::new(&self.run_dir), cmd).await
  }
}

#[async_trait]
impl Supervisor for SystemdSupervisor {
  #[instrument(skip(self))]
  async fn install(&self, pull: bool) -> Result<Log> {
    let _ = pull; // systemd units have nothing to pre-pull; kept for surface symmetry.
    self.write_units().await?;
    let reload = self.systemctl("daemon-reload", "daemon-reload").await;
    if !reload.success {
      return Ok(reload);
    }
    let enable = self.systemctl("enable", "enable").await;
    Ok(enable)
  }

  #[instrument(skip(self))]
  async fn up(&self, pull: bool) -> Result<Log> {
    self.install(pull).await?;
    self.start().await
  }

  #[instrument(skip(self))]
  async fn pull(&self) -> Result<Log> {
    Ok(Log::simple("pull", "no-op: systemd units have no image to pull"))
  }

  #[instrument(skip(self))]
  async fn update(&self) -> Result<Log> {
    self.write_units().await?;
    let reload = self.systemctl("daemon-reload", "daemon-reload").await;
    if !reload.success {
      return Ok(reload);
    }
    self.restart().await
  }

  #[instrument(skip(self))]
  async fn remove(&self) -> Result<Log> {
    let _ = self.down().await;
    let disable = self.systemctl("disable", "disable").await;
    for path in [self.service_unit_path(), self.timer_unit_path()] {
      let _ = fs::remove_file(&path).await;
    }
    Ok(disable)
  }

  #[instrument(skip(self))]
  async fn down(&self) -> Result<Log> {
    Ok(self.systemctl("down", "stop").await)
  }

  #[instrument(skip(self))]
  async fn start(&self) -> Result<Log> {
    Ok(self.systemctl("start", "start").await)
  }

  #[instrument(skip(self))]
  async fn stop(&self) -> Result<Log> {
    Ok(self.systemctl("stop", "stop").await)
  }

  #[instrument(skip(self))]
  async fn restart(&self) -> Result<Log> {
    Ok(self.systemctl("restart", "restart").await)
  }

  #[instrument(skip(self))]
  async fn status(&self) -> Result<BTreeMap<String, Status>> {
    let mut statuses = BTreeMap::new();
    for name in self.unit_names() {
      let cmd = format!("systemctl --user is-active {name}");
      let log = run_yeet_command("status", Path::new(&self.run_dir), cmd).await;
      statuses.insert(name, Status::from_raw(log.stdout.trim()));
    }
    Ok(statuses)
  }

  #[instrument(skip(self))]
  async fn logs(&self, opts: LogOptions) -> Result<Vec<Log>> {
    let mut cmd = format!("journalctl --user -u {}.service --no-pager", self.unit_name);
    if opts.follow {
      cmd.push_str(" --follow");
    }
    if let Some(n) = opts.lines {
      cmd.push_str(&format!(" -n {n}"));
    }
    if let Some(since_ms) = opts.since {
      let dt = chrono::DateTime::from_timestamp_millis(since_ms).unwrap_or_default();
      cmd.push_str(&format!(" --since \"{}\"", dt.format("%Y-%m-%d %H:%M:%S")));
    }
    Ok(vec![run_yeet_command("logs", Path::new(&self.run_dir), cmd).await])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unit_names_include_timer_only_when_scheduled() {
    let sup = SystemdSupervisor::new("svc-a", "/run", "/data", "/bin/true");
    assert_eq!(sup.unit_names(), vec!["svc-a.service"]);

    let scheduled = SystemdSupervisor::new("svc-a", "/run", "/data", "/bin/true")
      .with_schedule("0 3 * * *");
    assert_eq!(scheduled.unit_names(), vec!["svc-a.service", "svc-a.timer"]);
  }

  #[tokio::test]
  async fn write_units_produces_calendar_timer() {
    let dir = tempfile::tempdir().unwrap();
    let sup = SystemdSupervisor::new("svc-a", dir.path(), "/data", "/bin/true")
      .with_schedule("*/5 * * * *");
    sup.write_units().await.unwrap();
    let timer = fs::read_to_string(sup.timer_unit_path()).await.unwrap();
    assert!(timer.contains("OnCalendar=*-*-* *:*/5"));
    let service = fs::read_to_string(sup.service_unit_path()).await.unwrap();
    assert!(service.contains("ExecStart=/bin/true"));
  }
}
