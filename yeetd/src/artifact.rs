//! Per-host directory discipline for service artifacts. The Store records
//! the absolute path of every artifact reference and is the source of
//! truth; everything in this module is pure convention for *where* a
//! newly-written artifact should land, plus the promotion dance
//! (staged -> gen-N -> latest).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::instrument;
use yeet_entities::{ArtifactKind, ArtifactRef};

#[derive(Debug, Clone)]
pub struct Layout {
  root: PathBuf,
}

impl Layout {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Layout { root: root.into() }
  }

  pub fn db_path(&self) -> PathBuf {
    self.root.join("db.json")
  }

  pub fn service_dir(&self, service: &str) -> PathBuf {
    self.root.join("services").join(service)
  }

  pub fn bin_dir(&self, service: &str) -> PathBuf {
    self.service_dir(service).join("bin")
  }

  pub fn compose_dir(&self, service: &str) -> PathBuf {
    self.service_dir(service).join("compose")
  }

  pub fn env_dir(&self, service: &str) -> PathBuf {
    self.service_dir(service).join("env")
  }

  pub fn run_dir(&self, service: &str) -> PathBuf {
    self.service_dir(service).join("run")
  }

  pub fn data_dir(&self, service: &str) -> PathBuf {
    self.service_dir(service).join("data")
  }

  pub fn mounts_dir(&self) -> PathBuf {
    self.root.join("mounts")
  }

  pub fn mount_dir(&self, volume: &str) -> PathBuf {
    self.mounts_dir().join(volume)
  }

  /// Creates the full per-service skeleton, idempotent.
  #[instrument(skip(self))]
  pub async fn ensure_service_dirs(&self, service: &str) -> Result<()> {
    for dir in [
      self.bin_dir(service),
      self.compose_dir(service),
      self.env_dir(service),
      self.run_dir(service),
      self.data_dir(service),
    ] {
      fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
  }

  /// The path a newly-uploaded artifact of `kind` for generation `gen`
  /// should be written to, named by its logical kind and generation
  /// number.
  pub fn artifact_path(&self, service: &str, kind: ArtifactKind, gen: u64) -> PathBuf {
    let subdir = self.service_dir(service).join(kind.subdir());
    let file_name = format!("{}-{gen}", kind_file_stem(kind));
    subdir.join(file_name)
  }

  /// "Promotion" is a copy into the `staged`/`gen-N`/`latest` named
  /// location within the service directory. Implemented as copy+rename
  /// rather than a symlink so the layout survives filesystems/containers
  /// without symlink support; see DESIGN.md.
  #[instrument(skip(self))]
  pub async fn promote(
    &self,
    service: &str,
    kind: ArtifactKind,
    from: &Path,
    to: ArtifactRef,
  ) -> Result<PathBuf> {
    let subdir = self.service_dir(service).join(kind.subdir());
    fs::create_dir_all(&subdir)
      .await
      .with_context(|| format!("failed to create {}", subdir.display()))?;
    let dest = subdir.join(format!("{}-{to}", kind_file_stem(kind)));
    let tmp = subdir.join(format!(".{}-{to}.tmp", kind_file_stem(kind)));
    fs::copy(from, &tmp)
      .await
      .with_context(|| format!("failed to copy {} to {}", from.display(), tmp.display()))?;
    fs::rename(&tmp, &dest)
      .await
      .with_context(|| format!("failed to rename {} into {}", tmp.display(), dest.display()))?;
    Ok(dest)
  }
}

fn kind_file_stem(kind: ArtifactKind) -> &'static str {
  use ArtifactKind::*;
  match kind {
    Binary => "bin",
    Env => "env",
    ComposeYml => "compose.yml",
    ComposeNetwork => "compose.network.yml",
    MainTs => "main.ts",
    MainPy => "main.py",
    SystemdService => "systemd.service",
    SystemdTimer => "systemd.timer",
    NetnsService => "netns.service",
    NetnsEnv => "netns.env",
    TailscaleService => "tailscale.service",
    TailscaleEnv => "tailscale.env",
    Tailscaled => "tailscaled",
    TailscaledJson => "tailscaled.json",
    ResolvConf => "resolv.conf",
  }
}
