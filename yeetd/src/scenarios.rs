//! End-to-end scenario tests that drive more than one module together:
//! a payload landing through `Dispatcher::install_payload`, a manifest PUT
//! committing a service, and a port-forward rule pair. Unlike the
//! colocated unit tests in each module, these stand in for the walkthroughs
//! named for the RPC Server / Internal Registry / Network Manager
//! surfaces, without actually shelling out to `docker`/`systemctl` (no
//! container runtime or systemd is assumed to be present wherever this
//! suite runs).

#[cfg(test)]
mod tests {
  use std::sync::{Arc, Mutex};
  use std::collections::BTreeMap;

  use async_trait::async_trait;
  use yeet_entities::{ArtifactKind, ArtifactRef, Log, ProtoPort, Service, ServiceKind};

  use crate::{
    artifact::Layout,
    detect,
    network::chains,
    registry::{
      blobstore::BlobStore,
      manifest::{put_manifest, ComposeInstaller},
    },
    rpc::dispatch::{Dispatcher, SupervisorFactory},
    store::Store,
    supervisor::{LogOptions, Status, Supervisor},
  };

  fn elf_binary(machine_le: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 64];
    buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    buf[5] = 1; // EI_DATA = LE
    buf[18..20].copy_from_slice(&machine_le.to_le_bytes());
    buf
  }

  fn machine_code_for(arch: detect::Arch) -> u16 {
    match arch {
      detect::Arch::X86_64 => 0x3e,
      detect::Arch::Arm64 => 0xb7,
      detect::Arch::Arm => 0x28,
      detect::Arch::I386 => 0x03,
      detect::Arch::Unknown => 0x3e,
    }
  }

  /// A `Supervisor` double that records every call it receives instead of
  /// shelling out to a real container runtime or systemd.
  struct RecordingSupervisor {
    install_calls: Arc<Mutex<Vec<bool>>>,
    up_calls: Arc<Mutex<Vec<bool>>>,
  }

  #[async_trait]
  impl Supervisor for RecordingSupervisor {
    async fn install(&self, pull: bool) -> anyhow::Result<Log> {
      self.install_calls.lock().unwrap().push(pull);
      Ok(Log::simple("install", "ok"))
    }
    async fn up(&self, pull: bool) -> anyhow::Result<Log> {
      self.up_calls.lock().unwrap().push(pull);
      Ok(Log::simple("up", "ok"))
    }
    async fn pull(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("pull", "ok"))
    }
    async fn update(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("update", "ok"))
    }
    async fn remove(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("remove", "ok"))
    }
    async fn down(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("down", "ok"))
    }
    async fn start(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("start", "ok"))
    }
    async fn stop(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("stop", "ok"))
    }
    async fn restart(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("restart", "ok"))
    }
    async fn status(&self) -> anyhow::Result<BTreeMap<String, Status>> {
      Ok(BTreeMap::from([("svc".to_string(), Status::Running)]))
    }
    async fn logs(&self, _opts: LogOptions) -> anyhow::Result<Vec<Log>> {
      Ok(Vec::new())
    }
  }

  /// Records the `schedule` argument passed to every `build` call, so a
  /// cron install can be checked for round-tripping through the store.
  struct RecordingFactory {
    install_calls: Arc<Mutex<Vec<bool>>>,
    up_calls: Arc<Mutex<Vec<bool>>>,
    schedules_seen: Arc<Mutex<Vec<Option<String>>>>,
  }

  impl SupervisorFactory for RecordingFactory {
    fn build(&self, _service: &str, _kind: ServiceKind, schedule: Option<&str>) -> Box<dyn Supervisor> {
      self.schedules_seen.lock().unwrap().push(schedule.map(str::to_string));
      Box::new(RecordingSupervisor {
        install_calls: self.install_calls.clone(),
        up_calls: self.up_calls.clone(),
      })
    }
  }

  async fn fixture(
    kind: ServiceKind,
  ) -> (tempfile::TempDir, Arc<Store>, Dispatcher, Arc<Mutex<Vec<bool>>>, Arc<Mutex<Vec<bool>>>, Arc<Mutex<Vec<Option<String>>>>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new(dir.path().join("db.json")));
    store
      .mutate(|data| {
        data.services.insert("svc".to_string(), Service::new("svc", kind));
        Ok(())
      })
      .await
      .unwrap();
    let layout = Arc::new(Layout::new(dir.path()));
    let install_calls = Arc::new(Mutex::new(Vec::new()));
    let up_calls = Arc::new(Mutex::new(Vec::new()));
    let schedules_seen = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(RecordingFactory {
      install_calls: install_calls.clone(),
      up_calls: up_calls.clone(),
      schedules_seen: schedules_seen.clone(),
    });
    let dispatcher = Dispatcher::new(store.clone(), layout, factory);
    (dir, store, dispatcher, install_calls, up_calls, schedules_seen)
  }

  /// A binary payload matching the host's own architecture is classified,
  /// promoted, and drives a systemd supervisor through install+up.
  #[tokio::test]
  async fn binary_deploy_installs_and_ups_matching_arch() {
    let (dir, store, dispatcher, install_calls, up_calls, _) = fixture(ServiceKind::Systemd).await;
    let staged = dir.path().join("upload");
    tokio::fs::write(&staged, elf_binary(machine_code_for(detect::host_arch()))).await.unwrap();

    let log = dispatcher
      .install_payload("svc", ServiceKind::Systemd, &staged, "app", false, false, None)
      .await
      .unwrap();
    assert!(log.success);
    assert_eq!(install_calls.lock().unwrap().as_slice(), &[false]);
    assert_eq!(up_calls.lock().unwrap().as_slice(), &[false]);

    let view = store.get().await.unwrap();
    let svc = &view.services["svc"];
    assert_eq!(svc.current_generation, 1);
    assert!(svc.artifacts.get(ArtifactKind::Binary, ArtifactRef::Latest).is_some());
  }

  /// The real wire format: a binary always arrives zstd-compressed. The
  /// staged payload here is the zstd frame, not the raw ELF, matching what
  /// the run-command client actually uploads.
  #[tokio::test]
  async fn zstd_compressed_binary_deploy_is_unwrapped_and_installed() {
    let (dir, store, dispatcher, install_calls, up_calls, _) = fixture(ServiceKind::Systemd).await;
    let staged = dir.path().join("upload");
    let elf = elf_binary(machine_code_for(detect::host_arch()));
    let compressed = zstd::stream::encode_all(elf.as_slice(), 0).unwrap();
    tokio::fs::write(&staged, &compressed).await.unwrap();

    let log = dispatcher
      .install_payload("svc", ServiceKind::Systemd, &staged, "app", false, false, None)
      .await
      .unwrap();
    assert!(log.success);
    assert_eq!(install_calls.lock().unwrap().as_slice(), &[false]);
    assert_eq!(up_calls.lock().unwrap().as_slice(), &[false]);

    let view = store.get().await.unwrap();
    let svc = &view.services["svc"];
    let promoted = svc.artifacts.get(ArtifactKind::Binary, ArtifactRef::Latest).unwrap();
    assert_eq!(tokio::fs::read(promoted).await.unwrap(), elf);
  }

  /// A compose payload referencing an externally-hosted image, installed
  /// with `--pull`, carries the pull flag through to both `install` and
  /// `up`.
  #[tokio::test]
  async fn compose_deploy_with_remote_image_passes_pull_flag() {
    let (dir, _store, dispatcher, install_calls, up_calls, _) = fixture(ServiceKind::Compose).await;
    let staged = dir.path().join("upload");
    tokio::fs::write(&staged, b"services:\n  web:\n    image: docker.io/library/nginx:1.27\n")
      .await
      .unwrap();

    dispatcher
      .install_payload("svc", ServiceKind::Compose, &staged, "compose.yml", true, false, None)
      .await
      .unwrap();

    assert_eq!(install_calls.lock().unwrap().as_slice(), &[true]);
    assert_eq!(up_calls.lock().unwrap().as_slice(), &[true]);
  }

  /// `cron` persists a schedule on the service record, and the very next
  /// supervisor lookup for that service sees it via `SupervisorFactory::build`.
  #[tokio::test]
  async fn cron_install_persists_schedule_for_next_lookup() {
    let (dir, _store, dispatcher, _, _, schedules_seen) = fixture(ServiceKind::Systemd).await;
    let staged = dir.path().join("upload");
    tokio::fs::write(&staged, elf_binary(machine_code_for(detect::host_arch()))).await.unwrap();

    dispatcher
      .install_payload("svc", ServiceKind::Systemd, &staged, "job", false, false, Some("*/5 * * * *"))
      .await
      .unwrap();

    dispatcher.dispatch("svc", &["status".to_string()]).await.unwrap();

    let seen = schedules_seen.lock().unwrap();
    assert_eq!(seen.last().unwrap().as_deref(), Some("*/5 * * * *"));
  }

  /// Putting a manifest under the `run` tag records both the `run` and
  /// `staged` refs and drives the installer with `stage_only = false`; the
  /// installer mirrors what `main.rs`'s real bridge does by registering the
  /// service in the store.
  #[tokio::test]
  async fn registry_put_commits_service() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db.json"));
    let blobstore = BlobStore::new(dir.path().join("blobs"));

    struct CommittingInstaller {
      store: Arc<Store>,
    }
    #[async_trait]
    impl ComposeInstaller for CommittingInstaller {
      async fn stage_or_install(&self, service: &str, _compose_yaml: &str, stage_only: bool) -> anyhow::Result<()> {
        self
          .store
          .mutate_service(service, ServiceKind::Compose, |svc| {
            if !stage_only {
              svc.current_generation += 1;
            }
            Ok(())
          })
          .await
      }
    }

    let store = Arc::new(store);
    let installer: Arc<dyn ComposeInstaller> = Arc::new(CommittingInstaller { store: store.clone() });

    put_manifest(&store, &blobstore, &installer, "svc-a/app", "run", "application/vnd.oci.image.manifest.v1+json", b"{}")
      .await
      .unwrap();

    let view = store.get().await.unwrap();
    assert!(view.images["svc-a/app"].tags.contains_key("run"));
    assert!(view.images["svc-a/app"].tags.contains_key("staged"));
    let svc = view.services.get("svc-a").expect("installer should have committed the service");
    assert_eq!(svc.current_generation, 1);
  }

  /// A port-forward add followed by a remove issues matching DNAT rules —
  /// the redesign note's resolution that teardown mirrors install exactly.
  /// `run_yeet_command` never errors on a missing/unprivileged `iptables`;
  /// only the recorded command text is asserted.
  #[tokio::test]
  async fn port_forward_lifecycle_mirrors_add_and_remove() {
    let pp = ProtoPort::tcp(8080).unwrap();
    let add_logs = chains::add_dnat(pp, "172.30.0.9", 9000).await.unwrap();
    let remove_logs = chains::remove_dnat(pp, "172.30.0.9", 9000).await.unwrap();

    assert!(add_logs[0].command.contains("-A YEET_PREROUTING"));
    assert!(add_logs[0].command.contains("--dport 8080"));
    assert!(add_logs[0].command.contains("172.30.0.9:9000"));

    assert!(remove_logs[0].command.contains("-D YEET_PREROUTING"));
    assert!(remove_logs[0].command.contains("--dport 8080"));
    assert!(remove_logs[0].command.contains("172.30.0.9:9000"));
  }

  /// A binary built for an architecture other than the host's is rejected
  /// as a validation error before anything is promoted or a supervisor is
  /// touched.
  #[tokio::test]
  async fn cross_architecture_binary_is_rejected() {
    let mismatched = match detect::host_arch() {
      detect::Arch::Arm64 => detect::Arch::X86_64,
      _ => detect::Arch::Arm64,
    };
    let (dir, _store, dispatcher, install_calls, up_calls, _) = fixture(ServiceKind::Systemd).await;
    let staged = dir.path().join("upload");
    tokio::fs::write(&staged, elf_binary(machine_code_for(mismatched))).await.unwrap();

    let err = dispatcher
      .install_payload("svc", ServiceKind::Systemd, &staged, "app", false, false, None)
      .await
      .unwrap_err();
    assert!(matches!(err.kind, yeet_entities::ErrorKind::Validation));
    assert!(install_calls.lock().unwrap().is_empty());
    assert!(up_calls.lock().unwrap().is_empty());
  }
}
