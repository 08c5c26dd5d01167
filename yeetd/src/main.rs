//! `yeetd`: the host agent. Wires together the on-disk store, the service
//! supervisors, the network manager, the internal OCI registry, and the RPC
//! server into one running process.

mod artifact;
mod config;
mod detect;
mod network;
mod registry;
mod rpc;
#[cfg(test)]
mod scenarios;
mod store;
mod supervisor;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info, warn};
use yeet_entities::ServiceKind;

use artifact::Layout;
use config::AgentConfig;
use registry::manifest::ComposeInstaller;
use rpc::dispatch::{Dispatcher, SupervisorFactory};
use store::Store;
use supervisor::{compose::ComposeSupervisor, systemd::SystemdSupervisor, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
  let config = config::agent_config();
  logger::init(&config.logging).context("failed to initialize logging")?;

  let layout = Arc::new(Layout::new(&config.root_directory));
  let store = Arc::new(Store::new(config.db_path()));

  if let Err(e) = network::chains::ensure_base_chains().await {
    warn!(error = %e, "failed to ensure base netfilter chains, continuing without port-forwarding support");
  }

  let registry_installer: Arc<dyn ComposeInstaller> =
    Arc::new(RealComposeInstaller { layout: layout.clone() });
  let registry_state = Arc::new(registry::RegistryState {
    blobstore: registry::blobstore::BlobStore::new(config.root_directory.join("registry-blobs")),
    uploads: registry::uploads::UploadManager::new(config.root_directory.join("registry-uploads")),
    store: store.clone(),
    installer: registry_installer,
  });

  let supervisor_factory: Arc<dyn SupervisorFactory> =
    Arc::new(RealSupervisorFactory { layout: layout.clone() });
  let dispatcher = Arc::new(Dispatcher::new(store.clone(), layout.clone(), supervisor_factory));
  let rpc_server = Arc::new(rpc::RpcServer::new(dispatcher, layout.clone()));

  let plugin_state = network::PluginState::new();

  info!(
    rpc_port = config.port,
    registry_port = config.registry_port,
    root = %config.root_directory.display(),
    "yeetd starting"
  );

  let bind_ip: std::net::IpAddr = config.bind_ip.parse().context("invalid bind_ip")?;

  let rpc_fut = {
    let rpc_server = rpc_server.clone();
    let port = config.port;
    async move { rpc_server.serve(bind_ip, port).await }
  };
  let registry_fut = registry::serve(&config.bind_ip, config.registry_port, registry_state);
  let plugin_fut = network::plugin::serve(std::path::Path::new(network::PLUGIN_SOCKET_PATH), plugin_state);

  tokio::select! {
    res = rpc_fut => {
      error!("rpc server exited");
      res
    }
    res = registry_fut => {
      error!("registry server exited");
      res
    }
    res = plugin_fut => {
      error!("network plugin server exited");
      res
    }
  }
}

/// Writes the synthesized compose file into the service's compose
/// directory and drives it through a `ComposeSupervisor`. `stage_only`
/// leaves the file written but does not start it, matching the `latest`
/// (stage) vs `run` (install+up) distinction in the PUT-manifest hook.
struct RealComposeInstaller {
  layout: Arc<Layout>,
}

#[async_trait]
impl ComposeInstaller for RealComposeInstaller {
  async fn stage_or_install(&self, service: &str, compose_yaml: &str, stage_only: bool) -> anyhow::Result<()> {
    self.layout.ensure_service_dirs(service).await?;
    let compose_dir = self.layout.compose_dir(service);
    let staged_path = compose_dir.join("compose.yml-staged");
    tokio::fs::write(&staged_path, compose_yaml)
      .await
      .with_context(|| format!("failed to write {}", staged_path.display()))?;
    if stage_only {
      return Ok(());
    }
    let latest_path = compose_dir.join("compose.yml-latest");
    tokio::fs::copy(&staged_path, &latest_path)
      .await
      .with_context(|| format!("failed to promote {} to {}", staged_path.display(), latest_path.display()))?;
    let sup = ComposeSupervisor::new(
      service,
      self.layout.service_dir(service),
      latest_path,
      self.layout.run_dir(service),
    );
    sup.install(true).await?;
    sup.up(true).await?;
    Ok(())
  }
}

/// Builds the concrete `Supervisor` for a service from pure path
/// convention (`Layout`'s per-kind generation naming), so it never needs an
/// async `Store` lookup of its own — the caller (`Dispatcher`) already
/// resolved `kind`/`schedule` from the store before calling in.
struct RealSupervisorFactory {
  layout: Arc<Layout>,
}

impl SupervisorFactory for RealSupervisorFactory {
  fn build(&self, service: &str, kind: ServiceKind, schedule: Option<&str>) -> Box<dyn Supervisor> {
    match kind {
      ServiceKind::Compose => {
        let compose_file = self.layout.compose_dir(service).join("compose.yml-latest");
        Box::new(ComposeSupervisor::new(
          service,
          self.layout.service_dir(service),
          compose_file,
          self.layout.run_dir(service),
        ))
      }
      ServiceKind::Systemd => {
        let exec_start = self.layout.bin_dir(service).join("bin-latest");
        let mut sup = SystemdSupervisor::new(
          service,
          self.layout.run_dir(service),
          self.layout.service_dir(service),
          exec_start.display().to_string(),
        );
        if let Some(expr) = schedule {
          sup = sup.with_schedule(expr.to_string());
        }
        Box::new(sup)
      }
    }
  }
}
