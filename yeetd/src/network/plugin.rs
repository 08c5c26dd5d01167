//! The docker network-driver plugin: HTTP over a UNIX socket at the
//! conventional plugins path, speaking the legacy plugin-v1 protocol
//! (`/Plugin.Activate`, `/NetworkDriver.*`). Capability scope is `local`.

use std::{collections::BTreeMap, convert::Infallible, net::Ipv4Addr, path::Path, sync::Arc};

use anyhow::{Context, Result};
use axum::{extract::State, routing::post, Json, Router};
use dashmap::DashMap;
use hyper_util::{
  rt::{TokioExecutor, TokioIo},
  server::conn::auto::Builder as ConnBuilder,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::UnixListener;
use tracing::{error, info, instrument, warn};
use yeet_entities::{DockerNetworkRecord, Log, PortMapEntry, ProtoPort};

use super::{chains, namespace::NamespaceSpec};

pub const PLUGIN_SOCKET_PATH: &str = "/run/docker/plugins/yeet.sock";

#[derive(Debug, Clone)]
pub struct EndpointRecord {
  pub network_id: String,
  pub address: Ipv4Addr,
}

/// In-memory plugin state: docker recreates networks/endpoints on every
/// daemon restart by reissuing `CreateNetwork`/`CreateEndpoint`, so this
/// state does not need to survive a `yeetd` restart on its own. Per-netns
/// operations are serialized by a semaphore keyed on network id, matching
/// the single-writer-per-namespace rule.
pub struct PluginState {
  networks: DashMap<String, DockerNetworkRecord>,
  endpoints: DashMap<String, EndpointRecord>,
  netns_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl PluginState {
  pub fn new() -> Arc<Self> {
    Arc::new(PluginState {
      networks: DashMap::new(),
      endpoints: DashMap::new(),
      netns_locks: DashMap::new(),
    })
  }

  fn netns_lock(&self, network_id: &str) -> Arc<tokio::sync::Mutex<()>> {
    self
      .netns_locks
      .entry(network_id.to_string())
      .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
      .clone()
  }
}

#[derive(Debug, Deserialize)]
struct CreateNetworkRequest {
  #[serde(rename = "NetworkID")]
  network_id: String,
  #[serde(rename = "Options", default)]
  options: Value,
}

#[derive(Debug, Deserialize)]
struct DeleteNetworkRequest {
  #[serde(rename = "NetworkID")]
  network_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateEndpointRequest {
  #[serde(rename = "NetworkID")]
  network_id: String,
  #[serde(rename = "EndpointID")]
  endpoint_id: String,
  #[serde(rename = "Interface")]
  interface: EndpointInterface,
  #[serde(rename = "Options", default)]
  options: Value,
}

#[derive(Debug, Deserialize)]
struct EndpointInterface {
  #[serde(rename = "Address")]
  address: String,
}

/// One entry of the `com.docker.network.portmap` option, docker's wire
/// format for the `PortBinding`s requested on `CreateEndpoint`. `Proto` is
/// an IANA protocol number (6 tcp, 17 udp), matching `ProtoPort`.
#[derive(Debug, Deserialize)]
struct RequestedPortBinding {
  #[serde(rename = "Proto")]
  proto: u8,
  #[serde(rename = "Port")]
  container_port: u16,
  #[serde(rename = "HostPort")]
  host_port: u16,
}

/// Parses the `com.docker.network.portmap` entry out of a `CreateEndpoint`
/// request's `Options`, if present. Malformed or absent entries yield no
/// bindings rather than an error — a network driver that can't understand
/// one exotic option shouldn't fail the whole endpoint creation.
fn parse_port_map(options: &Value, endpoint_id: &str) -> Vec<(ProtoPort, PortMapEntry)> {
  let Some(bindings) = options.get("com.docker.network.portmap").and_then(|v| v.as_array()) else {
    return Vec::new();
  };
  bindings
    .iter()
    .filter_map(|raw| serde_json::from_value::<RequestedPortBinding>(raw.clone()).ok())
    .filter_map(|b| {
      let pp = ProtoPort::new(b.proto, b.host_port).ok()?;
      Some((pp, PortMapEntry { endpoint_id: endpoint_id.to_string(), container_port: b.container_port }))
    })
    .collect()
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
  #[serde(rename = "NetworkID")]
  network_id: String,
  #[serde(rename = "EndpointID")]
  endpoint_id: String,
}

#[derive(Debug, Serialize)]
struct JoinResponse {
  #[serde(rename = "InterfaceName")]
  interface_name: InterfaceNameResponse,
  #[serde(rename = "Gateway")]
  gateway: String,
}

#[derive(Debug, Serialize)]
struct InterfaceNameResponse {
  #[serde(rename = "SrcName")]
  src_name: String,
  #[serde(rename = "DstPrefix")]
  dst_prefix: String,
}

async fn activate() -> Json<Value> {
  Json(json!({ "Implements": ["NetworkDriver"] }))
}

async fn get_capabilities() -> Json<Value> {
  Json(json!({ "Scope": "local" }))
}

#[instrument(skip(state))]
async fn create_network(
  State(state): State<Arc<PluginState>>,
  Json(req): Json<CreateNetworkRequest>,
) -> Json<Value> {
  let netns_path = req
    .options
    .get("com.docker.network.generic")
    .and_then(|v| v.get("yeet.netns_path"))
    .and_then(|v| v.as_str())
    .unwrap_or_default()
    .to_string();
  let range = req
    .options
    .get("com.docker.network.generic")
    .and_then(|v| v.get("yeet.range"))
    .and_then(|v| v.as_str())
    .unwrap_or("0.0.0.0/0")
    .to_string();
  let gateway = range
    .split('/')
    .next()
    .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
    .unwrap_or(Ipv4Addr::UNSPECIFIED);

  state.networks.insert(
    req.network_id.clone(),
    DockerNetworkRecord {
      id: req.network_id,
      netns_path,
      gateway,
      range,
      endpoints: BTreeMap::new(),
      port_map: BTreeMap::new(),
    },
  );
  Json(json!({}))
}

#[instrument(skip(state))]
async fn delete_network(
  State(state): State<Arc<PluginState>>,
  Json(req): Json<DeleteNetworkRequest>,
) -> Json<Value> {
  state.networks.remove(&req.network_id);
  state.netns_locks.remove(&req.network_id);
  Json(json!({}))
}

#[instrument(skip(state))]
async fn create_endpoint(
  State(state): State<Arc<PluginState>>,
  Json(req): Json<CreateEndpointRequest>,
) -> Json<Value> {
  let ip: Ipv4Addr = req
    .interface
    .address
    .split('/')
    .next()
    .unwrap_or_default()
    .parse()
    .unwrap_or(Ipv4Addr::UNSPECIFIED);

  let port_map = parse_port_map(&req.options, &req.endpoint_id);
  if let Some(mut network) = state.networks.get_mut(&req.network_id) {
    network.endpoints.insert(req.endpoint_id.clone(), ip);
    for (pp, entry) in port_map {
      network.port_map.insert(pp, entry);
    }
  }
  state.endpoints.insert(
    req.endpoint_id,
    EndpointRecord { network_id: req.network_id, address: ip },
  );
  Json(json!({ "Interface": {} }))
}

#[derive(Debug, Deserialize)]
struct DeleteEndpointRequest {
  #[serde(rename = "EndpointID")]
  endpoint_id: String,
}

#[instrument(skip(state))]
async fn delete_endpoint(
  State(state): State<Arc<PluginState>>,
  Json(req): Json<DeleteEndpointRequest>,
) -> Json<Value> {
  if let Some((_, rec)) = state.endpoints.remove(&req.endpoint_id) {
    if let Some(mut network) = state.networks.get_mut(&rec.network_id) {
      network.endpoints.remove(&req.endpoint_id);
      network.port_map.retain(|_, entry| entry.endpoint_id != req.endpoint_id);
    }
  }
  Json(json!({}))
}

/// Installs a DNAT rule for every port-map entry `CreateEndpoint` recorded
/// against `endpoint_id`, returning the logs from each `add_dnat` call (an
/// empty vec if the network is gone or has no matching entries).
async fn install_port_forwards(
  state: &PluginState,
  network_id: &str,
  endpoint_id: &str,
  address: Ipv4Addr,
) -> Vec<Log> {
  let Some(mut network) = state.networks.get_mut(network_id) else { return Vec::new() };
  let port_map: Vec<(ProtoPort, PortMapEntry)> = network
    .port_map
    .iter()
    .filter(|(_, e)| e.endpoint_id == endpoint_id)
    .map(|(pp, e)| (*pp, e.clone()))
    .collect();
  drop(network);

  let mut logs = Vec::new();
  for (pp, entry) in port_map {
    match chains::add_dnat(pp, &address.to_string(), entry.container_port).await {
      Ok(mut l) => logs.append(&mut l),
      Err(e) => warn!(error = %e, "failed to install DNAT rule during Join"),
    }
  }
  logs
}

#[instrument(skip(state))]
async fn join(State(state): State<Arc<PluginState>>, Json(req): Json<JoinRequest>) -> Json<Value> {
  let lock = state.netns_lock(&req.network_id);
  let _guard = lock.lock().await;

  let Some(network) = state.networks.get(&req.network_id).map(|e| e.clone()) else {
    return Json(json!({ "Err": format!("unknown network {}", req.network_id) }));
  };
  let Some(address) = state.endpoints.get(&req.endpoint_id).map(|e| e.address) else {
    return Json(json!({ "Err": format!("unknown endpoint {}", req.endpoint_id) }));
  };

  if let Err(e) = chains::ensure_base_chains().await {
    error!(error = %e, "failed to ensure base netfilter chains");
    return Json(json!({ "Err": e.to_string() }));
  }

  let veth_id = &req.endpoint_id[..8.min(req.endpoint_id.len())];
  let spec = NamespaceSpec {
    service: req.network_id.clone(),
    veth_id: veth_id.to_string(),
    gateway: network.gateway.to_string(),
    address_cidr: format!("{address}/24"),
    macvlan: None,
    use_dhcp: false,
    resolv_conf: None,
  };
  if let Err(e) = super::namespace::reconcile(&spec).await {
    warn!(error = %e, "namespace reconcile during Join reported an error");
  }

  install_port_forwards(&state, &req.network_id, &req.endpoint_id, address).await;

  Json(serde_json::to_value(JoinResponse {
    interface_name: InterfaceNameResponse { src_name: "veth0".into(), dst_prefix: "eth".into() },
    gateway: network.gateway.to_string(),
  }).unwrap())
}

#[instrument(skip(state))]
async fn leave(State(state): State<Arc<PluginState>>, Json(req): Json<JoinRequest>) -> Json<Value> {
  let lock = state.netns_lock(&req.network_id);
  let _guard = lock.lock().await;

  if let Some(network) = state.networks.get(&req.network_id).map(|e| e.clone()) {
    if let Some(address) = state.endpoints.get(&req.endpoint_id).map(|e| e.address) {
      let port_map: Vec<(ProtoPort, PortMapEntry)> = network
        .port_map
        .iter()
        .filter(|(_, e)| e.endpoint_id == req.endpoint_id)
        .map(|(pp, e)| (*pp, e.clone()))
        .collect();
      for (pp, entry) in port_map {
        let _ = chains::remove_dnat(pp, &address.to_string(), entry.container_port).await;
      }
    }
  }

  let veth_id = &req.endpoint_id[..8.min(req.endpoint_id.len())];
  let spec = NamespaceSpec {
    service: req.network_id.clone(),
    veth_id: veth_id.to_string(),
    gateway: String::new(),
    address_cidr: String::new(),
    macvlan: None,
    use_dhcp: false,
    resolv_conf: None,
  };
  let _ = super::namespace::teardown(&spec).await;

  Json(json!({}))
}

async fn endpoint_oper_info() -> Json<Value> {
  Json(json!({ "Value": {} }))
}

async fn program_external_connectivity() -> Json<Value> {
  Json(json!({}))
}

fn router(state: Arc<PluginState>) -> Router {
  Router::new()
    .route("/Plugin.Activate", post(activate))
    .route("/NetworkDriver.GetCapabilities", post(get_capabilities))
    .route("/NetworkDriver.CreateNetwork", post(create_network))
    .route("/NetworkDriver.DeleteNetwork", post(delete_network))
    .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
    .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
    .route("/NetworkDriver.Join", post(join))
    .route("/NetworkDriver.Leave", post(leave))
    .route("/NetworkDriver.EndpointOperInfo", post(endpoint_oper_info))
    .route("/NetworkDriver.ProgramExternalConnectivity", post(program_external_connectivity))
    .with_state(state)
}

/// Serves the plugin protocol over a UNIX socket, accepting connections
/// until the process exits. `hyper` 1.x has no built-in Unix-socket
/// listener helper, so the accept loop is driven by hand with `hyper-util`.
#[instrument(skip(state))]
pub async fn serve(socket_path: &Path, state: Arc<PluginState>) -> Result<()> {
  if socket_path.exists() {
    tokio::fs::remove_file(socket_path).await.ok();
  }
  if let Some(parent) = socket_path.parent() {
    tokio::fs::create_dir_all(parent).await.ok();
  }
  let listener = UnixListener::bind(socket_path)
    .with_context(|| format!("failed to bind plugin socket at {}", socket_path.display()))?;
  info!(path = %socket_path.display(), "docker network-driver plugin listening");

  let app = router(state);
  loop {
    let (stream, _addr) = listener.accept().await.context("failed to accept plugin connection")?;
    let app = app.clone();
    tokio::spawn(async move {
      let io = TokioIo::new(stream);
      let service = hyper::service::service_fn(move |req| {
        let app = app.clone();
        async move {
          let resp = tower::Service::call(&mut app.clone(), req).await;
          Ok::<_, Infallible>(resp.unwrap())
        }
      });
      if let Err(e) = ConnBuilder::new(TokioExecutor::new()).serve_connection(io, service).await {
        error!(error = %e, "plugin connection ended with an error");
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn activate_reports_network_driver() {
    let Json(body) = activate().await;
    assert_eq!(body["Implements"][0], "NetworkDriver");
  }

  #[tokio::test]
  async fn create_then_delete_network_round_trips() {
    let state = PluginState::new();
    let req = CreateNetworkRequest {
      network_id: "net-1".into(),
      options: json!({ "com.docker.network.generic": { "yeet.netns_path": "/proc/self/ns/net", "yeet.range": "172.30.0.0/24" } }),
    };
    create_network(State(state.clone()), Json(req)).await;
    assert!(state.networks.contains_key("net-1"));

    delete_network(State(state.clone()), Json(DeleteNetworkRequest { network_id: "net-1".into() })).await;
    assert!(!state.networks.contains_key("net-1"));
  }

  #[tokio::test]
  async fn create_endpoint_records_address() {
    let state = PluginState::new();
    create_network(
      State(state.clone()),
      Json(CreateNetworkRequest { network_id: "net-1".into(), options: json!({}) }),
    )
    .await;
    create_endpoint(
      State(state.clone()),
      Json(CreateEndpointRequest {
        network_id: "net-1".into(),
        endpoint_id: "ep-1".into(),
        interface: EndpointInterface { address: "172.30.0.5/24".into() },
        options: json!({}),
      }),
    )
    .await;
    assert_eq!(state.endpoints.get("ep-1").unwrap().address, Ipv4Addr::new(172, 30, 0, 5));
  }

  /// `CreateEndpoint`'s `com.docker.network.portmap` option lands in
  /// `network.port_map`, and a subsequent `Join` reads it and installs a
  /// matching DNAT rule — the real wire-format path, not a direct call into
  /// `chains::add_dnat`.
  #[tokio::test]
  async fn create_endpoint_portmap_drives_join_dnat_install() {
    let state = PluginState::new();
    create_network(
      State(state.clone()),
      Json(CreateNetworkRequest { network_id: "net-1".into(), options: json!({}) }),
    )
    .await;
    create_endpoint(
      State(state.clone()),
      Json(CreateEndpointRequest {
        network_id: "net-1".into(),
        endpoint_id: "ep-1".into(),
        interface: EndpointInterface { address: "172.30.0.5/24".into() },
        options: json!({
          "com.docker.network.portmap": [
            { "Proto": 6, "Port": 9000, "HostPort": 8080 }
          ]
        }),
      }),
    )
    .await;

    let network = state.networks.get("net-1").unwrap();
    let entry = network.port_map.get(&ProtoPort::tcp(8080).unwrap()).unwrap();
    assert_eq!(entry.endpoint_id, "ep-1");
    assert_eq!(entry.container_port, 9000);
    drop(network);

    let logs = install_port_forwards(&state, "net-1", "ep-1", Ipv4Addr::new(172, 30, 0, 5)).await;
    assert_eq!(logs.len(), 2);
    assert!(logs[0].command.contains("--dport 8080"));
    assert!(logs[0].command.contains("172.30.0.5:9000"));
  }
}
