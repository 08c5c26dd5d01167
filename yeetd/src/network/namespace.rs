//! Per-service network namespace reconcile: `yeet-<service>-ns`, a loopback
//! interface, an optional veth pair into the shared host namespace
//! `yeet-ns`, an optional macvlan + DHCP client, and an optional per-netns
//! `resolv.conf`. Everything here is a shelled-out `ip`/`bridge` invocation
//! — this is the specified design, not a placeholder for a netlink crate.

use std::path::{Path, PathBuf};

use anyhow::Result;
use command::run_yeet_command;
use tokio::fs;
use tracing::instrument;
use yeet_entities::Log;

/// The host-side namespace every per-service veth peer lands in.
pub const SHARED_HOST_NETNS: &str = "yeet-ns";

#[derive(Debug, Clone, Default)]
pub struct MacvlanSpec {
  pub parent_interface: String,
  pub vlan_id: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct NamespaceSpec {
  pub service: String,
  /// Short, unique id used to name the veth pair (`y-<id>-v` /
  /// `y-<id>-vp`); callers keep this stable across reconciles so the
  /// interface names don't churn.
  pub veth_id: String,
  pub gateway: String,
  pub address_cidr: String,
  pub macvlan: Option<MacvlanSpec>,
  pub use_dhcp: bool,
  pub resolv_conf: Option<String>,
}

impl NamespaceSpec {
  pub fn netns_name(&self) -> String {
    format!("yeet-{}-ns", self.service)
  }

  fn veth_service_side(&self) -> String {
    format!("y-{}-v", self.veth_id)
  }

  fn veth_host_side(&self) -> String {
    format!("y-{}-vp", self.veth_id)
  }
}

#[instrument]
async fn ip(stage: &str, args: &str) -> Log {
  run_yeet_command(stage, Path::new("/"), format!("ip {args}")).await
}

#[instrument]
async fn ip_netns_exec(netns: &str, stage: &str, args: &str) -> Log {
  run_yeet_command(stage, Path::new("/"), format!("ip netns exec {netns} {args}")).await
}

/// (Re)creates the namespace and brings it to the state described by
/// `spec`. Idempotent: every step either checks before acting or uses a
/// form of the command that tolerates "already exists".
#[instrument(skip(spec))]
pub async fn reconcile(spec: &NamespaceSpec) -> Result<Vec<Log>> {
  let netns = spec.netns_name();
  let mut logs = Vec::new();

  logs.push(ip("add-netns", &format!("netns add {netns}")).await);
  logs.push(ip_netns_exec(&netns, "loopback-up", "ip link set lo up").await);

  let svc_if = spec.veth_service_side();
  let host_if = spec.veth_host_side();
  logs.push(ip("add-veth", &format!("link add {svc_if} type veth peer name {host_if}")).await);
  logs.push(ip("move-veth", &format!("link set {svc_if} netns {netns}")).await);
  logs.push(ip("move-veth-host", &format!("link set {host_if} netns {SHARED_HOST_NETNS}")).await);
  logs.push(
    ip_netns_exec(
      &netns,
      "addr-veth",
      &format!("ip addr add {} dev {svc_if}", spec.address_cidr),
    )
    .await,
  );
  logs.push(ip_netns_exec(&netns, "up-veth", &format!("ip link set {svc_if} up")).await);
  logs.push(
    ip_netns_exec(
      &netns,
      "default-route",
      &format!("ip route replace default via {}", spec.gateway),
    )
    .await,
  );

  if let Some(macvlan) = &spec.macvlan {
    logs.extend(attach_macvlan(&netns, macvlan).await);
    if spec.use_dhcp {
      logs.push(start_dhcp_client(&netns, &macvlan_if_name(macvlan)).await);
    }
  }

  if let Some(resolv) = &spec.resolv_conf {
    logs.push(write_netns_resolv_conf(&netns, resolv).await?);
  }

  Ok(logs)
}

fn macvlan_if_name(macvlan: &MacvlanSpec) -> String {
  match macvlan.vlan_id {
    Some(vlan) => format!("{}.{vlan}-mv", macvlan.parent_interface),
    None => format!("{}-mv", macvlan.parent_interface),
  }
}

async fn attach_macvlan(netns: &str, macvlan: &MacvlanSpec) -> Vec<Log> {
  let mut logs = Vec::new();
  let parent = if let Some(vlan) = macvlan.vlan_id {
    let trunk_if = format!("{}.{vlan}", macvlan.parent_interface);
    logs.push(
      ip(
        "add-vlan-trunk",
        &format!("link add link {} name {trunk_if} type vlan id {vlan}", macvlan.parent_interface),
      )
      .await,
    );
    logs.push(ip("up-vlan-trunk", &format!("link set {trunk_if} up")).await);
    trunk_if
  } else {
    macvlan.parent_interface.clone()
  };

  let mv_if = macvlan_if_name(macvlan);
  logs.push(ip("add-macvlan", &format!("link add link {parent} name {mv_if} type macvlan mode bridge")).await);
  logs.push(ip("move-macvlan", &format!("link set {mv_if} netns {netns}")).await);
  logs.push(ip_netns_exec(netns, "up-macvlan", &format!("ip link set {mv_if} up")).await);
  logs
}

async fn start_dhcp_client(netns: &str, iface: &str) -> Log {
  let pidfile = dhcp_pidfile_path(netns, iface);
  ip_netns_exec(
    netns,
    "dhcp-client",
    &format!("udhcpc -i {iface} -p {} -b", pidfile.display()),
  )
  .await
}

fn dhcp_pidfile_path(netns: &str, iface: &str) -> PathBuf {
  PathBuf::from(format!("/run/yeet/dhcp/{netns}-{iface}.pid"))
}

async fn write_netns_resolv_conf(netns: &str, contents: &str) -> Result<Log> {
  let dir = PathBuf::from(format!("/etc/netns/{netns}"));
  fs::create_dir_all(&dir).await?;
  let path = dir.join("resolv.conf");
  fs::write(&path, contents).await?;
  Ok(Log::simple("resolv-conf", format!("wrote {}", path.display())))
}

/// Deletes the dhcp client, the veth pair (deleting one end removes the
/// peer), and the namespace itself. Tolerates already-gone state; this is
/// the reverse of `reconcile` and must be safe to call twice.
#[instrument(skip(spec))]
pub async fn teardown(spec: &NamespaceSpec) -> Result<Vec<Log>> {
  let netns = spec.netns_name();
  let mut logs = Vec::new();

  if let Some(macvlan) = &spec.macvlan {
    let iface = macvlan_if_name(macvlan);
    let pidfile = dhcp_pidfile_path(&netns, &iface);
    logs.push(
      run_yeet_command(
        "kill-dhcp",
        Path::new("/"),
        format!("kill -TERM $(cat {} 2>/dev/null) 2>/dev/null; true", pidfile.display()),
      )
      .await,
    );
  }

  logs.push(ip("del-veth", &format!("link del {} 2>/dev/null; true", spec.veth_service_side())).await);
  logs.push(ip("del-netns", &format!("netns del {netns} 2>/dev/null; true", )).await);

  Ok(logs)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn netns_and_veth_names_are_deterministic() {
    let spec = NamespaceSpec {
      service: "svc-a".into(),
      veth_id: "ab12".into(),
      gateway: "10.70.0.1".into(),
      address_cidr: "10.70.0.2/24".into(),
      macvlan: None,
      use_dhcp: false,
      resolv_conf: None,
    };
    assert_eq!(spec.netns_name(), "yeet-svc-a-ns");
    assert_eq!(spec.veth_service_side(), "y-ab12-v");
    assert_eq!(spec.veth_host_side(), "y-ab12-vp");
  }

  #[test]
  fn macvlan_if_name_includes_vlan_when_set() {
    let plain = MacvlanSpec { parent_interface: "eth0".into(), vlan_id: None };
    assert_eq!(macvlan_if_name(&plain), "eth0-mv");
    let trunked = MacvlanSpec { parent_interface: "eth0".into(), vlan_id: Some(42) };
    assert_eq!(macvlan_if_name(&trunked), "eth0.42-mv");
  }

  #[tokio::test]
  async fn reconcile_emits_one_log_per_step_without_macvlan() {
    let spec = NamespaceSpec {
      service: "svc-a".into(),
      veth_id: "ab12".into(),
      gateway: "10.70.0.1".into(),
      address_cidr: "10.70.0.2/24".into(),
      macvlan: None,
      use_dhcp: false,
      resolv_conf: None,
    };
    let logs = reconcile(&spec).await.unwrap();
    assert_eq!(logs.len(), 7);
  }
}
