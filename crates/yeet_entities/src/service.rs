use serde::{Deserialize, Serialize};

use crate::{artifact::ArtifactStore, yeet_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
  Compose,
  Systemd,
}

/// A private subnet address assigned to a service's network namespace,
/// stored in CIDR form (e.g. `10.70.3.0/24`).
pub type SubnetCidr = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
  /// Hostname this service is reachable as on the mesh VPN.
  pub hostname: String,
  pub advertise_routes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacvlanConfig {
  pub parent_interface: String,
  pub vlan_id: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
  pub name: String,
  pub kind: ServiceKind,
  /// The generation the supervisor is currently running, 0 meaning "never
  /// installed".
  pub current_generation: u64,
  /// The highest generation ever staged/committed.
  pub latest_generation: u64,
  #[serde(default)]
  pub artifacts: ArtifactStore,
  #[serde(default)]
  pub mesh: Option<MeshConfig>,
  #[serde(default)]
  pub macvlan: Option<MacvlanConfig>,
  #[serde(default)]
  pub subnet: Option<SubnetCidr>,
  /// 5-field cron expression, set by the `cron` command. `None` means the
  /// service runs continuously rather than on a schedule.
  #[serde(default)]
  pub schedule: Option<String>,
  pub created_at: i64,
  pub updated_at: i64,
  #[serde(default)]
  pub last_error: Option<String>,
}

impl Service {
  pub fn new(name: impl Into<String>, kind: ServiceKind) -> Self {
    let ts = yeet_timestamp();
    Service {
      name: name.into(),
      kind,
      current_generation: 0,
      latest_generation: 0,
      artifacts: ArtifactStore::default(),
      mesh: None,
      macvlan: None,
      subnet: None,
      schedule: None,
      created_at: ts,
      updated_at: ts,
      last_error: None,
    }
  }

  pub fn touch(&mut self) {
    self.updated_at = yeet_timestamp();
  }

  /// Invariant: `current <= latest`.
  pub fn is_consistent(&self) -> bool {
    self.current_generation <= self.latest_generation
  }
}
