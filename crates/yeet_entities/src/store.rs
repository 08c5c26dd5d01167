use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{image::ImageRepo, network::DockerNetworkRecord, service::Service};

/// Current on-disk schema version. Bump this and add a migration in
/// `yeetd::store::migrate` whenever this shape changes.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
  pub name: String,
  /// `host:path` form.
  pub source: String,
  pub mount_path: String,
  pub fs_type: String,
  #[serde(default)]
  pub mount_opts: Vec<String>,
  #[serde(default)]
  pub depends_on: Vec<String>,
}

/// The single JSON document persisted at `<root>/db.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreData {
  pub schema_version: u32,
  #[serde(default)]
  pub services: BTreeMap<String, Service>,
  #[serde(default)]
  pub images: BTreeMap<String, ImageRepo>,
  #[serde(default)]
  pub networks: BTreeMap<String, DockerNetworkRecord>,
  #[serde(default)]
  pub volumes: BTreeMap<String, Volume>,
}

impl Default for StoreData {
  fn default() -> Self {
    StoreData {
      schema_version: CURRENT_SCHEMA_VERSION,
      services: BTreeMap::new(),
      images: BTreeMap::new(),
      networks: BTreeMap::new(),
      volumes: BTreeMap::new(),
    }
  }
}
