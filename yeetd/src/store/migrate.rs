//! Schema migrations. A migration is a pure function over the raw JSON
//! value (so it can still apply after `StoreData`'s Rust shape has moved on
//! from whatever an old file recorded) keyed by the schema version it
//! migrates *from*. Running migrations is idempotent: a file already at
//! `CURRENT_SCHEMA_VERSION` runs no migration at all.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde_json::Value;
use yeet_entities::store::CURRENT_SCHEMA_VERSION;

pub type Migration = fn(&mut Value) -> Result<()>;

fn migrations() -> BTreeMap<u32, Migration> {
  // No migrations yet: schema version 1 is the first shape this agent has
  // ever written. Add `m.insert(1, migrate_v1_to_v2);` here when the
  // schema next changes.
  BTreeMap::new()
}

/// Applies every migration from the document's recorded `schema_version`
/// up to `CURRENT_SCHEMA_VERSION`, in order, mutating `value` in place and
/// bumping `schema_version` after each step.
pub fn migrate(value: &mut Value) -> Result<bool> {
  let migrations = migrations();
  let mut version = value
    .get("schema_version")
    .and_then(Value::as_u64)
    .unwrap_or(0) as u32;
  let mut migrated = false;
  while version < CURRENT_SCHEMA_VERSION {
    let step = migrations
      .get(&version)
      .with_context(|| format!("no migration registered from schema version {version}"))?;
    step(value)?;
    version += 1;
    migrated = true;
    value["schema_version"] = Value::from(version);
  }
  Ok(migrated)
}
