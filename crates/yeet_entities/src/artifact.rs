use std::{
  collections::BTreeMap,
  fmt,
  path::PathBuf,
  str::FromStr,
};

use serde::{Deserialize, Serialize};

/// One of the fixed artifact classes a generation may carry.
/// Exactly one payload-class artifact (`Binary | ComposeYml | MainTs |
/// MainPy`) is permitted per generation; the Store does not enforce this by
/// construction (it is a cross-field invariant checked in
/// `store::migrate`/`artifact::layout` validation), but the enum itself
/// fixes the vocabulary so a typo can't silently create a new kind.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
  Binary,
  Env,
  ComposeYml,
  ComposeNetwork,
  MainTs,
  MainPy,
  SystemdService,
  SystemdTimer,
  NetnsService,
  NetnsEnv,
  TailscaleService,
  TailscaleEnv,
  Tailscaled,
  TailscaledJson,
  ResolvConf,
}

impl ArtifactKind {
  /// Is this one of the mutually-exclusive "what does this generation run"
  /// artifacts? Exactly one is permitted per generation.
  pub fn is_payload_class(self) -> bool {
    matches!(
      self,
      ArtifactKind::Binary
        | ArtifactKind::ComposeYml
        | ArtifactKind::MainTs
        | ArtifactKind::MainPy
    )
  }

  /// The subdirectory under `services/<name>/` this kind's generations are
  /// numbered within (`bin/`, `compose/`, `env/`). Unit/run-dir artifacts
  /// all live directly in `run/`.
  pub fn subdir(self) -> &'static str {
    use ArtifactKind::*;
    match self {
      Binary => "bin",
      ComposeYml | ComposeNetwork => "compose",
      Env | NetnsEnv | TailscaleEnv => "env",
      MainTs | MainPy => "bin",
      SystemdService | SystemdTimer | NetnsService | TailscaleService
      | Tailscaled | TailscaledJson | ResolvConf => "run",
    }
  }
}

/// `"latest"`, `"staged"`, or `"gen-N"` — never a bare string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactRef {
  Latest,
  Staged,
  Gen(u64),
}

impl fmt::Display for ArtifactRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ArtifactRef::Latest => write!(f, "latest"),
      ArtifactRef::Staged => write!(f, "staged"),
      ArtifactRef::Gen(n) => write!(f, "gen-{n}"),
    }
  }
}

impl FromStr for ArtifactRef {
  type Err = ParseArtifactRefError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "latest" => Ok(ArtifactRef::Latest),
      "staged" => Ok(ArtifactRef::Staged),
      _ => s
        .strip_prefix("gen-")
        .and_then(|n| n.parse::<u64>().ok())
        .map(ArtifactRef::Gen)
        .ok_or_else(|| ParseArtifactRefError(s.to_string())),
    }
  }
}

impl Serialize for ArtifactRef {
  fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for ArtifactRef {
  fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(d)?;
    raw.parse().map_err(serde::de::Error::custom)
  }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid artifact ref {0:?}, expected \"latest\", \"staged\" or \"gen-N\"")]
pub struct ParseArtifactRefError(String);

/// Mapping of artifact-name (kind) -> ref -> on-disk path. The Store is the
/// source of truth for paths; the directory layout under each service is
/// pure convention.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactStore {
  #[serde(default)]
  entries: BTreeMap<ArtifactKind, BTreeMap<String, PathBuf>>,
}

impl ArtifactStore {
  pub fn set(&mut self, kind: ArtifactKind, r: ArtifactRef, path: PathBuf) {
    self
      .entries
      .entry(kind)
      .or_default()
      .insert(r.to_string(), path);
  }

  pub fn get(&self, kind: ArtifactKind, r: ArtifactRef) -> Option<&PathBuf> {
    self.entries.get(&kind)?.get(&r.to_string())
  }

  pub fn remove_ref(&mut self, r: ArtifactRef) {
    let key = r.to_string();
    for refs in self.entries.values_mut() {
      refs.remove(&key);
    }
  }

  pub fn kinds(&self) -> impl Iterator<Item = ArtifactKind> + '_ {
    self.entries.keys().copied()
  }

  pub fn all_gen_paths(&self) -> impl Iterator<Item = &PathBuf> {
    self.entries.values().flat_map(|refs| {
      refs
        .iter()
        .filter(|(r, _)| r.starts_with("gen-"))
        .map(|(_, p)| p)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn artifact_ref_round_trips() {
    for s in ["latest", "staged", "gen-0", "gen-42"] {
      let parsed: ArtifactRef = s.parse().unwrap();
      assert_eq!(parsed.to_string(), s);
    }
  }

  #[test]
  fn artifact_ref_rejects_garbage() {
    for s in ["", "gen-", "gen-x", "Latest", "gen--1"] {
      assert!(s.parse::<ArtifactRef>().is_err(), "expected {s:?} to fail");
    }
  }

  #[test]
  fn set_get_round_trips() {
    let mut store = ArtifactStore::default();
    store.set(ArtifactKind::Binary, ArtifactRef::Gen(3), "services/a/bin/3".into());
    assert_eq!(
      store.get(ArtifactKind::Binary, ArtifactRef::Gen(3)),
      Some(&PathBuf::from("services/a/bin/3"))
    );
    assert_eq!(store.get(ArtifactKind::Binary, ArtifactRef::Latest), None);
  }
}
