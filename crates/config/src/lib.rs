//! Configuration-file loading. A single host agent only ever loads one
//! optional TOML file plus environment-variable/CLI overrides, so this
//! stays to that single-file shape (see DESIGN.md for the trim note from
//! a fleet-oriented multi-path loader).

use std::path::Path;

use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("failed to read config file {path}: {source}")]
  Read { path: String, #[source] source: std::io::Error },
  #[error("failed to parse config file {path}: {source}")]
  Parse { path: String, #[source] source: toml::de::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Loads and parses a single TOML config file. Returns `T::default()`-style
/// behavior is left to the caller (via `Option`): a missing path is not an
/// error, since every `yeetd` config field already has a built-in default.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
  if !path.exists() {
    return Ok(None);
  }
  let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
    path: path.display().to_string(),
    source,
  })?;
  let parsed = toml::from_str(&raw).map_err(|source| Error::Parse {
    path: path.display().to_string(),
    source,
  })?;
  Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, Deserialize, PartialEq)]
  struct Sample {
    port: u16,
  }

  #[test]
  fn missing_file_is_none_not_error() {
    let result: Result<Option<Sample>> = load_toml(Path::new("/nonexistent/yeetd.toml"));
    assert!(matches!(result, Ok(None)));
  }

  #[test]
  fn parses_present_file() {
    let dir = tempfile_dir();
    let path = dir.join("yeetd.toml");
    std::fs::write(&path, "port = 9120\n").unwrap();
    let parsed: Sample = load_toml(&path).unwrap().unwrap();
    assert_eq!(parsed, Sample { port: 9120 });
    std::fs::remove_dir_all(dir).ok();
  }

  fn tempfile_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("yeetd-config-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }
}
