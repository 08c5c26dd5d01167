use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tags an `ImageRepo` accepts. Any other tag is a validation error.
pub const ALLOWED_TAGS: [&str; 3] = ["latest", "run", "staged"];

pub fn is_allowed_tag(tag: &str) -> bool {
  ALLOWED_TAGS.contains(&tag)
}

/// `repo` must be `svc/container` — exactly two path components.
pub fn parse_repo_name(repo: &str) -> Option<(&str, &str)> {
  let mut parts = repo.split('/');
  let svc = parts.next()?;
  let container = parts.next()?;
  if svc.is_empty() || container.is_empty() || parts.next().is_some() {
    return None;
  }
  Some((svc, container))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRecord {
  pub content_type: String,
  /// `sha256:<hex>`
  pub digest: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageRepo {
  #[serde(default)]
  pub tags: BTreeMap<String, ManifestRecord>,
}
