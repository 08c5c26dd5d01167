//! The PUT-manifest hook: the one place where the registry stops being
//! plain storage and becomes a control plane. Accepting a manifest records
//! it in the `Store` and, for the `latest`/`run` tags, synthesizes a
//! compose file pointing the service at this registry and drives it
//! through a compose supervisor.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use yeet_entities::{image, store::StoreData, YeetError};

use crate::store::Store;

use super::blobstore::BlobStore;

/// The hostname the synthesized compose file points images at. Reserved —
/// never resolvable outside this process's own registry endpoint.
pub const INTERNAL_REGISTRY_HOST: &str = "registry.yeet.internal";

/// Abstracts "drive a service's compose supervisor" so the registry module
/// does not depend on `supervisor::compose` directly; `main.rs` supplies
/// the concrete wiring. `stage_only` mirrors the `latest` (stage) vs `run`
/// (install) distinction from the PUT-manifest hook.
#[async_trait]
pub trait ComposeInstaller: Send + Sync {
  async fn stage_or_install(&self, service: &str, compose_yaml: &str, stage_only: bool) -> Result<()>;
}

pub struct PutManifestOutcome {
  pub digest: String,
  pub staged_tag_recorded: bool,
}

/// `repo` is already known to be a valid two-component name; `tag` is
/// already known to be in the allowed set — callers validate those at the
/// HTTP boundary so this function can focus on the write/install sequence.
pub async fn put_manifest(
  store: &Store,
  blobstore: &BlobStore,
  installer: &Arc<dyn ComposeInstaller>,
  repo: &str,
  tag: &str,
  content_type: &str,
  body: &[u8],
) -> Result<PutManifestOutcome, YeetError> {
  let (service, _container) =
    image::parse_repo_name(repo).ok_or_else(|| YeetError::user(format!("invalid repository name {repo}")))?;
  if !image::is_allowed_tag(tag) {
    return Err(YeetError::user(format!("tag {tag} is not allowed")));
  }

  let digest = blobstore
    .write_blob(body)
    .await
    .map_err(|e| YeetError::infra(format!("failed to persist manifest blob: {e:#}")))?;
  blobstore
    .mark_gc_root(&digest)
    .await
    .map_err(|e| YeetError::infra(format!("failed to mark manifest blob as gc root: {e:#}")))?;

  record_manifest(store, repo, tag, content_type, &digest)
    .await
    .map_err(|e| YeetError::infra(format!("failed to record manifest in store: {e:#}")))?;
  record_manifest(store, repo, "staged", content_type, &digest)
    .await
    .map_err(|e| YeetError::infra(format!("failed to record staged ref in store: {e:#}")))?;

  if tag == "latest" || tag == "run" {
    let compose_yaml = synthesize_compose(repo);
    installer
      .stage_or_install(service, &compose_yaml, tag == "latest")
      .await
      .map_err(|e| YeetError::transient(format!("compose install failed: {e:#}")))?;
  }

  Ok(PutManifestOutcome { digest, staged_tag_recorded: true })
}

async fn record_manifest(store: &Store, repo: &str, tag: &str, content_type: &str, digest: &str) -> Result<()> {
  let repo = repo.to_string();
  let tag = tag.to_string();
  let content_type = content_type.to_string();
  let digest = digest.to_string();
  store
    .mutate(move |data: &mut StoreData| {
      let entry = data.images.entry(repo.clone()).or_default();
      entry.tags.insert(tag.clone(), image::ManifestRecord { content_type: content_type.clone(), digest: digest.clone() });
      Ok(())
    })
    .await
    .context("store mutation failed")
}

/// Exactly the minimal compose payload the run-side CLI surface also
/// synthesizes for a plain image reference, pointed at this registry.
fn synthesize_compose(repo: &str) -> String {
  format!(
    "services:\n  svc:\n    image: {INTERNAL_REGISTRY_HOST}/{repo}\n    restart: unless-stopped\n    volumes:\n      - \"./:/data\"\n"
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  use crate::registry::blobstore::BlobStore;

  struct RecordingInstaller {
    calls: Mutex<Vec<(String, bool)>>,
  }

  #[async_trait]
  impl ComposeInstaller for RecordingInstaller {
    async fn stage_or_install(&self, service: &str, _compose_yaml: &str, stage_only: bool) -> Result<()> {
      self.calls.lock().unwrap().push((service.to_string(), stage_only));
      Ok(())
    }
  }

  #[tokio::test]
  async fn run_tag_records_staged_and_installs() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db.json"));
    let blobstore = BlobStore::new(dir.path().join("blobs"));
    let installer: Arc<dyn ComposeInstaller> =
      Arc::new(RecordingInstaller { calls: Mutex::new(Vec::new()) });

    let outcome = put_manifest(
      &store,
      &blobstore,
      &installer,
      "svc-a/app",
      "run",
      "application/vnd.oci.image.manifest.v1+json",
      b"{}",
    )
    .await
    .unwrap();

    assert!(outcome.staged_tag_recorded);
    let view = store.get().await.unwrap();
    let repo = &view.images["svc-a/app"];
    assert!(repo.tags.contains_key("run"));
    assert!(repo.tags.contains_key("staged"));
    assert!(!repo.tags.contains_key("latest"));
  }

  #[tokio::test]
  async fn latest_tag_stages_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db.json"));
    let blobstore = BlobStore::new(dir.path().join("blobs"));
    let calls = Arc::new(Mutex::new(Vec::new()));
    struct Capturing(Arc<Mutex<Vec<(String, bool)>>>);
    #[async_trait]
    impl ComposeInstaller for Capturing {
      async fn stage_or_install(&self, service: &str, _c: &str, stage_only: bool) -> Result<()> {
        self.0.lock().unwrap().push((service.to_string(), stage_only));
        Ok(())
      }
    }
    let installer: Arc<dyn ComposeInstaller> = Arc::new(Capturing(calls.clone()));

    put_manifest(&store, &blobstore, &installer, "svc-a/app", "latest", "application/json", b"{}")
      .await
      .unwrap();

    let recorded = calls.lock().unwrap();
    assert_eq!(recorded.as_slice(), &[("svc-a".to_string(), true)]);
  }

  #[tokio::test]
  async fn invalid_repo_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db.json"));
    let blobstore = BlobStore::new(dir.path().join("blobs"));
    let installer: Arc<dyn ComposeInstaller> =
      Arc::new(RecordingInstaller { calls: Mutex::new(Vec::new()) });

    let err = put_manifest(&store, &blobstore, &installer, "nocontainer", "run", "application/json", b"{}")
      .await
      .unwrap_err();
    assert!(matches!(err.kind, yeet_entities::ErrorKind::User));
  }

  #[tokio::test]
  async fn disallowed_tag_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db.json"));
    let blobstore = BlobStore::new(dir.path().join("blobs"));
    let installer: Arc<dyn ComposeInstaller> =
      Arc::new(RecordingInstaller { calls: Mutex::new(Vec::new()) });

    let err = put_manifest(&store, &blobstore, &installer, "svc-a/app", "v1.0", "application/json", b"{}")
      .await
      .unwrap_err();
    assert!(matches!(err.kind, yeet_entities::ErrorKind::User));
  }
}
