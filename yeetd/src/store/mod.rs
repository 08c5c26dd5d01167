//! The on-disk JSON database: one file, one schema version, atomic writes,
//! a mutate-with-callback API. Supervisors and the network manager never
//! hold a reference back into the `Store`; they're handed an immutable
//! `View` (a cloned snapshot) or they go through `mutate`.

mod migrate;

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::{Context, Result};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, instrument};
use yeet_entities::{store::StoreData, Service};

/// An immutable snapshot returned by `Store::get`. Cheap to clone (it's an
/// `Arc`), so callers can hold it across `.await` points without holding
/// the store lock.
pub type View = Arc<StoreData>;

pub struct Store {
  path: PathBuf,
  cache: Mutex<Option<Arc<StoreData>>>,
}

impl Store {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Store { path: path.into(), cache: Mutex::new(None) }
  }

  /// Loads the file if not resident, applies pending migrations, returns
  /// an immutable snapshot.
  #[instrument(skip(self))]
  pub async fn get(&self) -> Result<View> {
    let mut cache = self.cache.lock().await;
    if let Some(data) = &*cache {
      return Ok(data.clone());
    }
    let data = Arc::new(self.load_and_migrate().await?);
    *cache = Some(data.clone());
    Ok(data)
  }

  async fn load_and_migrate(&self) -> Result<StoreData> {
    let raw = match fs::read(&self.path).await {
      Ok(raw) => raw,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!("store file {} absent, starting empty", self.path.display());
        return Ok(StoreData::default());
      }
      Err(e) => {
        return Err(e).with_context(|| format!("failed to read store file {}", self.path.display()))
      }
    };
    let mut value: serde_json::Value = serde_json::from_slice(&raw)
      .with_context(|| format!("store file {} is not valid JSON", self.path.display()))?;
    if migrate::migrate(&mut value)? {
      info!("migrated store schema, backing up pre-migration file");
      self.backup_before_migration(&raw).await?;
    }
    serde_json::from_value(value).context("migrated store document failed to deserialize")
  }

  async fn backup_before_migration(&self, raw: &[u8]) -> Result<()> {
    let ts = yeet_entities::yeet_timestamp();
    let backup_path = self.path.with_extension(format!("json.bak.{ts}"));
    fs::write(&backup_path, raw)
      .await
      .with_context(|| format!("failed to write migration backup {}", backup_path.display()))
  }

  /// Acquires the sole writer lock, hands the mutator a deep clone of the
  /// current data, persists atomically if it returned `Ok`. On error, the
  /// prior file and cache are untouched — the caller sees either the
  /// mutation visible and persisted, or an error with no observable state
  /// change.
  #[instrument(skip(self, f))]
  pub async fn mutate<F, T>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&mut StoreData) -> Result<T>,
  {
    let mut cache = self.cache.lock().await;
    let mut data = match &*cache {
      Some(data) => (**data).clone(),
      None => self.load_and_migrate().await?,
    };
    let result = f(&mut data)?;
    write_atomic(&self.path, &data).await?;
    *cache = Some(Arc::new(data));
    Ok(result)
  }

  /// Convenience: auto-creates the service entry if absent before handing
  /// it to the mutator.
  pub async fn mutate_service<F, T>(&self, name: &str, kind: yeet_entities::ServiceKind, f: F) -> Result<T>
  where
    F: FnOnce(&mut Service) -> Result<T>,
  {
    self
      .mutate(move |data| {
        let service = data
          .services
          .entry(name.to_string())
          .or_insert_with(|| Service::new(name, kind));
        let result = f(service)?;
        service.touch();
        Ok(result)
      })
      .await
  }
}

/// Write to a sibling temp file, fsync, rename over the destination. The
/// parent directory is created with mode 0755 if missing.
async fn write_atomic(path: &Path, data: &StoreData) -> Result<()> {
  let parent = path.parent().context("store path has no parent directory")?;
  fs::create_dir_all(parent)
    .await
    .with_context(|| format!("failed to create store directory {}", parent.display()))?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o755);
    let _ = fs::set_permissions(parent, perms).await;
  }

  let tmp_path = path.with_extension("json.tmp");
  let body = serde_json::to_vec_pretty(data).context("failed to serialize store data")?;
  let mut file = fs::File::create(&tmp_path)
    .await
    .with_context(|| format!("failed to create temp store file {}", tmp_path.display()))?;
  file.write_all(&body).await.context("failed to write store temp file")?;
  file.sync_all().await.context("failed to fsync store temp file")?;
  drop(file);
  fs::rename(&tmp_path, path)
    .await
    .with_context(|| format!("failed to rename {} into place", tmp_path.display()))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use yeet_entities::ServiceKind;

  async fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db.json"));
    (dir, store)
  }

  #[tokio::test]
  async fn get_on_missing_file_is_empty() {
    let (_dir, store) = temp_store().await;
    let view = store.get().await.unwrap();
    assert!(view.services.is_empty());
  }

  #[tokio::test]
  async fn mutate_persists_across_new_store_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.json");
    {
      let store = Store::new(&path);
      store
        .mutate_service("svc-a", ServiceKind::Compose, |svc| {
          svc.latest_generation = 3;
          Ok(())
        })
        .await
        .unwrap();
    }
    let store2 = Store::new(&path);
    let view = store2.get().await.unwrap();
    assert_eq!(view.services["svc-a"].latest_generation, 3);
  }

  #[tokio::test]
  async fn mutate_error_leaves_state_unchanged() {
    let (_dir, store) = temp_store().await;
    store
      .mutate_service("svc-a", ServiceKind::Compose, |svc| {
        svc.latest_generation = 1;
        Ok(())
      })
      .await
      .unwrap();
    let result: Result<()> = store
      .mutate(|_data| anyhow::bail!("boom"))
      .await;
    assert!(result.is_err());
    let view = store.get().await.unwrap();
    assert_eq!(view.services["svc-a"].latest_generation, 1);
  }
}
