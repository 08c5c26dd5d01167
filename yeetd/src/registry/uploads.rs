//! Chunked upload-session protocol: `POST .../blobs/uploads/` starts a
//! session, `PATCH`/`PUT .../blobs/uploads/{uuid}` append and complete it.
//! Sessions stage their bytes under `<root>/uploads/<uuid>` and are moved
//! into the blob store on completion. Completion is a compare-and-delete:
//! the session entry is removed only once its bytes have been durably
//! written to the blob store, so a failed completion leaves it retryable.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use tokio::{
  fs,
  io::{AsyncSeekExt, AsyncWriteExt},
};

use super::blobstore::BlobStore;

struct Session {
  repo: String,
  path: PathBuf,
}

pub struct UploadManager {
  root: PathBuf,
  sessions: DashMap<String, Session>,
}

impl UploadManager {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    UploadManager { root: root.into(), sessions: DashMap::new() }
  }

  fn session_path(&self, id: &str) -> PathBuf {
    self.root.join("uploads").join(id)
  }

  pub async fn start(&self, repo: &str) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let path = self.session_path(&id);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await.context("failed to create uploads directory")?;
    }
    fs::File::create(&path).await.context("failed to create upload staging file")?;
    self.sessions.insert(id.clone(), Session { repo: repo.to_string(), path });
    Ok(id)
  }

  pub fn exists(&self, id: &str) -> bool {
    self.sessions.contains_key(id)
  }

  pub fn repo_of(&self, id: &str) -> Option<String> {
    self.sessions.get(id).map(|s| s.repo.clone())
  }

  /// Current staged size; used to answer the distribution protocol's
  /// `Range:` status response and to validate the next chunk's offset.
  pub async fn offset(&self, id: &str) -> Result<u64> {
    let session = self.sessions.get(id).context("unknown upload session")?;
    let meta = fs::metadata(&session.path).await.context("failed to stat upload staging file")?;
    Ok(meta.len())
  }

  /// Appends `data` at `start`. Uploads are sequential — `start` must equal
  /// the session's current size.
  pub async fn write_chunk(&self, id: &str, start: u64, data: &[u8]) -> Result<u64> {
    let path = {
      let session = self.sessions.get(id).context("unknown upload session")?;
      session.path.clone()
    };
    let mut file =
      fs::OpenOptions::new().write(true).open(&path).await.context("failed to open upload staging file")?;
    let current = file.metadata().await.context("failed to stat upload staging file")?.len();
    if start != current {
      bail!("chunk start {start} does not match current offset {current}");
    }
    file.seek(std::io::SeekFrom::Start(start)).await.context("failed to seek upload staging file")?;
    file.write_all(data).await.context("failed to write upload chunk")?;
    file.flush().await.context("failed to flush upload chunk")?;
    Ok(start + data.len() as u64)
  }

  /// Moves the staged bytes into the blob store, verifying `expected_digest`
  /// when given, marks the result as a GC root, and removes the session. A
  /// manifest target that already exists in the blob store still completes
  /// the session cleanly (no error) — completion releases the lease either
  /// way.
  pub async fn complete(
    &self,
    id: &str,
    blobstore: &BlobStore,
    expected_digest: Option<&str>,
  ) -> Result<String> {
    let path = {
      let session = self.sessions.get(id).context("unknown upload session")?;
      session.path.clone()
    };
    let data = fs::read(&path).await.context("failed to read completed upload")?;
    let digest = blobstore.write_blob(&data).await?;
    if let Some(expected) = expected_digest {
      if expected != digest {
        bail!("uploaded content digest {digest} does not match expected {expected}");
      }
    }
    blobstore.mark_gc_root(&digest).await?;
    let _ = fs::remove_file(&path).await;
    self.sessions.remove(id);
    Ok(digest)
  }

  pub fn cancel(&self, id: &str) {
    if let Some((_, session)) = self.sessions.remove(id) {
      let path = session.path;
      tokio::spawn(async move {
        let _ = fs::remove_file(&path).await;
      });
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn chunk_then_complete_lands_in_blobstore() {
    let dir = tempfile::tempdir().unwrap();
    let uploads = UploadManager::new(dir.path().join("up"));
    let blobstore = BlobStore::new(dir.path().join("blobs"));

    let id = uploads.start("svc-a/app").await.unwrap();
    assert_eq!(uploads.offset(&id).await.unwrap(), 0);
    let next = uploads.write_chunk(&id, 0, b"hello ").await.unwrap();
    let next = uploads.write_chunk(&id, next, b"world").await.unwrap();
    assert_eq!(next, 11);

    let digest = uploads.complete(&id, &blobstore, None).await.unwrap();
    assert!(blobstore.exists(&digest).await);
    assert_eq!(blobstore.read_blob(&digest).await.unwrap(), b"hello world");
    assert!(!uploads.exists(&id));
  }

  #[tokio::test]
  async fn out_of_order_chunk_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let uploads = UploadManager::new(dir.path().join("up"));
    let id = uploads.start("svc-a/app").await.unwrap();
    uploads.write_chunk(&id, 0, b"abc").await.unwrap();
    assert!(uploads.write_chunk(&id, 0, b"xyz").await.is_err());
  }

  #[tokio::test]
  async fn digest_mismatch_is_rejected_and_session_survives() {
    let dir = tempfile::tempdir().unwrap();
    let uploads = UploadManager::new(dir.path().join("up"));
    let blobstore = BlobStore::new(dir.path().join("blobs"));
    let id = uploads.start("svc-a/app").await.unwrap();
    uploads.write_chunk(&id, 0, b"hello").await.unwrap();
    let result = uploads.complete(&id, &blobstore, Some("sha256:wrong")).await;
    assert!(result.is_err());
    assert!(uploads.exists(&id));
  }
}
