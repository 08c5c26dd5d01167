//! Content-addressed blob storage: every blob lives at
//! `<root>/blobs/sha256/<hex digest>`, named by its own digest. A "GC root"
//! marker is a zero-byte sidecar file; nothing currently reclaims unmarked
//! blobs, but completed uploads are marked so a future collector has
//! somewhere to look.

use std::path::PathBuf;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncReadExt};

#[derive(Debug, Clone)]
pub struct BlobStore {
  root: PathBuf,
}

impl BlobStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    BlobStore { root: root.into() }
  }

  pub fn blob_path(&self, digest: &str) -> PathBuf {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    self.root.join("blobs").join("sha256").join(hex)
  }

  fn gc_root_path(&self, digest: &str) -> PathBuf {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    self.root.join("blobs").join("sha256").join(format!(".{hex}.gcroot"))
  }

  /// Writes `data`, returning its `sha256:<hex>` digest. Overwriting an
  /// existing blob with identical content is a no-op in effect, since the
  /// digest and hence the path are the same.
  pub async fn write_blob(&self, data: &[u8]) -> Result<String> {
    let digest = digest_of(data);
    let path = self.blob_path(&digest);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await.context("failed to create blob directory")?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).await.context("failed to write blob temp file")?;
    fs::rename(&tmp, &path).await.context("failed to rename blob into place")?;
    Ok(digest)
  }

  pub async fn mark_gc_root(&self, digest: &str) -> Result<()> {
    fs::write(self.gc_root_path(digest), b"").await.context("failed to write gc-root marker")
  }

  /// True only when both the blob file exists AND can actually be opened
  /// for reading — a metadata-only hit with a broken reader is reported as
  /// not-found so a puller never starts a stream that will fail mid-way.
  pub async fn exists(&self, digest: &str) -> bool {
    fs::File::open(self.blob_path(digest)).await.is_ok()
  }

  pub async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
    let mut file = fs::File::open(self.blob_path(digest))
      .await
      .with_context(|| format!("blob {digest} not found"))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.context("failed to read blob")?;
    Ok(buf)
  }

  pub async fn delete_blob(&self, digest: &str) -> Result<()> {
    let _ = fs::remove_file(self.gc_root_path(digest)).await;
    fs::remove_file(self.blob_path(digest))
      .await
      .with_context(|| format!("failed to delete blob {digest}"))
  }
}

pub fn digest_of(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  format!("sha256:{}", hex::encode(hasher.finalize()))
}
