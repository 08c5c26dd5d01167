//! The `copy` command's wire format: a `YEETCOPY1 <kind> <base64 basename>\n`
//! header followed by a tar stream. `kind` is `f` (single file, archive has
//! one entry) or `d` (directory tree). Entries are applied as the archive is
//! read — the whole payload is never buffered in memory — and directory
//! mtimes are applied last-in-first-out (deepest directories first) since
//! writing a file into a directory updates that directory's mtime.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::Engine;

pub const COPY_HEADER_MAGIC: &str = "YEETCOPY1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
  File,
  Dir,
}

#[derive(Debug, Clone)]
pub struct CopyHeader {
  pub kind: CopyKind,
  pub base_name: String,
}

/// Parses the one header line. `line` must not include the trailing `\n`.
pub fn parse_header(line: &str) -> Result<CopyHeader> {
  let mut parts = line.split_whitespace();
  let magic = parts.next().context("empty copy header")?;
  if magic != COPY_HEADER_MAGIC {
    bail!("unrecognized copy header magic {magic:?}");
  }
  let kind = match parts.next().context("copy header missing kind")? {
    "f" => CopyKind::File,
    "d" => CopyKind::Dir,
    other => bail!("unknown copy kind {other:?}"),
  };
  let encoded = parts.next().context("copy header missing basename")?;
  let decoded = base64::engine::general_purpose::STANDARD
    .decode(encoded)
    .context("copy header basename is not valid base64")?;
  let base_name = String::from_utf8(decoded).context("copy header basename is not valid utf-8")?;
  if base_name.is_empty() || base_name.contains('/') || base_name == ".." {
    bail!("copy header basename {base_name:?} is not a bare filename");
  }
  Ok(CopyHeader { kind, base_name })
}

/// Rejects an archive entry path that would escape `dest_root`: absolute
/// paths and any component equal to `..`.
fn reject_traversal(entry_path: &Path) -> Result<()> {
  use std::path::Component;
  for component in entry_path.components() {
    match component {
      Component::ParentDir => bail!("tar entry {} escapes destination with ..", entry_path.display()),
      Component::RootDir | Component::Prefix(_) => {
        bail!("tar entry {} is an absolute path", entry_path.display())
      }
      _ => {}
    }
  }
  Ok(())
}

/// Streams `reader` as a tar archive into `dest_root`, rejecting any entry
/// that would traverse outside it. Directory modification times are
/// collected and applied after every entry has been written, deepest path
/// first, so a later file write under a shallower directory doesn't clobber
/// a shallower directory's intended mtime before a deeper one is set.
pub fn unpack_tar<R: std::io::Read>(reader: R, dest_root: &Path) -> Result<()> {
  let mut archive = tar::Archive::new(reader);
  let mut dir_mtimes: Vec<(PathBuf, u64)> = Vec::new();

  for entry in archive.entries().context("failed to read tar stream")? {
    let mut entry = entry.context("failed to read tar entry")?;
    let entry_path = entry.path().context("tar entry has an invalid path")?.into_owned();
    reject_traversal(&entry_path)?;
    let dest_path = dest_root.join(&entry_path);

    if entry.header().entry_type().is_dir() {
      std::fs::create_dir_all(&dest_path)
        .with_context(|| format!("failed to create directory {}", dest_path.display()))?;
      if let Ok(mtime) = entry.header().mtime() {
        dir_mtimes.push((dest_path, mtime));
      }
      continue;
    }

    if let Some(parent) = dest_path.parent() {
      std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    entry
      .unpack(&dest_path)
      .with_context(|| format!("failed to unpack {}", dest_path.display()))?;
  }

  dir_mtimes.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
  for (path, mtime) in dir_mtimes {
    let mtime = filetime::FileTime::from_unix_time(mtime as i64, 0);
    let _ = filetime::set_file_mtime(&path, mtime);
  }
  Ok(())
}
