//! Content-sniffing payload classifier. First match wins: magic sniff,
//! extension heuristic, YAML-content heuristic, shebang, else unknown.

use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
  Binary,
  MachO,
  Zstd,
  DockerCompose,
  Script,
  TypeScript,
  Python,
  Tarball,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
  X86_64,
  Arm64,
  Arm,
  I386,
  Unknown,
}

impl Arch {
  pub fn canonical(self) -> &'static str {
    match self {
      Arch::X86_64 => "x86_64",
      Arch::Arm64 => "ARM64",
      Arch::Arm => "ARM",
      Arch::I386 => "386",
      Arch::Unknown => "unknown",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
  Linux,
  Darwin,
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
  #[error("file is too short to classify ({0} bytes, need >= 4)")]
  TooShort(usize),
  #[error("unrecognized file type")]
  Unknown,
  #[error("binary architecture {found} does not match host architecture {host}")]
  ArchMismatch { found: &'static str, host: &'static str },
  #[error("binary built for {found:?} cannot run on host OS {host:?}")]
  OsMismatch { found: HostOs, host: HostOs },
  #[error("failed to decompress zstd payload: {0}")]
  Zstd(String),
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const MACHO_MAGICS: [[u8; 4]; 4] = [
  [0xfe, 0xed, 0xfa, 0xce], // 32-bit BE
  [0xce, 0xfa, 0xed, 0xfe], // 32-bit LE
  [0xfe, 0xed, 0xfa, 0xcf], // 64-bit BE
  [0xcf, 0xfa, 0xed, 0xfe], // 64-bit LE
];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

pub fn classify(path: &str, content: &[u8]) -> Result<FileKind, DetectError> {
  if content.len() < 4 {
    return Err(DetectError::TooShort(content.len()));
  }
  let head: [u8; 4] = content[..4].try_into().unwrap();

  // 1. magic sniff
  if head == ELF_MAGIC {
    return Ok(FileKind::Binary);
  }
  if MACHO_MAGICS.contains(&head) {
    return Ok(FileKind::MachO);
  }
  if head == ZSTD_MAGIC {
    return Ok(FileKind::Zstd);
  }
  if content.len() > 257 + 5 && &content[257..262] == b"ustar" {
    return Ok(FileKind::Tarball);
  }

  // 2. name heuristic on lowercase extension
  let lower = path.to_ascii_lowercase();
  let basename = lower.rsplit('/').next().unwrap_or(&lower);
  if lower.ends_with(".py") {
    return Ok(FileKind::Python);
  }
  if lower.ends_with(".ts") {
    return Ok(FileKind::TypeScript);
  }
  if lower.ends_with(".yml")
    || lower.ends_with(".yaml")
    || basename == "compose.yml"
    || basename == "compose.yaml"
  {
    return Ok(FileKind::DockerCompose);
  }

  // 3. content heuristic: valid YAML with a non-empty top-level `services:`
  if looks_like_compose(content) {
    return Ok(FileKind::DockerCompose);
  }

  // 4. shebang
  if content.starts_with(b"#!") {
    return Ok(FileKind::Script);
  }

  // 5. otherwise unknown
  Err(DetectError::Unknown)
}

/// Decompresses a single zstd frame. Binaries are always zstd-compressed
/// before upload, so this is the first thing `classify`'s caller runs on a
/// payload that sniffs as `FileKind::Zstd` before classifying again.
pub fn decompress_zstd(content: &[u8]) -> Result<Vec<u8>, DetectError> {
  zstd::stream::decode_all(content).map_err(|e| DetectError::Zstd(e.to_string()))
}

/// Classifies `content`, transparently unwrapping a single zstd frame so the
/// caller sees the kind of what's inside rather than `FileKind::Zstd`
/// itself. Returns the kind alongside the bytes that kind was derived from
/// (the decompressed bytes, if unwrapping happened).
pub fn classify_through_zstd(path: &str, content: &[u8]) -> Result<(FileKind, Vec<u8>), DetectError> {
  let kind = classify(path, content)?;
  if kind != FileKind::Zstd {
    return Ok((kind, content.to_vec()));
  }
  let inner = decompress_zstd(content)?;
  let inner_kind = classify(path, &inner)?;
  Ok((inner_kind, inner))
}

fn looks_like_compose(content: &[u8]) -> bool {
  let Ok(text) = std::str::from_utf8(content) else { return false };
  let Ok(value) = serde_yaml_ng::from_str::<serde_yaml_ng::Value>(text) else { return false };
  let Some(mapping) = value.as_mapping() else { return false };
  match mapping.get(serde_yaml_ng::Value::String("services".to_string())) {
    Some(services) => services.as_mapping().is_some_and(|m| !m.is_empty()),
    None => false,
  }
}

/// Extracts the architecture from an ELF/Mach-O header and checks it
/// against the host. `host_os`/`host_arch` describe the agent's own
/// platform.
pub fn check_binary_arch(
  kind: FileKind,
  content: &[u8],
  host_os: HostOs,
  host_arch: Arch,
) -> Result<(), DetectError> {
  let (binary_os, arch) = match kind {
    FileKind::Binary => (HostOs::Linux, elf_arch(content)),
    FileKind::MachO => (HostOs::Darwin, macho_arch(content)),
    _ => return Ok(()),
  };
  if binary_os != host_os {
    return Err(DetectError::OsMismatch { found: binary_os, host: host_os });
  }
  if arch != host_arch {
    return Err(DetectError::ArchMismatch {
      found: arch.canonical(),
      host: host_arch.canonical(),
    });
  }
  Ok(())
}

fn elf_arch(content: &[u8]) -> Arch {
  // e_machine is a little/big-endian u16 at offset 18, endianness given
  // by EI_DATA at offset 5 (1 = LE, 2 = BE).
  if content.len() < 20 {
    return Arch::Unknown;
  }
  let le = content[5] != 2;
  let raw = if le {
    u16::from_le_bytes([content[18], content[19]])
  } else {
    u16::from_be_bytes([content[18], content[19]])
  };
  match raw {
    0x3e => Arch::X86_64,
    0xb7 => Arch::Arm64,
    0x28 => Arch::Arm,
    0x03 => Arch::I386,
    _ => Arch::Unknown,
  }
}

fn macho_arch(content: &[u8]) -> Arch {
  if content.len() < 8 {
    return Arch::Unknown;
  }
  let be = content[..4] == [0xfe, 0xed, 0xfa, 0xce] || content[..4] == [0xfe, 0xed, 0xfa, 0xcf];
  let cputype = if be {
    i32::from_be_bytes([content[4], content[5], content[6], content[7]])
  } else {
    i32::from_le_bytes([content[4], content[5], content[6], content[7]])
  };
  // Mach-O CPU_TYPE constants, masked of the 64-bit ABI bit (0x0100_0000).
  match cputype & !0x0100_0000 {
    0x0000_0007 => Arch::X86_64,
    0x0000_000c => Arch::Arm64,
    _ => Arch::Unknown,
  }
}

/// Maps a GOARCH-style name (as reported by an upload's metadata hint, or
/// the running host) to the canonical form used in error messages.
pub fn canonicalize_arch_name(name: &str) -> Arch {
  match name {
    "amd64" | "x86_64" => Arch::X86_64,
    "arm64" | "aarch64" => Arch::Arm64,
    "arm" => Arch::Arm,
    "386" | "i386" => Arch::I386,
    _ => Arch::Unknown,
  }
}

pub fn host_arch() -> Arch {
  canonicalize_arch_name(std::env::consts::ARCH)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn elf_header(machine_le: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 64];
    buf[0..4].copy_from_slice(&ELF_MAGIC);
    buf[5] = 1; // EI_DATA = LE
    buf[18..20].copy_from_slice(&machine_le.to_le_bytes());
    buf
  }

  #[test]
  fn classifies_elf_as_binary() {
    let content = elf_header(0x3e);
    assert_eq!(classify("app", &content).unwrap(), FileKind::Binary);
  }

  #[test]
  fn classifies_zstd_magic() {
    let content = [0x28, 0xB5, 0x2F, 0xFD, 0, 0, 0, 0];
    assert_eq!(classify("app.zst", &content).unwrap(), FileKind::Zstd);
  }

  #[test]
  fn classify_through_zstd_unwraps_a_compressed_binary() {
    let elf = elf_header(0x3e);
    let compressed = zstd::stream::encode_all(elf.as_slice(), 0).unwrap();
    assert_eq!(classify("app", &compressed).unwrap(), FileKind::Zstd);

    let (kind, bytes) = classify_through_zstd("app", &compressed).unwrap();
    assert_eq!(kind, FileKind::Binary);
    assert_eq!(bytes, elf);
  }

  #[test]
  fn classify_through_zstd_is_a_no_op_for_uncompressed_content() {
    let elf = elf_header(0x3e);
    let (kind, bytes) = classify_through_zstd("app", &elf).unwrap();
    assert_eq!(kind, FileKind::Binary);
    assert_eq!(bytes, elf);
  }

  #[test]
  fn classifies_by_extension() {
    assert_eq!(classify("main.py", b"print(1)").unwrap(), FileKind::Python);
    assert_eq!(classify("main.ts", b"console.log(1)").unwrap(), FileKind::TypeScript);
    assert_eq!(classify("compose.yml", b"services:\n  a:\n    image: x\n").unwrap(), FileKind::DockerCompose);
  }

  #[test]
  fn classifies_compose_by_content_when_untitled() {
    let content = b"services:\n  web:\n    image: nginx\n";
    assert_eq!(classify("payload", content).unwrap(), FileKind::DockerCompose);
  }

  #[test]
  fn rejects_yaml_without_services() {
    let content = b"foo: bar\n";
    assert!(matches!(classify("payload", content), Err(DetectError::Unknown)));
  }

  #[test]
  fn classifies_shebang_as_script() {
    assert_eq!(classify("deploy", b"#!/bin/sh\necho hi\n").unwrap(), FileKind::Script);
  }

  #[test]
  fn unknown_for_short_or_garbage_input() {
    assert!(matches!(classify("x", b"ab"), Err(DetectError::TooShort(2))));
    assert!(matches!(classify("x", b"\x01\x02\x03\x04garbage"), Err(DetectError::Unknown)));
  }

  #[test]
  fn detector_never_panics_on_arbitrary_bytes_ge_4() {
    for len in 4..64 {
      let buf = vec![0xAAu8; len];
      let _ = classify("x", &buf);
    }
  }

  #[test]
  fn arch_mismatch_is_reported() {
    let content = elf_header(0x3e); // x86_64
    let err = check_binary_arch(FileKind::Binary, &content, HostOs::Linux, Arch::Arm64).unwrap_err();
    assert!(matches!(err, DetectError::ArchMismatch { found: "x86_64", host: "ARM64" }));
  }

  #[test]
  fn macho_on_linux_is_os_mismatch() {
    let mut content = vec![0u8; 32];
    content[0..4].copy_from_slice(&MACHO_MAGICS[3]);
    let err = check_binary_arch(FileKind::MachO, &content, HostOs::Linux, Arch::X86_64).unwrap_err();
    assert!(matches!(err, DetectError::OsMismatch { .. }));
  }
}
