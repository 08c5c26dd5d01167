use serde::{Deserialize, Serialize};

/// The error taxonomy, carried end-to-end in the RPC trailer frame and
/// mapped onto the OCI distribution JSON error body at the registry
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum ErrorKind {
  /// Invalid repo name, unknown tag, malformed copy destination, unknown
  /// command, unknown service.
  User,
  /// Architecture mismatch, compose lacks `services:`, tar traversal entry.
  Validation,
  /// Docker daemon unavailable, image-inspect failure, peer RPC timeout.
  Transient,
  /// Store write failure, netlink failure, netfilter error.
  Infra,
  /// The child process exited non-zero; carries the exit code so the
  /// client can forward it verbatim.
  RemoteExit(i32),
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct YeetError {
  pub kind: ErrorKind,
  pub message: String,
}

impl YeetError {
  pub fn user(message: impl Into<String>) -> Self {
    YeetError { kind: ErrorKind::User, message: message.into() }
  }

  pub fn validation(message: impl Into<String>) -> Self {
    YeetError { kind: ErrorKind::Validation, message: message.into() }
  }

  pub fn transient(message: impl Into<String>) -> Self {
    YeetError { kind: ErrorKind::Transient, message: message.into() }
  }

  pub fn infra(message: impl Into<String>) -> Self {
    YeetError { kind: ErrorKind::Infra, message: message.into() }
  }

  pub fn remote_exit(code: i32) -> Self {
    YeetError {
      kind: ErrorKind::RemoteExit(code),
      message: format!("remote process exited with code {code}"),
    }
  }

  /// The conventional local-error exit code.
  pub const LOCAL_ERROR_EXIT_CODE: i32 = 2;

  /// The exit code a client should surface for this error.
  pub fn client_exit_code(&self) -> i32 {
    match self.kind {
      ErrorKind::RemoteExit(code) => code,
      _ => Self::LOCAL_ERROR_EXIT_CODE,
    }
  }
}
