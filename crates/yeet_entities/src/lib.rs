//! Shared types for the `yeetd` host agent: the on-disk/store records, the
//! RPC wire frames, and the error taxonomy. A dependency-light crate that
//! both the agent's internals and (conceptually) a client share, with no
//! behavior of its own beyond (de)serialization and small
//! invariants-preserving constructors.

pub mod artifact;
pub mod error;
pub mod frame;
pub mod image;
pub mod log;
pub mod network;
pub mod rpc;
pub mod service;
pub mod store;

pub use artifact::{ArtifactKind, ArtifactRef, ArtifactStore};
pub use error::{ErrorKind, YeetError};
pub use image::{ImageRepo, ManifestRecord};
pub use log::Log;
pub use network::{DockerNetworkRecord, ProtoPort};
pub use service::{Service, ServiceKind};
pub use store::StoreData;

/// Milliseconds since the epoch. Every persisted record stamps with this
/// whenever it needs a cheap, monotonic-enough creation/update marker.
pub fn yeet_timestamp() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

/// `name` must match `[A-Za-z0-9_-]+` and be non-empty.
pub fn valid_service_name(name: &str) -> bool {
  !name.is_empty()
    && name
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
