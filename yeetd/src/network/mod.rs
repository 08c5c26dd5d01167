//! The three concerns of network management: per-service namespace
//! reconcile, the docker network-driver plugin, and the port-forwarding
//! netfilter chain invariants. None of these hold a reference back into
//! the `Store` — they operate on values handed to them and report what
//! they did as `Log`s.

pub mod chains;
pub mod namespace;
pub mod plugin;

pub use namespace::{MacvlanSpec, NamespaceSpec, SHARED_HOST_NETNS};
pub use plugin::{PluginState, PLUGIN_SOCKET_PATH};
