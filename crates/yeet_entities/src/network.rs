use std::{collections::BTreeMap, fmt, net::Ipv4Addr, str::FromStr};

use serde::{Deserialize, Serialize};

/// IANA protocol numbers the port-map understands.
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// `proto/port`, e.g. `6/8080`. Canonical string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtoPort {
  pub proto: u8,
  pub port: u16,
}

impl ProtoPort {
  pub fn new(proto: u8, port: u16) -> Result<Self, ProtoPortError> {
    if proto != PROTO_TCP && proto != PROTO_UDP {
      return Err(ProtoPortError::BadProto(proto));
    }
    if port == 0 {
      return Err(ProtoPortError::BadPort(port));
    }
    Ok(ProtoPort { proto, port })
  }

  pub fn tcp(port: u16) -> Result<Self, ProtoPortError> {
    Self::new(PROTO_TCP, port)
  }

  pub fn udp(port: u16) -> Result<Self, ProtoPortError> {
    Self::new(PROTO_UDP, port)
  }

  /// The name iptables expects in a `-p` flag.
  pub fn iptables_name(&self) -> &'static str {
    if self.proto == PROTO_TCP { "tcp" } else { "udp" }
  }
}

impl fmt::Display for ProtoPort {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.proto, self.port)
  }
}

impl FromStr for ProtoPort {
  type Err = ProtoPortError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (proto, port) = s
      .split_once('/')
      .ok_or_else(|| ProtoPortError::Malformed(s.to_string()))?;
    let proto: u8 = proto
      .parse()
      .map_err(|_| ProtoPortError::Malformed(s.to_string()))?;
    let port: u16 = port
      .parse()
      .map_err(|_| ProtoPortError::Malformed(s.to_string()))?;
    ProtoPort::new(proto, port)
  }
}

impl TryFrom<String> for ProtoPort {
  type Error = ProtoPortError;
  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<ProtoPort> for String {
  fn from(value: ProtoPort) -> Self {
    value.to_string()
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoPortError {
  #[error("malformed proto/port string {0:?}")]
  Malformed(String),
  #[error("proto {0} is not tcp(6) or udp(17)")]
  BadProto(u8),
  #[error("port {0} out of range [1,65535]")]
  BadPort(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapEntry {
  pub endpoint_id: String,
  pub container_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerNetworkRecord {
  pub id: String,
  pub netns_path: String,
  pub gateway: Ipv4Addr,
  /// CIDR, e.g. `172.30.0.0/24`.
  pub range: String,
  #[serde(default)]
  pub endpoints: BTreeMap<String, Ipv4Addr>,
  #[serde(default)]
  pub port_map: BTreeMap<ProtoPort, PortMapEntry>,
}

impl DockerNetworkRecord {
  pub fn has_endpoint(&self, id: &str) -> bool {
    self.endpoints.contains_key(id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn proto_port_round_trips() {
    let pp = ProtoPort::tcp(8080).unwrap();
    assert_eq!(pp.to_string(), "6/8080");
    assert_eq!("6/8080".parse::<ProtoPort>().unwrap(), pp);
  }

  #[test]
  fn proto_port_rejects_bad_proto() {
    assert!(ProtoPort::new(1, 80).is_err());
    assert!(ProtoPort::new(6, 0).is_err());
    assert!("tcp/80".parse::<ProtoPort>().is_err());
  }
}
