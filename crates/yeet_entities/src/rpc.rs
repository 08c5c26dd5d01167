use serde::{Deserialize, Serialize};

/// How the client wants progress reported back. Plain
/// disables `event` frames entirely (used by scripted callers); Spinner and
/// Json are rendering hints interpreted only by the client — the agent
/// just tags events with the same enum so it doesn't have to special-case
/// rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
  #[default]
  Plain,
  Spinner,
  Json,
}

/// The request frame that opens every RPC stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
  pub service: String,
  pub args: Vec<String>,
  #[serde(default)]
  pub tty: bool,
  #[serde(default)]
  pub payload_file_name: Option<String>,
  #[serde(default)]
  pub width: u16,
  #[serde(default)]
  pub height: u16,
  #[serde(default)]
  pub term: Option<String>,
  #[serde(default)]
  pub progress_mode: ProgressMode,
  #[serde(default)]
  pub host_hint: Option<String>,
}

impl ExecRequest {
  pub fn command(&self) -> Option<&str> {
    self.args.first().map(String::as_str)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMsg {
  pub service: String,
  pub kind: String,
  pub message: String,
  pub ts: i64,
}
