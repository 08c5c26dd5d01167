use serde::{Deserialize, Serialize};

use crate::yeet_timestamp;

/// The record of a single shell invocation. Streamed back to the RPC
/// client as `event` frames and also kept in the response of supervisor
/// operations that run more than one command (e.g. compose `Up`, which may
/// pre-pull then recreate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: i64,
  pub end_ts: i64,
}

impl Log {
  pub fn simple(stage: impl Into<String>, stdout: impl Into<String>) -> Log {
    let ts = yeet_timestamp();
    Log {
      stage: stage.into(),
      command: String::new(),
      stdout: stdout.into(),
      stderr: String::new(),
      success: true,
      start_ts: ts,
      end_ts: ts,
    }
  }

  pub fn error(stage: impl Into<String>, stderr: impl Into<String>) -> Log {
    let ts = yeet_timestamp();
    Log {
      stage: stage.into(),
      command: String::new(),
      stdout: String::new(),
      stderr: stderr.into(),
      success: false,
      start_ts: ts,
      end_ts: ts,
    }
  }
}

pub fn all_logs_success(logs: &[Log]) -> bool {
  logs.iter().all(|log| log.success)
}
