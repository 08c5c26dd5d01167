//! Shell-command execution with captured output and timing. Every
//! supervisor and network-manager operation in `yeetd` that shells out goes
//! through this so that every invocation becomes one `Log` the RPC layer
//! can stream back as an `event` frame.

use std::path::Path;

use run_command::async_run_command;
use yeet_entities::{yeet_timestamp, Log};

/// Runs `command` (optionally `cd`-ed into `path` first) and turns the
/// result into a `Log`. Never returns an `Err` for a nonzero exit — that is
/// reported via `Log::success`; a failed shell command is data, not a Rust
/// error, and callers decide whether a nonzero exit should abort the
/// surrounding operation.
pub async fn run_yeet_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> Log {
  let command = if let Some(path) = path.into() {
    format!("cd {} && {}", path.display(), command.as_ref())
  } else {
    command.as_ref().to_string()
  };
  let start_ts = yeet_timestamp();
  let output = async_run_command(&command).await;
  output_into_log(stage, command, start_ts, output)
}

pub fn output_into_log(
  stage: &str,
  command: String,
  start_ts: i64,
  output: run_command::CommandOutput,
) -> Log {
  let success = output.success();
  Log {
    stage: stage.to_string(),
    command,
    stdout: output.stdout,
    stderr: output.stderr,
    success,
    start_ts,
    end_ts: yeet_timestamp(),
  }
}
