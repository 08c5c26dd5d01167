//! Spawns the child process behind an `Exec` request and pumps its I/O
//! into/out of `Frame`s. TTY sessions run the child behind a PTY master/
//! slave pair (grounded on the PTY reader/writer/waiter task trio in the
//! teacher's own terminal session handling); non-TTY sessions run the
//! child directly with piped stdio, which is cheaper and needs no
//! blocking-thread pumps.
//!
//! Cancellation sends SIGTERM to the child, waits a grace period, then
//! SIGKILL.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use nix::{
  sys::signal::{self, Signal},
  unistd::Pid,
};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  process::Command,
  sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use yeet_entities::frame::{encode_exit, Frame, FrameTag};

/// How long after SIGTERM to wait before escalating to SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

pub enum StdinMsg {
  Data(Bytes),
  Resize(u16, u16),
}

pub struct ExecHandle {
  pub stdin: mpsc::Sender<StdinMsg>,
  pub output: mpsc::Receiver<Frame>,
  cancel: CancellationToken,
}

impl ExecHandle {
  /// Sends SIGTERM immediately; the child-wait task escalates to SIGKILL
  /// if the process is still alive after `TERMINATE_GRACE`.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }
}

pub struct Spawn {
  pub command: String,
  pub args: Vec<String>,
  pub cwd: Option<PathBuf>,
  pub tty: bool,
  pub width: u16,
  pub height: u16,
}

pub async fn spawn(spec: Spawn) -> Result<ExecHandle> {
  if spec.tty {
    spawn_pty(spec).await
  } else {
    spawn_plain(spec).await
  }
}

fn send_sigterm(pid: i32) {
  if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
    debug!(pid, error = %e, "SIGTERM delivery failed (process likely already gone)");
  }
}

async fn spawn_plain(spec: Spawn) -> Result<ExecHandle> {
  let mut command = Command::new(&spec.command);
  command
    .args(&spec.args)
    .stdin(std::process::Stdio::piped())
    .stdout(std::process::Stdio::piped())
    .stderr(std::process::Stdio::piped())
    .kill_on_drop(true);
  if let Some(cwd) = &spec.cwd {
    command.current_dir(cwd);
  }
  let mut child = command.spawn().context("failed to spawn child process")?;
  let pid = child.id().context("spawned child has no pid")? as i32;

  let mut stdin_pipe = child.stdin.take().context("child stdin not piped")?;
  let mut stdout_pipe = child.stdout.take().context("child stdout not piped")?;
  let mut stderr_pipe = child.stderr.take().context("child stderr not piped")?;

  let (stdin_tx, mut stdin_rx) = mpsc::channel::<StdinMsg>(64);
  let (output_tx, output_rx) = mpsc::channel::<Frame>(64);
  let cancel = CancellationToken::new();

  tokio::spawn(async move {
    while let Some(msg) = stdin_rx.recv().await {
      if let StdinMsg::Data(bytes) = msg {
        if stdin_pipe.write_all(&bytes).await.is_err() {
          break;
        }
      }
    }
  });

  let stdout_tx = output_tx.clone();
  tokio::spawn(async move {
    let mut buf = [0u8; 8192];
    loop {
      match stdout_pipe.read(&mut buf).await {
        Ok(0) | Err(_) => break,
        Ok(n) => {
          if stdout_tx.send(Frame::new(FrameTag::Stdout, Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
            break;
          }
        }
      }
    }
  });

  let stderr_tx = output_tx.clone();
  tokio::spawn(async move {
    let mut buf = [0u8; 8192];
    loop {
      match stderr_pipe.read(&mut buf).await {
        Ok(0) | Err(_) => break,
        Ok(n) => {
          if stderr_tx.send(Frame::new(FrameTag::Stderr, Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
            break;
          }
        }
      }
    }
  });

  let wait_cancel = cancel.clone();
  tokio::spawn(async move {
    let exit_code = tokio::select! {
      status = child.wait() => status.ok().and_then(|s| s.code()).unwrap_or(-1),
      _ = wait_cancel.cancelled() => {
        send_sigterm(pid);
        tokio::select! {
          status = child.wait() => status.ok().and_then(|s| s.code()).unwrap_or(-1),
          _ = tokio::time::sleep(TERMINATE_GRACE) => {
            warn!(pid, "child did not exit after SIGTERM, sending SIGKILL");
            let _ = child.start_kill();
            child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1)
          }
        }
      }
    };
    let _ = output_tx.send(Frame::new(FrameTag::Exit, encode_exit(exit_code))).await;
  });

  Ok(ExecHandle { stdin: stdin_tx, output: output_rx, cancel })
}

async fn spawn_pty(spec: Spawn) -> Result<ExecHandle> {
  let pty_system = native_pty_system();
  let pair = pty_system
    .openpty(PtySize { rows: spec.height.max(1), cols: spec.width.max(1), pixel_width: 0, pixel_height: 0 })
    .context("failed to open pty")?;

  let mut cmd = CommandBuilder::new(&spec.command);
  cmd.args(&spec.args);
  if let Some(cwd) = &spec.cwd {
    cmd.cwd(cwd);
  }
  cmd.env("TERM", "xterm-256color");

  let mut child = pair.slave.spawn_command(cmd).context("failed to spawn pty child")?;
  drop(pair.slave);
  let pid = child.process_id().map(|p| p as i32);

  let mut pty_writer = pair.master.take_writer().context("failed to take pty writer")?;
  let mut pty_reader = pair.master.try_clone_reader().context("failed to clone pty reader")?;

  let (stdin_tx, stdin_rx) = mpsc::channel::<StdinMsg>(64);
  let (output_tx, output_rx) = mpsc::channel::<Frame>(64);
  let cancel = CancellationToken::new();

  let writer_cancel = cancel.clone();
  let master = pair.master;
  tokio::task::spawn_blocking(move || {
    let mut stdin_rx = stdin_rx;
    loop {
      if writer_cancel.is_cancelled() {
        break;
      }
      match stdin_rx.blocking_recv() {
        Some(StdinMsg::Data(bytes)) => {
          if pty_writer.write_all(&bytes).is_err() {
            break;
          }
        }
        Some(StdinMsg::Resize(rows, cols)) => {
          let _ = master.resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 });
        }
        None => break,
      }
    }
  });

  let reader_tx = output_tx.clone();
  let reader_cancel = cancel.clone();
  tokio::task::spawn_blocking(move || {
    let mut buf = [0u8; 8192];
    loop {
      if reader_cancel.is_cancelled() {
        break;
      }
      match pty_reader.read(&mut buf) {
        Ok(0) | Err(_) => break,
        Ok(n) => {
          if reader_tx.blocking_send(Frame::new(FrameTag::Stdout, Bytes::copy_from_slice(&buf[..n]))).is_err() {
            break;
          }
        }
      }
    }
  });

  let wait_cancel = cancel.clone();
  tokio::task::spawn_blocking(move || {
    let mut sent_term = false;
    let exit_code = loop {
      if wait_cancel.is_cancelled() && !sent_term {
        sent_term = true;
        if let Some(pid) = pid {
          send_sigterm(pid);
        }
      }
      match child.try_wait() {
        Ok(Some(status)) => break status.exit_code() as i32,
        Ok(None) => std::thread::sleep(Duration::from_millis(200)),
        Err(_) => break -1,
      }
    };
    output_tx.blocking_send(Frame::new(FrameTag::Exit, encode_exit(exit_code))).ok();
  });

  Ok(ExecHandle { stdin: stdin_tx, output: output_rx, cancel })
}
