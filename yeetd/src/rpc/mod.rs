//! The multiplexed binary-frame RPC server. One TCP connection carries one
//! request: a `Request` frame (JSON `ExecRequest`) opens the stream, then
//! `Stdin`/`Resize` frames flow client->server and `Stdout`/`Stderr`/`Event`
//! frames flow server->client, terminated by an `Exit` frame (for commands
//! that ran a child process) and always a closing `Trailer` frame.

pub mod copy;
pub mod dispatch;
pub mod exec;
pub mod frame_io;

use std::{net::IpAddr, sync::Arc};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, instrument, warn};
use yeet_entities::{
  frame::{encode_exit, parse_resize, Frame, FrameTag},
  rpc::ExecRequest,
  Log, ServiceKind, YeetError,
};

use crate::artifact::Layout;
use dispatch::{Dispatcher, Outcome};
use exec::{spawn, Spawn, StdinMsg};
use frame_io::{FrameReader, FrameWriter};

pub struct RpcServer {
  dispatcher: Arc<Dispatcher>,
  layout: Arc<Layout>,
}

impl RpcServer {
  pub fn new(dispatcher: Arc<Dispatcher>, layout: Arc<Layout>) -> Self {
    RpcServer { dispatcher, layout }
  }

  pub async fn serve(self: Arc<Self>, bind_ip: IpAddr, port: u16) -> Result<()> {
    let listener = TcpListener::bind((bind_ip, port)).await.context("failed to bind rpc listener")?;
    info!(%bind_ip, port, "rpc server listening");
    loop {
      let (stream, peer) = listener.accept().await.context("rpc accept failed")?;
      let this = self.clone();
      tokio::spawn(async move {
        if let Err(e) = this.handle_connection(stream).await {
          warn!(%peer, error = %e, "rpc connection ended with error");
        }
      });
    }
  }

  #[instrument(skip(self, stream))]
  async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    self.serve_frames(read_half, write_half).await
  }

  /// Does the actual framing/dispatch work, generic over the transport so
  /// tests can drive it over `tokio::io::duplex` instead of a real socket.
  async fn serve_frames<R, W>(&self, read_half: R, write_half: W) -> Result<()>
  where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
  {
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let Some(first) = reader.read_frame().await? else {
      return Ok(());
    };
    if first.tag != FrameTag::Request {
      bail!("first frame on a connection must be a Request frame, got {:?}", first.tag);
    }
    let req: ExecRequest = serde_json::from_slice(&first.payload).context("malformed ExecRequest json")?;

    let outcome = self.run_request(&req, &mut reader, &mut writer).await;
    let trailer_body = match outcome {
      Ok(()) => Bytes::new(),
      Err(err) => {
        let yeet_err = to_yeet_error(&err);
        Bytes::from(serde_json::to_vec(&yeet_err).unwrap_or_default())
      }
    };
    writer.write_frame(&Frame::new(FrameTag::Trailer, trailer_body)).await?;
    Ok(())
  }

  async fn run_request<R, W>(&self, req: &ExecRequest, reader: &mut FrameReader<R>, writer: &mut FrameWriter<W>) -> Result<()>
  where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
  {
    if req.payload_file_name.is_some() {
      return self.run_payload_command(req, reader, writer).await;
    }
    if req.tty {
      return self.run_interactive(req, reader, writer).await;
    }
    self.run_one_shot(req, writer).await
  }

  /// `run`/`stage`/`cron`: drain stdin frames into a staging file, then hand
  /// off to `Dispatcher::install_payload`.
  async fn run_payload_command<R, W>(&self, req: &ExecRequest, reader: &mut FrameReader<R>, writer: &mut FrameWriter<W>) -> Result<()>
  where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
  {
    use tokio::io::AsyncWriteExt;
    let payload_file_name = req.payload_file_name.as_deref().context("payload command missing payload_file_name")?;
    self.layout.ensure_service_dirs(&req.service).await?;
    let staged_path = self.layout.bin_dir(&req.service).join("upload-staging");
    let mut staged = tokio::fs::File::create(&staged_path).await.context("failed to create staging file")?;

    loop {
      let Some(frame) = reader.read_frame().await? else { break };
      match frame.tag {
        FrameTag::Stdin => staged.write_all(&frame.payload).await.context("failed to write staged payload")?,
        FrameTag::Trailer => break,
        other => bail!("unexpected frame {other:?} while receiving payload"),
      }
    }
    staged.flush().await.ok();
    drop(staged);

    let kind = default_kind_for(req);
    let command = req.command().unwrap_or_default();
    let stage_only = command == "stage";
    let cron_expr = if command == "cron" { req.args.get(1).map(String::as_str) } else { None };

    let result = self
      .dispatcher
      .install_payload(&req.service, kind, &staged_path, payload_file_name, !stage_only, stage_only, cron_expr)
      .await;
    let _ = tokio::fs::remove_file(&staged_path).await;

    match result {
      Ok(log) => {
        emit_log(writer, &log).await?;
        writer.write_frame(&Frame::new(FrameTag::Exit, encode_exit(0))).await?;
        Ok(())
      }
      Err(err) => Err(err.into()),
    }
  }

  /// Interactive (`tty: true`) exec: spawns a PTY session and pumps frames
  /// both directions until the child exits or the client closes the stream.
  async fn run_interactive<R, W>(&self, req: &ExecRequest, reader: &mut FrameReader<R>, writer: &mut FrameWriter<W>) -> Result<()>
  where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
  {
    let command = req.command().context("missing command")?.to_string();
    let mut handle = spawn(Spawn {
      command,
      args: req.args[1..].to_vec(),
      cwd: Some(self.layout.service_dir(&req.service)),
      tty: true,
      width: req.width,
      height: req.height,
    })
    .await?;

    loop {
      tokio::select! {
        incoming = reader.read_frame() => {
          match incoming? {
            None => { handle.cancel(); break; }
            Some(frame) => match frame.tag {
              FrameTag::Stdin => { let _ = handle.stdin.send(StdinMsg::Data(frame.payload)).await; }
              FrameTag::Resize => {
                if let Some((rows, cols)) = parse_resize(&frame.payload) {
                  let _ = handle.stdin.send(StdinMsg::Resize(rows, cols)).await;
                }
              }
              FrameTag::Trailer => { handle.cancel(); }
              other => bail!("unexpected frame {other:?} during interactive exec"),
            },
          }
        }
        outgoing = handle.output.recv() => {
          match outgoing {
            None => break,
            Some(frame) => {
              let is_exit = frame.tag == yeet_entities::frame::FrameTag::Exit;
              writer.write_frame(&frame).await?;
              if is_exit {
                break;
              }
            }
          }
        }
      }
    }
    Ok(())
  }

  /// Every other command: resolved synchronously through `Dispatcher::dispatch`.
  async fn run_one_shot<W>(&self, req: &ExecRequest, writer: &mut FrameWriter<W>) -> Result<()>
  where
    W: tokio::io::AsyncWrite + Unpin,
  {
    let outcome = self.dispatcher.dispatch(&req.service, &req.args).await?;
    match outcome {
      Outcome::Log(log) => {
        emit_log(writer, &log).await?;
        writer.write_frame(&Frame::new(FrameTag::Exit, encode_exit(exit_code_for(&log)))).await?;
      }
      Outcome::Logs(logs) => {
        let all_success = logs.iter().all(|l| l.success);
        for log in &logs {
          emit_log(writer, log).await?;
        }
        writer.write_frame(&Frame::new(FrameTag::Exit, encode_exit(if all_success { 0 } else { 1 }))).await?;
      }
      Outcome::Status(status) => {
        let body = serde_json::to_vec(&status.iter().map(|(k, v)| (k.clone(), format!("{v:?}"))).collect::<std::collections::BTreeMap<_, _>>())
          .context("failed to serialize status")?;
        writer.write_frame(&Frame::new(FrameTag::Event, body)).await?;
        writer.write_frame(&Frame::new(FrameTag::Exit, encode_exit(0))).await?;
      }
    }
    Ok(())
  }
}

fn default_kind_for(req: &ExecRequest) -> ServiceKind {
  match req.payload_file_name.as_deref() {
    Some(name) if name.ends_with(".service") || name.ends_with(".timer") => ServiceKind::Systemd,
    _ => ServiceKind::Compose,
  }
}

async fn emit_log<W: tokio::io::AsyncWrite + Unpin>(writer: &mut FrameWriter<W>, log: &Log) -> Result<()> {
  let body = serde_json::to_vec(log).context("failed to serialize log")?;
  writer.write_frame(&Frame::new(FrameTag::Event, body)).await
}

fn exit_code_for(log: &Log) -> i32 {
  if log.success {
    0
  } else {
    YeetError::LOCAL_ERROR_EXIT_CODE
  }
}

fn to_yeet_error(err: &anyhow::Error) -> YeetError {
  if let Some(yeet_err) = err.downcast_ref::<YeetError>() {
    return yeet_err.clone();
  }
  YeetError::infra(err.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use dispatch::SupervisorFactory;
  use std::sync::Arc;
  use yeet_entities::{store::StoreData, Service};

  struct NoopSupervisor;

  #[async_trait::async_trait]
  impl crate::supervisor::Supervisor for NoopSupervisor {
    async fn install(&self, _pull: bool) -> anyhow::Result<Log> {
      Ok(Log::simple("install", "ok"))
    }
    async fn up(&self, _pull: bool) -> anyhow::Result<Log> {
      Ok(Log::simple("up", "ok"))
    }
    async fn pull(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("pull", "ok"))
    }
    async fn update(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("update", "ok"))
    }
    async fn remove(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("remove", "ok"))
    }
    async fn down(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("down", "ok"))
    }
    async fn start(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("start", "ok"))
    }
    async fn stop(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("stop", "ok"))
    }
    async fn restart(&self) -> anyhow::Result<Log> {
      Ok(Log::simple("restart", "ok"))
    }
    async fn status(&self) -> anyhow::Result<std::collections::BTreeMap<String, crate::supervisor::Status>> {
      Ok(std::collections::BTreeMap::new())
    }
    async fn logs(&self, _opts: crate::supervisor::LogOptions) -> anyhow::Result<Vec<Log>> {
      Ok(vec![])
    }
  }

  struct NoopFactory;
  impl SupervisorFactory for NoopFactory {
    fn build(&self, _service: &str, _kind: ServiceKind, _schedule: Option<&str>) -> Box<dyn crate::supervisor::Supervisor> {
      Box::new(NoopSupervisor)
    }
  }

  async fn test_server() -> (tempfile::TempDir, RpcServer) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(crate::store::Store::new(dir.path().join("db.json")));
    store
      .mutate(|data: &mut StoreData| {
        data.services.insert("svc-a".to_string(), Service::new("svc-a", ServiceKind::Compose));
        Ok(())
      })
      .await
      .unwrap();
    let layout = Arc::new(Layout::new(dir.path()));
    let dispatcher = Arc::new(Dispatcher::new(store, layout.clone(), Arc::new(NoopFactory)));
    (dir, RpcServer::new(dispatcher, layout))
  }

  #[tokio::test]
  async fn one_shot_status_round_trips_over_frames() {
    let (_dir, server) = test_server().await;
    let (client, srv) = tokio::io::duplex(65536);
    let (client_r, client_w) = tokio::io::split(client);
    let (srv_r, srv_w) = tokio::io::split(srv);

    let handle = tokio::spawn(async move { server.serve_frames(srv_r, srv_w).await });

    let mut client_writer = FrameWriter::new(client_w);
    let req = ExecRequest {
      service: "svc-a".to_string(),
      args: vec!["status".to_string()],
      tty: false,
      payload_file_name: None,
      width: 0,
      height: 0,
      term: None,
      progress_mode: Default::default(),
      host_hint: None,
    };
    client_writer
      .write_frame(&Frame::new(FrameTag::Request, serde_json::to_vec(&req).unwrap()))
      .await
      .unwrap();

    let mut client_reader = FrameReader::new(client_r);
    let event = client_reader.read_frame().await.unwrap().unwrap();
    assert_eq!(event.tag, FrameTag::Event);
    let exit = client_reader.read_frame().await.unwrap().unwrap();
    assert_eq!(exit.tag, FrameTag::Exit);
    let trailer = client_reader.read_frame().await.unwrap().unwrap();
    assert_eq!(trailer.tag, FrameTag::Trailer);
    assert!(trailer.payload.is_empty());

    handle.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn unknown_command_produces_a_nonempty_trailer() {
    let (_dir, server) = test_server().await;
    let (client, srv) = tokio::io::duplex(65536);
    let (client_r, client_w) = tokio::io::split(client);
    let (srv_r, srv_w) = tokio::io::split(srv);

    let handle = tokio::spawn(async move { server.serve_frames(srv_r, srv_w).await });

    let mut client_writer = FrameWriter::new(client_w);
    let req = ExecRequest {
      service: "svc-a".to_string(),
      args: vec!["bogus".to_string()],
      tty: false,
      payload_file_name: None,
      width: 0,
      height: 0,
      term: None,
      progress_mode: Default::default(),
      host_hint: None,
    };
    client_writer
      .write_frame(&Frame::new(FrameTag::Request, serde_json::to_vec(&req).unwrap()))
      .await
      .unwrap();
    drop(client_writer);

    let mut client_reader = FrameReader::new(client_r);
    let trailer = client_reader.read_frame().await.unwrap().unwrap();
    assert_eq!(trailer.tag, FrameTag::Trailer);
    assert!(!trailer.payload.is_empty());

    handle.await.unwrap().unwrap();
  }
}
