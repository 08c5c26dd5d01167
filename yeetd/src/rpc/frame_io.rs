//! Buffers bytes off an `AsyncRead`/`AsyncWrite` stream and hands back
//! whole frames per `yeet_entities::frame`. The wire format itself is
//! defined there; this module only adds the executor-side read loop.

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use yeet_entities::frame::{try_parse_frame, Frame};

pub struct FrameReader<R> {
  inner: R,
  buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
  pub fn new(inner: R) -> Self {
    FrameReader { inner, buf: BytesMut::with_capacity(8192) }
  }

  /// `Ok(None)` means clean EOF with nothing buffered; an EOF that leaves
  /// a partial frame in the buffer is an error.
  pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
    loop {
      if let Some((frame, consumed)) = try_parse_frame(&self.buf).context("malformed frame on stream")? {
        let _ = self.buf.split_to(consumed);
        return Ok(Some(frame));
      }
      let mut chunk = [0u8; 8192];
      let n = self.inner.read(&mut chunk).await.context("frame stream read failed")?;
      if n == 0 {
        if self.buf.is_empty() {
          return Ok(None);
        }
        bail!("stream ended with a partial frame buffered");
      }
      self.buf.extend_from_slice(&chunk[..n]);
    }
  }
}

pub struct FrameWriter<W> {
  inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
  pub fn new(inner: W) -> Self {
    FrameWriter { inner }
  }

  pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
    let mut out = BytesMut::new();
    frame.encode(&mut out);
    self.inner.write_all(&out).await.context("frame stream write failed")?;
    self.inner.flush().await.context("frame stream flush failed")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use yeet_entities::frame::FrameTag;

  #[tokio::test]
  async fn frames_round_trip_over_a_duplex_stream() {
    let (client, server) = tokio::io::duplex(64);
    let (client_r, client_w) = tokio::io::split(client);
    let (server_r, server_w) = tokio::io::split(server);
    let mut writer = FrameWriter::new(client_w);
    let mut reader = FrameReader::new(server_r);
    drop(client_r);
    drop(server_w);

    writer.write_frame(&Frame::new(FrameTag::Stdout, Bytes::from_static(b"hello"))).await.unwrap();
    writer.write_frame(&Frame::new(FrameTag::Exit, yeet_entities::frame::encode_exit(0))).await.unwrap();

    let first = reader.read_frame().await.unwrap().unwrap();
    assert_eq!(first.tag, FrameTag::Stdout);
    assert_eq!(&first.payload[..], b"hello");

    let second = reader.read_frame().await.unwrap().unwrap();
    assert_eq!(second.tag, FrameTag::Exit);
  }

  #[tokio::test]
  async fn reader_reassembles_a_frame_split_across_many_reads() {
    let mut full = BytesMut::new();
    Frame::new(FrameTag::Stdout, Bytes::from_static(b"0123456789")).encode(&mut full);
    let chunks: Vec<Vec<u8>> = full.chunks(3).map(|c| c.to_vec()).collect();
    let (reader_half, mut writer_half) = tokio::io::duplex(4096);
    tokio::spawn(async move {
      for chunk in chunks {
        writer_half.write_all(&chunk).await.unwrap();
      }
    });
    let mut reader = FrameReader::new(reader_half);
    let frame = reader.read_frame().await.unwrap().unwrap();
    assert_eq!(&frame.payload[..], b"0123456789");
  }

  #[tokio::test]
  async fn clean_eof_with_nothing_buffered_is_none() {
    let (reader_half, writer_half) = tokio::io::duplex(64);
    drop(writer_half);
    let mut reader = FrameReader::new(reader_half);
    assert!(reader.read_frame().await.unwrap().is_none());
  }
}
