//! The wire envelope: `(tag: 1 byte, length: varint, payload: bytes)`. This
//! module only knows about bytes; the async read/write pump lives in
//! `yeetd::rpc::frame_io` since it needs an executor to await on.

use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
  /// Client -> server: the initial `ExecRequest`, serialized as JSON.
  Request = 0,
  /// Client -> server: a chunk of stdin.
  Stdin = 1,
  /// Server -> client: a chunk of stdout.
  Stdout = 2,
  /// Server -> client: a chunk of stderr.
  Stderr = 3,
  /// Client -> server: a PTY resize.
  Resize = 4,
  /// Server -> client: the child's terminal exit code.
  Exit = 5,
  /// Server -> client: a progress/status event.
  Event = 6,
  /// Server -> client, stream-terminating: a structured error, or empty on
  /// clean completion without an explicit exit frame (e.g. `events`).
  Trailer = 7,
}

impl FrameTag {
  pub fn from_byte(b: u8) -> Option<Self> {
    Some(match b {
      0 => FrameTag::Request,
      1 => FrameTag::Stdin,
      2 => FrameTag::Stdout,
      3 => FrameTag::Stderr,
      4 => FrameTag::Resize,
      5 => FrameTag::Exit,
      6 => FrameTag::Event,
      7 => FrameTag::Trailer,
      _ => return None,
    })
  }
}

#[derive(Debug, Clone)]
pub struct Frame {
  pub tag: FrameTag,
  pub payload: Bytes,
}

impl Frame {
  pub fn new(tag: FrameTag, payload: impl Into<Bytes>) -> Self {
    Frame { tag, payload: payload.into() }
  }

  /// Encode `(tag, varint length, payload)` into `out`.
  pub fn encode(&self, out: &mut BytesMut) {
    out.put_u8(self.tag as u8);
    put_varint(out, self.payload.len() as u64);
    out.extend_from_slice(&self.payload);
  }
}

/// LEB128 unsigned varint, 7 bits per byte, high bit set = more bytes follow.
pub fn put_varint(out: &mut BytesMut, mut value: u64) {
  loop {
    let byte = (value & 0x7f) as u8;
    value >>= 7;
    if value == 0 {
      out.put_u8(byte);
      break;
    } else {
      out.put_u8(byte | 0x80);
    }
  }
}

/// Maximum frame payload: 64 MiB. Guards against a malformed/adversarial
/// length prefix causing unbounded allocation.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum VarintError {
  #[error("need more bytes")]
  Incomplete,
  #[error("varint exceeds the maximum frame length")]
  TooLarge,
}

/// Decode a varint from the front of `buf` without consuming it on
/// incompleteness. Returns `(value, bytes_consumed)`.
pub fn get_varint(buf: &[u8]) -> Result<(u64, usize), VarintError> {
  let mut value: u64 = 0;
  for (i, &byte) in buf.iter().enumerate() {
    if i >= 10 {
      return Err(VarintError::TooLarge);
    }
    value |= ((byte & 0x7f) as u64) << (7 * i);
    if byte & 0x80 == 0 {
      if value > MAX_FRAME_LEN {
        return Err(VarintError::TooLarge);
      }
      return Ok((value, i + 1));
    }
  }
  Err(VarintError::Incomplete)
}

/// Try to parse one full frame from the front of `buf`. Returns
/// `(frame, bytes_consumed)` on success, `None` if more bytes are needed.
/// `buf` is left untouched either way; the caller advances its cursor.
pub fn try_parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, VarintError> {
  if buf.is_empty() {
    return Ok(None);
  }
  let tag_byte = buf[0];
  let tag = FrameTag::from_byte(tag_byte).ok_or(VarintError::TooLarge)?;
  let (len, len_bytes) = match get_varint(&buf[1..]) {
    Ok(v) => v,
    Err(VarintError::Incomplete) => return Ok(None),
    Err(e) => return Err(e),
  };
  let header_len = 1 + len_bytes;
  let total_len = header_len + len as usize;
  if buf.len() < total_len {
    return Ok(None);
  }
  let payload = Bytes::copy_from_slice(&buf[header_len..total_len]);
  Ok(Some((Frame::new(tag, payload), total_len)))
}

pub fn parse_resize(payload: &[u8]) -> Option<(u16, u16)> {
  if payload.len() != 4 {
    return None;
  }
  let mut buf = payload;
  let rows = buf.get_u16();
  let cols = buf.get_u16();
  Some((rows, cols))
}

pub fn encode_resize(rows: u16, cols: u16) -> Bytes {
  let mut out = BytesMut::with_capacity(4);
  out.put_u16(rows);
  out.put_u16(cols);
  out.freeze()
}

pub fn parse_exit(payload: &[u8]) -> Option<i32> {
  if payload.len() != 4 {
    return None;
  }
  let mut buf = payload;
  Some(buf.get_i32())
}

pub fn encode_exit(code: i32) -> Bytes {
  let mut out = BytesMut::with_capacity(4);
  out.put_i32(code);
  out.freeze()
}
