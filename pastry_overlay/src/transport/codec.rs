use crate::core::{TransportError, WireError};
use crate::transport::{ConnectionHeader, Frame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_SIZE: usize = 4;
const READ_CHUNK: usize = 8 * 1024;

/// `[len: u32 BE][CBOR body]`
pub fn encode_frame(frame: &Frame, max_frame_size: usize) -> Result<Vec<u8>, WireError> {
  let body = serde_cbor::to_vec(frame)?;
  if body.len() > max_frame_size {
    return Err(WireError::FrameTooLarge(body.len(), max_frame_size));
  }
  let len = body.len() as u32;
  let mut buf = Vec::with_capacity(LEN_SIZE + body.len());
  buf.push((len >> 24) as u8);
  buf.push((len >> 16) as u8);
  buf.push((len >> 8) as u8);
  buf.push(len as u8);
  buf.extend_from_slice(&body);
  Ok(buf)
}

/// Reassembles frames from however the stream happens to chunk them.
pub struct FrameReader {
  buf: Vec<u8>,
  max_frame_size: usize,
  read_bytes: u64,
}
impl FrameReader {
  pub fn new(max_frame_size: usize) -> FrameReader {
    FrameReader {
      buf: Vec::new(),
      max_frame_size: max_frame_size,
      read_bytes: 0,
    }
  }

  pub fn push(&mut self, bytes: &[u8]) {
    self.read_bytes += bytes.len() as u64;
    self.buf.extend_from_slice(bytes);
  }

  /// Bytes pushed since the last call.
  pub fn take_read_bytes(&mut self) -> u64 {
    std::mem::replace(&mut self.read_bytes, 0)
  }

  /// Bytes received but not yet returned as frames.
  pub fn buffered(&self) -> usize {
    self.buf.len()
  }

  /// The next complete frame, or `None` until more bytes arrive. An oversized length prefix
  /// is an error as soon as it is seen.
  pub fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
    if self.buf.len() < LEN_SIZE {
      return Ok(None);
    }
    let mut len = 0usize;
    len |= (self.buf[0] as usize) << 24;
    len |= (self.buf[1] as usize) << 16;
    len |= (self.buf[2] as usize) << 8;
    len |= self.buf[3] as usize;
    if len > self.max_frame_size {
      return Err(WireError::FrameTooLarge(len, self.max_frame_size));
    }
    if self.buf.len() < LEN_SIZE + len {
      return Ok(None);
    }
    let frame = serde_cbor::from_slice(&self.buf[LEN_SIZE..LEN_SIZE + len]);
    self.buf.drain(..LEN_SIZE + len);
    Ok(Some(frame?))
  }

  /// Reads until a whole frame is buffered. `None` on a clean end of stream.
  pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>, TransportError>
  where
    R: AsyncRead + Unpin,
  {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
      if let Some(frame) = self.next_frame()? {
        return Ok(Some(frame));
      }
      let n = reader.read(&mut chunk[..]).await?;
      if n == 0 {
        return if self.buf.is_empty() {
          Ok(None)
        } else {
          Err(WireError::Truncated(LEN_SIZE, self.buf.len()).into())
        };
      }
      self.push(&chunk[..n]);
    }
  }
}

pub async fn write_frame<W>(
  writer: &mut W,
  frame: &Frame,
  max_frame_size: usize,
) -> Result<usize, TransportError>
where
  W: AsyncWrite + Unpin,
{
  let bytes = encode_frame(frame, max_frame_size)?;
  writer.write_all(&bytes).await?;
  Ok(bytes.len())
}

pub async fn write_header<W>(writer: &mut W, header: &ConnectionHeader) -> Result<(), TransportError>
where
  W: AsyncWrite + Unpin,
{
  writer.write_all(&header.to_bytes()).await?;
  Ok(())
}

pub async fn read_header<R>(reader: &mut R) -> Result<ConnectionHeader, TransportError>
where
  R: AsyncRead + Unpin,
{
  let mut buf = [0u8; ConnectionHeader::SIZE];
  reader.read_exact(&mut buf).await?;
  Ok(ConnectionHeader::parse(&buf[..])?)
}

#[cfg(test)]
use crate::core::{Id, NodeHandle, Socket};

#[cfg(test)]
fn hello() -> Frame {
  Frame::Hello(NodeHandle::with_epoch(
    Id::from_u128(0xabcd, 16),
    Socket::localhost(4000),
    7,
  ))
}

#[test]
fn test_reader_reassembles_split_frames() {
  let mut bytes = encode_frame(&hello(), 1024).unwrap();
  bytes.extend(encode_frame(&Frame::Ping(3), 1024).unwrap());
  let mut reader = FrameReader::new(1024);
  // one byte at a time, frames come out exactly when complete
  let mut frames = Vec::new();
  for b in bytes.iter() {
    reader.push(&[*b]);
    while let Some(f) = reader.next_frame().unwrap() {
      frames.push(f);
    }
  }
  assert_eq!(frames, vec![hello(), Frame::Ping(3)]);
  assert_eq!(reader.buffered(), 0);
}

#[test]
fn test_frame_size_limit() {
  assert!(matches!(
    encode_frame(&hello(), 4),
    Err(WireError::FrameTooLarge(_, 4))
  ));
  let mut reader = FrameReader::new(16);
  reader.push(&[0, 0, 1, 0]);
  assert!(matches!(
    reader.next_frame(),
    Err(WireError::FrameTooLarge(256, 16))
  ));
}

#[test]
fn test_async_read_over_stream() {
  tokio_test::block_on(async {
    let mut bytes = ConnectionHeader::new(crate::transport::Purpose::Direct)
      .to_bytes()
      .to_vec();
    bytes.extend(encode_frame(&hello(), 1024).unwrap());
    let mut src = &bytes[..];
    let header = read_header(&mut src).await.unwrap();
    assert_eq!(header.purpose, crate::transport::Purpose::Direct);
    let mut reader = FrameReader::new(1024);
    assert_eq!(reader.read_frame(&mut src).await.unwrap(), Some(hello()));
    assert_eq!(reader.read_frame(&mut src).await.unwrap(), None);
  });
}
