use crate::core::{Id, NodeHandle, WireError};
use crate::overlay::PastryMsg;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

pub const MAGIC: [u8; 4] = *b"PSTR";
pub const VERSION: u32 = 1;

/// What a freshly opened connection is for. Sent once, in the connection header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Purpose {
  /// An ordinary node-to-node connection.
  Direct = 0,
  /// Asks a rendezvous helper to be spliced to a node behind NAT.
  Connector = 1,
  /// A node behind NAT answering a connector through the helper.
  Acceptor = 2,
  /// Kept open from a node behind NAT to its helper, to hear about connectors.
  Pilot = 3,
}

/*
The connection header is fixed-size and written before any frame, so the accepting side
knows how to treat the stream before it has to trust anything CBOR-encoded.
*/
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionHeader {
  pub version: u32,
  pub purpose: Purpose,
}
// Serialization is big endian
impl ConnectionHeader {
  pub const SIZE: usize = 9;

  pub fn new(purpose: Purpose) -> ConnectionHeader {
    ConnectionHeader {
      version: VERSION,
      purpose: purpose,
    }
  }

  pub fn put(&self, buf: &mut [u8; Self::SIZE]) {
    buf[0..4].copy_from_slice(&MAGIC);
    buf[4] = (self.version >> 24) as u8;
    buf[5] = (self.version >> 16) as u8;
    buf[6] = (self.version >> 8) as u8;
    buf[7] = self.version as u8;
    buf[8] = self.purpose.into();
  }

  pub fn to_bytes(&self) -> [u8; Self::SIZE] {
    let mut buf = [0u8; Self::SIZE];
    self.put(&mut buf);
    buf
  }

  pub fn parse(buf: &[u8]) -> Result<ConnectionHeader, WireError> {
    if buf.len() != Self::SIZE {
      return Err(WireError::Truncated(Self::SIZE, buf.len()));
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&buf[0..4]);
    if magic != MAGIC {
      return Err(WireError::BadMagic(magic));
    }
    let mut version = 0u32;
    version |= (buf[4] as u32) << 24;
    version |= (buf[5] as u32) << 16;
    version |= (buf[6] as u32) << 8;
    version |= buf[7] as u32;
    if version != VERSION {
      return Err(WireError::BadVersion(version));
    }
    let purpose =
      Purpose::try_from(buf[8]).map_err(|_| WireError::UnknownPurpose(buf[8]))?;
    Ok(ConnectionHeader {
      version: version,
      purpose: purpose,
    })
  }
}

/// Everything that travels over a connection after the header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
  /// The opener's identity. First frame on every direct connection.
  Hello(NodeHandle),
  HelloAck(NodeHandle),
  Ping(u64),
  Pong(u64),
  Msg(PastryMsg),
  /// The sender is closing the connection on purpose.
  Goodbye,
  /// Connector to helper: splice me to `target`.
  Connect { target: Id, token: u64 },
  /// Acceptor to helper: I am the target for `token`.
  Accept { token: u64 },
  /// Helper to a node behind NAT, over its pilot.
  OpenRequest { token: u64 },
  /// Helper to connector: from here on the stream belongs to the target.
  Spliced,
  Refused(String),
}
impl Frame {
  pub fn kind(&self) -> &'static str {
    match self {
      Frame::Hello(_) => "Hello",
      Frame::HelloAck(_) => "HelloAck",
      Frame::Ping(_) => "Ping",
      Frame::Pong(_) => "Pong",
      Frame::Msg(_) => "Msg",
      Frame::Goodbye => "Goodbye",
      Frame::Connect { .. } => "Connect",
      Frame::Accept { .. } => "Accept",
      Frame::OpenRequest { .. } => "OpenRequest",
      Frame::Spliced => "Spliced",
      Frame::Refused(_) => "Refused",
    }
  }
}

#[test]
fn test_connection_header_serde() {
  let header = ConnectionHeader::new(Purpose::Pilot);
  let buf = header.to_bytes();
  assert_eq!(&buf[0..4], b"PSTR");
  assert_eq!(&buf[4..8], &[0, 0, 0, 1]);
  assert_eq!(buf[8], 3);
  assert_eq!(ConnectionHeader::parse(&buf[..]).unwrap(), header);
}

#[test]
fn test_connection_header_rejects() {
  let mut buf = ConnectionHeader::new(Purpose::Direct).to_bytes();
  buf[0] = b'X';
  assert!(matches!(
    ConnectionHeader::parse(&buf[..]),
    Err(WireError::BadMagic(m)) if &m == b"XSTR"
  ));

  let mut buf = ConnectionHeader::new(Purpose::Direct).to_bytes();
  buf[7] = 9;
  assert!(matches!(
    ConnectionHeader::parse(&buf[..]),
    Err(WireError::BadVersion(9))
  ));

  let mut buf = ConnectionHeader::new(Purpose::Direct).to_bytes();
  buf[8] = 17;
  assert!(matches!(
    ConnectionHeader::parse(&buf[..]),
    Err(WireError::UnknownPurpose(17))
  ));

  assert!(matches!(
    ConnectionHeader::parse(&buf[..4]),
    Err(WireError::Truncated(9, 4))
  ));
}
