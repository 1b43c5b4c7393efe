use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("identifier width {0} must be a positive multiple of 8, at most {1} bits")]
  IdBits(usize, usize),
  #[error("digit width {0} must be between 1 and 8 bits")]
  DigitBits(usize),
  #[error("leaf set size {0} must be even and at least 2")]
  LeafSetSize(usize),
  #[error("route sets must hold at least one handle")]
  RouteSetSize,
  #[error("{0} must be non-zero")]
  Zero(&'static str),
  #[error("{0} must be set")]
  Missing(&'static str),
  #[error("the tick delay threshold must exceed the tick interval")]
  TickDelay,
  #[error("pong timeout must be shorter than the ping interval")]
  PongTimeout,
}

/// Why a routed or direct message never reached an application.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
  #[error("hop limit of {0} exceeded")]
  HopLimit(u32),
  #[error("gave up after {0} failed forwarding attempts")]
  AttemptsExhausted(u32),
  #[error("destination {0} is unreachable")]
  Unreachable(String),
  #[error("no application registered at {0:?}")]
  NoApplication(String),
  #[error("identifier is {0} bits wide, the ring uses {1}")]
  WrongWidth(usize, usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoinError {
  #[error("bootstrap unreachable after {0} attempts")]
  BootstrapUnreachable(u32),
  #[error("leaf set members did not answer after {0} probe rounds")]
  ProbesExhausted(u32),
  #[error("bootstrap identifier is {0} bits wide, the ring uses {1}")]
  WrongWidth(usize, usize),
}

#[derive(Debug, Error)]
pub enum WireError {
  #[error("bad magic {0:02x?}")]
  BadMagic([u8; 4]),
  #[error("unsupported protocol version {0}")]
  BadVersion(u32),
  #[error("unknown connection purpose {0}")]
  UnknownPurpose(u8),
  #[error("frame of {0} bytes exceeds the {1} byte limit")]
  FrameTooLarge(usize, usize),
  #[error("expected {0} bytes, got {1}")]
  Truncated(usize, usize),
  #[error(transparent)]
  Codec(#[from] serde_cbor::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
  #[error("could not bind {0}: {1}")]
  Bind(String, String),
  #[error("{0} is unreachable: {1}")]
  Unreachable(String, String),
  #[error("connecting to {0} timed out")]
  ConnectTimeout(String),
  #[error("peer at {addr} identified as {got}, expected {expected}")]
  IdentityMismatch {
    addr: String,
    expected: String,
    got: String,
  },
  #[error("protocol violation: {0}")]
  Protocol(String),
  #[error("io: {0}")]
  Io(String),
  #[error("cancelled")]
  Cancelled,
  #[error(transparent)]
  Config(#[from] ConfigError),
}
impl From<std::io::Error> for TransportError {
  fn from(e: std::io::Error) -> Self {
    TransportError::Io(e.to_string())
  }
}
impl From<WireError> for TransportError {
  fn from(e: WireError) -> Self {
    TransportError::Protocol(e.to_string())
  }
}
