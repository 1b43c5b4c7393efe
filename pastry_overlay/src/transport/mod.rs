//! Moving overlay messages between nodes over TCP.
//!
//! Every connection starts with a fixed [`ConnectionHeader`]: magic, protocol version and the
//! connection's purpose. After it, both sides exchange length-prefixed CBOR [`Frame`]s. A
//! direct connection begins with `Hello`/`HelloAck` so each side learns the other's handle.
//!
//! Nodes that cannot accept inbound connections keep a pilot connection open to a helper node.
//! A peer wanting to reach one connects to the helper as a connector, the helper asks the
//! target over its pilot to connect back as an acceptor, and then splices the two streams
//! together. From there on the relayed stream behaves like a direct one.
//!
//! [`TcpTransport`] holds the connection state. It is driven by the actor owning it, which
//! feeds it the [`TransportEvent`]s posted by the connection tasks and acts on the
//! [`TransportOutput`]s it returns.

mod codec;
mod connection;
mod liveness;
mod pilot;
mod socket_manager;
mod tcp;
mod wire;

pub(crate) use connection::{
  listen, spawn_acceptor, spawn_connect, spawn_pilot, spawn_refuse, spawn_splice,
};

#[rustfmt::skip]
pub use {
  codec::encode_frame,
  codec::read_header,
  codec::write_frame,
  codec::write_header,
  codec::FrameReader,
  connection::Abort,
  connection::ConnContext,
  connection::ConnId,
  connection::TransportEvent,
  connection::WriterCmd,
  liveness::LivenessAction,
  liveness::LivenessTracker,
  pilot::RelayTable,
  socket_manager::keeps_own_connection,
  socket_manager::SocketManager,
  tcp::bind,
  tcp::TcpTransport,
  tcp::TransportOutput,
  wire::ConnectionHeader,
  wire::Frame,
  wire::Purpose,
  wire::MAGIC,
  wire::VERSION,
};
