//! This crate implements a structured peer-to-peer overlay with key-based routing. Every node
//! owns an identifier in a circular identifier space, and a message addressed to any identifier
//! is forwarded hop by hop until it reaches the live node whose identifier is numerically closest
//! to it. Routing takes `O(log N)` hops and uses only the state each node keeps locally: a
//! prefix-indexed [`RoutingTable`](crate::overlay::RoutingTable) for long hops and a
//! [`LeafSet`](crate::overlay::LeafSet) of immediate neighbours for the last hop.
//!
//! The crate is split into layers:
//!
//! - [`core`]: identifiers, node handles and their liveness pool, configuration, errors and the
//!   small actor runtime everything else runs on.
//! - [`overlay`]: the routing state, the forwarding decision, the consistent join protocol and
//!   the sans-IO [`PastryNode`](crate::overlay::PastryNode) tying them together, plus the
//!   [`Overlay`](crate::overlay::Overlay) actor that drives a node over real sockets.
//! - [`transport`]: connection headers, framing, liveness probing, the LRU socket working set
//!   and rendezvous relaying for nodes that cannot accept inbound connections.
//! - [`testkit`]: logging, failure injection and a deterministic in-memory network for running
//!   many nodes in one test.

pub mod core;
pub mod overlay;
pub mod testkit;
pub mod transport;
