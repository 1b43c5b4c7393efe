use crate::core::{Id, NodeHandle};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Names the application a message is for. Each node hosts any number of applications.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppAddress(pub String);
impl From<&str> for AppAddress {
  fn from(s: &str) -> Self {
    AppAddress(s.to_string())
  }
}
impl fmt::Display for AppAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
  /// Ask for a `delivery_failed` upcall at the sender if the message is dropped.
  pub notify_failure: bool,
}

/// A message travelling towards the node closest to `key`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMsg {
  pub key: Id,
  pub app: AppAddress,
  pub origin: NodeHandle,
  pub payload: Vec<u8>,
  pub hops: u32,
  /// Failed forwarding attempts at the node currently holding the message.
  pub attempts: u32,
  pub options: SendOptions,
}

/// A message for one specific node, no routing involved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMsg {
  pub app: AppAddress,
  pub origin: NodeHandle,
  pub payload: Vec<u8>,
  pub options: SendOptions,
}

/// A leaf set on the wire. `cw` and `ccw` are nearest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafSetSnapshot {
  pub base: NodeHandle,
  pub cw: Vec<NodeHandle>,
  pub ccw: Vec<NodeHandle>,
}
impl LeafSetSnapshot {
  /// Every member, clockwise side first. The base is not included.
  pub fn handles(&self) -> impl Iterator<Item = &NodeHandle> {
    self.cw.iter().chain(self.ccw.iter())
  }
}

/// One routing table row of `from`, one entry per column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRow {
  pub row: u32,
  pub from: NodeHandle,
  pub cells: Vec<Vec<NodeHandle>>,
}
impl RouteRow {
  /// `from` followed by every handle in the row.
  pub fn handles(&self) -> impl Iterator<Item = &NodeHandle> {
    std::iter::once(&self.from).chain(self.cells.iter().flatten())
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
  pub joiner: NodeHandle,
  /// One row from every node the request passed through.
  pub rows: Vec<RouteRow>,
  pub hops: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReply {
  pub leaf_set: LeafSetSnapshot,
  pub rows: Vec<RouteRow>,
}

/// Probe and acknowledgement of the consistent join protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentJoinMsg {
  pub leaf_set: LeafSetSnapshot,
  /// Nodes the sender believes failed. Only a hint for the receiver.
  pub failed: Vec<NodeHandle>,
  /// Set on probes, clear on replies.
  pub request: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PastryMsg {
  Route(RouteMsg),
  Direct(DirectMsg),
  JoinRequest(JoinRequest),
  JoinReply(JoinReply),
  ConsistentJoin(ConsistentJoinMsg),
  LeafSetRequest,
  LeafSetBroadcast(LeafSetSnapshot),
  RouteRowRequest(u32),
  RouteRowResponse(RouteRow),
  RouteRowBroadcast(RouteRow),
}
impl PastryMsg {
  /// True when every identifier the message carries is `bits` wide. Anything else comes from
  /// a different ring and must not be merged or routed.
  pub fn fits_width(&self, bits: usize) -> bool {
    let fits = |h: &NodeHandle| h.id.bit_len() == bits;
    match self {
      PastryMsg::Route(m) => m.key.bit_len() == bits && fits(&m.origin),
      PastryMsg::Direct(m) => fits(&m.origin),
      PastryMsg::JoinRequest(j) => {
        fits(&j.joiner) && j.rows.iter().flat_map(|r| r.handles()).all(fits)
      }
      PastryMsg::JoinReply(r) => {
        fits(&r.leaf_set.base)
          && r.leaf_set.handles().all(fits)
          && r.rows.iter().flat_map(|r| r.handles()).all(fits)
      }
      PastryMsg::ConsistentJoin(c) => {
        fits(&c.leaf_set.base) && c.leaf_set.handles().all(fits) && c.failed.iter().all(fits)
      }
      PastryMsg::LeafSetRequest | PastryMsg::RouteRowRequest(_) => true,
      PastryMsg::LeafSetBroadcast(snapshot) => {
        fits(&snapshot.base) && snapshot.handles().all(fits)
      }
      PastryMsg::RouteRowResponse(row) | PastryMsg::RouteRowBroadcast(row) => {
        row.handles().all(fits)
      }
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      PastryMsg::Route(_) => "Route",
      PastryMsg::Direct(_) => "Direct",
      PastryMsg::JoinRequest(_) => "JoinRequest",
      PastryMsg::JoinReply(_) => "JoinReply",
      PastryMsg::ConsistentJoin(_) => "ConsistentJoin",
      PastryMsg::LeafSetRequest => "LeafSetRequest",
      PastryMsg::LeafSetBroadcast(_) => "LeafSetBroadcast",
      PastryMsg::RouteRowRequest(_) => "RouteRowRequest",
      PastryMsg::RouteRowResponse(_) => "RouteRowResponse",
      PastryMsg::RouteRowBroadcast(_) => "RouteRowBroadcast",
    }
  }
}
