//! The structured overlay: leaf set, prefix routing table, next-hop selection, the consistent
//! join protocol and the node state machine tying them together.
//!
//! ### Layout
//! [`PastryNode`] is pure state: it takes inputs with the current time and an [`Outbox`], and
//! never touches the network. [`Overlay`] runs one inside an actor on top of the TCP
//! [`transport`](crate::transport), turning effects into frames and transport events back into
//! inputs.
//!
//! ```ignore
//! let mut config = NodeConfig::default();
//! config.socket = Socket::localhost(5000);
//! let node = Node::new_sync(config)?;
//! let handle = Overlay::spawn(
//!   &node,
//!   Id::random(160, &mut rand::thread_rng()),
//!   PastryConfig::default(),
//!   TransportConfig::default(),
//!   Some(bootstrap),
//!   FailureConfigMap::default(),
//! )?;
//! handle.register("chat".into(), my_app_ref);
//! handle.route(key, "chat".into(), b"hello".to_vec(), SendOptions::default());
//! ```
//!
//! ### Applications
//! Anything implementing [`Application`] can be registered under an [`AppAddress`]. Upcalls run
//! synchronously inside the node, so actor-based applications register a
//! `LocalRef<AppUpcall>` instead and receive [`AppUpcall`] messages.

mod actor;
mod app;
mod join;
mod leaf_set;
mod messages;
mod node;
mod outbox;
mod route_set;
mod router;
mod routing_table;

pub(crate) use join::JoinOutcome;
pub(crate) use node::RoutingState;

#[rustfmt::skip]
pub use {
  actor::Overlay,
  actor::OverlayCmd,
  actor::OverlayHandle,
  actor::OverlayMsg,
  actor::OverlayStatus,
  app::AppMessage,
  app::AppUpcall,
  app::Application,
  join::JoinProtocol,
  join::JoinState,
  leaf_set::LeafSet,
  messages::AppAddress,
  messages::ConsistentJoinMsg,
  messages::DirectMsg,
  messages::JoinReply,
  messages::JoinRequest,
  messages::LeafSetSnapshot,
  messages::PastryMsg,
  messages::RouteMsg,
  messages::RouteRow,
  messages::SendOptions,
  node::PastryNode,
  outbox::Effect,
  outbox::Outbox,
  route_set::RouteSet,
  route_set::RouteSetPut,
  router::HopSource,
  router::RouteDecision,
  router::RouteStep,
  router::Router,
  routing_table::RoutingTable,
};
