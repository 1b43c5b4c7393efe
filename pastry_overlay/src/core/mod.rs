//! Identifiers, node handles and the liveness pool, configuration, errors and the actor runtime
//! the overlay runs on.
//!
//! ### Actors
//! Every long-lived piece of state is owned by one actor: a tokio task draining an unbounded
//! channel. Other tasks only hold a [`LocalRef`] to it and post messages. A [`Node`] owns the
//! runtime and the node-wide logger and spawns actors.
//!
//! ```ignore
//! let mut config = NodeConfig::default();
//! config.socket = Socket::localhost(4000);
//! let node = Node::new_sync(config)?;
//! let cmd: LocalRef<MyMsg> = node.spawn(MyActor::new(), "my-actor".to_string());
//! node.schedule_local_msg(Duration::from_secs(1), cmd, MyMsg::Tick);
//! ```
//!
//! ### Logging
//! Define a [`LogLevel`](crate::testkit::LogLevel) for your module, and call one of the log
//! macros with it, a sink (a [`Node`] or a `LocalRef<LoggerMsg>`) and a message. Messages below
//! the level are never formatted.
//!
//! ```ignore
//! const LOG_LEVEL: LogLevel = LogLevel::Debug;
//! trace!(LOG_LEVEL, &node, "not logged");
//! warn!(LOG_LEVEL, &node, format!("peer {} is slow", peer));
//! ```

mod actor;
mod config;
mod error;
mod id;
mod node;
mod node_handle;
mod observe;
mod pending;
mod socket;

pub(crate) use actor::run_single;

#[rustfmt::skip]
pub use {
  actor::Actor,
  actor::ActorContext,
  actor::ActorSignal,
  actor::LocalActorMsg,
  actor::LocalRef,
  config::PastryConfig,
  config::TransportConfig,
  error::ConfigError,
  error::JoinError,
  error::RouteError,
  error::TransportError,
  error::WireError,
  id::Distance,
  id::Id,
  id::MAX_ID_BYTES,
  node::Node,
  node::NodeConfig,
  node_handle::HandlePool,
  node_handle::Liveness,
  node_handle::LivenessEvent,
  node_handle::NodeHandle,
  node_handle::DEAD_PROXIMITY,
  node_handle::DEFAULT_PROXIMITY,
  observe::Observers,
  observe::SetEvent,
  pending::PendingOp,
  socket::Host,
  socket::Socket,
};
