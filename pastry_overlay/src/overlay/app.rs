use crate::core::{Id, JoinError, LocalRef, NodeHandle, RouteError};
use crate::overlay::RouteMsg;
use std::sync::Arc;

/// A message as an application sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppMessage {
  /// The routing key, `None` for direct messages.
  pub key: Option<Id>,
  pub origin: NodeHandle,
  pub payload: Vec<u8>,
  pub hops: u32,
}

/// Upcalls from the overlay into an application hosted on the same node.
///
/// Upcalls run inside the overlay's state machine, so they should hand work off rather than do
/// it. The [`LocalRef<AppUpcall>`] implementation does exactly that.
pub trait Application: Send {
  /// The message reached the node responsible for its key, or its direct destination.
  fn deliver(&mut self, msg: AppMessage);

  /// Called before a routed message leaves this node towards `next_hop`. Returning false
  /// consumes the message here.
  fn forward(&mut self, _msg: &RouteMsg, _next_hop: &NodeHandle) -> bool {
    true
  }

  fn leaf_set_changed(&mut self, _handle: &Arc<NodeHandle>, _added: bool) {}

  fn route_set_changed(&mut self, _handle: &Arc<NodeHandle>, _added: bool) {}

  fn notify_ready(&mut self) {}

  /// A message sent with `notify_failure` was dropped.
  fn delivery_failed(&mut self, _msg: AppMessage, _error: RouteError) {}

  fn join_failed(&mut self, _error: &JoinError) {}
}

/// Upcalls as messages, for applications living in their own actor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppUpcall {
  Deliver(AppMessage),
  LeafSetChanged(Arc<NodeHandle>, bool),
  RouteSetChanged(Arc<NodeHandle>, bool),
  Ready,
  DeliveryFailed(AppMessage, RouteError),
  JoinFailed(JoinError),
}

impl Application for LocalRef<AppUpcall> {
  fn deliver(&mut self, msg: AppMessage) {
    self.send(AppUpcall::Deliver(msg));
  }

  fn leaf_set_changed(&mut self, handle: &Arc<NodeHandle>, added: bool) {
    self.send(AppUpcall::LeafSetChanged(handle.clone(), added));
  }

  fn route_set_changed(&mut self, handle: &Arc<NodeHandle>, added: bool) {
    self.send(AppUpcall::RouteSetChanged(handle.clone(), added));
  }

  fn notify_ready(&mut self) {
    self.send(AppUpcall::Ready);
  }

  fn delivery_failed(&mut self, msg: AppMessage, error: RouteError) {
    self.send(AppUpcall::DeliveryFailed(msg, error));
  }

  fn join_failed(&mut self, error: &JoinError) {
    self.send(AppUpcall::JoinFailed(error.clone()));
  }
}
