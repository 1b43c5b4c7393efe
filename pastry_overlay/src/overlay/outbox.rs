use crate::core::NodeHandle;
use crate::overlay::PastryMsg;
use std::sync::Arc;

/// Something the overlay state machine wants the outside world to do.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
  Send { to: Arc<NodeHandle>, msg: PastryMsg },
  /// Verify the peer directly. The answer comes back as a liveness change.
  CheckLiveness(Arc<NodeHandle>),
}

/// Effects collected while handling one input, in the order they were produced.
#[derive(Debug, Default)]
pub struct Outbox {
  effects: Vec<Effect>,
}
impl Outbox {
  pub fn new() -> Outbox {
    Outbox::default()
  }

  pub fn send(&mut self, to: Arc<NodeHandle>, msg: PastryMsg) {
    self.effects.push(Effect::Send { to: to, msg: msg });
  }

  pub fn check_liveness(&mut self, handle: Arc<NodeHandle>) {
    self.effects.push(Effect::CheckLiveness(handle));
  }

  pub fn drain(&mut self) -> std::vec::Drain<'_, Effect> {
    self.effects.drain(..)
  }

  pub fn take(&mut self) -> Vec<Effect> {
    std::mem::replace(&mut self.effects, Vec::new())
  }

  pub fn len(&self) -> usize {
    self.effects.len()
  }

  pub fn is_empty(&self) -> bool {
    self.effects.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Effect> {
    self.effects.iter()
  }
}
