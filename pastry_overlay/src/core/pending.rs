use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

/// An asynchronous operation that can be cancelled. Completion and cancellation race on one
/// atomic, so exactly one of them wins.
#[derive(Clone, Debug)]
pub struct PendingOp {
  state: Arc<AtomicU8>,
}
impl PendingOp {
  pub fn new() -> PendingOp {
    PendingOp {
      state: Arc::new(AtomicU8::new(PENDING)),
    }
  }

  /// True if this call cancelled the operation.
  pub fn cancel(&self) -> bool {
    self.transition(CANCELLED)
  }

  /// True if this call completed the operation. The completer must discard its result when
  /// this returns false.
  pub fn complete(&self) -> bool {
    self.transition(COMPLETED)
  }

  pub fn is_cancelled(&self) -> bool {
    self.state.load(Ordering::Acquire) == CANCELLED
  }

  pub fn is_pending(&self) -> bool {
    self.state.load(Ordering::Acquire) == PENDING
  }

  fn transition(&self, to: u8) -> bool {
    self
      .state
      .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }
}
impl Default for PendingOp {
  fn default() -> Self {
    PendingOp::new()
  }
}

#[test]
fn test_cancel_complete_race() {
  let op = PendingOp::new();
  let other = op.clone();
  assert!(op.is_pending());
  assert!(other.cancel());
  assert!(!op.complete());
  assert!(op.is_cancelled());

  let op = PendingOp::new();
  assert!(op.complete());
  assert!(!op.cancel());
  assert!(!op.is_cancelled());

  let op = PendingOp::new();
  let winners: Vec<bool> = crossbeam::scope(|s| {
    let a = s.spawn(|_| op.cancel());
    let b = s.spawn(|_| op.complete());
    vec![a.join().unwrap(), b.join().unwrap()]
  })
  .unwrap();
  assert_eq!(winners.iter().filter(|w| **w).count(), 1);
}
