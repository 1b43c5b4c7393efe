use crate::core::{LocalRef, NodeHandle};
use std::sync::Arc;

/// A change in the membership of a leaf set or routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetEvent {
  Added(Arc<NodeHandle>),
  Removed(Arc<NodeHandle>),
}
impl SetEvent {
  pub fn handle(&self) -> &Arc<NodeHandle> {
    match self {
      SetEvent::Added(h) | SetEvent::Removed(h) => h,
    }
  }

  pub fn added(&self) -> bool {
    matches!(self, SetEvent::Added(_))
  }
}

/// Subscribers to typed events. Subscribers whose receiver is gone are dropped on the next
/// notification.
pub struct Observers<E> {
  subscribers: Vec<LocalRef<E>>,
}
impl<E: Clone + Send + 'static> Observers<E> {
  pub fn new() -> Self {
    Observers {
      subscribers: Vec::new(),
    }
  }

  pub fn subscribe(&mut self, subscriber: LocalRef<E>) {
    self.subscribers.push(subscriber);
  }

  pub fn notify(&mut self, event: &E) {
    self.subscribers.retain(|s| s.send(event.clone()));
  }

  pub fn len(&self) -> usize {
    self.subscribers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.subscribers.is_empty()
  }
}
impl<E: Clone + Send + 'static> Default for Observers<E> {
  fn default() -> Self {
    Observers::new()
  }
}

#[test]
fn test_observers_prune_closed() {
  use std::sync::atomic::{AtomicUsize, Ordering};
  let count = Arc::new(AtomicUsize::new(0));
  let c = count.clone();
  let mut obs = Observers::<u32>::new();
  obs.subscribe(LocalRef::from_fn(move |x| {
    c.fetch_add(x as usize, Ordering::SeqCst);
    true
  }));
  obs.subscribe(LocalRef::void());
  assert_eq!(obs.len(), 2);
  obs.notify(&5);
  assert_eq!(obs.len(), 1);
  obs.notify(&2);
  assert_eq!(count.load(Ordering::SeqCst), 7);
}
