use crate::core::{Id, LocalRef, Observers, Socket};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Proximity assumed for handles nobody has measured yet.
pub const DEFAULT_PROXIMITY: u64 = u32::MAX as u64;
/// Proximity reported for handles believed dead, so they sort last everywhere.
pub const DEAD_PROXIMITY: u64 = u64::MAX;

/// How to reach a remote node.
///
/// `epoch` identifies the incarnation: a restarted node comes back with a larger epoch, which
/// lets the pool tell a fresh handle from stale gossip about the old one. `relay` is set when the
/// node can only be reached through a rendezvous helper.
#[derive(Clone, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeHandle {
  pub id: Id,
  pub socket: Socket,
  pub epoch: u64,
  pub relay: Option<Socket>,
}
impl NodeHandle {
  pub fn new(id: Id, socket: Socket) -> NodeHandle {
    let epoch = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_millis() as u64)
      .unwrap_or(0);
    NodeHandle::with_epoch(id, socket, epoch)
  }

  pub fn with_epoch(id: Id, socket: Socket, epoch: u64) -> NodeHandle {
    NodeHandle {
      id: id,
      socket: socket,
      epoch: epoch,
      relay: None,
    }
  }

  pub fn relayed_by(mut self, helper: Socket) -> NodeHandle {
    self.relay = Some(helper);
    self
  }

  /// The address a connection to this node is opened against.
  pub fn dial_socket(&self) -> &Socket {
    self.relay.as_ref().unwrap_or(&self.socket)
  }
}
impl fmt::Display for NodeHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.relay {
      Some(r) => write!(f, "[{:?} @ {} via {}]", self.id, self.socket, r),
      None => write!(f, "[{:?} @ {}]", self.id, self.socket),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Liveness {
  Alive,
  Suspected,
  Dead,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LivenessEvent {
  ProximityChanged(Arc<NodeHandle>, u64),
  DeclaredDead(Arc<NodeHandle>),
  DeclaredLive(Arc<NodeHandle>),
}

struct PoolEntry {
  handle: Arc<NodeHandle>,
  liveness: Liveness,
  proximity: u64,
}

/// The single place a node keeps liveness and proximity for every remote node it knows.
///
/// Handles arriving from the network are coalesced here, so the leaf set, routing table and
/// transport all share one `Arc<NodeHandle>` per identifier and agree on its liveness.
pub struct HandlePool {
  local: Arc<NodeHandle>,
  entries: HashMap<Id, PoolEntry>,
  observers: Observers<LivenessEvent>,
}
impl HandlePool {
  pub fn new(local: Arc<NodeHandle>) -> HandlePool {
    HandlePool {
      local: local,
      entries: HashMap::new(),
      observers: Observers::new(),
    }
  }

  pub fn local(&self) -> &Arc<NodeHandle> {
    &self.local
  }

  pub fn subscribe(&mut self, subscriber: LocalRef<LivenessEvent>) {
    self.observers.subscribe(subscriber);
  }

  /// Returns the canonical handle for `handle.id`. A newer incarnation replaces the stored
  /// handle and starts out alive; older or equal epochs return what is already stored.
  pub fn coalesce(&mut self, handle: &NodeHandle) -> Arc<NodeHandle> {
    if handle.id == self.local.id {
      return self.local.clone();
    }
    match self.entries.entry(handle.id.clone()) {
      Entry::Occupied(mut o) => {
        let entry = o.get_mut();
        if handle.epoch > entry.handle.epoch {
          entry.handle = Arc::new(handle.clone());
          entry.liveness = Liveness::Alive;
          entry.proximity = DEFAULT_PROXIMITY;
        }
        entry.handle.clone()
      }
      Entry::Vacant(v) => {
        v.insert(PoolEntry {
          handle: Arc::new(handle.clone()),
          liveness: Liveness::Alive,
          proximity: DEFAULT_PROXIMITY,
        })
        .handle
        .clone()
      }
    }
  }

  pub fn get(&self, id: &Id) -> Option<&Arc<NodeHandle>> {
    if *id == self.local.id {
      return Some(&self.local);
    }
    self.entries.get(id).map(|e| &e.handle)
  }

  /// Unknown handles are presumed alive until something says otherwise.
  pub fn liveness(&self, id: &Id) -> Liveness {
    self
      .entries
      .get(id)
      .map(|e| e.liveness)
      .unwrap_or(Liveness::Alive)
  }

  /// Suspected handles are still usable.
  pub fn is_alive(&self, id: &Id) -> bool {
    self.liveness(id) != Liveness::Dead
  }

  pub fn is_known_dead(&self, id: &Id) -> bool {
    self.liveness(id) == Liveness::Dead
  }

  pub fn proximity(&self, id: &Id) -> u64 {
    if *id == self.local.id {
      return 0;
    }
    match self.entries.get(id) {
      Some(e) if e.liveness == Liveness::Dead => DEAD_PROXIMITY,
      Some(e) => e.proximity,
      None => DEFAULT_PROXIMITY,
    }
  }

  pub fn mark_alive(&mut self, id: &Id) -> Option<LivenessEvent> {
    let entry = self.entries.get_mut(id)?;
    let was = entry.liveness;
    entry.liveness = Liveness::Alive;
    let event = match was {
      Liveness::Dead => Some(LivenessEvent::DeclaredLive(entry.handle.clone())),
      _ => None,
    };
    self.emit(event)
  }

  /// Returns true if the handle was alive before.
  pub fn mark_suspected(&mut self, id: &Id) -> bool {
    match self.entries.get_mut(id) {
      Some(e) if e.liveness == Liveness::Alive => {
        e.liveness = Liveness::Suspected;
        true
      }
      _ => false,
    }
  }

  pub fn mark_dead(&mut self, id: &Id) -> Option<LivenessEvent> {
    let entry = self.entries.get_mut(id)?;
    let event = match entry.liveness {
      Liveness::Dead => None,
      _ => {
        entry.liveness = Liveness::Dead;
        Some(LivenessEvent::DeclaredDead(entry.handle.clone()))
      }
    };
    self.emit(event)
  }

  pub fn update_proximity(&mut self, id: &Id, proximity: u64) -> Option<LivenessEvent> {
    let entry = self.entries.get_mut(id)?;
    let event = if entry.proximity != proximity {
      entry.proximity = proximity;
      Some(LivenessEvent::ProximityChanged(entry.handle.clone(), proximity))
    } else {
      None
    };
    self.emit(event)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn handles(&self) -> impl Iterator<Item = &Arc<NodeHandle>> {
    self.entries.values().map(|e| &e.handle)
  }

  fn emit(&mut self, event: Option<LivenessEvent>) -> Option<LivenessEvent> {
    if let Some(e) = &event {
      self.observers.notify(e);
    }
    event
  }
}

#[cfg(test)]
fn handle(id: u128, epoch: u64) -> NodeHandle {
  NodeHandle::with_epoch(Id::from_u128(id, 16), Socket::localhost(id as u16), epoch)
}

#[test]
fn test_pool_coalesce() {
  let local = Arc::new(handle(1, 1));
  let mut pool = HandlePool::new(local.clone());
  assert!(Arc::ptr_eq(&pool.coalesce(&handle(1, 9)), &local));

  let a = pool.coalesce(&handle(2, 5));
  let b = pool.coalesce(&handle(2, 5));
  assert!(Arc::ptr_eq(&a, &b));
  // stale gossip about an older incarnation changes nothing
  let c = pool.coalesce(&handle(2, 4));
  assert!(Arc::ptr_eq(&a, &c));

  assert!(pool.mark_dead(&a.id).is_some());
  assert!(pool.is_known_dead(&a.id));
  assert_eq!(pool.proximity(&a.id), DEAD_PROXIMITY);
  let d = pool.coalesce(&handle(2, 6));
  assert_eq!(d.epoch, 6);
  assert!(pool.is_alive(&d.id));
  assert_eq!(pool.len(), 1);
}

#[test]
fn test_pool_liveness_events() {
  use std::sync::Mutex;
  let mut pool = HandlePool::new(Arc::new(handle(1, 1)));
  let seen = Arc::new(Mutex::new(Vec::new()));
  let s = seen.clone();
  pool.subscribe(LocalRef::from_fn(move |e| {
    s.lock().unwrap().push(e);
    true
  }));
  let h = pool.coalesce(&handle(3, 1));
  assert_eq!(pool.proximity(&h.id), DEFAULT_PROXIMITY);
  assert_eq!(pool.proximity(&pool.local().id.clone()), 0);
  assert!(pool.mark_suspected(&h.id));
  assert!(pool.is_alive(&h.id));
  assert_eq!(pool.mark_alive(&h.id), None);
  assert!(pool.update_proximity(&h.id, 12).is_some());
  assert_eq!(pool.update_proximity(&h.id, 12), None);
  assert_eq!(pool.mark_dead(&h.id), Some(LivenessEvent::DeclaredDead(h.clone())));
  assert_eq!(pool.mark_dead(&h.id), None);
  assert_eq!(pool.mark_alive(&h.id), Some(LivenessEvent::DeclaredLive(h.clone())));
  assert_eq!(
    *seen.lock().unwrap(),
    vec![
      LivenessEvent::ProximityChanged(h.clone(), 12),
      LivenessEvent::DeclaredDead(h.clone()),
      LivenessEvent::DeclaredLive(h.clone()),
    ]
  );
}
