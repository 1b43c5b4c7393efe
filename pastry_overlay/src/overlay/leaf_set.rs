use crate::core::{Distance, HandlePool, Id, LocalRef, NodeHandle, Observers, SetEvent};
use crate::overlay::{LeafSetSnapshot, RoutingTable};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
  Cw,
  Ccw,
}

enum HalfPut {
  Inserted(Option<Arc<NodeHandle>>),
  Rejected,
}

// One side of the leaf set, nearest first.
struct Half {
  base: Id,
  side: Side,
  capacity: usize,
  members: Vec<Arc<NodeHandle>>,
}
impl Half {
  fn new(base: Id, side: Side, capacity: usize) -> Half {
    Half {
      base: base,
      side: side,
      capacity: capacity,
      members: Vec::with_capacity(capacity + 1),
    }
  }

  fn distance(&self, id: &Id) -> Distance {
    match self.side {
      Side::Cw => self.base.cw_distance(id),
      Side::Ccw => id.cw_distance(&self.base),
    }
  }

  fn position(&self, id: &Id) -> usize {
    let d = self.distance(id);
    self.members.partition_point(|m| self.distance(&m.id) < d)
  }

  fn contains(&self, id: &Id) -> bool {
    self.members.iter().any(|m| m.id == *id)
  }

  fn fits(&self, id: &Id) -> bool {
    !self.contains(id)
      && (self.members.len() < self.capacity || self.position(id) < self.members.len())
  }

  fn put(&mut self, handle: Arc<NodeHandle>) -> HalfPut {
    if !self.fits(&handle.id) {
      return HalfPut::Rejected;
    }
    let pos = self.position(&handle.id);
    self.members.insert(pos, handle);
    if self.members.len() > self.capacity {
      HalfPut::Inserted(self.members.pop())
    } else {
      HalfPut::Inserted(None)
    }
  }

  fn remove(&mut self, id: &Id) -> Option<Arc<NodeHandle>> {
    let pos = self.members.iter().position(|m| m.id == *id)?;
    Some(self.members.remove(pos))
  }

  fn farthest(&self) -> Option<&Arc<NodeHandle>> {
    self.members.last()
  }

  fn is_full(&self) -> bool {
    self.members.len() >= self.capacity
  }

  // id lies between the base and the farthest member on this side, inclusive
  fn spans(&self, id: &Id) -> bool {
    match self.farthest() {
      Some(far) => self.distance(id) <= self.distance(&far.id),
      None => false,
    }
  }
}

/// The `L/2` numerically closest known nodes on each side of the local node.
///
/// A node can sit in both halves when the ring is small. Every membership change is journalled as
/// a [`SetEvent`] and pushed to subscribers.
pub struct LeafSet {
  local: Arc<NodeHandle>,
  cw: Half,
  ccw: Half,
  observers: Observers<SetEvent>,
  journal: Vec<SetEvent>,
}
impl LeafSet {
  pub fn new(local: Arc<NodeHandle>, size: usize) -> LeafSet {
    let half = std::cmp::max(size / 2, 1);
    LeafSet {
      cw: Half::new(local.id.clone(), Side::Cw, half),
      ccw: Half::new(local.id.clone(), Side::Ccw, half),
      local: local,
      observers: Observers::new(),
      journal: Vec::new(),
    }
  }

  pub fn local(&self) -> &Arc<NodeHandle> {
    &self.local
  }

  pub fn subscribe(&mut self, subscriber: LocalRef<SetEvent>) {
    self.observers.subscribe(subscriber);
  }

  pub fn take_events(&mut self) -> Vec<SetEvent> {
    std::mem::replace(&mut self.journal, Vec::new())
  }

  fn record(&mut self, event: SetEvent) {
    self.observers.notify(&event);
    self.journal.push(event);
  }

  /// Inserts the handle into every half it fits in, including the other half of an existing
  /// member. Returns true if it became a member.
  pub fn put(&mut self, handle: Arc<NodeHandle>) -> bool {
    if handle.id == self.local.id {
      return false;
    }
    let was_member = self.member(&handle.id);
    let mut inserted = false;
    let mut evicted = Vec::new();
    for half in [&mut self.cw, &mut self.ccw].iter_mut() {
      if let HalfPut::Inserted(e) = half.put(handle.clone()) {
        inserted = true;
        evicted.extend(e);
      }
    }
    let joined = inserted && !was_member;
    if joined {
      self.record(SetEvent::Added(handle));
    }
    for e in evicted {
      if !self.member(&e.id) {
        self.record(SetEvent::Removed(e));
      }
    }
    joined
  }

  pub fn remove(&mut self, id: &Id) -> Option<Arc<NodeHandle>> {
    let a = self.cw.remove(id);
    let b = self.ccw.remove(id);
    let removed = a.or(b)?;
    self.record(SetEvent::Removed(removed.clone()));
    Some(removed)
  }

  pub fn member(&self, id: &Id) -> bool {
    self.cw.contains(id) || self.ccw.contains(id)
  }

  /// Would `put` accept this handle?
  pub fn test(&self, handle: &NodeHandle) -> bool {
    handle.id != self.local.id && (self.cw.fits(&handle.id) || self.ccw.fits(&handle.id))
  }

  pub fn max_half(&self) -> usize {
    self.cw.capacity
  }

  pub fn cw_size(&self) -> usize {
    self.cw.members.len()
  }

  pub fn ccw_size(&self) -> usize {
    self.ccw.members.len()
  }

  /// Distinct members.
  pub fn size(&self) -> usize {
    self.members().len()
  }

  pub fn is_empty(&self) -> bool {
    self.cw.members.is_empty() && self.ccw.members.is_empty()
  }

  /// Member at signed position `i`: `0` is the local node, positive indices walk clockwise,
  /// negative ones counter-clockwise.
  pub fn get(&self, i: isize) -> Option<&Arc<NodeHandle>> {
    if i == 0 {
      Some(&self.local)
    } else if i > 0 {
      self.cw.members.get(i as usize - 1)
    } else {
      self.ccw.members.get((-i) as usize - 1)
    }
  }

  pub fn cw_members(&self) -> &[Arc<NodeHandle>] {
    &self.cw.members
  }

  pub fn ccw_members(&self) -> &[Arc<NodeHandle>] {
    &self.ccw.members
  }

  /// Distinct members, counter-clockwise farthest first, then clockwise nearest first.
  pub fn members(&self) -> Vec<Arc<NodeHandle>> {
    let mut out: Vec<Arc<NodeHandle>> = self.ccw.members.iter().rev().cloned().collect();
    for h in self.cw.members.iter() {
      if !out.iter().any(|o| o.id == h.id) {
        out.push(h.clone());
      }
    }
    out
  }

  /// The two halves meet: the whole ring fits in the leaf set.
  pub fn overlaps(&self) -> bool {
    match (self.cw.farthest(), self.ccw.farthest()) {
      (Some(cw), Some(ccw)) => self.ccw.contains(&cw.id) || self.cw.contains(&ccw.id),
      _ => false,
    }
  }

  pub fn is_complete(&self) -> bool {
    (self.cw.is_full() && self.ccw.is_full()) || self.overlaps()
  }

  /// Whether `id` falls inside the stretch of ring this leaf set knows completely.
  pub fn covers(&self, id: &Id) -> bool {
    *id == self.local.id || self.overlaps() || self.cw.spans(id) || self.ccw.spans(id)
  }

  /// The nearest `n` members on each side.
  pub fn neighbor_set(&self, n: usize) -> Vec<Arc<NodeHandle>> {
    let mut out: Vec<Arc<NodeHandle>> = Vec::new();
    for h in self.ccw.members.iter().take(n).chain(self.cw.members.iter().take(n)) {
      if !out.iter().any(|o| o.id == h.id) {
        out.push(h.clone());
      }
    }
    out
  }

  /// The member or local node numerically closest to `id` among those `pool` believes alive.
  /// Ties go to the lower identifier.
  pub fn closest_alive(&self, id: &Id, pool: &HandlePool) -> Arc<NodeHandle> {
    let mut best = self.local.clone();
    let mut best_key = (id.distance(&best.id), best.id.clone());
    for h in self.cw.members.iter().chain(self.ccw.members.iter()) {
      if !pool.is_alive(&h.id) {
        continue;
      }
      let key = (id.distance(&h.id), h.id.clone());
      if key < best_key {
        best_key = key;
        best = h.clone();
      }
    }
    best
  }

  pub fn snapshot(&self) -> LeafSetSnapshot {
    LeafSetSnapshot {
      base: (*self.local).clone(),
      cw: self.cw.members.iter().map(|h| (**h).clone()).collect(),
      ccw: self.ccw.members.iter().map(|h| (**h).clone()).collect(),
    }
  }

  /// Offers already coalesced handles to the leaf set, and every one of them to the routing
  /// table as well. Known-dead handles are skipped. Returns the handles that joined the leaf
  /// set.
  pub fn merge_handles<I>(
    &mut self,
    handles: I,
    table: &mut RoutingTable,
    pool: &HandlePool,
  ) -> Vec<Arc<NodeHandle>>
  where
    I: IntoIterator<Item = Arc<NodeHandle>>,
  {
    let mut added = Vec::new();
    for h in handles {
      if h.id == self.local.id || pool.is_known_dead(&h.id) {
        continue;
      }
      if self.put(h.clone()) {
        added.push(h.clone());
      }
      table.put(h, pool);
    }
    added
  }

  /// Merges a leaf set received from `from`, including `from` itself.
  pub fn merge(
    &mut self,
    other: &LeafSetSnapshot,
    from: Arc<NodeHandle>,
    table: &mut RoutingTable,
    pool: &mut HandlePool,
  ) -> Vec<Arc<NodeHandle>> {
    let mut handles = vec![from];
    for h in other.handles() {
      handles.push(pool.coalesce(h));
    }
    self.merge_handles(handles, table, pool)
  }
}

#[cfg(test)]
use crate::core::Socket;
#[cfg(test)]
use rand::{rngs::SmallRng, Rng, SeedableRng};

#[cfg(test)]
fn h(id: u128) -> Arc<NodeHandle> {
  Arc::new(NodeHandle::with_epoch(
    Id::from_u128(id, 8),
    Socket::localhost(1000 + id as u16),
    1,
  ))
}

#[test]
fn test_halves_sorted_and_bounded() {
  let mut ls = LeafSet::new(h(100), 4);
  for id in [101u128, 99, 103, 97, 102, 98, 150, 50].iter() {
    ls.put(h(*id));
  }
  let cw: Vec<_> = ls.cw_members().iter().map(|m| m.id.clone()).collect();
  let ccw: Vec<_> = ls.ccw_members().iter().map(|m| m.id.clone()).collect();
  assert_eq!(cw, vec![Id::from_u128(101, 8), Id::from_u128(102, 8)]);
  assert_eq!(ccw, vec![Id::from_u128(99, 8), Id::from_u128(98, 8)]);
  assert!(ls.is_complete());
  assert!(!ls.overlaps());
  assert!(ls.covers(&Id::from_u128(102, 8)));
  assert!(ls.covers(&Id::from_u128(98, 8)));
  assert!(!ls.covers(&Id::from_u128(103, 8)));
  assert_eq!(ls.get(0).unwrap().id, Id::from_u128(100, 8));
  assert_eq!(ls.get(2).unwrap().id, Id::from_u128(102, 8));
  assert_eq!(ls.get(-1).unwrap().id, Id::from_u128(99, 8));
  assert!(ls.get(3).is_none());
  assert!(!ls.test(&h(120)));
}

#[test]
fn test_wraparound_and_overlap() {
  let mut ls = LeafSet::new(h(250), 4);
  ls.put(h(3));
  assert!(ls.overlaps());
  assert!(ls.is_complete());
  assert_eq!(ls.cw_size(), 1);
  assert_eq!(ls.ccw_size(), 1);
  assert_eq!(ls.size(), 1);
  ls.put(h(240));
  // 3 is clockwise nearest across zero, 240 counter-clockwise nearest
  assert_eq!(ls.cw_members()[0].id, Id::from_u128(3, 8));
  assert_eq!(ls.ccw_members()[0].id, Id::from_u128(240, 8));
  assert!(ls.covers(&Id::from_u128(128, 8)));
}

#[test]
fn test_events_on_eviction() {
  let mut ls = LeafSet::new(h(100), 2);
  ls.put(h(110));
  ls.put(h(90));
  ls.take_events();
  assert!(ls.put(h(105)));
  let events = ls.take_events();
  assert_eq!(events, vec![SetEvent::Added(h(105)), SetEvent::Removed(h(110))]);
  assert!(!ls.member(&Id::from_u128(110, 8)));
  assert_eq!(ls.remove(&Id::from_u128(90, 8)), Some(h(90)));
  assert_eq!(ls.take_events(), vec![SetEvent::Removed(h(90))]);
  assert_eq!(ls.remove(&Id::from_u128(90, 8)), None);
}

#[test]
fn test_random_halves_never_exceed() {
  let mut rng = SmallRng::seed_from_u64(5);
  let mut ls = LeafSet::new(h(0x80), 6);
  for _ in 0..500 {
    let id: u8 = rng.gen();
    if rng.gen_bool(0.3) {
      ls.remove(&Id::from_u128(id as u128, 8));
    } else {
      ls.put(h(id as u128));
    }
    assert!(ls.cw_size() <= 3 && ls.ccw_size() <= 3);
    assert!(!ls.member(&Id::from_u128(0x80, 8)));
  }
}

#[test]
fn test_merge_and_closest() {
  let local = h(100);
  let mut pool = HandlePool::new(local.clone());
  let mut table = RoutingTable::new(local.clone(), 2, 2);
  let mut ls = LeafSet::new(local.clone(), 4);
  let from = pool.coalesce(&h(104));
  let snap = LeafSetSnapshot {
    base: (*from).clone(),
    cw: vec![(*h(108)).clone(), (*h(200)).clone()],
    ccw: vec![(*h(102)).clone(), (*h(100)).clone()],
  };
  pool.coalesce(&h(108));
  pool.mark_dead(&Id::from_u128(108, 8));
  let added = ls.merge(&snap, from.clone(), &mut table, &mut pool);
  let ids: Vec<_> = added.iter().map(|a| a.id.clone()).collect();
  assert_eq!(ids, vec![Id::from_u128(104, 8), Id::from_u128(200, 8), Id::from_u128(102, 8)]);
  assert!(!ls.member(&Id::from_u128(108, 8)));
  assert!(table.contains(&Id::from_u128(200, 8)));

  assert_eq!(ls.closest_alive(&Id::from_u128(103, 8), &pool).id, Id::from_u128(102, 8));
  assert_eq!(ls.closest_alive(&Id::from_u128(101, 8), &pool).id, Id::from_u128(100, 8));
  pool.mark_dead(&Id::from_u128(102, 8));
  assert_eq!(ls.closest_alive(&Id::from_u128(103, 8), &pool).id, Id::from_u128(104, 8));
}

#[test]
fn test_member_refills_other_half() {
  let mut ls = LeafSet::new(h(100), 4);
  for id in [99u128, 98, 101].iter() {
    ls.put(h(*id));
  }
  // 101 is too far counter-clockwise while 99 and 98 fill that side
  assert_eq!(ls.ccw_size(), 2);
  ls.remove(&Id::from_u128(99, 8));
  ls.remove(&Id::from_u128(98, 8));
  ls.take_events();
  assert_eq!(ls.ccw_size(), 0);
  assert!(!ls.put(h(101)));
  assert_eq!(ls.ccw_members()[0].id, Id::from_u128(101, 8));
  assert!(ls.take_events().is_empty());
}
