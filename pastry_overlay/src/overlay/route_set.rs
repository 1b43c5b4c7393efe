use crate::core::{HandlePool, Id, NodeHandle};
use smallvec::SmallVec;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteSetPut {
  Added,
  /// Added, pushing out the returned handle.
  Replaced(Arc<NodeHandle>),
  /// Already a member. The stored handle was refreshed to the canonical one.
  Present,
  Rejected,
}

/// One routing table cell: a bounded set of handles sharing the same prefix and next digit.
///
/// When full, the worst member is evicted in favour of a better candidate. Worse means dead
/// before alive, then higher proximity, then the larger identifier.
#[derive(Clone, Debug)]
pub struct RouteSet {
  capacity: usize,
  members: SmallVec<[Arc<NodeHandle>; 4]>,
}
impl RouteSet {
  pub fn new(capacity: usize) -> RouteSet {
    RouteSet {
      capacity: capacity,
      members: SmallVec::new(),
    }
  }

  fn rank(handle: &NodeHandle, pool: &HandlePool) -> (bool, u64, Id) {
    (
      pool.is_known_dead(&handle.id),
      pool.proximity(&handle.id),
      handle.id.clone(),
    )
  }

  pub fn put(&mut self, handle: Arc<NodeHandle>, pool: &HandlePool) -> RouteSetPut {
    if let Some(existing) = self.members.iter_mut().find(|m| m.id == handle.id) {
      *existing = handle;
      return RouteSetPut::Present;
    }
    if self.members.len() < self.capacity {
      self.members.push(handle);
      return RouteSetPut::Added;
    }
    let worst = self
      .members
      .iter()
      .enumerate()
      .max_by_key(|(_, m)| Self::rank(m, pool))
      .map(|(i, _)| i);
    match worst {
      Some(i) if Self::rank(&handle, pool) < Self::rank(&self.members[i], pool) => {
        let victim = std::mem::replace(&mut self.members[i], handle);
        RouteSetPut::Replaced(victim)
      }
      _ => RouteSetPut::Rejected,
    }
  }

  pub fn remove(&mut self, id: &Id) -> Option<Arc<NodeHandle>> {
    let pos = self.members.iter().position(|m| m.id == *id)?;
    Some(self.members.remove(pos))
  }

  pub fn contains(&self, id: &Id) -> bool {
    self.members.iter().any(|m| m.id == *id)
  }

  pub fn get(&self, i: usize) -> Option<&Arc<NodeHandle>> {
    self.members.get(i)
  }

  pub fn len(&self) -> usize {
    self.members.len()
  }

  pub fn is_empty(&self) -> bool {
    self.members.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<NodeHandle>> {
    self.members.iter()
  }

  /// The alive member with the lowest proximity, ties broken by the lower identifier.
  pub fn closest(&self, pool: &HandlePool) -> Option<&Arc<NodeHandle>> {
    self
      .members
      .iter()
      .filter(|m| pool.is_alive(&m.id))
      .min_by_key(|m| (pool.proximity(&m.id), m.id.clone()))
  }

  pub fn snapshot(&self) -> Vec<NodeHandle> {
    self.members.iter().map(|m| (**m).clone()).collect()
  }
}

#[cfg(test)]
use crate::core::Socket;

#[cfg(test)]
fn pool_with(ids: &[u128]) -> (HandlePool, Vec<Arc<NodeHandle>>) {
  let local = NodeHandle::with_epoch(Id::from_u128(0, 8), Socket::localhost(1), 1);
  let mut pool = HandlePool::new(Arc::new(local));
  let handles = ids
    .iter()
    .map(|i| {
      pool.coalesce(&NodeHandle::with_epoch(
        Id::from_u128(*i, 8),
        Socket::localhost(100 + *i as u16),
        1,
      ))
    })
    .collect();
  (pool, handles)
}

#[test]
fn test_route_set_eviction() {
  let (mut pool, h) = pool_with(&[10, 11, 12, 13]);
  pool.update_proximity(&h[0].id, 50);
  pool.update_proximity(&h[1].id, 5);
  pool.update_proximity(&h[2].id, 30);
  let mut rs = RouteSet::new(2);
  assert_eq!(rs.put(h[0].clone(), &pool), RouteSetPut::Added);
  assert_eq!(rs.put(h[1].clone(), &pool), RouteSetPut::Added);
  assert_eq!(rs.put(h[1].clone(), &pool), RouteSetPut::Present);
  // 30 beats the current worst (50)
  assert_eq!(rs.put(h[2].clone(), &pool), RouteSetPut::Replaced(h[0].clone()));
  // unmeasured proximity loses to both
  assert_eq!(rs.put(h[3].clone(), &pool), RouteSetPut::Rejected);
  assert_eq!(rs.len(), 2);
  assert_eq!(rs.closest(&pool), Some(&h[1]));

  // the dead member goes first, whatever its proximity
  pool.mark_dead(&h[1].id);
  assert_eq!(rs.closest(&pool), Some(&h[2]));
  assert_eq!(rs.put(h[3].clone(), &pool), RouteSetPut::Replaced(h[1].clone()));
  assert!(rs.contains(&h[3].id));
  assert_eq!(rs.remove(&h[2].id), Some(h[2].clone()));
  assert_eq!(rs.len(), 1);
}

#[test]
fn test_route_set_tie_break() {
  let (pool, h) = pool_with(&[40, 20, 30]);
  let mut rs = RouteSet::new(2);
  rs.put(h[0].clone(), &pool);
  rs.put(h[1].clone(), &pool);
  // equal proximity everywhere: the larger id is the victim
  assert_eq!(rs.put(h[2].clone(), &pool), RouteSetPut::Replaced(h[0].clone()));
  assert_eq!(rs.closest(&pool), Some(&h[1]));
}
