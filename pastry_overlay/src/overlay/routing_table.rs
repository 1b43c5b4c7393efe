use crate::core::{HandlePool, Id, LocalRef, NodeHandle, Observers, SetEvent};
use crate::overlay::{RouteSet, RouteSetPut};
use std::sync::Arc;

/// The prefix routing table: `rows x 2^b` route sets.
///
/// A handle whose identifier first differs from the local identifier at digit `r` (counting
/// from the most significant end, digit indices from the least) lives in row `r`, column equal
/// to its own digit `r`. Every member of row `r` therefore shares all digits above `r` with the
/// local node.
pub struct RoutingTable {
  local: Arc<NodeHandle>,
  digit_bits: usize,
  rows: Vec<Vec<RouteSet>>,
  observers: Observers<SetEvent>,
  journal: Vec<SetEvent>,
}
impl RoutingTable {
  pub fn new(
    local: Arc<NodeHandle>,
    digit_bits: usize,
    max_route_set_size: usize,
  ) -> RoutingTable {
    let num_rows = local.id.num_digits(digit_bits);
    let cols = 1usize << digit_bits;
    let rows = (0..num_rows)
      .map(|_| (0..cols).map(|_| RouteSet::new(max_route_set_size)).collect())
      .collect();
    RoutingTable {
      local: local,
      digit_bits: digit_bits,
      rows: rows,
      observers: Observers::new(),
      journal: Vec::new(),
    }
  }

  pub fn num_rows(&self) -> usize {
    self.rows.len()
  }

  pub fn num_cols(&self) -> usize {
    1 << self.digit_bits
  }

  pub fn digit_bits(&self) -> usize {
    self.digit_bits
  }

  /// The cell a handle or key with this identifier maps to. `None` for the local identifier.
  pub fn cell_of(&self, id: &Id) -> Option<(usize, usize)> {
    let row = self.local.id.index_of_msdd(id, self.digit_bits)?;
    Some((row, id.digit(row, self.digit_bits)))
  }

  pub fn subscribe(&mut self, subscriber: LocalRef<SetEvent>) {
    self.observers.subscribe(subscriber);
  }

  /// Events since the last call, oldest first.
  pub fn take_events(&mut self) -> Vec<SetEvent> {
    std::mem::replace(&mut self.journal, Vec::new())
  }

  fn record(&mut self, event: SetEvent) {
    self.observers.notify(&event);
    self.journal.push(event);
  }

  /// Returns true if the handle was newly added.
  pub fn put(&mut self, handle: Arc<NodeHandle>, pool: &HandlePool) -> bool {
    let (row, col) = match self.cell_of(&handle.id) {
      Some(cell) => cell,
      None => return false,
    };
    match self.rows[row][col].put(handle.clone(), pool) {
      RouteSetPut::Added => {
        self.record(SetEvent::Added(handle));
        true
      }
      RouteSetPut::Replaced(victim) => {
        self.record(SetEvent::Removed(victim));
        self.record(SetEvent::Added(handle));
        true
      }
      RouteSetPut::Present | RouteSetPut::Rejected => false,
    }
  }

  pub fn remove(&mut self, id: &Id) -> Option<Arc<NodeHandle>> {
    let (row, col) = self.cell_of(id)?;
    let removed = self.rows[row][col].remove(id)?;
    self.record(SetEvent::Removed(removed.clone()));
    Some(removed)
  }

  pub fn contains(&self, id: &Id) -> bool {
    match self.cell_of(id) {
      Some((row, col)) => self.rows[row][col].contains(id),
      None => false,
    }
  }

  /// The route set a message for `dest` should be forwarded through, if it is non-empty.
  pub fn best_route(&self, dest: &Id) -> Option<&RouteSet> {
    let (row, col) = self.cell_of(dest)?;
    let set = &self.rows[row][col];
    if set.is_empty() {
      None
    } else {
      Some(set)
    }
  }

  pub fn get_row(&self, row: usize) -> Option<&[RouteSet]> {
    self.rows.get(row).map(|r| r.as_slice())
  }

  pub fn get_route_set(&self, row: usize, col: usize) -> Option<&RouteSet> {
    self.rows.get(row).and_then(|r| r.get(col))
  }

  pub fn handles(&self) -> impl Iterator<Item = &Arc<NodeHandle>> {
    self.rows.iter().flatten().flat_map(|set| set.iter())
  }

  pub fn len(&self) -> usize {
    self.handles().count()
  }

  pub fn is_empty(&self) -> bool {
    self.handles().next().is_none()
  }

  /// Indices of rows holding at least one handle.
  pub fn non_empty_rows(&self) -> Vec<usize> {
    (0..self.rows.len())
      .filter(|r| self.rows[*r].iter().any(|s| !s.is_empty()))
      .collect()
  }

  /// Row `row` for the wire, one entry per column.
  pub fn row_snapshot(&self, row: usize) -> Vec<Vec<NodeHandle>> {
    match self.rows.get(row) {
      Some(r) => r.iter().map(|set| set.snapshot()).collect(),
      None => Vec::new(),
    }
  }
}

#[cfg(test)]
use crate::core::Socket;
#[cfg(test)]
use rand::{rngs::SmallRng, Rng, SeedableRng};

#[cfg(test)]
fn table_for(local: u128, bits: usize, digit_bits: usize) -> (RoutingTable, HandlePool) {
  let local = Arc::new(NodeHandle::with_epoch(
    Id::from_u128(local, bits),
    Socket::localhost(1),
    1,
  ));
  (
    RoutingTable::new(local.clone(), digit_bits, 2),
    HandlePool::new(local),
  )
}

#[test]
fn test_small_id_placement() {
  let (mut rt, mut pool) = table_for(0b1000_0000, 8, 2);
  assert_eq!(rt.num_rows(), 4);
  assert_eq!(rt.num_cols(), 4);
  let mut put = |id: u128| {
    let h = pool.coalesce(&NodeHandle::with_epoch(
      Id::from_u128(id, 8),
      Socket::localhost(id as u16 + 10),
      1,
    ));
    (rt.put(h.clone(), &pool), h)
  };
  let (added, low) = put(0b0000_0001);
  assert!(added);
  let (_, mid) = put(0b0100_0000);
  let (_, near) = put(0b1000_0001);
  let (_, high) = put(0b1111_1111);
  assert_eq!(rt.cell_of(&low.id), Some((3, 0)));
  assert_eq!(rt.cell_of(&mid.id), Some((3, 1)));
  assert_eq!(rt.cell_of(&near.id), Some((0, 1)));
  assert_eq!(rt.cell_of(&high.id), Some((3, 3)));
  assert!(rt.get_route_set(3, 0).unwrap().contains(&low.id));
  assert!(rt.get_route_set(3, 1).unwrap().contains(&mid.id));
  assert!(rt.get_route_set(0, 1).unwrap().contains(&near.id));
  assert!(rt.get_route_set(3, 3).unwrap().contains(&high.id));
  assert_eq!(rt.len(), 4);
  assert_eq!(rt.non_empty_rows(), vec![0, 3]);
  assert_eq!(rt.cell_of(&Id::from_u128(0b1000_0000, 8)), None);
}

#[test]
fn test_placement_invariant() {
  let mut rng = SmallRng::seed_from_u64(21);
  for digit_bits in [1usize, 2, 3, 4, 8].iter() {
    let local = rng.gen::<u32>() as u128;
    let (mut rt, mut pool) = table_for(local, 32, *digit_bits);
    for _ in 0..300 {
      let id = Id::random(32, &mut rng);
      let h = pool.coalesce(&NodeHandle::with_epoch(id, Socket::localhost(2), 1));
      rt.put(h, &pool);
    }
    let local_id = Id::from_u128(local, 32);
    for row in 0..rt.num_rows() {
      for col in 0..rt.num_cols() {
        for h in rt.get_route_set(row, col).unwrap().iter() {
          assert_eq!(local_id.index_of_msdd(&h.id, *digit_bits), Some(row));
          assert_eq!(h.id.digit(row, *digit_bits), col);
          assert_ne!(col, local_id.digit(row, *digit_bits));
        }
      }
    }
  }
}

#[test]
fn test_events_and_best_route() {
  let (mut rt, mut pool) = table_for(0x8000, 16, 4);
  let a = pool.coalesce(&NodeHandle::with_epoch(
    Id::from_u128(0x1234, 16),
    Socket::localhost(2),
    1,
  ));
  assert!(rt.put(a.clone(), &pool));
  assert!(!rt.put(a.clone(), &pool));
  assert_eq!(rt.take_events(), vec![SetEvent::Added(a.clone())]);
  let via = rt.best_route(&Id::from_u128(0x1fff, 16)).unwrap();
  assert!(via.contains(&a.id));
  assert!(rt.best_route(&Id::from_u128(0x2fff, 16)).is_none());
  assert!(rt.best_route(&Id::from_u128(0x8000, 16)).is_none());
  assert_eq!(rt.remove(&a.id), Some(a.clone()));
  assert_eq!(rt.take_events(), vec![SetEvent::Removed(a.clone())]);
  assert!(rt.take_events().is_empty());
}
