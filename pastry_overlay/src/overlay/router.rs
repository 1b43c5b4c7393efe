use crate::core::{HandlePool, Id, NodeHandle};
use crate::overlay::{LeafSet, RoutingTable};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteStep {
  Start,
  LeafSet,
  Table,
  Fallback,
}

/// Which part of the routing state produced a hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HopSource {
  LeafSet,
  Table,
  Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteDecision {
  /// This node is the closest live node it knows of.
  Deliver,
  Forward {
    hop: Arc<NodeHandle>,
    source: HopSource,
  },
}

/// The next-hop decision over a borrowed view of a node's routing state.
///
/// Each step only hands off to the next one when it has nothing to offer, and no step ever picks
/// a hop that is not closer to the destination than the local node, either by shared prefix or
/// numerically.
pub struct Router<'a> {
  pub local: &'a Arc<NodeHandle>,
  pub leaf_set: &'a LeafSet,
  pub table: &'a RoutingTable,
  pub pool: &'a HandlePool,
}
impl<'a> Router<'a> {
  pub fn next_hop(&self, dest: &Id) -> RouteDecision {
    self.next_hop_excluding(dest, None)
  }

  /// As `next_hop`, never choosing `exclude`.
  pub fn next_hop_excluding(&self, dest: &Id, exclude: Option<&Id>) -> RouteDecision {
    let usable = |h: &Arc<NodeHandle>| {
      self.pool.is_alive(&h.id) && exclude.map_or(true, |x| *x != h.id)
    };
    let mut step = RouteStep::Start;
    loop {
      step = match step {
        RouteStep::Start => RouteStep::LeafSet,
        RouteStep::LeafSet => {
          if self.leaf_set.covers(dest) {
            let mut best = self.local.clone();
            let mut best_key = (dest.distance(&best.id), best.id.clone());
            for h in self.leaf_set.members().into_iter().filter(|h| usable(h)) {
              let key = (dest.distance(&h.id), h.id.clone());
              if key < best_key {
                best_key = key;
                best = h;
              }
            }
            return if best.id == self.local.id {
              RouteDecision::Deliver
            } else {
              RouteDecision::Forward {
                hop: best,
                source: HopSource::LeafSet,
              }
            };
          }
          RouteStep::Table
        }
        RouteStep::Table => {
          let hop = self.table.best_route(dest).and_then(|set| {
            set
              .iter()
              .filter(|h| usable(*h))
              .min_by_key(|h| (self.pool.proximity(&h.id), h.id.clone()))
          });
          if let Some(hop) = hop {
            return RouteDecision::Forward {
              hop: hop.clone(),
              source: HopSource::Table,
            };
          }
          RouteStep::Fallback
        }
        RouteStep::Fallback => return self.fallback(dest, &usable),
      }
    }
  }

  // Any known node sharing at least our prefix with dest and strictly closer to it.
  fn fallback<F>(&self, dest: &Id, usable: &F) -> RouteDecision
  where
    F: Fn(&Arc<NodeHandle>) -> bool,
  {
    let bits = self.table.digit_bits();
    // a shorter shared prefix means a higher msdd index; None means equal
    let local_msdd = match self.local.id.index_of_msdd(dest, bits) {
      Some(i) => i,
      None => return RouteDecision::Deliver,
    };
    let local_dist = dest.distance(&self.local.id);
    let candidates = self
      .leaf_set
      .members()
      .into_iter()
      .chain(self.table.handles().cloned());
    let best = candidates
      .filter(|h| usable(h))
      .filter(|h| match h.id.index_of_msdd(dest, bits) {
        Some(i) => i <= local_msdd,
        None => true,
      })
      .filter(|h| dest.distance(&h.id) < local_dist)
      .min_by_key(|h| (dest.distance(&h.id), h.id.clone()));
    match best {
      Some(hop) => RouteDecision::Forward {
        hop: hop,
        source: HopSource::Fallback,
      },
      None => RouteDecision::Deliver,
    }
  }
}

#[cfg(test)]
use crate::core::Socket;

#[cfg(test)]
struct Fixture {
  local: Arc<NodeHandle>,
  pool: HandlePool,
  leaf_set: LeafSet,
  table: RoutingTable,
}
#[cfg(test)]
impl Fixture {
  fn new(local: u128) -> Fixture {
    let local = Arc::new(NodeHandle::with_epoch(
      Id::from_u128(local, 16),
      Socket::localhost(1),
      1,
    ));
    Fixture {
      pool: HandlePool::new(local.clone()),
      leaf_set: LeafSet::new(local.clone(), 4),
      table: RoutingTable::new(local.clone(), 4, 2),
      local: local,
    }
  }

  fn add(&mut self, id: u128, leaf: bool) -> Arc<NodeHandle> {
    let h = self.pool.coalesce(&NodeHandle::with_epoch(
      Id::from_u128(id, 16),
      Socket::localhost(id as u16),
      1,
    ));
    if leaf {
      self.leaf_set.put(h.clone());
    }
    self.table.put(h.clone(), &self.pool);
    h
  }

  fn route(&self, dest: u128) -> RouteDecision {
    Router {
      local: &self.local,
      leaf_set: &self.leaf_set,
      table: &self.table,
      pool: &self.pool,
    }
    .next_hop(&Id::from_u128(dest, 16))
  }
}

#[test]
fn test_leaf_set_step() {
  let mut f = Fixture::new(0x8000);
  let a = f.add(0x8010, true);
  f.add(0x8020, true);
  f.add(0x7ff0, true);
  f.add(0x7fe0, true);
  assert_eq!(f.route(0x8001), RouteDecision::Deliver);
  assert_eq!(
    f.route(0x800c),
    RouteDecision::Forward {
      hop: a.clone(),
      source: HopSource::LeafSet
    }
  );
  // dead leaf members are skipped
  f.pool.mark_dead(&a.id);
  assert_eq!(f.route(0x800c), RouteDecision::Deliver);
}

#[test]
fn test_table_then_fallback() {
  let mut f = Fixture::new(0x8000);
  f.add(0x8010, true);
  let edge = f.add(0x8020, true);
  f.add(0x7ff0, true);
  f.add(0x7fe0, true);
  let far = f.add(0x2345, false);
  let near = f.add(0x2300, false);
  f.pool.update_proximity(&far.id, 3);
  f.pool.update_proximity(&near.id, 9);
  // same cell, lower proximity wins
  assert_eq!(
    f.route(0x2999),
    RouteDecision::Forward {
      hop: far.clone(),
      source: HopSource::Table
    }
  );
  f.pool.mark_dead(&far.id);
  assert_eq!(
    f.route(0x2999),
    RouteDecision::Forward {
      hop: near.clone(),
      source: HopSource::Table
    }
  );
  // nothing in row 3, column 1: fall back to the numerically closest with no worse prefix
  assert_eq!(
    f.route(0x1000),
    RouteDecision::Forward {
      hop: near.clone(),
      source: HopSource::Fallback
    }
  );
  // outside the leaf set's span, its far edge still makes progress
  assert_eq!(
    f.route(0xc000),
    RouteDecision::Forward {
      hop: edge.clone(),
      source: HopSource::Fallback
    }
  );
}
