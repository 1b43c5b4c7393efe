use crate::core::Id;
use hashbrown::HashMap;
use std::time::{Duration, Instant};

struct Parked<S> {
  target: Id,
  stream: S,
  since: Instant,
}

/// Rendezvous bookkeeping on a helper node.
///
/// Nodes behind NAT register a pilot connection here. A connector naming one of them is parked
/// under its token until the target's acceptor shows up with the same token, and both streams
/// are handed out for splicing. Generic over the stream so the bookkeeping stays testable.
pub struct RelayTable<C, S> {
  pilots: HashMap<Id, C>,
  parked: HashMap<u64, Parked<S>>,
}
impl<C: Clone + PartialEq, S> RelayTable<C, S> {
  pub fn new() -> RelayTable<C, S> {
    RelayTable {
      pilots: HashMap::new(),
      parked: HashMap::new(),
    }
  }

  /// A newer pilot for the same node replaces the old one.
  pub fn register_pilot(&mut self, target: Id, conn: C) -> Option<C> {
    self.pilots.insert(target, conn)
  }

  pub fn pilot_for(&self, target: &Id) -> Option<&C> {
    self.pilots.get(target)
  }

  /// The pilot connection `conn` went away. Returns the connectors that were waiting on it,
  /// which have to be refused.
  pub fn drop_pilot_conn(&mut self, conn: &C) -> Vec<S> {
    let gone: Vec<Id> = self
      .pilots
      .iter()
      .filter(|(_, c)| *c == conn)
      .map(|(id, _)| id.clone())
      .collect();
    let mut refused = Vec::new();
    for id in gone {
      self.pilots.remove(&id);
      let tokens: Vec<u64> = self
        .parked
        .iter()
        .filter(|(_, p)| p.target == id)
        .map(|(t, _)| *t)
        .collect();
      for t in tokens {
        if let Some(p) = self.parked.remove(&t) {
          refused.push(p.stream);
        }
      }
    }
    refused
  }

  pub fn park(&mut self, token: u64, target: Id, stream: S, now: Instant) {
    self.parked.insert(
      token,
      Parked {
        target: target,
        stream: stream,
        since: now,
      },
    );
  }

  pub fn take(&mut self, token: u64) -> Option<S> {
    self.parked.remove(&token).map(|p| p.stream)
  }

  pub fn parked(&self) -> usize {
    self.parked.len()
  }

  /// Connectors that waited longer than `timeout` for their acceptor.
  pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<S> {
    let old: Vec<u64> = self
      .parked
      .iter()
      .filter(|(_, p)| now.saturating_duration_since(p.since) >= timeout)
      .map(|(t, _)| *t)
      .collect();
    old
      .into_iter()
      .filter_map(|t| self.parked.remove(&t).map(|p| p.stream))
      .collect()
  }
}
impl<C: Clone + PartialEq, S> Default for RelayTable<C, S> {
  fn default() -> Self {
    RelayTable::new()
  }
}

#[test]
fn test_park_take_and_refuse() {
  let mut table: RelayTable<u64, &'static str> = RelayTable::new();
  let nat = Id::from_u128(0x42, 8);
  let start = Instant::now();
  assert_eq!(table.register_pilot(nat.clone(), 7), None);
  assert_eq!(table.pilot_for(&nat), Some(&7));
  table.park(1, nat.clone(), "first", start);
  table.park(2, nat.clone(), "second", start);
  assert_eq!(table.take(1), Some("first"));
  assert_eq!(table.take(1), None);
  // the pilot dies with one connector still waiting
  assert_eq!(table.drop_pilot_conn(&7), vec!["second"]);
  assert_eq!(table.pilot_for(&nat), None);
  assert_eq!(table.parked(), 0);
}

#[test]
fn test_expire() {
  let mut table: RelayTable<u64, u8> = RelayTable::new();
  let start = Instant::now();
  table.park(1, Id::from_u128(1, 8), 10, start);
  table.park(2, Id::from_u128(1, 8), 20, start + Duration::from_secs(3));
  let gone = table.expire(start + Duration::from_secs(5), Duration::from_secs(5));
  assert_eq!(gone, vec![10]);
  assert_eq!(table.parked(), 1);
}
