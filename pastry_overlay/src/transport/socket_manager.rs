use crate::core::Socket;
use linked_hash_map::LinkedHashMap;
use std::hash::Hash;

/// The working set of outbound sockets, least recently active first.
pub struct SocketManager<K: Hash + Eq> {
  capacity: usize,
  lru: LinkedHashMap<K, ()>,
}
impl<K: Hash + Eq + Clone> SocketManager<K> {
  pub fn new(capacity: usize) -> SocketManager<K> {
    SocketManager {
      capacity: std::cmp::max(capacity, 1),
      lru: LinkedHashMap::new(),
    }
  }

  /// Record a newly opened socket. Returns the socket that has to make room for it, if the
  /// working set was full.
  pub fn opened(&mut self, key: K) -> Option<K> {
    self.lru.insert(key, ());
    if self.lru.len() > self.capacity {
      self.lru.pop_front().map(|(k, _)| k)
    } else {
      None
    }
  }

  /// Traffic on the socket. False if it is not managed here.
  pub fn updated(&mut self, key: &K) -> bool {
    self.lru.get_refresh(key).is_some()
  }

  pub fn closed(&mut self, key: &K) -> bool {
    self.lru.remove(key).is_some()
  }

  pub fn contains(&self, key: &K) -> bool {
    self.lru.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.lru.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lru.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Least recently active first.
  pub fn iter(&self) -> impl Iterator<Item = &K> {
    self.lru.keys()
  }
}

/// Both ends opened a connection to each other at once. The connection opened by the side with
/// the larger address string survives, so both sides reach the same verdict independently.
pub fn keeps_own_connection(local: &Socket, remote: &Socket) -> bool {
  local.to_string() > remote.to_string()
}

#[test]
fn test_lru_eviction() {
  let mut m = SocketManager::new(3);
  assert_eq!(m.opened(1), None);
  assert_eq!(m.opened(2), None);
  assert_eq!(m.opened(3), None);
  assert!(m.updated(&1));
  assert!(!m.updated(&9));
  // 2 is now the least recently active
  assert_eq!(m.opened(4), Some(2));
  assert_eq!(m.iter().cloned().collect::<Vec<_>>(), vec![3, 1, 4]);
  assert!(m.closed(&3));
  assert!(!m.closed(&3));
  assert_eq!(m.opened(5), None);
  assert_eq!(m.len(), 3);
}

#[test]
fn test_simultaneous_open_tiebreak() {
  let a = Socket::localhost(5001);
  let b = Socket::localhost(5002);
  assert!(keeps_own_connection(&b, &a));
  assert!(!keeps_own_connection(&a, &b));
}
