use crate::core::{Id, TransportConfig};
use hashbrown::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LivenessAction {
  Ping(Id, u64),
  Suspected(Id),
  Dead(Id),
  /// A suspected peer was heard from again.
  Alive(Id),
}

struct PeerState {
  last_heard: Instant,
  outstanding: Option<(u64, Instant)>,
  missed: u32,
  next_seq: u64,
}
impl PeerState {
  fn ping(&mut self, id: &Id, now: Instant) -> LivenessAction {
    let seq = self.next_seq;
    self.next_seq += 1;
    self.outstanding = Some((seq, now));
    LivenessAction::Ping(id.clone(), seq)
  }
}

/// Ping bookkeeping for every connected peer.
///
/// Any frame from a peer counts as a sign of life. Idle peers are pinged every
/// `ping_interval`; a ping unanswered after `pong_timeout` is a miss. The first miss makes the
/// peer suspected, `max_missed_pongs` misses make it dead and untracked.
pub struct LivenessTracker {
  ping_interval: Duration,
  pong_timeout: Duration,
  max_missed: u32,
  peers: HashMap<Id, PeerState>,
}
impl LivenessTracker {
  pub fn new(config: &TransportConfig) -> LivenessTracker {
    LivenessTracker {
      ping_interval: config.ping_interval,
      pong_timeout: config.pong_timeout,
      max_missed: config.max_missed_pongs,
      peers: HashMap::new(),
    }
  }

  pub fn track(&mut self, id: &Id, now: Instant) {
    self.peers.entry(id.clone()).or_insert(PeerState {
      last_heard: now,
      outstanding: None,
      missed: 0,
      next_seq: 0,
    });
  }

  pub fn forget(&mut self, id: &Id) {
    self.peers.remove(id);
  }

  pub fn is_tracked(&self, id: &Id) -> bool {
    self.peers.contains_key(id)
  }

  pub fn missed(&self, id: &Id) -> u32 {
    self.peers.get(id).map_or(0, |p| p.missed)
  }

  /// Any traffic from the peer.
  pub fn heard(&mut self, id: &Id, now: Instant) -> Option<LivenessAction> {
    let peer = self.peers.get_mut(id)?;
    peer.last_heard = now;
    if peer.missed > 0 {
      peer.missed = 0;
      return Some(LivenessAction::Alive(id.clone()));
    }
    None
  }

  /// A pong for `seq`. Returns the round trip if it answers the outstanding ping.
  pub fn pong(&mut self, id: &Id, seq: u64, now: Instant) -> Option<Duration> {
    let peer = self.peers.get_mut(id)?;
    peer.last_heard = now;
    match peer.outstanding {
      Some((s, sent)) if s == seq => {
        peer.outstanding = None;
        peer.missed = 0;
        Some(now.saturating_duration_since(sent))
      }
      _ => None,
    }
  }

  /// Ping the peer now unless a ping is already out.
  pub fn check(&mut self, id: &Id, now: Instant) -> Option<LivenessAction> {
    self.track(id, now);
    let peer = self.peers.get_mut(id)?;
    if peer.outstanding.is_some() {
      return None;
    }
    Some(peer.ping(id, now))
  }

  pub fn tick(&mut self, now: Instant) -> Vec<LivenessAction> {
    let mut actions = Vec::new();
    let mut dead = Vec::new();
    for (id, peer) in self.peers.iter_mut() {
      match peer.outstanding {
        Some((_, sent)) if now.saturating_duration_since(sent) >= self.pong_timeout => {
          peer.outstanding = None;
          peer.missed += 1;
          if peer.missed >= self.max_missed {
            dead.push(id.clone());
            continue;
          }
          if peer.missed == 1 {
            actions.push(LivenessAction::Suspected(id.clone()));
          }
          actions.push(peer.ping(id, now));
        }
        Some(_) => {}
        None => {
          if now.saturating_duration_since(peer.last_heard) >= self.ping_interval {
            actions.push(peer.ping(id, now));
          }
        }
      }
    }
    for id in dead {
      self.peers.remove(&id);
      actions.push(LivenessAction::Dead(id));
    }
    actions
  }
}

#[test]
fn test_ping_suspect_dead() {
  let mut config = TransportConfig::default();
  config.ping_interval = Duration::from_millis(100);
  config.pong_timeout = Duration::from_millis(50);
  config.max_missed_pongs = 2;
  let mut t = LivenessTracker::new(&config);
  let id = Id::from_u128(5, 8);
  let start = Instant::now();
  t.track(&id, start);
  assert_eq!(t.tick(start + Duration::from_millis(10)), vec![]);

  let at = start + Duration::from_millis(100);
  assert_eq!(t.tick(at), vec![LivenessAction::Ping(id.clone(), 0)]);
  let at = at + Duration::from_millis(50);
  assert_eq!(
    t.tick(at),
    vec![
      LivenessAction::Suspected(id.clone()),
      LivenessAction::Ping(id.clone(), 1)
    ]
  );
  assert_eq!(t.missed(&id), 1);
  // traffic clears the suspicion but the new ping stays outstanding
  assert_eq!(t.heard(&id, at), Some(LivenessAction::Alive(id.clone())));
  assert_eq!(t.heard(&id, at), None);
  let at = at + Duration::from_millis(50);
  assert_eq!(
    t.tick(at),
    vec![
      LivenessAction::Suspected(id.clone()),
      LivenessAction::Ping(id.clone(), 2)
    ]
  );
  let at = at + Duration::from_millis(50);
  assert_eq!(t.tick(at), vec![LivenessAction::Dead(id.clone())]);
  assert!(!t.is_tracked(&id));
}

#[test]
fn test_pong_measures_rtt() {
  let config = TransportConfig::default();
  let mut t = LivenessTracker::new(&config);
  let id = Id::from_u128(9, 8);
  let start = Instant::now();
  assert_eq!(t.check(&id, start), Some(LivenessAction::Ping(id.clone(), 0)));
  assert_eq!(t.check(&id, start), None);
  // stale sequence numbers are ignored
  assert_eq!(t.pong(&id, 7, start), None);
  let rtt = t.pong(&id, 0, start + Duration::from_millis(12));
  assert_eq!(rtt, Some(Duration::from_millis(12)));
  assert_eq!(t.heard(&id, start), None);
}
