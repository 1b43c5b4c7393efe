use crate::core::{ConfigError, Id, Liveness, LocalRef, NodeHandle, PastryConfig, RouteError, Socket};
use crate::overlay::{
  AppAddress, AppMessage, AppUpcall, Effect, Outbox, PastryMsg, PastryNode, SendOptions,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The application every simulated node hosts.
pub const SIM_APP: &str = "sim";

/// Decides whether a message is lost on its way from the first handle to the second.
pub type DropRule = Box<dyn FnMut(&NodeHandle, &NodeHandle, &PastryMsg) -> bool + Send>;

/// Something that reached the simulated application of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimDelivery {
  pub at: Id,
  pub msg: AppMessage,
}

struct SimNode {
  pastry: PastryNode,
  alive: bool,
  /// Not ticked before this point.
  stalled_until: Duration,
}

enum SimEvent {
  Deliver {
    from: NodeHandle,
    to: NodeHandle,
    msg: PastryMsg,
  },
  /// The transport of `sender` gave up on `to`.
  SendFailed {
    sender: Id,
    to: NodeHandle,
    msg: PastryMsg,
  },
  Verdict {
    asker: Id,
    peer: NodeHandle,
    liveness: Liveness,
  },
}

/// Many [`PastryNode`]s in one process, on virtual time.
///
/// Every message takes `latency` to arrive. Messages to a dead node bounce back to the sender
/// as a failed send after the same delay, liveness checks are answered from whether the node is
/// alive, and drop rules lose messages silently. Nothing depends on the wall clock, so a run is
/// reproducible from its seed.
pub struct SimNetwork {
  config: PastryConfig,
  start: Instant,
  elapsed: Duration,
  next_tick: Duration,
  latency: Duration,
  seq: u64,
  epoch: u64,
  queue: BTreeMap<(Duration, u64), SimEvent>,
  nodes: BTreeMap<Id, SimNode>,
  rules: Vec<DropRule>,
  upcalls: Arc<Mutex<Vec<(Id, AppUpcall)>>>,
  rng: SmallRng,
  sent: u64,
}
impl SimNetwork {
  pub fn new(config: PastryConfig, seed: u64) -> SimNetwork {
    SimNetwork {
      next_tick: config.tick_interval,
      config: config,
      start: Instant::now(),
      elapsed: Duration::from_millis(0),
      latency: Duration::from_millis(5),
      seq: 0,
      epoch: 0,
      queue: BTreeMap::new(),
      nodes: BTreeMap::new(),
      rules: Vec::new(),
      upcalls: Arc::new(Mutex::new(Vec::new())),
      rng: SmallRng::seed_from_u64(seed),
      sent: 0,
    }
  }

  pub fn set_latency(&mut self, latency: Duration) {
    self.latency = latency;
  }

  pub fn now(&self) -> Instant {
    self.start + self.elapsed
  }

  pub fn elapsed(&self) -> Duration {
    self.elapsed
  }

  /// Messages handed to the network so far, lost ones included.
  pub fn sent(&self) -> u64 {
    self.sent
  }

  pub fn rng(&mut self) -> &mut SmallRng {
    &mut self.rng
  }

  /// Start a node, joining through `bootstrap` if given.
  pub fn add_node(&mut self, id: Id, bootstrap: Option<&Id>) -> Result<NodeHandle, ConfigError> {
    self.epoch += 1;
    let port = (self.nodes.len() % 60000) as u16 + 1024;
    let handle = NodeHandle::with_epoch(id.clone(), Socket::localhost(port), self.epoch);
    let mut pastry = PastryNode::new(handle.clone(), self.config.clone())?;
    let log = self.upcalls.clone();
    let at = id.clone();
    let recorder = LocalRef::<AppUpcall>::from_fn(move |u| match log.lock() {
      Ok(mut log) => {
        log.push((at.clone(), u));
        true
      }
      Err(_) => false,
    });
    pastry.register(AppAddress::from(SIM_APP), Box::new(recorder));
    let bootstrap = bootstrap
      .and_then(|b| self.nodes.get(b))
      .map(|b| (**b.pastry.local()).clone());
    let mut out = Outbox::new();
    let now = self.now();
    pastry.boot(bootstrap.as_ref(), now, &mut out);
    self.nodes.insert(
      id.clone(),
      SimNode {
        pastry: pastry,
        alive: true,
        stalled_until: self.elapsed,
      },
    );
    self.dispatch(&id, out);
    Ok(handle)
  }

  pub fn add_random_node(&mut self, bootstrap: Option<&Id>) -> Result<NodeHandle, ConfigError> {
    let id = loop {
      let id = Id::random(self.config.id_bits, &mut self.rng);
      if !self.nodes.contains_key(&id) {
        break id;
      }
    };
    self.add_node(id, bootstrap)
  }

  /// The node stops answering anything. It keeps its place in the map so its state can still
  /// be inspected.
  pub fn kill(&mut self, id: &Id) {
    if let Some(n) = self.nodes.get_mut(id) {
      n.alive = false;
    }
  }

  /// The node keeps running but is not ticked for `duration`, as if its process was paused.
  pub fn stall(&mut self, id: &Id, duration: Duration) {
    let until = self.elapsed + duration;
    if let Some(n) = self.nodes.get_mut(id) {
      n.stalled_until = until;
    }
  }

  /// Silently lose every message the rule matches.
  pub fn drop_when<F>(&mut self, rule: F)
  where
    F: FnMut(&NodeHandle, &NodeHandle, &PastryMsg) -> bool + Send + 'static,
  {
    self.rules.push(Box::new(rule));
  }

  pub fn clear_rules(&mut self) {
    self.rules.clear();
  }

  pub fn node(&self, id: &Id) -> Option<&PastryNode> {
    self.nodes.get(id).map(|n| &n.pastry)
  }

  pub fn is_alive(&self, id: &Id) -> bool {
    self.nodes.get(id).map_or(false, |n| n.alive)
  }

  /// Live nodes in identifier order.
  pub fn alive(&self) -> Vec<Id> {
    self
      .nodes
      .iter()
      .filter(|(_, n)| n.alive)
      .map(|(id, _)| id.clone())
      .collect()
  }

  pub fn all_ready(&self) -> bool {
    self.nodes.values().filter(|n| n.alive).all(|n| n.pastry.is_ready())
  }

  /// The live node a message for `key` should end up at.
  pub fn responsible(&self, key: &Id) -> Option<Id> {
    self
      .nodes
      .iter()
      .filter(|(_, n)| n.alive)
      .map(|(id, _)| (key.distance(id), id.clone()))
      .min()
      .map(|(_, id)| id)
  }

  pub fn route(&mut self, from: &Id, key: Id, payload: Vec<u8>) {
    let now = self.now();
    let mut out = Outbox::new();
    if let Some(n) = self.nodes.get_mut(from) {
      let options = SendOptions {
        notify_failure: true,
      };
      n.pastry.route(key, AppAddress::from(SIM_APP), payload, options, now, &mut out);
    }
    self.dispatch(from, out);
  }

  pub fn route_direct(&mut self, from: &Id, to: &NodeHandle, payload: Vec<u8>) {
    let mut out = Outbox::new();
    if let Some(n) = self.nodes.get_mut(from) {
      let options = SendOptions {
        notify_failure: true,
      };
      n.pastry.route_direct(to, AppAddress::from(SIM_APP), payload, options, &mut out);
    }
    self.dispatch(from, out);
  }

  pub fn deliveries(&self) -> Vec<SimDelivery> {
    self.upcalls(|at, u| match u {
      AppUpcall::Deliver(msg) => Some(SimDelivery {
        at: at.clone(),
        msg: msg.clone(),
      }),
      _ => None,
    })
  }

  /// `delivery_failed` upcalls, at the node that sent the message.
  pub fn failures(&self) -> Vec<(Id, RouteError)> {
    self.upcalls(|at, u| match u {
      AppUpcall::DeliveryFailed(_, e) => Some((at.clone(), e.clone())),
      _ => None,
    })
  }

  /// Nodes that told their application they are ready, in the order they did.
  pub fn ready_events(&self) -> Vec<Id> {
    self.upcalls(|at, u| match u {
      AppUpcall::Ready => Some(at.clone()),
      _ => None,
    })
  }

  pub fn clear_log(&mut self) {
    if let Ok(mut log) = self.upcalls.lock() {
      log.clear();
    }
  }

  /// Process queued messages until none are left, without advancing the timers. Returns how
  /// many events were handled.
  pub fn run_until_idle(&mut self) -> usize {
    let mut handled = 0;
    while let Some((at, event)) = self.pop() {
      self.elapsed = std::cmp::max(self.elapsed, at);
      self.handle(event);
      handled += 1;
    }
    handled
  }

  /// Advance virtual time by `duration`, ticking every live node each `tick_interval`.
  pub fn run_for(&mut self, duration: Duration) {
    let end = self.elapsed + duration;
    loop {
      let boundary = std::cmp::min(self.next_tick, end);
      while let Some(at) = self.queue.keys().next().map(|(at, _)| *at) {
        if at > boundary {
          break;
        }
        if let Some((at, event)) = self.pop() {
          self.elapsed = std::cmp::max(self.elapsed, at);
          self.handle(event);
        }
      }
      self.elapsed = std::cmp::max(self.elapsed, boundary);
      if self.next_tick > end {
        break;
      }
      self.next_tick += self.config.tick_interval;
      self.tick_all();
    }
  }

  fn upcalls<T, F>(&self, f: F) -> Vec<T>
  where
    F: Fn(&Id, &AppUpcall) -> Option<T>,
  {
    match self.upcalls.lock() {
      Ok(log) => log.iter().filter_map(|(at, u)| f(at, u)).collect(),
      Err(_) => Vec::new(),
    }
  }

  fn pop(&mut self) -> Option<(Duration, SimEvent)> {
    let key = *self.queue.keys().next()?;
    self.queue.remove(&key).map(|e| (key.0, e))
  }

  fn schedule(&mut self, after: Duration, event: SimEvent) {
    self.seq += 1;
    self.queue.insert((self.elapsed + after, self.seq), event);
  }

  fn tick_all(&mut self) {
    let now = self.now();
    let due: Vec<Id> = self
      .nodes
      .iter()
      .filter(|(_, n)| n.alive && n.stalled_until <= self.elapsed)
      .map(|(id, _)| id.clone())
      .collect();
    for id in due {
      let mut out = Outbox::new();
      if let Some(n) = self.nodes.get_mut(&id) {
        n.pastry.tick(now, &mut out);
      }
      self.dispatch(&id, out);
    }
  }

  /// A live node currently running under this exact handle.
  fn reachable(&self, handle: &NodeHandle) -> bool {
    self
      .nodes
      .get(&handle.id)
      .map_or(false, |n| n.alive && n.pastry.local().epoch == handle.epoch)
  }

  fn dispatch(&mut self, src: &Id, mut out: Outbox) {
    let from = match self.nodes.get(src) {
      Some(n) => (**n.pastry.local()).clone(),
      None => return,
    };
    for effect in out.drain() {
      match effect {
        Effect::Send { to, msg } => {
          self.sent += 1;
          let to = (*to).clone();
          if self.rules.iter_mut().any(|rule| rule(&from, &to, &msg)) {
            continue;
          }
          let latency = self.latency;
          if self.reachable(&to) {
            self.schedule(
              latency,
              SimEvent::Deliver {
                from: from.clone(),
                to: to,
                msg: msg,
              },
            );
          } else {
            self.schedule(
              latency * 2,
              SimEvent::SendFailed {
                sender: src.clone(),
                to: to,
                msg: msg,
              },
            );
          }
        }
        Effect::CheckLiveness(peer) => {
          let liveness = if self.reachable(&peer) {
            Liveness::Alive
          } else {
            Liveness::Dead
          };
          let latency = self.latency;
          self.schedule(
            latency * 2,
            SimEvent::Verdict {
              asker: src.clone(),
              peer: (*peer).clone(),
              liveness: liveness,
            },
          );
        }
      }
    }
  }

  fn handle(&mut self, event: SimEvent) {
    let now = self.now();
    let mut out = Outbox::new();
    let at = match event {
      SimEvent::Deliver { from, to, msg } => {
        if !self.reachable(&to) {
          // died while the message was in flight
          self.schedule(
            self.latency,
            SimEvent::SendFailed {
              sender: from.id.clone(),
              to: to,
              msg: msg,
            },
          );
          return;
        }
        if let Some(n) = self.nodes.get_mut(&to.id) {
          n.pastry.receive(&from, msg, now, &mut out);
        }
        to.id
      }
      SimEvent::SendFailed { sender, to, msg } => {
        match self.nodes.get_mut(&sender) {
          Some(n) if n.alive => n.pastry.send_failed(&to, msg, now, &mut out),
          _ => return,
        }
        sender
      }
      SimEvent::Verdict {
        asker,
        peer,
        liveness,
      } => {
        match self.nodes.get_mut(&asker) {
          Some(n) if n.alive => n.pastry.peer_status(&peer, liveness, now, &mut out),
          _ => return,
        }
        asker
      }
    };
    self.dispatch(&at, out);
  }
}

#[cfg(test)]
fn small_config() -> PastryConfig {
  let mut config = PastryConfig::default();
  config.id_bits = 16;
  config.digit_bits = 2;
  config.leaf_set_size = 4;
  config
}

#[test]
fn test_two_nodes_route_to_each_other() {
  let mut net = SimNetwork::new(small_config(), 1);
  let a = Id::from_u128(0x1000, 16);
  let b = Id::from_u128(0x9000, 16);
  net.add_node(a.clone(), None).unwrap();
  net.add_node(b.clone(), Some(&a)).unwrap();
  net.run_until_idle();
  assert!(net.all_ready());
  assert_eq!(net.ready_events(), vec![a.clone(), b.clone()]);

  net.route(&a, Id::from_u128(0x8f00, 16), b"x".to_vec());
  net.run_until_idle();
  let d = net.deliveries();
  assert_eq!(d.len(), 1);
  assert_eq!(d[0].at, b);
  assert_eq!(d[0].msg.hops, 1);
}

#[test]
fn test_messages_to_dead_nodes_bounce() {
  let mut net = SimNetwork::new(small_config(), 2);
  let a = Id::from_u128(0x1000, 16);
  let b = Id::from_u128(0x9000, 16);
  net.add_node(a.clone(), None).unwrap();
  let hb = net.add_node(b.clone(), Some(&a)).unwrap();
  net.run_until_idle();
  net.kill(&b);
  net.route_direct(&a, &hb, b"x".to_vec());
  net.run_until_idle();
  assert_eq!(net.deliveries(), vec![]);
  assert!(matches!(
    net.failures().as_slice(),
    [(at, RouteError::Unreachable(_))] if *at == a
  ));
  assert!(net.node(&a).unwrap().pool().is_known_dead(&b));
}
