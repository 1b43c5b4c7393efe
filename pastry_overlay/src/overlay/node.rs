use crate::core::{
  ConfigError, HandlePool, Id, JoinError, Liveness, LivenessEvent, LocalRef, NodeHandle,
  PastryConfig, RouteError, SetEvent,
};
use crate::overlay::{
  AppAddress, AppMessage, Application, DirectMsg, JoinOutcome, JoinProtocol, JoinReply,
  JoinRequest, JoinState, LeafSet, Outbox, PastryMsg, RouteDecision, RouteMsg, RouteRow, Router,
  RoutingTable, SendOptions,
};
use crate::testkit::{LogLevel, LoggerMsg};
use crate::{debug, error, info, trace, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use wyhash::WyHash;

const LOG_LEVEL: LogLevel = LogLevel::Info;

/// Everything a node knows about the ring.
pub(crate) struct RoutingState {
  pub local: Arc<NodeHandle>,
  pub config: PastryConfig,
  pub pool: HandlePool,
  pub leaf_set: LeafSet,
  pub table: RoutingTable,
}
impl RoutingState {
  fn router(&self) -> Router<'_> {
    Router {
      local: &self.local,
      leaf_set: &self.leaf_set,
      table: &self.table,
      pool: &self.pool,
    }
  }
}

/// One overlay node as a state machine.
///
/// `PastryNode` does no IO and never reads the clock. Every input (a message from a peer, a
/// liveness verdict from the transport, a timer tick, a request from a local application) comes
/// with the current instant and an [`Outbox`] the node pushes its effects into. The caller
/// carries the effects out and feeds the results back in. The same node runs over real TCP in
/// [`Overlay`](crate::overlay::Overlay) and over virtual time in
/// [`SimNetwork`](crate::testkit::SimNetwork).
pub struct PastryNode {
  st: RoutingState,
  join: JoinProtocol,
  apps: BTreeMap<AppAddress, Box<dyn Application>>,
  logger: LocalRef<LoggerMsg>,
  rng: SmallRng,
  last_tick: Option<Instant>,
  next_leafset_maintenance: Option<Instant>,
  next_route_maintenance: Option<Instant>,
}
impl PastryNode {
  pub fn new(local: NodeHandle, config: PastryConfig) -> Result<PastryNode, ConfigError> {
    config.validate()?;
    if local.id.bit_len() != config.id_bits {
      return Err(ConfigError::IdBits(local.id.bit_len(), config.id_bits));
    }
    let mut hasher = WyHash::with_seed(local.epoch);
    local.id.hash(&mut hasher);
    let local = Arc::new(local);
    Ok(PastryNode {
      st: RoutingState {
        pool: HandlePool::new(local.clone()),
        leaf_set: LeafSet::new(local.clone(), config.leaf_set_size),
        table: RoutingTable::new(
          local.clone(),
          config.digit_bits,
          config.max_route_set_size,
        ),
        local: local,
        config: config,
      },
      join: JoinProtocol::new(),
      apps: BTreeMap::new(),
      logger: LocalRef::void(),
      rng: SmallRng::seed_from_u64(hasher.finish()),
      last_tick: None,
      next_leafset_maintenance: None,
      next_route_maintenance: None,
    })
  }

  pub fn set_logger(&mut self, logger: LocalRef<LoggerMsg>) {
    self.logger = logger;
  }

  pub fn register(&mut self, address: AppAddress, app: Box<dyn Application>) {
    self.apps.insert(address, app);
  }

  pub fn unregister(&mut self, address: &AppAddress) -> Option<Box<dyn Application>> {
    self.apps.remove(address)
  }

  pub fn local(&self) -> &Arc<NodeHandle> {
    &self.st.local
  }

  pub fn config(&self) -> &PastryConfig {
    &self.st.config
  }

  pub fn leaf_set(&self) -> &LeafSet {
    &self.st.leaf_set
  }

  pub fn routing_table(&self) -> &RoutingTable {
    &self.st.table
  }

  pub fn pool(&self) -> &HandlePool {
    &self.st.pool
  }

  pub fn join_state(&self) -> &JoinState {
    self.join.state()
  }

  pub fn is_ready(&self) -> bool {
    self.join.is_ready()
  }

  pub fn subscribe_leaf_set(&mut self, subscriber: LocalRef<SetEvent>) {
    self.st.leaf_set.subscribe(subscriber);
  }

  pub fn subscribe_routes(&mut self, subscriber: LocalRef<SetEvent>) {
    self.st.table.subscribe(subscriber);
  }

  pub fn subscribe_liveness(&mut self, subscriber: LocalRef<LivenessEvent>) {
    self.st.pool.subscribe(subscriber);
  }

  /// Where a message for `key` would go next from here.
  pub fn next_hop(&self, key: &Id) -> RouteDecision {
    self.st.router().next_hop(key)
  }

  /// Start the node. Without a bootstrap it forms a ring of its own and is ready at once.
  pub fn boot(&mut self, bootstrap: Option<&NodeHandle>, now: Instant, out: &mut Outbox) {
    if let Some(b) = bootstrap.filter(|b| self.foreign(b)) {
      let e = JoinError::WrongWidth(b.id.bit_len(), self.st.config.id_bits);
      let outcome = self.join.fail(e);
      self.settle(outcome, now, out);
      return;
    }
    let bootstrap = bootstrap.map(|b| self.st.pool.coalesce(b));
    match &bootstrap {
      Some(b) => info!(LOG_LEVEL, &self.logger, format!("joining through {}", b)),
      None => info!(LOG_LEVEL, &self.logger, "starting a new ring"),
    }
    self.last_tick = Some(now);
    let outcome = self.join.boot(&mut self.st, out, bootstrap, now);
    self.settle(outcome, now, out);
  }

  /// Throw away the join progress and start over, keeping the routing state.
  pub fn rejoin(&mut self, bootstrap: Option<&NodeHandle>, now: Instant, out: &mut Outbox) {
    self.next_leafset_maintenance = None;
    self.next_route_maintenance = None;
    self.boot(bootstrap, now, out);
  }

  pub fn receive(&mut self, from: &NodeHandle, msg: PastryMsg, now: Instant, out: &mut Outbox) {
    if self.foreign(from) || !msg.fits_width(self.st.config.id_bits) {
      warn!(
        LOG_LEVEL,
        &self.logger,
        format!("dropping {} from {}: wrong identifier width", msg.kind(), from)
      );
      return;
    }
    if from.id == self.st.local.id {
      warn!(
        LOG_LEVEL,
        &self.logger,
        format!("ignoring {} sent under our own id", msg.kind())
      );
      return;
    }
    trace!(
      LOG_LEVEL,
      &self.logger,
      format!("{} from {}", msg.kind(), from)
    );
    let from = self.st.pool.coalesce(from);
    if let Some(event) = self.st.pool.mark_alive(&from.id) {
      self.on_liveness(event, now, out);
    }
    let outcome = match msg {
      PastryMsg::Route(mut m) => {
        m.attempts = 0;
        self.forward_route(m, out);
        JoinOutcome::Unchanged
      }
      PastryMsg::Direct(m) => {
        self.deliver_direct(m);
        JoinOutcome::Unchanged
      }
      PastryMsg::JoinRequest(j) => {
        self.on_join_request(j, out);
        JoinOutcome::Unchanged
      }
      PastryMsg::JoinReply(r) => self.join.on_join_reply(&mut self.st, out, from, r, now),
      PastryMsg::ConsistentJoin(c) => {
        self.join.on_consistent_join(&mut self.st, out, from, c, now)
      }
      PastryMsg::LeafSetRequest => {
        out.send(from, PastryMsg::LeafSetBroadcast(self.st.leaf_set.snapshot()));
        JoinOutcome::Unchanged
      }
      PastryMsg::LeafSetBroadcast(snapshot) => {
        let st = &mut self.st;
        st.leaf_set.merge(&snapshot, from, &mut st.table, &mut st.pool);
        JoinOutcome::Unchanged
      }
      PastryMsg::RouteRowRequest(row) => {
        let row = self.row_for_wire(row as usize);
        out.send(from, PastryMsg::RouteRowResponse(row));
        JoinOutcome::Unchanged
      }
      PastryMsg::RouteRowResponse(row) | PastryMsg::RouteRowBroadcast(row) => {
        self.absorb_row(&row);
        JoinOutcome::Unchanged
      }
    };
    self.settle(outcome, now, out);
  }

  /// The transport's verdict on a peer.
  pub fn peer_status(
    &mut self,
    peer: &NodeHandle,
    liveness: Liveness,
    now: Instant,
    out: &mut Outbox,
  ) {
    if self.foreign(peer) {
      return;
    }
    let peer = self.st.pool.coalesce(peer);
    let event = match liveness {
      Liveness::Alive => self.st.pool.mark_alive(&peer.id),
      Liveness::Suspected => {
        self.st.pool.mark_suspected(&peer.id);
        None
      }
      Liveness::Dead => self.st.pool.mark_dead(&peer.id),
    };
    if let Some(event) = event {
      self.on_liveness(event, now, out);
    }
    self.settle(JoinOutcome::Unchanged, now, out);
  }

  /// A measured round trip to `peer`, in milliseconds.
  pub fn proximity(&mut self, peer: &NodeHandle, rtt_ms: u64) {
    if self.foreign(peer) {
      return;
    }
    let peer = self.st.pool.coalesce(peer);
    self.st.pool.update_proximity(&peer.id, rtt_ms);
  }

  /// The transport could not deliver `msg` to `to`. The peer is declared dead and the message
  /// is rerouted where that makes sense.
  pub fn send_failed(&mut self, to: &NodeHandle, msg: PastryMsg, now: Instant, out: &mut Outbox) {
    debug!(
      LOG_LEVEL,
      &self.logger,
      format!("could not send {} to {}", msg.kind(), to)
    );
    if self.foreign(to) {
      return;
    }
    let to = self.st.pool.coalesce(to);
    if let Some(event) = self.st.pool.mark_dead(&to.id) {
      self.on_liveness(event, now, out);
    }
    match msg {
      PastryMsg::Route(mut m) => {
        m.hops = m.hops.saturating_sub(1);
        m.attempts += 1;
        if m.attempts >= self.st.config.max_route_attempts {
          let e = RouteError::AttemptsExhausted(m.attempts);
          self.fail_route(m, e);
        } else {
          self.forward_route(m, out);
        }
      }
      PastryMsg::Direct(m) => {
        let e = RouteError::Unreachable(to.to_string());
        self.fail_direct(m, e);
      }
      PastryMsg::JoinRequest(mut j) if j.joiner.id != self.st.local.id => {
        j.hops = j.hops.saturating_sub(1);
        self.forward_join(j, out);
      }
      _ => {}
    }
    self.settle(JoinOutcome::Unchanged, now, out);
  }

  /// Drive timers. Call at least every `tick_interval`.
  pub fn tick(&mut self, now: Instant, out: &mut Outbox) {
    let mut outcome = JoinOutcome::Unchanged;
    if let Some(last) = self.last_tick {
      let gap = now.saturating_duration_since(last);
      if gap > self.st.config.max_tick_delay {
        warn!(
          LOG_LEVEL,
          &self.logger,
          format!("not scheduled for {:?}, probing the leaf set again", gap)
        );
        outcome = self.join.suspect_self(&mut self.st, out, now);
      }
    }
    self.last_tick = Some(now);
    if outcome == JoinOutcome::Unchanged {
      outcome = self.join.tick(&mut self.st, out, now);
    }
    if self.join.is_ready() {
      self.maintain(now, out);
    }
    self.settle(outcome, now, out);
  }

  /// Send `payload` towards the live node numerically closest to `key`.
  pub fn route(
    &mut self,
    key: Id,
    app: AppAddress,
    payload: Vec<u8>,
    options: SendOptions,
    now: Instant,
    out: &mut Outbox,
  ) {
    let bits = self.st.config.id_bits;
    let msg = RouteMsg {
      key: key,
      app: app,
      origin: (*self.st.local).clone(),
      payload: payload,
      hops: 0,
      attempts: 0,
      options: options,
    };
    if msg.key.bit_len() != bits {
      let e = RouteError::WrongWidth(msg.key.bit_len(), bits);
      self.fail_route(msg, e);
      return;
    }
    self.forward_route(msg, out);
    self.settle(JoinOutcome::Unchanged, now, out);
  }

  /// Send `payload` to one node, without routing.
  pub fn route_direct(
    &mut self,
    to: &NodeHandle,
    app: AppAddress,
    payload: Vec<u8>,
    options: SendOptions,
    out: &mut Outbox,
  ) {
    let msg = DirectMsg {
      app: app,
      origin: (*self.st.local).clone(),
      payload: payload,
      options: options,
    };
    if to.id == self.st.local.id {
      self.deliver_direct(msg);
      return;
    }
    if self.foreign(to) {
      let e = RouteError::WrongWidth(to.id.bit_len(), self.st.config.id_bits);
      self.fail_direct(msg, e);
      return;
    }
    let to = self.st.pool.coalesce(to);
    if self.st.pool.is_known_dead(&to.id) {
      let e = RouteError::Unreachable(to.to_string());
      self.fail_direct(msg, e);
      return;
    }
    out.send(to, PastryMsg::Direct(msg));
  }

  // Handles from a ring of another width.
  fn foreign(&self, h: &NodeHandle) -> bool {
    h.id.bit_len() != self.st.config.id_bits
  }

  fn forward_route(&mut self, mut msg: RouteMsg, out: &mut Outbox) {
    if msg.hops >= self.st.config.max_hops {
      let e = RouteError::HopLimit(self.st.config.max_hops);
      self.fail_route(msg, e);
      return;
    }
    match self.st.router().next_hop(&msg.key) {
      RouteDecision::Deliver => {
        let app_msg = AppMessage {
          key: Some(msg.key.clone()),
          origin: msg.origin,
          payload: msg.payload,
          hops: msg.hops,
        };
        self.deliver(&msg.app, app_msg);
      }
      RouteDecision::Forward { hop, source } => {
        if let Some(app) = self.apps.get_mut(&msg.app) {
          if !app.forward(&msg, &hop) {
            return;
          }
        }
        trace!(
          LOG_LEVEL,
          &self.logger,
          format!("{:?} via {} ({:?})", msg.key, hop, source)
        );
        msg.hops += 1;
        out.send(hop, PastryMsg::Route(msg));
      }
    }
  }

  fn deliver_direct(&mut self, msg: DirectMsg) {
    let app_msg = AppMessage {
      key: None,
      origin: msg.origin,
      payload: msg.payload,
      hops: 0,
    };
    self.deliver(&msg.app, app_msg);
  }

  fn deliver(&mut self, address: &AppAddress, msg: AppMessage) {
    match self.apps.get_mut(address) {
      Some(app) => app.deliver(msg),
      None => {
        let e = RouteError::NoApplication(address.to_string());
        warn!(LOG_LEVEL, &self.logger, e.to_string());
      }
    }
  }

  fn fail_route(&mut self, msg: RouteMsg, e: RouteError) {
    warn!(
      LOG_LEVEL,
      &self.logger,
      format!("dropping message for {:?}: {}", msg.key, e)
    );
    if !msg.options.notify_failure {
      return;
    }
    if let Some(app) = self.apps.get_mut(&msg.app) {
      let app_msg = AppMessage {
        key: Some(msg.key),
        origin: msg.origin,
        payload: msg.payload,
        hops: msg.hops,
      };
      app.delivery_failed(app_msg, e);
    }
  }

  fn fail_direct(&mut self, msg: DirectMsg, e: RouteError) {
    debug!(LOG_LEVEL, &self.logger, format!("direct message dropped: {}", e));
    if !msg.options.notify_failure {
      return;
    }
    if let Some(app) = self.apps.get_mut(&msg.app) {
      let app_msg = AppMessage {
        key: None,
        origin: msg.origin,
        payload: msg.payload,
        hops: 0,
      };
      app.delivery_failed(app_msg, e);
    }
  }

  fn on_join_request(&mut self, mut j: JoinRequest, out: &mut Outbox) {
    if !self.join.is_ready() {
      debug!(
        LOG_LEVEL,
        &self.logger,
        format!("not ready, ignoring join of {}", j.joiner)
      );
      return;
    }
    let row = match self.st.local.id.index_of_msdd(&j.joiner.id, self.st.table.digit_bits()) {
      Some(row) => row,
      None => {
        warn!(
          LOG_LEVEL,
          &self.logger,
          format!("{} is joining with our id", j.joiner)
        );
        return;
      }
    };
    self.st.pool.coalesce(&j.joiner);
    j.rows.push(self.row_for_wire(row));
    self.forward_join(j, out);
  }

  fn forward_join(&mut self, mut j: JoinRequest, out: &mut Outbox) {
    if j.hops >= self.st.config.max_hops {
      warn!(
        LOG_LEVEL,
        &self.logger,
        format!("join of {} exceeded the hop limit", j.joiner)
      );
      return;
    }
    let joiner = self.st.pool.coalesce(&j.joiner);
    let decision = self
      .st
      .router()
      .next_hop_excluding(&joiner.id, Some(&joiner.id));
    match decision {
      RouteDecision::Deliver => {
        debug!(
          LOG_LEVEL,
          &self.logger,
          format!("answering join of {} after {} hops", joiner, j.hops)
        );
        let reply = JoinReply {
          leaf_set: self.st.leaf_set.snapshot(),
          rows: j.rows,
        };
        out.send(joiner, PastryMsg::JoinReply(reply));
      }
      RouteDecision::Forward { hop, .. } => {
        j.hops += 1;
        out.send(hop, PastryMsg::JoinRequest(j));
      }
    }
  }

  fn row_for_wire(&self, row: usize) -> RouteRow {
    RouteRow {
      row: row as u32,
      from: (*self.st.local).clone(),
      cells: self.st.table.row_snapshot(row),
    }
  }

  fn absorb_row(&mut self, row: &RouteRow) {
    for h in row.handles() {
      let h = self.st.pool.coalesce(h);
      if h.id != self.st.local.id && !self.st.pool.is_known_dead(&h.id) {
        self.st.table.put(h, &self.st.pool);
      }
    }
  }

  fn on_liveness(&mut self, event: LivenessEvent, now: Instant, out: &mut Outbox) {
    let outcome = match event {
      LivenessEvent::DeclaredDead(h) => {
        info!(LOG_LEVEL, &self.logger, format!("{} declared dead", h));
        self.join.on_dead(&mut self.st, out, &h, now)
      }
      LivenessEvent::DeclaredLive(h) => {
        info!(LOG_LEVEL, &self.logger, format!("{} is back", h));
        self.join.on_live(&mut self.st, out, &h, now);
        JoinOutcome::Unchanged
      }
      LivenessEvent::ProximityChanged(..) => JoinOutcome::Unchanged,
    };
    self.settle(outcome, now, out);
  }

  fn maintain(&mut self, now: Instant, out: &mut Outbox) {
    let config = &self.st.config;
    let ls_due = *self
      .next_leafset_maintenance
      .get_or_insert(now + config.leafset_maintenance);
    let rt_due = *self
      .next_route_maintenance
      .get_or_insert(now + config.route_maintenance);

    if now >= ls_due {
      self.next_leafset_maintenance = Some(now + self.st.config.leafset_maintenance);
      let snapshot = self.st.leaf_set.snapshot();
      for h in self.st.leaf_set.neighbor_set(self.st.leaf_set.max_half()) {
        out.send(h, PastryMsg::LeafSetBroadcast(snapshot.clone()));
      }
    }

    if now >= rt_due {
      self.next_route_maintenance = Some(now + self.st.config.route_maintenance);
      let rows = self.st.table.non_empty_rows();
      if rows.is_empty() {
        return;
      }
      let row = rows[self.rng.gen_range(0..rows.len())];
      let pool = &self.st.pool;
      let candidates: Vec<_> = self
        .st
        .table
        .get_row(row)
        .into_iter()
        .flatten()
        .flat_map(|set| set.iter())
        .filter(|h| pool.is_alive(&h.id))
        .cloned()
        .collect();
      if !candidates.is_empty() {
        let peer = candidates[self.rng.gen_range(0..candidates.len())].clone();
        out.send(peer, PastryMsg::RouteRowRequest(row as u32));
      }
    }
  }

  // Act on a join outcome, then pass set changes on to the join protocol and applications.
  fn settle(&mut self, outcome: JoinOutcome, now: Instant, out: &mut Outbox) {
    match outcome {
      JoinOutcome::Unchanged => {}
      JoinOutcome::Ready => {
        info!(
          LOG_LEVEL,
          &self.logger,
          format!(
            "ready with {} leaf set members and {} routes",
            self.st.leaf_set.size(),
            self.st.table.len()
          )
        );
        for row in self.st.table.non_empty_rows() {
          let wire = self.row_for_wire(row);
          let targets: Vec<_> = wire
            .cells
            .iter()
            .flatten()
            .filter_map(|h| self.st.pool.get(&h.id).cloned())
            .collect();
          for h in targets {
            out.send(h, PastryMsg::RouteRowBroadcast(wire.clone()));
          }
        }
        for app in self.apps.values_mut() {
          app.notify_ready();
        }
      }
      JoinOutcome::Failed(e) => {
        error!(LOG_LEVEL, &self.logger, format!("join failed: {}", e));
        for app in self.apps.values_mut() {
          app.join_failed(&e);
        }
      }
    }

    for event in self.st.leaf_set.take_events() {
      if event.added() {
        self.join.on_leaf_added(&self.st, out, event.handle(), now);
      }
      for app in self.apps.values_mut() {
        app.leaf_set_changed(event.handle(), event.added());
      }
    }
    for event in self.st.table.take_events() {
      for app in self.apps.values_mut() {
        app.route_set_changed(event.handle(), event.added());
      }
    }
  }
}

#[cfg(test)]
use crate::core::Socket;
#[cfg(test)]
use crate::overlay::{AppUpcall, Effect, LeafSetSnapshot};
#[cfg(test)]
use crossbeam::channel::{unbounded, Receiver};
#[cfg(test)]
use std::sync::Mutex;

#[cfg(test)]
fn peer(id: u128, bits: usize) -> NodeHandle {
  NodeHandle::with_epoch(Id::from_u128(id, bits), Socket::localhost(1000 + id as u16), 1)
}

#[cfg(test)]
fn sim_app() -> AppAddress {
  AppAddress::from("test")
}

// A ready 16 bit node at 0x1000 that knows 0x5000 and 0x9000.
#[cfg(test)]
fn ring_of_three(now: Instant) -> (PastryNode, Receiver<AppUpcall>) {
  let mut config = PastryConfig::default();
  config.id_bits = 16;
  config.leaf_set_size = 8;
  config.max_hops = 4;
  config.max_route_attempts = 2;
  let mut node = PastryNode::new(peer(0x1000, 16), config).unwrap();
  let (tx, rx) = unbounded();
  node.register(sim_app(), Box::new(LocalRef::from_fn(move |u| tx.send(u).is_ok())));
  let mut out = Outbox::new();
  node.boot(None, now, &mut out);
  assert!(node.is_ready());
  let snapshot = LeafSetSnapshot {
    base: peer(0x5000, 16),
    cw: vec![peer(0x9000, 16)],
    ccw: vec![],
  };
  let msg = PastryMsg::LeafSetBroadcast(snapshot);
  node.receive(&peer(0x5000, 16), msg, now, &mut out);
  assert_eq!(node.leaf_set().size(), 2);
  (node, rx)
}

#[cfg(test)]
fn routed(out: &mut Outbox) -> Vec<(Id, RouteMsg)> {
  out
    .drain()
    .filter_map(|e| match e {
      Effect::Send {
        to,
        msg: PastryMsg::Route(m),
      } => Some((to.id.clone(), m)),
      _ => None,
    })
    .collect()
}

#[cfg(test)]
fn failures(rx: &Receiver<AppUpcall>) -> Vec<RouteError> {
  rx.try_iter()
    .filter_map(|u| match u {
      AppUpcall::DeliveryFailed(_, e) => Some(e),
      _ => None,
    })
    .collect()
}

#[cfg(test)]
fn notify() -> SendOptions {
  SendOptions {
    notify_failure: true,
  }
}

#[test]
fn test_foreign_width_is_dropped() {
  let now = Instant::now();
  let (mut node, rx) = ring_of_three(now);
  let mut out = Outbox::new();

  let narrow = peer(0x20, 8);
  let snapshot = LeafSetSnapshot {
    base: narrow.clone(),
    cw: vec![peer(0x30, 8)],
    ccw: vec![],
  };
  node.receive(&narrow, PastryMsg::LeafSetBroadcast(snapshot), now, &mut out);
  // a peer of the right width passing on handles of the wrong one
  let snapshot = LeafSetSnapshot {
    base: peer(0x5000, 16),
    cw: vec![peer(0x40, 8)],
    ccw: vec![],
  };
  node.receive(&peer(0x5000, 16), PastryMsg::LeafSetBroadcast(snapshot), now, &mut out);
  node.peer_status(&narrow, Liveness::Dead, now, &mut out);
  node.proximity(&narrow, 3);
  assert_eq!(node.leaf_set().size(), 2);
  assert!(out.is_empty());

  node.route(Id::from_u128(0x51, 8), sim_app(), vec![1], notify(), now, &mut out);
  node.route_direct(&narrow, sim_app(), vec![2], notify(), &mut out);
  assert!(routed(&mut out).is_empty());
  assert_eq!(
    failures(&rx),
    vec![RouteError::WrongWidth(8, 16), RouteError::WrongWidth(8, 16)]
  );
}

#[test]
fn test_foreign_bootstrap_fails_the_join() {
  let mut config = PastryConfig::default();
  config.id_bits = 16;
  let mut node = PastryNode::new(peer(0x1000, 16), config).unwrap();
  let mut out = Outbox::new();
  node.boot(Some(&peer(0x20, 8)), Instant::now(), &mut out);
  assert_eq!(node.join_state(), &JoinState::Failed(JoinError::WrongWidth(8, 16)));
  assert!(out.is_empty());
}

#[test]
fn test_failed_send_reroutes_then_gives_up() {
  let now = Instant::now();
  let (mut node, rx) = ring_of_three(now);
  let mut out = Outbox::new();
  let key = Id::from_u128(0x5100, 16);
  node.route(key.clone(), sim_app(), vec![7], notify(), now, &mut out);
  let mut sent = routed(&mut out);
  assert_eq!(sent.len(), 1);
  let (to, msg) = sent.remove(0);
  assert_eq!(to, Id::from_u128(0x5000, 16));

  // 0x9000 is the next closest once 0x5000 is gone
  node.send_failed(&peer(0x5000, 16), PastryMsg::Route(msg), now, &mut out);
  let mut sent = routed(&mut out);
  assert_eq!(sent.len(), 1);
  let (to, msg) = sent.remove(0);
  assert_eq!(to, Id::from_u128(0x9000, 16));
  assert_eq!(msg.attempts, 1);
  assert_eq!(msg.key, key);
  assert!(failures(&rx).is_empty());

  node.send_failed(&peer(0x9000, 16), PastryMsg::Route(msg), now, &mut out);
  assert!(routed(&mut out).is_empty());
  assert_eq!(failures(&rx), vec![RouteError::AttemptsExhausted(2)]);
}

#[test]
fn test_hop_limit() {
  let now = Instant::now();
  let (mut node, rx) = ring_of_three(now);
  let mut out = Outbox::new();
  let msg = RouteMsg {
    key: Id::from_u128(0x9100, 16),
    app: sim_app(),
    origin: peer(0x5000, 16),
    payload: vec![],
    hops: 4,
    attempts: 0,
    options: notify(),
  };
  node.receive(&peer(0x5000, 16), PastryMsg::Route(msg.clone()), now, &mut out);
  assert!(routed(&mut out).is_empty());
  assert_eq!(failures(&rx), vec![RouteError::HopLimit(4)]);

  let mut fresh = msg;
  fresh.hops = 3;
  node.receive(&peer(0x5000, 16), PastryMsg::Route(fresh), now, &mut out);
  let sent = routed(&mut out);
  assert_eq!(sent.len(), 1);
  assert_eq!(sent[0].1.hops, 4);
}

#[cfg(test)]
struct Hold(Arc<Mutex<Vec<(Id, Id)>>>);
#[cfg(test)]
impl Application for Hold {
  fn deliver(&mut self, _: AppMessage) {}

  fn forward(&mut self, msg: &RouteMsg, next_hop: &NodeHandle) -> bool {
    if let Ok(mut held) = self.0.lock() {
      held.push((msg.key.clone(), next_hop.id.clone()));
    }
    false
  }
}

#[test]
fn test_application_can_keep_a_forwarded_message() {
  let now = Instant::now();
  let (mut node, _rx) = ring_of_three(now);
  let held = Arc::new(Mutex::new(Vec::new()));
  node.register(sim_app(), Box::new(Hold(held.clone())));
  let mut out = Outbox::new();
  let key = Id::from_u128(0x5100, 16);
  node.route(key.clone(), sim_app(), vec![], notify(), now, &mut out);
  assert!(routed(&mut out).is_empty());
  assert_eq!(*held.lock().unwrap(), vec![(key, Id::from_u128(0x5000, 16))]);
}
