use crate::core::{Id, JoinError, NodeHandle};
use crate::overlay::{
  ConsistentJoinMsg, JoinReply, JoinRequest, Outbox, PastryMsg, RoutingState,
};
use hashbrown::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinState {
  /// Waiting for the ring to answer our join request.
  Bootstrapping,
  NotReady,
  /// Waiting for every leaf set member to acknowledge us.
  Probing,
  Ready,
  Failed(JoinError),
}

/// What the node has to act on after the join protocol handled an input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum JoinOutcome {
  Unchanged,
  Ready,
  Failed(JoinError),
}

/// Join through a bootstrap, then the probe/acknowledge exchange that keeps leaf sets mutually
/// consistent.
///
/// A node only becomes ready once its leaf set is complete and every current member has
/// answered a probe. Failure claims from peers are hints: they only trigger a local liveness
/// check, never a removal.
pub struct JoinProtocol {
  state: JoinState,
  bootstrap: Option<Arc<NodeHandle>>,
  join_attempt: u32,
  join_deadline: Option<Instant>,
  got_response: HashSet<Id>,
  failed: HashMap<Id, Arc<NodeHandle>>,
  probed_at: HashMap<Id, Instant>,
  probe_rounds: u32,
  next_retry: Option<Instant>,
}
impl JoinProtocol {
  pub fn new() -> JoinProtocol {
    JoinProtocol {
      state: JoinState::NotReady,
      bootstrap: None,
      join_attempt: 0,
      join_deadline: None,
      got_response: HashSet::new(),
      failed: HashMap::new(),
      probed_at: HashMap::new(),
      probe_rounds: 0,
      next_retry: None,
    }
  }

  pub fn state(&self) -> &JoinState {
    &self.state
  }

  pub fn is_ready(&self) -> bool {
    self.state == JoinState::Ready
  }

  pub fn acknowledged(&self, id: &Id) -> bool {
    self.got_response.contains(id)
  }

  pub fn failed(&self) -> impl Iterator<Item = &Arc<NodeHandle>> {
    self.failed.values()
  }

  pub(crate) fn boot(
    &mut self,
    st: &mut RoutingState,
    out: &mut Outbox,
    bootstrap: Option<Arc<NodeHandle>>,
    now: Instant,
  ) -> JoinOutcome {
    self.bootstrap = bootstrap.clone();
    self.got_response.clear();
    self.failed.clear();
    match bootstrap {
      None if st.leaf_set.is_empty() => {
        self.state = JoinState::Ready;
        JoinOutcome::Ready
      }
      None => self.start_probing(st, out, now),
      Some(b) => {
        self.state = JoinState::Bootstrapping;
        self.join_attempt = 1;
        self.join_deadline = Some(now + st.config.join_timeout);
        Self::send_join_request(st, out, &b);
        JoinOutcome::Unchanged
      }
    }
  }

  /// Give up. Nothing is retried until the node boots again.
  pub(crate) fn fail(&mut self, e: JoinError) -> JoinOutcome {
    self.state = JoinState::Failed(e.clone());
    self.join_deadline = None;
    self.next_retry = None;
    JoinOutcome::Failed(e)
  }

  fn send_join_request(st: &RoutingState, out: &mut Outbox, to: &Arc<NodeHandle>) {
    out.send(
      to.clone(),
      PastryMsg::JoinRequest(JoinRequest {
        joiner: (*st.local).clone(),
        rows: Vec::new(),
        hops: 0,
      }),
    );
  }

  pub(crate) fn on_join_reply(
    &mut self,
    st: &mut RoutingState,
    out: &mut Outbox,
    from: Arc<NodeHandle>,
    reply: JoinReply,
    now: Instant,
  ) -> JoinOutcome {
    if self.state != JoinState::Bootstrapping {
      return JoinOutcome::Unchanged;
    }
    for row in reply.rows.iter() {
      for h in row.handles() {
        let h = st.pool.coalesce(h);
        if !st.pool.is_known_dead(&h.id) {
          st.table.put(h, &st.pool);
        }
      }
    }
    st.leaf_set
      .merge(&reply.leaf_set, from, &mut st.table, &mut st.pool);
    self.join_deadline = None;
    self.start_probing(st, out, now)
  }

  /// Forget acknowledgements and probe every leaf set member.
  pub(crate) fn start_probing(
    &mut self,
    st: &mut RoutingState,
    out: &mut Outbox,
    now: Instant,
  ) -> JoinOutcome {
    self.state = JoinState::NotReady;
    self.got_response.clear();
    self.failed.clear();
    self.probe_rounds = 0;
    self.state = JoinState::Probing;
    self.next_retry = Some(now + st.config.probe_retry);
    for h in st.leaf_set.members() {
      self.probe(st, out, &h, now);
    }
    self.done_probing(st)
  }

  fn probe(
    &mut self,
    st: &RoutingState,
    out: &mut Outbox,
    to: &Arc<NodeHandle>,
    now: Instant,
  ) {
    if self.probed_at.get(&to.id) == Some(&now) {
      return;
    }
    self.probed_at.insert(to.id.clone(), now);
    let msg = self.consistent_join_msg(st, true);
    out.send(to.clone(), PastryMsg::ConsistentJoin(msg));
  }

  fn consistent_join_msg(&self, st: &RoutingState, request: bool) -> ConsistentJoinMsg {
    ConsistentJoinMsg {
      leaf_set: st.leaf_set.snapshot(),
      failed: self.failed.values().map(|h| (**h).clone()).collect(),
      request: request,
    }
  }

  pub(crate) fn on_consistent_join(
    &mut self,
    st: &mut RoutingState,
    out: &mut Outbox,
    from: Arc<NodeHandle>,
    msg: ConsistentJoinMsg,
    now: Instant,
  ) -> JoinOutcome {
    self.failed.remove(&from.id);
    let mut added =
      st.leaf_set
        .merge_handles(Some(from.clone()), &mut st.table, &st.pool);

    for f in msg.failed.iter() {
      if f.id == st.local.id || !st.leaf_set.member(&f.id) {
        continue;
      }
      if let Some(h) = st.pool.get(&f.id) {
        out.check_liveness(h.clone());
      }
    }

    let mut theirs = Vec::new();
    for h in msg.leaf_set.handles() {
      if h.id != st.local.id && !self.failed.contains_key(&h.id) {
        theirs.push(st.pool.coalesce(h));
      }
    }
    added.extend(st.leaf_set.merge_handles(theirs, &mut st.table, &st.pool));
    for h in added.iter().filter(|h| h.id != from.id) {
      self.probe(st, out, h, now);
    }

    if msg.request {
      let reply = self.consistent_join_msg(st, false);
      out.send(from.clone(), PastryMsg::ConsistentJoin(reply));
    }
    self.got_response.insert(from.id.clone());
    self.done_probing(st)
  }

  pub(crate) fn done_probing(&mut self, st: &RoutingState) -> JoinOutcome {
    if self.state != JoinState::Probing {
      return JoinOutcome::Unchanged;
    }
    let alone = st.leaf_set.is_empty() && self.bootstrap.is_none();
    if !(st.leaf_set.is_complete() || alone) {
      return JoinOutcome::Unchanged;
    }
    let all_acked = st
      .leaf_set
      .members()
      .iter()
      .all(|h| self.got_response.contains(&h.id));
    if !all_acked {
      return JoinOutcome::Unchanged;
    }
    self.state = JoinState::Ready;
    self.failed.clear();
    self.probed_at.clear();
    self.next_retry = None;
    JoinOutcome::Ready
  }

  /// A handle joined the leaf set through some other path than a probe exchange.
  pub(crate) fn on_leaf_added(
    &mut self,
    st: &RoutingState,
    out: &mut Outbox,
    handle: &Arc<NodeHandle>,
    now: Instant,
  ) {
    if self.state == JoinState::Probing && !self.got_response.contains(&handle.id) {
      self.probe(st, out, handle, now);
    }
  }

  pub(crate) fn on_dead(
    &mut self,
    st: &mut RoutingState,
    out: &mut Outbox,
    handle: &Arc<NodeHandle>,
    now: Instant,
  ) -> JoinOutcome {
    st.table.remove(&handle.id);
    if st.leaf_set.remove(&handle.id).is_none() {
      return JoinOutcome::Unchanged;
    }
    self.failed.insert(handle.id.clone(), handle.clone());
    self.got_response.remove(&handle.id);
    match self.state {
      JoinState::Probing => self.done_probing(st),
      JoinState::Ready => {
        let collapsed = !st.leaf_set.is_empty()
          && (st.leaf_set.cw_size() == 0 || st.leaf_set.ccw_size() == 0);
        if collapsed {
          return self.start_probing(st, out, now);
        }
        let mut asked: Vec<&Id> = Vec::new();
        let edges = [
          st.leaf_set.cw_members().last(),
          st.leaf_set.ccw_members().last(),
        ];
        for edge in edges.iter().flatten() {
          if !asked.contains(&&edge.id) {
            asked.push(&edge.id);
            out.send((*edge).clone(), PastryMsg::LeafSetRequest);
          }
        }
        JoinOutcome::Unchanged
      }
      _ => JoinOutcome::Unchanged,
    }
  }

  pub(crate) fn on_live(
    &mut self,
    st: &mut RoutingState,
    out: &mut Outbox,
    handle: &Arc<NodeHandle>,
    now: Instant,
  ) {
    self.failed.remove(&handle.id);
    st.leaf_set
      .merge_handles(Some(handle.clone()), &mut st.table, &st.pool);
    if self.state == JoinState::Probing && st.leaf_set.member(&handle.id) {
      self.probe(st, out, handle, now);
    }
  }

  /// The node was not scheduled for too long. Peers may have given up on it, so check the
  /// whole leaf set again.
  pub(crate) fn suspect_self(
    &mut self,
    st: &mut RoutingState,
    out: &mut Outbox,
    now: Instant,
  ) -> JoinOutcome {
    if self.state != JoinState::Ready || st.leaf_set.is_empty() {
      return JoinOutcome::Unchanged;
    }
    self.start_probing(st, out, now)
  }

  pub(crate) fn tick(
    &mut self,
    st: &mut RoutingState,
    out: &mut Outbox,
    now: Instant,
  ) -> JoinOutcome {
    match self.state {
      JoinState::Bootstrapping => {
        let due = self.join_deadline.map_or(false, |d| now >= d);
        if !due {
          return JoinOutcome::Unchanged;
        }
        if self.join_attempt >= st.config.join_attempts {
          return self.fail(JoinError::BootstrapUnreachable(self.join_attempt));
        }
        self.join_attempt += 1;
        self.join_deadline = Some(now + st.config.join_timeout);
        if let Some(b) = &self.bootstrap {
          Self::send_join_request(st, out, b);
        }
        JoinOutcome::Unchanged
      }
      JoinState::Probing => {
        let due = self.next_retry.map_or(false, |d| now >= d);
        if !due {
          return JoinOutcome::Unchanged;
        }
        self.probe_rounds += 1;
        if self.probe_rounds > st.config.max_probe_rounds {
          return self.fail(JoinError::ProbesExhausted(st.config.max_probe_rounds));
        }
        self.next_retry = Some(now + st.config.probe_retry);
        let unacked: Vec<_> = st
          .leaf_set
          .members()
          .into_iter()
          .filter(|h| !self.got_response.contains(&h.id))
          .collect();
        for h in unacked.iter() {
          self.probe(st, out, h, now);
        }
        JoinOutcome::Unchanged
      }
      _ => JoinOutcome::Unchanged,
    }
  }
}
impl Default for JoinProtocol {
  fn default() -> Self {
    JoinProtocol::new()
  }
}
