use crate::core::{
  Host, Id, Liveness, LocalRef, NodeHandle, PendingOp, Socket, TransportConfig, TransportError,
};
use crate::overlay::PastryMsg;
use crate::testkit::{LogLevel, LoggerMsg};
use crate::transport::{
  keeps_own_connection, listen, spawn_acceptor, spawn_connect, spawn_pilot, spawn_refuse,
  spawn_splice, Abort, ConnContext, ConnId, Frame, LivenessAction, LivenessTracker, Purpose,
  RelayTable, SocketManager, TransportEvent, WriterCmd,
};
use crate::{debug, info, trace, warn};
use hashbrown::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

const LOG_LEVEL: LogLevel = LogLevel::Info;

/// What the transport hands back to the overlay.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportOutput {
  Deliver { from: NodeHandle, msg: PastryMsg },
  PeerStatus { peer: NodeHandle, liveness: Liveness },
  Proximity { peer: NodeHandle, rtt_ms: u64 },
  /// The peer was declared dead with this message still queued for it.
  Undeliverable { to: NodeHandle, msg: PastryMsg },
}

struct Conn {
  peer: NodeHandle,
  writer: UnboundedSender<WriterCmd>,
  abort: Abort,
  purpose: Purpose,
  outbound: bool,
  /// We said goodbye. Frames already in flight are still delivered.
  closing: bool,
}

struct Dialing {
  conn: ConnId,
  op: PendingOp,
  attempts: u32,
  retry_at: Option<Instant>,
}

/// Binds the listening socket. Returns it along with the socket peers should be told about:
/// the bound port, and the loopback address if `socket` names the unspecified one.
pub fn bind(socket: &Socket) -> Result<(std::net::TcpListener, Socket), TransportError> {
  let bind_err = |e: std::io::Error| TransportError::Bind(socket.to_string(), e.to_string());
  let addr = socket
    .as_std_addrs()
    .map_err(bind_err)?
    .into_iter()
    .next()
    .ok_or_else(|| TransportError::Bind(socket.to_string(), "no address".to_string()))?;
  let listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
  listener.set_nonblocking(true).map_err(bind_err)?;
  let port = listener.local_addr().map_err(bind_err)?.port();
  let host = match &socket.host {
    Host::IP(ip) if ip.is_unspecified() => Host::IP(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    host => host.clone(),
  };
  Ok((listener, Socket::new(host, port)))
}

/// Connection management for one node.
///
/// Owned by the actor that receives the [`TransportEvent`]s of its connection tasks. Outbound
/// messages are queued per peer until a connection is up; peers that cannot be connected to
/// after `max_connect_attempts`, or stop answering pings, are reported dead. Outbound
/// connections are kept in an LRU working set of `max_open_sockets`.
pub struct TcpTransport {
  local: NodeHandle,
  config: Arc<TransportConfig>,
  cx: ConnContext,
  next_conn: ConnId,
  conns: HashMap<ConnId, Conn>,
  peers: HashMap<Id, ConnId>,
  dialing: HashMap<Id, Dialing>,
  queues: HashMap<Id, Vec<PastryMsg>>,
  handles: HashMap<Id, NodeHandle>,
  sockets: SocketManager<Id>,
  liveness: LivenessTracker,
  relay: RelayTable<ConnId, TcpStream>,
  pilot: Option<ConnId>,
  pilot_dial: Option<ConnId>,
  pilot_retry_at: Option<Instant>,
  listener: Option<JoinHandle<()>>,
}
impl TcpTransport {
  pub fn new(
    local: NodeHandle,
    config: TransportConfig,
    events: LocalRef<TransportEvent>,
    logger: LocalRef<LoggerMsg>,
  ) -> Result<TcpTransport, TransportError> {
    config.validate()?;
    let config = Arc::new(config);
    let cx = ConnContext {
      local: local.clone(),
      config: config.clone(),
      events: events,
      logger: logger,
    };
    Ok(TcpTransport {
      local: local,
      sockets: SocketManager::new(config.max_open_sockets),
      liveness: LivenessTracker::new(&config),
      config: config,
      cx: cx,
      next_conn: 1,
      conns: HashMap::new(),
      peers: HashMap::new(),
      dialing: HashMap::new(),
      queues: HashMap::new(),
      handles: HashMap::new(),
      relay: RelayTable::new(),
      pilot: None,
      pilot_dial: None,
      pilot_retry_at: None,
      listener: None,
    })
  }

  /// Start accepting connections, and register with the helper if we are behind NAT. Must be
  /// called from within the runtime.
  pub fn start(
    &mut self,
    listener: std::net::TcpListener,
    now: Instant,
  ) -> Result<(), TransportError> {
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let task = tokio::spawn(listen(listener, self.cx.clone(), ConnId::MAX));
    self.listener = Some(task);
    info!(LOG_LEVEL, &self.cx.logger, format!("listening as {}", self.local));
    self.connect_pilot(now);
    Ok(())
  }

  pub fn local(&self) -> &NodeHandle {
    &self.local
  }

  pub fn config(&self) -> &TransportConfig {
    &self.config
  }

  /// Outbound sockets in the working set.
  pub fn open_sockets(&self) -> usize {
    self.sockets.len()
  }

  /// Peers with an established connection in either direction.
  pub fn connections(&self) -> usize {
    self.peers.len()
  }

  pub fn is_connected(&self, id: &Id) -> bool {
    self.peers.contains_key(id)
  }

  pub fn has_pilot(&self) -> bool {
    self.pilot.is_some()
  }

  pub fn queued(&self, id: &Id) -> usize {
    self.queues.get(id).map_or(0, |q| q.len())
  }

  pub fn send(&mut self, to: &NodeHandle, msg: PastryMsg, now: Instant) {
    if to.id == self.local.id {
      warn!(LOG_LEVEL, &self.cx.logger, format!("not sending {} to ourselves", msg.kind()));
      return;
    }
    self.remember(to);
    let msg = match self.write_peer(&to.id, Frame::Msg(msg)) {
      Ok(()) => {
        self.sockets.updated(&to.id);
        return;
      }
      Err(Frame::Msg(msg)) => msg,
      Err(_) => return,
    };
    self.queues.entry(to.id.clone()).or_default().push(msg);
    self.dial(&to.id, now);
  }

  /// Verify the peer: ping it over its connection, or connect to it. The verdict comes back as
  /// a `PeerStatus` output.
  pub fn check(&mut self, peer: &NodeHandle, now: Instant) {
    if peer.id == self.local.id {
      return;
    }
    self.remember(peer);
    if !self.peers.contains_key(&peer.id) {
      self.dial(&peer.id, now);
      return;
    }
    if let Some(LivenessAction::Ping(id, seq)) = self.liveness.check(&peer.id, now) {
      let _ = self.write_peer(&id, Frame::Ping(seq));
    }
  }

  pub fn handle(&mut self, event: TransportEvent, now: Instant, out: &mut Vec<TransportOutput>) {
    match event {
      TransportEvent::Up {
        conn,
        peer,
        purpose,
        outbound,
        writer,
        abort,
      } => self.on_up(conn, peer, purpose, outbound, writer, abort, now, out),
      TransportEvent::Unsent {
        to,
        msgs,
        abandoned,
      } => self.on_unsent(to, msgs, abandoned, now, out),
      TransportEvent::ConnectFailed { conn, peer, error } => match peer {
        Some(id) => self.on_connect_failed(conn, id, error, now, out),
        None => {
          if self.pilot_dial == Some(conn) {
            warn!(
              LOG_LEVEL,
              &self.cx.logger,
              format!("could not reach relay helper: {}", error)
            );
            self.pilot_dial = None;
            self.pilot_retry_at = Some(now + self.config.connect_backoff);
          }
        }
      },
      TransportEvent::Frame { conn, frame } => self.on_frame(conn, frame, now, out),
      TransportEvent::Down { conn, error } => self.on_down(conn, error, now),
      TransportEvent::RelayConnect {
        target,
        token,
        stream,
      } => {
        let pilot = self.relay.pilot_for(&target).cloned();
        match pilot {
          Some(pilot) if self.write(pilot, Frame::OpenRequest { token: token }).is_ok() => {
            trace!(
              LOG_LEVEL,
              &self.cx.logger,
              format!("parked connector {} for {:?}", token, target)
            );
            self.relay.park(token, target, stream, now);
          }
          _ => spawn_refuse(stream, format!("no pilot for {:?}", target), self.cx.clone()),
        }
      }
      TransportEvent::RelayAccept { token, stream } => match self.relay.take(token) {
        Some(connector) => spawn_splice(connector, stream, self.cx.clone()),
        None => debug!(
          LOG_LEVEL,
          &self.cx.logger,
          format!("acceptor for unknown token {}", token)
        ),
      },
    }
  }

  /// Drive connect retries, pings, relay expiry and the pilot connection.
  pub fn tick(&mut self, now: Instant, out: &mut Vec<TransportOutput>) {
    let due: Vec<Id> = self
      .dialing
      .iter()
      .filter(|(_, d)| d.retry_at.map_or(false, |t| t <= now))
      .map(|(id, _)| id.clone())
      .collect();
    for id in due {
      self.redial(&id);
    }

    for action in self.liveness.tick(now) {
      match action {
        LivenessAction::Ping(id, seq) => {
          let _ = self.write_peer(&id, Frame::Ping(seq));
        }
        LivenessAction::Suspected(id) => self.report(&id, Liveness::Suspected, out),
        LivenessAction::Alive(id) => self.report(&id, Liveness::Alive, out),
        LivenessAction::Dead(id) => {
          warn!(LOG_LEVEL, &self.cx.logger, format!("{:?} stopped answering pings", id));
          self.declare_dead(&id, out);
        }
      }
    }

    for stream in self.relay.expire(now, self.config.relay_timeout) {
      spawn_refuse(stream, "acceptor never arrived".to_string(), self.cx.clone());
    }

    self.connect_pilot(now);
  }

  /// Close every connection and stop listening.
  pub fn shutdown(&mut self) {
    for (_, d) in self.dialing.drain() {
      d.op.cancel();
    }
    for (_, conn) in self.conns.iter_mut() {
      conn.closing = true;
      let _ = conn.writer.send(WriterCmd::Close);
    }
    self.peers.clear();
    if let Some(task) = self.listener.take() {
      task.abort();
    }
  }

  fn remember(&mut self, handle: &NodeHandle) {
    match self.handles.get(&handle.id) {
      Some(h) if h.epoch >= handle.epoch => {}
      _ => {
        self.handles.insert(handle.id.clone(), handle.clone());
      }
    }
  }

  fn conn_id(&mut self) -> ConnId {
    let conn = self.next_conn;
    self.next_conn += 1;
    conn
  }

  fn dial(&mut self, id: &Id, now: Instant) {
    if self.peers.contains_key(id) || self.dialing.contains_key(id) {
      return;
    }
    self.dialing.insert(
      id.clone(),
      Dialing {
        conn: 0,
        op: PendingOp::new(),
        attempts: 0,
        retry_at: Some(now),
      },
    );
    self.redial(id);
  }

  fn redial(&mut self, id: &Id) {
    let handle = match self.handles.get(id) {
      Some(h) => h.clone(),
      None => {
        self.dialing.remove(id);
        return;
      }
    };
    let conn = self.conn_id();
    let op = PendingOp::new();
    if let Some(d) = self.dialing.get_mut(id) {
      d.conn = conn;
      d.op = op.clone();
      d.retry_at = None;
    }
    trace!(LOG_LEVEL, &self.cx.logger, format!("dialing {}", handle));
    spawn_connect(handle, conn, op, self.cx.clone());
  }

  fn connect_pilot(&mut self, now: Instant) {
    if !self.config.behind_nat || self.pilot.is_some() || self.pilot_dial.is_some() {
      return;
    }
    if self.pilot_retry_at.map_or(false, |t| t > now) {
      return;
    }
    if let Some(helper) = self.config.relay.clone() {
      let conn = self.conn_id();
      self.pilot_dial = Some(conn);
      self.pilot_retry_at = None;
      spawn_pilot(helper, conn, self.cx.clone());
    }
  }

  fn write(&self, conn: ConnId, frame: Frame) -> Result<(), Frame> {
    match self.conns.get(&conn) {
      Some(c) if !c.closing => c.writer.send(WriterCmd::Frame(frame)).map_err(|SendError(cmd)| {
        match cmd {
          WriterCmd::Frame(f) => f,
          WriterCmd::Close => Frame::Goodbye,
        }
      }),
      _ => Err(frame),
    }
  }

  fn write_peer(&self, id: &Id, frame: Frame) -> Result<(), Frame> {
    match self.peers.get(id) {
      Some(conn) => self.write(*conn, frame),
      None => Err(frame),
    }
  }

  fn close(&mut self, conn: ConnId) {
    if let Some(c) = self.conns.get_mut(&conn) {
      c.closing = true;
      let _ = c.writer.send(WriterCmd::Close);
      let id = c.peer.id.clone();
      if self.peers.get(&id) == Some(&conn) {
        self.peers.remove(&id);
        self.sockets.closed(&id);
        self.liveness.forget(&id);
      }
    }
  }

  /// Close without waiting for queued frames to drain.
  fn abandon(&mut self, conn: ConnId) {
    if let Some(c) = self.conns.get(&conn) {
      c.abort.abort();
    }
    self.close(conn);
  }

  fn report(&self, id: &Id, liveness: Liveness, out: &mut Vec<TransportOutput>) {
    if let Some(peer) = self.handles.get(id) {
      out.push(TransportOutput::PeerStatus {
        peer: peer.clone(),
        liveness: liveness,
      });
    }
  }

  fn declare_dead(&mut self, id: &Id, out: &mut Vec<TransportOutput>) {
    if let Some(d) = self.dialing.remove(id) {
      d.op.cancel();
    }
    if let Some(conn) = self.peers.get(id).cloned() {
      self.abandon(conn);
    }
    self.liveness.forget(id);
    self.report(id, Liveness::Dead, out);
    let queued = self.queues.remove(id).unwrap_or_default();
    if let Some(to) = self.handles.get(id) {
      for msg in queued {
        out.push(TransportOutput::Undeliverable {
          to: to.clone(),
          msg: msg,
        });
      }
    }
  }

  fn on_up(
    &mut self,
    conn: ConnId,
    peer: NodeHandle,
    purpose: Purpose,
    outbound: bool,
    writer: UnboundedSender<WriterCmd>,
    abort: Abort,
    now: Instant,
    out: &mut Vec<TransportOutput>,
  ) {
    let id = peer.id.clone();
    let fresh = Conn {
      peer: peer.clone(),
      writer: writer,
      abort: abort,
      purpose: purpose,
      outbound: outbound,
      closing: false,
    };
    match (purpose, outbound) {
      (Purpose::Pilot, false) => {
        debug!(LOG_LEVEL, &self.cx.logger, format!("{} registered a pilot", peer));
        self.conns.insert(conn, fresh);
        if let Some(old) = self.relay.register_pilot(id, conn) {
          self.close(old);
        }
        return;
      }
      (Purpose::Pilot, true) => {
        info!(LOG_LEVEL, &self.cx.logger, format!("pilot registered with {}", peer));
        self.conns.insert(conn, fresh);
        self.pilot_dial = None;
        if let Some(old) = self.pilot.replace(conn) {
          self.close(old);
        }
        return;
      }
      _ => {}
    }
    if id == self.local.id {
      self.conns.insert(conn, fresh);
      self.close(conn);
      return;
    }
    if outbound && self.dialing.get(&id).map_or(false, |d| d.conn == conn) {
      self.dialing.remove(&id);
    }
    if let Some(existing) = self.peers.get(&id).cloned() {
      if self.keeps_existing(existing, &fresh) {
        trace!(
          LOG_LEVEL,
          &self.cx.logger,
          format!("dropping duplicate connection to {}", peer)
        );
        self.conns.insert(conn, fresh);
        self.close(conn);
        return;
      }
      self.close(existing);
    }
    if let Some(d) = self.dialing.get(&id) {
      // connected the other way while waiting to retry
      if d.retry_at.is_some() {
        self.dialing.remove(&id);
      }
    }
    self.conns.insert(conn, fresh);
    self.peers.insert(id.clone(), conn);
    self.remember(&peer);
    if outbound {
      if let Some(evicted) = self.sockets.opened(id.clone()) {
        debug!(
          LOG_LEVEL,
          &self.cx.logger,
          format!("socket limit reached, closing {:?}", evicted)
        );
        if let Some(old) = self.peers.get(&evicted).cloned() {
          self.close(old);
        }
      }
    }
    self.liveness.track(&id, now);
    self.report(&id, Liveness::Alive, out);
    for msg in self.queues.remove(&id).unwrap_or_default() {
      if let Err(Frame::Msg(msg)) = self.write(conn, Frame::Msg(msg)) {
        self.queues.entry(id.clone()).or_default().push(msg);
      }
    }
  }

  /// Two live connections to one peer. A newer incarnation always wins; otherwise the one
  /// opened by the side with the larger address survives, which both ends agree on. Only one of
  /// them being ours means we redialled after the peer's side went quiet, so the new one wins.
  fn keeps_existing(&self, existing: ConnId, fresh: &Conn) -> bool {
    let old = match self.conns.get(&existing) {
      Some(c) => c,
      None => return false,
    };
    if old.peer.epoch != fresh.peer.epoch {
      return old.peer.epoch > fresh.peer.epoch;
    }
    if old.outbound == fresh.outbound {
      return false;
    }
    let ours_win = keeps_own_connection(&self.local.socket, &fresh.peer.socket);
    old.outbound == ours_win
  }

  fn on_connect_failed(
    &mut self,
    conn: ConnId,
    id: Id,
    error: TransportError,
    now: Instant,
    out: &mut Vec<TransportOutput>,
  ) {
    let attempts = match self.dialing.get_mut(&id) {
      Some(d) if d.conn == conn => {
        d.attempts += 1;
        d.attempts
      }
      _ => return,
    };
    debug!(
      LOG_LEVEL,
      &self.cx.logger,
      format!("connect to {:?} failed ({}): {}", id, attempts, error)
    );
    if attempts >= self.config.max_connect_attempts {
      self.declare_dead(&id, out);
      return;
    }
    if attempts == 1 {
      self.report(&id, Liveness::Suspected, out);
    }
    if let Some(d) = self.dialing.get_mut(&id) {
      d.retry_at = Some(now + self.config.connect_backoff);
    }
  }

  /// A writer handed back what it could not send. Messages for a dead peer are reported
  /// undeliverable; after a failed write they go back to the front of the queue.
  fn on_unsent(
    &mut self,
    to: NodeHandle,
    msgs: Vec<PastryMsg>,
    abandoned: bool,
    now: Instant,
    out: &mut Vec<TransportOutput>,
  ) {
    if abandoned {
      for msg in msgs {
        out.push(TransportOutput::Undeliverable {
          to: to.clone(),
          msg: msg,
        });
      }
      return;
    }
    self.remember(&to);
    let queue = self.queues.entry(to.id.clone()).or_default();
    let later = std::mem::replace(queue, msgs);
    queue.extend(later);
    self.dial(&to.id, now);
  }

  fn on_frame(
    &mut self,
    conn: ConnId,
    frame: Frame,
    now: Instant,
    out: &mut Vec<TransportOutput>,
  ) {
    let (peer, closing, purpose) = match self.conns.get(&conn) {
      Some(c) => (c.peer.clone(), c.closing, c.purpose),
      None => return,
    };
    if !closing && self.peers.get(&peer.id) == Some(&conn) {
      self.sockets.updated(&peer.id);
      if let Some(LivenessAction::Alive(id)) = self.liveness.heard(&peer.id, now) {
        self.report(&id, Liveness::Alive, out);
      }
    }
    match frame {
      Frame::Msg(msg) => out.push(TransportOutput::Deliver {
        from: peer,
        msg: msg,
      }),
      Frame::Ping(seq) => {
        let _ = self.write(conn, Frame::Pong(seq));
      }
      Frame::Pong(seq) => {
        if let Some(rtt) = self.liveness.pong(&peer.id, seq, now) {
          out.push(TransportOutput::Proximity {
            peer: peer,
            rtt_ms: rtt.as_millis() as u64,
          });
        }
      }
      Frame::Goodbye => self.close(conn),
      Frame::OpenRequest { token } if purpose == Purpose::Pilot && self.pilot == Some(conn) => {
        if let Some(helper) = self.config.relay.clone() {
          let accept = self.conn_id();
          spawn_acceptor(helper, token, accept, self.cx.clone());
        }
      }
      other => {
        warn!(
          LOG_LEVEL,
          &self.cx.logger,
          format!("unexpected {} from {}, closing", other.kind(), peer)
        );
        self.close(conn);
        self.remember(&peer);
        self.dial(&peer.id, now);
      }
    }
  }

  fn on_down(&mut self, conn: ConnId, error: Option<TransportError>, now: Instant) {
    let c = match self.conns.remove(&conn) {
      Some(c) => c,
      None => return,
    };
    match &error {
      Some(e) => debug!(
        LOG_LEVEL,
        &self.cx.logger,
        format!("connection to {} lost: {}", c.peer, e)
      ),
      None => trace!(LOG_LEVEL, &self.cx.logger, format!("connection to {} closed", c.peer)),
    }
    if self.peers.get(&c.peer.id) == Some(&conn) {
      self.peers.remove(&c.peer.id);
      self.sockets.closed(&c.peer.id);
      self.liveness.forget(&c.peer.id);
      // a garbled stream says nothing about the peer itself
      let garbled = matches!(error, Some(TransportError::Protocol(_)));
      if garbled || self.queued(&c.peer.id) > 0 {
        self.dial(&c.peer.id, now);
      }
    }
    for stream in self.relay.drop_pilot_conn(&conn) {
      spawn_refuse(stream, "target went away".to_string(), self.cx.clone());
    }
    if self.pilot == Some(conn) {
      warn!(LOG_LEVEL, &self.cx.logger, "lost the pilot connection");
      self.pilot = None;
      self.pilot_retry_at = Some(now + self.config.connect_backoff);
    }
  }
}
impl Drop for TcpTransport {
  fn drop(&mut self) {
    if let Some(task) = self.listener.take() {
      task.abort();
    }
  }
}

#[test]
fn test_bind_advertises_loopback() {
  let (listener, advertised) = bind(&Socket::default()).unwrap();
  assert_eq!(advertised.host, Host::IP(IpAddr::V4(Ipv4Addr::LOCALHOST)));
  assert_eq!(advertised.port, listener.local_addr().unwrap().port());
  assert_ne!(advertised.port, 0);
}

#[cfg(test)]
fn test_transport() -> TcpTransport {
  let local = NodeHandle::new(Id::from_u128(0x10, 16), Socket::localhost(1));
  let config = TransportConfig::default();
  TcpTransport::new(local, config, LocalRef::void(), LocalRef::void()).unwrap()
}

#[test]
fn test_dial_without_a_handle_leaves_nothing_behind() {
  let mut t = test_transport();
  let id = Id::from_u128(0x20, 16);
  t.dial(&id, Instant::now());
  assert!(t.dialing.is_empty());
  let mut out = vec![];
  t.tick(Instant::now(), &mut out);
  assert!(out.is_empty());
}

#[test]
fn test_unexpected_frame_redials_a_peer_only_known_by_its_connection() {
  let rt = tokio::runtime::Runtime::new().unwrap();
  let _guard = rt.enter();
  let mut t = test_transport();
  let peer = NodeHandle::new(Id::from_u128(0x20, 16), Socket::localhost(2));
  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let conn = Conn {
    peer: peer.clone(),
    writer: tx,
    abort: Abort::default(),
    purpose: Purpose::Direct,
    outbound: false,
    closing: false,
  };
  t.conns.insert(7, conn);
  t.peers.insert(peer.id.clone(), 7);
  let mut out = vec![];
  t.on_frame(7, Frame::Spliced, Instant::now(), &mut out);
  assert!(!t.is_connected(&peer.id));
  assert!(matches!(rx.try_recv(), Ok(WriterCmd::Close)));
  let d = t.dialing.get(&peer.id).unwrap();
  assert_ne!(d.conn, 0);
  assert!(d.retry_at.is_none());
}

#[cfg(test)]
fn test_msg(n: u8) -> PastryMsg {
  PastryMsg::RouteRowRequest(n as u32)
}

#[test]
fn test_unsent_messages_requeue_or_fail() {
  let rt = tokio::runtime::Runtime::new().unwrap();
  let _guard = rt.enter();
  let mut t = test_transport();
  let peer = NodeHandle::new(Id::from_u128(0x20, 16), Socket::localhost(2));
  t.queues.insert(peer.id.clone(), vec![test_msg(3)]);
  let mut out = vec![];

  // a failed write puts them back ahead of anything queued since
  t.on_unsent(peer.clone(), vec![test_msg(1), test_msg(2)], false, Instant::now(), &mut out);
  assert!(out.is_empty());
  assert_eq!(t.queues[&peer.id], vec![test_msg(1), test_msg(2), test_msg(3)]);
  assert!(t.dialing.contains_key(&peer.id));

  t.on_unsent(peer.clone(), vec![test_msg(4)], true, Instant::now(), &mut out);
  assert_eq!(
    out,
    vec![TransportOutput::Undeliverable {
      to: peer.clone(),
      msg: test_msg(4),
    }]
  );
  assert_eq!(t.queued(&peer.id), 3);
}
