use crate::core::{
  Actor, ActorContext, ActorSignal, Id, LivenessEvent, LocalRef, Node, NodeHandle, PastryConfig,
  SetEvent, TransportConfig, TransportError,
};
use crate::overlay::{
  AppAddress, AppUpcall, Effect, JoinState, LeafSetSnapshot, Outbox, PastryMsg, PastryNode,
  SendOptions,
};
use crate::testkit::{FailureConfigMap, FailureMode, LogLevel};
use crate::transport::{bind, TcpTransport, TransportEvent, TransportOutput};
use crate::{error, trace};
use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

const LOG_LEVEL: LogLevel = LogLevel::Info;

pub enum OverlayMsg {
  Net(TransportEvent),
  Cmd(OverlayCmd),
  Tick,
  /// A message held back by failure injection.
  SendLater(NodeHandle, PastryMsg),
}
impl From<TransportEvent> for OverlayMsg {
  fn from(e: TransportEvent) -> Self {
    OverlayMsg::Net(e)
  }
}
impl From<OverlayCmd> for OverlayMsg {
  fn from(c: OverlayCmd) -> Self {
    OverlayMsg::Cmd(c)
  }
}

/// Requests from the rest of the process.
pub enum OverlayCmd {
  Register(AppAddress, LocalRef<AppUpcall>),
  Unregister(AppAddress),
  Route {
    key: Id,
    app: AppAddress,
    payload: Vec<u8>,
    options: SendOptions,
  },
  RouteDirect {
    to: NodeHandle,
    app: AppAddress,
    payload: Vec<u8>,
    options: SendOptions,
  },
  SubscribeLeafSet(LocalRef<SetEvent>),
  SubscribeRoutes(LocalRef<SetEvent>),
  SubscribeLiveness(LocalRef<LivenessEvent>),
  Rejoin(Option<NodeHandle>),
  Inspect(LocalRef<OverlayStatus>),
  Leave,
}

/// A point-in-time view of a running overlay node.
#[derive(Clone, Debug)]
pub struct OverlayStatus {
  pub local: NodeHandle,
  pub state: JoinState,
  pub leaf_set: LeafSetSnapshot,
  pub routes: usize,
  pub open_sockets: usize,
  pub connections: usize,
  pub has_pilot: bool,
}

/// How the rest of the process talks to a running [`Overlay`].
#[derive(Clone)]
pub struct OverlayHandle {
  local: NodeHandle,
  cmd: LocalRef<OverlayCmd>,
}
impl OverlayHandle {
  pub fn local(&self) -> &NodeHandle {
    &self.local
  }

  pub fn cmd(&self) -> &LocalRef<OverlayCmd> {
    &self.cmd
  }

  pub fn register(&self, app: AppAddress, recipient: LocalRef<AppUpcall>) -> bool {
    self.cmd.send(OverlayCmd::Register(app, recipient))
  }

  pub fn route(&self, key: Id, app: AppAddress, payload: Vec<u8>, options: SendOptions) -> bool {
    self.cmd.send(OverlayCmd::Route {
      key: key,
      app: app,
      payload: payload,
      options: options,
    })
  }

  pub fn route_direct(
    &self,
    to: NodeHandle,
    app: AppAddress,
    payload: Vec<u8>,
    options: SendOptions,
  ) -> bool {
    self.cmd.send(OverlayCmd::RouteDirect {
      to: to,
      app: app,
      payload: payload,
      options: options,
    })
  }

  pub fn inspect(&self, recipient: LocalRef<OverlayStatus>) -> bool {
    self.cmd.send(OverlayCmd::Inspect(recipient))
  }

  pub fn rejoin(&self, bootstrap: Option<NodeHandle>) -> bool {
    self.cmd.send(OverlayCmd::Rejoin(bootstrap))
  }

  /// Close every connection and stop the node. Peers find out through their liveness checks.
  pub fn leave(&self) -> bool {
    self.cmd.send(OverlayCmd::Leave)
  }
}

/// Runs a [`PastryNode`] over TCP.
///
/// The actor owns both the node and the [`TcpTransport`]. Transport events become node inputs,
/// node effects become frames, and a timer ticks both every `tick_interval`.
pub struct Overlay {
  pastry: PastryNode,
  transport_config: TransportConfig,
  listener: Option<std::net::TcpListener>,
  transport: Option<TcpTransport>,
  bootstrap: Option<NodeHandle>,
  fail_map: FailureConfigMap,
  rng: SmallRng,
}
impl Overlay {
  /// Binds the listener on the node's socket and starts the overlay actor. The node joins
  /// through `bootstrap`, or starts a ring of its own without one.
  pub fn spawn(
    node: &Node,
    id: Id,
    config: PastryConfig,
    transport: TransportConfig,
    bootstrap: Option<NodeHandle>,
    fail_map: FailureConfigMap,
  ) -> Result<OverlayHandle, TransportError> {
    transport.validate()?;
    let (listener, advertised) = bind(node.socket())?;
    let mut local = NodeHandle::new(id, advertised);
    if transport.behind_nat {
      if let Some(helper) = &transport.relay {
        local = local.relayed_by(helper.clone());
      }
    }
    let mut pastry = PastryNode::new(local.clone(), config)?;
    pastry.set_logger(node.logger().clone());
    let name = format!("overlay-{}", local.id);
    let actor = Overlay {
      pastry: pastry,
      transport_config: transport,
      listener: Some(listener),
      transport: None,
      bootstrap: bootstrap,
      fail_map: fail_map,
      rng: SmallRng::from_entropy(),
    };
    let msgs: LocalRef<OverlayMsg> = node.spawn(actor, name);
    Ok(OverlayHandle {
      local: local,
      cmd: msgs.transform(),
    })
  }

  fn schedule_tick(&self, ctx: &ActorContext<OverlayMsg>) {
    ctx.node.schedule_local_msg(
      self.pastry.config().tick_interval,
      ctx.local_interface(),
      OverlayMsg::Tick,
    );
  }

  fn send(
    &mut self,
    ctx: &ActorContext<OverlayMsg>,
    to: NodeHandle,
    msg: PastryMsg,
    now: Instant,
  ) {
    if self.fail_map.mode == FailureMode::Message {
      match self.fail_map.get(&to.socket).sample(&mut self.rng) {
        None => {
          trace!(
            LOG_LEVEL,
            &ctx.node,
            format!("dropping {} to {}", msg.kind(), to)
          );
          return;
        }
        Some(delay) if delay > Duration::from_millis(0) => {
          ctx.node.schedule_local_msg(
            delay,
            ctx.local_interface(),
            OverlayMsg::SendLater(to, msg),
          );
          return;
        }
        Some(_) => {}
      }
    }
    if let Some(t) = &mut self.transport {
      t.send(&to, msg, now);
    }
  }

  fn carry_out(&mut self, ctx: &ActorContext<OverlayMsg>, out: &mut Outbox, now: Instant) {
    for effect in out.take() {
      match effect {
        Effect::Send { to, msg } => self.send(ctx, (*to).clone(), msg, now),
        Effect::CheckLiveness(peer) => {
          if let Some(t) = &mut self.transport {
            t.check(&peer, now);
          }
        }
      }
    }
  }

  fn absorb(&mut self, outputs: Vec<TransportOutput>, now: Instant, out: &mut Outbox) {
    for output in outputs {
      match output {
        TransportOutput::Deliver { from, msg } => self.pastry.receive(&from, msg, now, out),
        TransportOutput::PeerStatus { peer, liveness } => {
          self.pastry.peer_status(&peer, liveness, now, out)
        }
        TransportOutput::Proximity { peer, rtt_ms } => self.pastry.proximity(&peer, rtt_ms),
        TransportOutput::Undeliverable { to, msg } => self.pastry.send_failed(&to, msg, now, out),
      }
    }
  }

  fn status(&self) -> OverlayStatus {
    let (open_sockets, connections, has_pilot) = match &self.transport {
      Some(t) => (t.open_sockets(), t.connections(), t.has_pilot()),
      None => (0, 0, false),
    };
    OverlayStatus {
      local: (**self.pastry.local()).clone(),
      state: self.pastry.join_state().clone(),
      leaf_set: self.pastry.leaf_set().snapshot(),
      routes: self.pastry.routing_table().len(),
      open_sockets: open_sockets,
      connections: connections,
      has_pilot: has_pilot,
    }
  }

  fn command(
    &mut self,
    ctx: &ActorContext<OverlayMsg>,
    cmd: OverlayCmd,
    now: Instant,
    out: &mut Outbox,
  ) {
    match cmd {
      OverlayCmd::Register(app, recipient) => self.pastry.register(app, Box::new(recipient)),
      OverlayCmd::Unregister(app) => {
        self.pastry.unregister(&app);
      }
      OverlayCmd::Route {
        key,
        app,
        payload,
        options,
      } => self.pastry.route(key, app, payload, options, now, out),
      OverlayCmd::RouteDirect {
        to,
        app,
        payload,
        options,
      } => self.pastry.route_direct(&to, app, payload, options, out),
      OverlayCmd::SubscribeLeafSet(s) => self.pastry.subscribe_leaf_set(s),
      OverlayCmd::SubscribeRoutes(s) => self.pastry.subscribe_routes(s),
      OverlayCmd::SubscribeLiveness(s) => self.pastry.subscribe_liveness(s),
      OverlayCmd::Rejoin(bootstrap) => self.pastry.rejoin(bootstrap.as_ref(), now, out),
      OverlayCmd::Inspect(recipient) => {
        recipient.send(self.status());
      }
      OverlayCmd::Leave => {
        if let Some(t) = &mut self.transport {
          t.shutdown();
        }
        ctx.local_interface::<OverlayMsg>().signal(ActorSignal::Term);
      }
    }
  }
}
#[async_trait]
impl Actor<OverlayMsg> for Overlay {
  async fn pre_start(&mut self, ctx: &ActorContext<OverlayMsg>) {
    let now = Instant::now();
    let local = (**self.pastry.local()).clone();
    let started = TcpTransport::new(
      local,
      self.transport_config.clone(),
      ctx.local_interface(),
      ctx.node.logger().clone(),
    )
    .and_then(|mut t| match self.listener.take() {
      Some(listener) => t.start(listener, now).map(|_| t),
      None => Ok(t),
    });
    match started {
      Ok(t) => self.transport = Some(t),
      Err(e) => {
        error!(LOG_LEVEL, &ctx.node, format!("overlay transport failed: {}", e));
        ctx.local_interface::<OverlayMsg>().signal(ActorSignal::Term);
        return;
      }
    }
    let mut out = Outbox::new();
    let bootstrap = self.bootstrap.take();
    self.pastry.boot(bootstrap.as_ref(), now, &mut out);
    self.carry_out(ctx, &mut out, now);
    self.schedule_tick(ctx);
  }

  async fn recv(&mut self, ctx: &ActorContext<OverlayMsg>, msg: OverlayMsg) {
    let now = Instant::now();
    let mut out = Outbox::new();
    let mut outputs = Vec::new();
    match msg {
      OverlayMsg::Net(event) => {
        if let Some(t) = &mut self.transport {
          t.handle(event, now, &mut outputs);
        }
      }
      OverlayMsg::Cmd(cmd) => self.command(ctx, cmd, now, &mut out),
      OverlayMsg::Tick => {
        self.pastry.tick(now, &mut out);
        if let Some(t) = &mut self.transport {
          t.tick(now, &mut outputs);
        }
        self.schedule_tick(ctx);
      }
      OverlayMsg::SendLater(to, msg) => {
        if let Some(t) = &mut self.transport {
          t.send(&to, msg, now);
        }
      }
    }
    self.absorb(outputs, now, &mut out);
    self.carry_out(ctx, &mut out, now);
  }

  async fn post_stop(&mut self, _: &ActorContext<OverlayMsg>) {
    if let Some(t) = &mut self.transport {
      t.shutdown();
    }
  }
}
