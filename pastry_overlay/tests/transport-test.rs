use crossbeam::channel::{unbounded, Receiver, Sender};
use pastry_overlay::core::{
  Id, LocalRef, Node, NodeConfig, NodeHandle, PastryConfig, RouteError, Socket, TransportConfig,
};
use pastry_overlay::overlay::{
  AppAddress, AppUpcall, JoinState, Overlay, OverlayHandle, OverlayStatus, SendOptions,
};
use pastry_overlay::testkit::{FailureConfigMap, LogLevel};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn app() -> AppAddress {
  AppAddress::from("echo")
}

fn pastry_config() -> PastryConfig {
  let mut config = PastryConfig::default();
  config.id_bits = 32;
  config.leaf_set_size = 8;
  config.tick_interval = Duration::from_millis(50);
  config.probe_retry = Duration::from_millis(300);
  config
}

fn transport_config() -> TransportConfig {
  let mut config = TransportConfig::default();
  config.ping_interval = Duration::from_millis(500);
  config.pong_timeout = Duration::from_millis(250);
  config.connect_timeout = Duration::from_secs(1);
  config.connect_backoff = Duration::from_millis(50);
  config.max_connect_attempts = 5;
  config
}

fn node() -> Node {
  let mut config = NodeConfig::default();
  config.socket = Socket::localhost(0);
  config.actor_threads = 2;
  config.log_level = LogLevel::Error;
  Node::new_sync(config).unwrap()
}

struct Peer {
  handle: OverlayHandle,
  upcalls: Receiver<AppUpcall>,
}

fn start(node: &Node, id: u128, transport: TransportConfig, bootstrap: Option<&Peer>) -> Peer {
  let handle = Overlay::spawn(
    node,
    Id::from_u128(id, 32),
    pastry_config(),
    transport,
    bootstrap.map(|b| b.handle.local().clone()),
    FailureConfigMap::default(),
  )
  .unwrap();
  let (tx, rx): (Sender<AppUpcall>, Receiver<AppUpcall>) = unbounded();
  handle.register(
    app(),
    LocalRef::from_fn(move |u| tx.send(u).is_ok()),
  );
  Peer {
    handle: handle,
    upcalls: rx,
  }
}

impl Peer {
  fn expect<T, F: Fn(AppUpcall) -> Option<T>>(&self, f: F) -> T {
    let deadline = std::time::Instant::now() + TIMEOUT;
    loop {
      let left = deadline.saturating_duration_since(std::time::Instant::now());
      let upcall = self.upcalls.recv_timeout(left).expect("timed out waiting for upcall");
      if let Some(t) = f(upcall) {
        return t;
      }
    }
  }

  fn await_ready(&self) {
    self.expect(|u| match u {
      AppUpcall::Ready => Some(()),
      _ => None,
    })
  }

  fn await_delivery(&self) -> (Option<Id>, Vec<u8>, NodeHandle) {
    self.expect(|u| match u {
      AppUpcall::Deliver(m) => Some((m.key, m.payload, m.origin)),
      _ => None,
    })
  }

  fn status(&self) -> OverlayStatus {
    let (tx, rx) = unbounded();
    self.handle.inspect(LocalRef::from_fn(move |s| tx.send(s).is_ok()));
    rx.recv_timeout(TIMEOUT).unwrap()
  }

  fn id(&self) -> Id {
    self.handle.local().id.clone()
  }
}

fn await_status<F: Fn(&OverlayStatus) -> bool>(peer: &Peer, f: F) {
  let deadline = std::time::Instant::now() + TIMEOUT;
  loop {
    let status = peer.status();
    if f(&status) {
      return;
    }
    assert!(std::time::Instant::now() < deadline, "gave up waiting, at {:?}", status);
    std::thread::sleep(Duration::from_millis(20));
  }
}

// The first node boots alone and is ready before its application registers, so wait on its
// status instead of the upcall.
fn await_state(peer: &Peer, state: JoinState) {
  await_status(peer, |s| s.state == state)
}

#[test]
fn three_nodes_route_over_tcp() {
  let node = node();
  let a = start(&node, 0x1000_0000, transport_config(), None);
  await_state(&a, JoinState::Ready);
  let b = start(&node, 0x5000_0000, transport_config(), Some(&a));
  b.await_ready();
  let c = start(&node, 0x9000_0000, transport_config(), Some(&b));
  c.await_ready();

  let status = c.status();
  let members: Vec<Id> = status.leaf_set.handles().map(|h| h.id.clone()).collect();
  assert!(members.contains(&a.id()));
  assert!(members.contains(&b.id()));
  assert!(status.connections >= 1);

  // closest to b
  let key = Id::from_u128(0x5100_0000, 32);
  a.handle.route(key.clone(), app(), b"hello".to_vec(), SendOptions::default());
  let (got, payload, origin) = b.await_delivery();
  assert_eq!(got, Some(key));
  assert_eq!(payload, b"hello".to_vec());
  assert_eq!(origin.id, a.id());

  c.handle.route_direct(
    a.handle.local().clone(),
    app(),
    b"direct".to_vec(),
    SendOptions::default(),
  );
  let (got, payload, origin) = a.await_delivery();
  assert_eq!(got, None);
  assert_eq!(payload, b"direct".to_vec());
  assert_eq!(origin.id, c.id());

  let (tx, rx) = unbounded();
  assert!(node.traffic(LocalRef::from_fn(move |t| tx.send(t).is_ok())));
  let (sent, recvd) = rx.recv_timeout(TIMEOUT).unwrap();
  assert!(sent > 0);
  assert!(recvd > 0);
}

#[test]
fn node_behind_nat_is_reached_through_its_helper() {
  let node = node();
  let helper = start(&node, 0x2000_0000, transport_config(), None);
  await_state(&helper, JoinState::Ready);

  let mut nat_config = transport_config();
  nat_config.behind_nat = true;
  nat_config.relay = Some(helper.handle.local().socket.clone());
  let hidden = start(&node, 0x6000_0000, nat_config, Some(&helper));
  hidden.await_ready();
  assert_eq!(hidden.handle.local().relay, Some(helper.handle.local().socket.clone()));
  await_status(&hidden, |s| s.has_pilot);

  // closer to the helper than to the hidden node, so the helper answers the join and the
  // outsider has to reach the hidden node through the relay
  let outsider = start(&node, 0x1000_0000, transport_config(), Some(&helper));
  outsider.await_ready();
  let key = Id::from_u128(0x6000_0001, 32);
  outsider.handle.route(key.clone(), app(), b"knock".to_vec(), SendOptions::default());
  let (got, payload, origin) = hidden.await_delivery();
  assert_eq!(got, Some(key));
  assert_eq!(payload, b"knock".to_vec());
  assert_eq!(origin.id, outsider.id());
}

#[test]
fn direct_message_to_unreachable_peer_fails() {
  let node = node();
  let mut config = transport_config();
  config.max_connect_attempts = 2;
  let a = start(&node, 0x1000_0000, config, None);
  await_state(&a, JoinState::Ready);

  // a port nothing listens on any more
  let port = {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
  };
  let ghost = NodeHandle::new(Id::from_u128(0x7000_0000, 32), Socket::localhost(port));
  let options = SendOptions {
    notify_failure: true,
  };
  a.handle.route_direct(ghost, app(), b"anyone?".to_vec(), options);
  let error = a.expect(|u| match u {
    AppUpcall::DeliveryFailed(m, e) => {
      assert_eq!(m.payload, b"anyone?".to_vec());
      Some(e)
    }
    _ => None,
  });
  assert!(matches!(error, RouteError::Unreachable(_)));
}
