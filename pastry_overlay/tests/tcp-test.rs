use crossbeam::channel::{unbounded, Receiver, Sender};
use pastry_overlay::core::{Id, Liveness, LocalRef, NodeHandle, Socket, TransportConfig};
use pastry_overlay::overlay::{AppAddress, PastryMsg, RouteMsg, SendOptions};
use pastry_overlay::transport::{
  bind, encode_frame, ConnectionHeader, Frame, FrameReader, Purpose, TcpTransport,
  TransportEvent, TransportOutput,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

const TIMEOUT: Duration = Duration::from_secs(10);
const MAX: usize = 4 * 1024 * 1024;

fn config() -> TransportConfig {
  let mut config = TransportConfig::default();
  // fake peers never answer pings, so keep them out of the way unless a test wants them
  config.ping_interval = Duration::from_secs(30);
  config.pong_timeout = Duration::from_secs(10);
  config.connect_timeout = Duration::from_secs(1);
  config.connect_backoff = Duration::from_millis(50);
  config.max_frame_size = MAX;
  config
}

fn msg(n: u8, bytes: usize) -> PastryMsg {
  PastryMsg::Route(RouteMsg {
    key: Id::from_u128(n as u128, 32),
    app: AppAddress::from("test"),
    origin: NodeHandle::new(Id::from_u128(1, 32), Socket::localhost(1)),
    payload: vec![n; bytes],
    hops: 0,
    attempts: 0,
    options: SendOptions::default(),
  })
}

struct Harness {
  transport: TcpTransport,
  events: Receiver<TransportEvent>,
  outputs: Vec<TransportOutput>,
  rt: Runtime,
}
impl Harness {
  fn new(id: u128, config: TransportConfig) -> Harness {
    let rt = tokio::runtime::Builder::new_multi_thread()
      .worker_threads(2)
      .enable_all()
      .build()
      .unwrap();
    let (listener, socket) = bind(&Socket::localhost(0)).unwrap();
    let (tx, rx): (Sender<TransportEvent>, Receiver<TransportEvent>) = unbounded();
    let local = NodeHandle::new(Id::from_u128(id, 32), socket);
    let events = LocalRef::from_fn(move |e| tx.send(e).is_ok());
    let mut transport = TcpTransport::new(local, config, events, LocalRef::void()).unwrap();
    {
      let _guard = rt.enter();
      transport.start(listener, Instant::now()).unwrap();
    }
    Harness {
      transport: transport,
      events: rx,
      outputs: Vec::new(),
      rt: rt,
    }
  }

  fn local(&self) -> NodeHandle {
    self.transport.local().clone()
  }

  fn send(&mut self, to: &NodeHandle, msg: PastryMsg) {
    let _guard = self.rt.enter();
    self.transport.send(to, msg, Instant::now());
  }

  fn step(&mut self) {
    let _guard = self.rt.enter();
    let now = Instant::now();
    while let Ok(event) = self.events.try_recv() {
      self.transport.handle(event, now, &mut self.outputs);
    }
    self.transport.tick(now, &mut self.outputs);
  }

  fn until<F: Fn(&Harness) -> bool>(&mut self, f: F) {
    let deadline = Instant::now() + TIMEOUT;
    while !f(&*self) {
      assert!(Instant::now() < deadline, "gave up waiting, at {:?}", self.outputs);
      if let Ok(event) = self.events.recv_timeout(Duration::from_millis(10)) {
        let _guard = self.rt.enter();
        self.transport.handle(event, Instant::now(), &mut self.outputs);
      }
      self.step();
    }
  }

  fn undeliverable(&self, to: &Id) -> usize {
    self
      .outputs
      .iter()
      .filter(|o| matches!(o, TransportOutput::Undeliverable { to: h, .. } if &h.id == to))
      .count()
  }

  fn delivered(&self, m: &PastryMsg) -> Vec<Id> {
    self
      .outputs
      .iter()
      .filter_map(|o| match o {
        TransportOutput::Deliver { from, msg } if msg == m => Some(from.id.clone()),
        _ => None,
      })
      .collect()
  }

  fn reported(&self, id: &Id, liveness: Liveness) -> bool {
    self.outputs.iter().any(|o| match o {
      TransportOutput::PeerStatus { peer, liveness: l } => &peer.id == id && *l == liveness,
      _ => false,
    })
  }
}

/// A peer played by hand over blocking sockets.
struct FakePeer {
  handle: NodeHandle,
  listener: TcpListener,
}
impl FakePeer {
  fn new(id: u128) -> FakePeer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    FakePeer {
      handle: NodeHandle::new(Id::from_u128(id, 32), Socket::localhost(port)),
      listener: listener,
    }
  }

  /// Take the next connection and answer its hello. Returns who said hello.
  fn accept(&self) -> (Wire, NodeHandle) {
    let (stream, _) = self.listener.accept().unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut wire = Wire {
      stream: stream,
      reader: FrameReader::new(MAX),
    };
    let mut header = [0u8; ConnectionHeader::SIZE];
    wire.stream.read_exact(&mut header).unwrap();
    assert_eq!(ConnectionHeader::parse(&header).unwrap().purpose, Purpose::Direct);
    let opener = match wire.read() {
      Some(Frame::Hello(h)) => h,
      other => panic!("expected Hello, got {:?}", other),
    };
    wire.write(&Frame::HelloAck(self.handle.clone()));
    (wire, opener)
  }
}

struct Wire {
  stream: TcpStream,
  reader: FrameReader,
}
impl Wire {
  /// `None` once the stream is closed.
  fn read(&mut self) -> Option<Frame> {
    let mut buf = [0u8; 8192];
    loop {
      if let Some(frame) = self.reader.next_frame().unwrap() {
        return Some(frame);
      }
      match self.stream.read(&mut buf) {
        Ok(0) | Err(_) => return None,
        Ok(n) => self.reader.push(&buf[..n]),
      }
    }
  }

  fn write(&mut self, frame: &Frame) {
    self.stream.write_all(&encode_frame(frame, MAX).unwrap()).unwrap();
  }
}

/// Serve one connection on its own thread, passing on every frame until it closes.
fn serve_one(peer: FakePeer) -> Receiver<Frame> {
  let (tx, rx) = unbounded();
  std::thread::spawn(move || {
    let (mut wire, _) = peer.accept();
    while let Some(frame) = wire.read() {
      if tx.send(frame).is_err() {
        return;
      }
    }
  });
  rx
}

#[test]
fn messages_behind_a_stuck_write_are_reported_when_the_peer_dies() {
  let mut config = config();
  config.ping_interval = Duration::from_millis(200);
  config.pong_timeout = Duration::from_millis(100);
  config.max_missed_pongs = 2;
  let mut h = Harness::new(0x1000_0000, config);

  // answers the hello, then never reads again
  let peer = FakePeer::new(0x5000_0000);
  let target = peer.handle.clone();
  let (hold, held) = unbounded::<()>();
  std::thread::spawn(move || {
    let _wire = peer.accept();
    let _ = held.recv();
  });

  h.send(&target, msg(0, 16));
  h.until(|h| h.transport.is_connected(&target.id));
  // far more than the socket buffers take
  for i in 0..200 {
    h.send(&target, msg(i as u8, 256 * 1024));
  }
  h.until(|h| h.reported(&target.id, Liveness::Dead));
  h.until(|h| h.undeliverable(&target.id) >= 100);
  assert!(!h.transport.is_connected(&target.id));
  assert!(h.undeliverable(&target.id) <= 201);
  drop(hold);
}

#[test]
fn least_recently_used_socket_is_closed_at_the_limit() {
  let mut config = config();
  config.max_open_sockets = 2;
  let mut h = Harness::new(0x1000_0000, config);

  let peers: Vec<FakePeer> = (1..=3).map(|i| FakePeer::new(i * 0x1000_0000 + 1)).collect();
  let handles: Vec<NodeHandle> = peers.iter().map(|p| p.handle.clone()).collect();
  let frames: Vec<Receiver<Frame>> = peers.into_iter().map(serve_one).collect();

  for (i, to) in handles.iter().enumerate() {
    h.send(to, msg(i as u8, 8));
    h.until(|h| h.transport.is_connected(&to.id));
    assert_eq!(frames[i].recv_timeout(TIMEOUT).unwrap(), Frame::Msg(msg(i as u8, 8)));
  }
  assert_eq!(h.transport.open_sockets(), 2);
  assert!(!h.transport.is_connected(&handles[0].id));
  assert!(h.transport.is_connected(&handles[1].id));
  assert!(h.transport.is_connected(&handles[2].id));
  assert_eq!(frames[0].recv_timeout(TIMEOUT).unwrap(), Frame::Goodbye);

  // touching the second makes the third the oldest
  h.send(&handles[1], msg(9, 8));
  assert_eq!(frames[1].recv_timeout(TIMEOUT).unwrap(), Frame::Msg(msg(9, 8)));
  let again = FakePeer::new(0x7000_0000);
  let fourth = again.handle.clone();
  let _fourth_frames = serve_one(again);
  h.send(&fourth, msg(4, 8));
  h.until(|h| h.transport.is_connected(&fourth.id));
  assert_eq!(frames[2].recv_timeout(TIMEOUT).unwrap(), Frame::Goodbye);
  assert!(h.transport.is_connected(&handles[1].id));
  assert_eq!(h.transport.open_sockets(), 2);
}

#[test]
fn garbled_connection_is_dropped_and_dialled_again() {
  let mut h = Harness::new(0x1000_0000, config());
  let local = h.local();
  let peer = FakePeer::new(0x5000_0000);
  let target = peer.handle.clone();
  let (tx, rx) = unbounded();
  std::thread::spawn(move || {
    let (mut first, _) = peer.accept();
    // only ever sent by a rendezvous helper
    first.write(&Frame::Spliced);
    let (mut second, opener) = peer.accept();
    let _ = tx.send(opener);
    while second.read().is_some() {}
    drop(first);
  });

  h.send(&target, msg(1, 8));
  let deadline = Instant::now() + TIMEOUT;
  let opener = loop {
    assert!(Instant::now() < deadline, "never dialled again");
    h.step();
    if let Ok(opener) = rx.recv_timeout(Duration::from_millis(10)) {
      break opener;
    }
  };
  assert_eq!(opener.id, local.id);
  h.until(|h| h.transport.is_connected(&target.id));
  assert_eq!(h.undeliverable(&target.id), 0);
}

#[test]
fn simultaneous_open_settles_on_one_connection() {
  let mut a = Harness::new(0x1000_0000, config());
  let mut b = Harness::new(0x5000_0000, config());
  let (ha, hb) = (a.local(), b.local());
  a.send(&hb, msg(1, 8));
  b.send(&ha, msg(2, 8));

  let deadline = Instant::now() + TIMEOUT;
  while a.delivered(&msg(2, 8)).is_empty() || b.delivered(&msg(1, 8)).is_empty() {
    assert!(Instant::now() < deadline, "messages never crossed");
    a.step();
    b.step();
    std::thread::sleep(Duration::from_millis(5));
  }
  // let the losing connection close on both ends
  for _ in 0..40 {
    a.step();
    b.step();
    std::thread::sleep(Duration::from_millis(5));
  }
  assert_eq!(a.transport.connections(), 1);
  assert_eq!(b.transport.connections(), 1);
  assert_eq!(a.delivered(&msg(2, 8)), vec![hb.id.clone()]);
  assert_eq!(b.delivered(&msg(1, 8)), vec![ha.id.clone()]);

  a.send(&hb, msg(3, 8));
  b.until(|b| !b.delivered(&msg(3, 8)).is_empty());
  assert!(a.transport.is_connected(&hb.id));
  assert!(b.transport.is_connected(&ha.id));
}

#[test]
fn hello_from_a_narrower_ring_is_turned_away() {
  let mut h = Harness::new(0x1000_0000, config());
  let port = h.local().socket.port;
  let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
  stream.set_read_timeout(Some(TIMEOUT)).unwrap();
  stream.write_all(&ConnectionHeader::new(Purpose::Direct).to_bytes()).unwrap();
  let narrow = NodeHandle::new(Id::from_u128(0x20, 8), Socket::localhost(1));
  stream.write_all(&encode_frame(&Frame::Hello(narrow), MAX).unwrap()).unwrap();

  // closed without a HelloAck
  let mut buf = [0u8; 64];
  assert_eq!(stream.read(&mut buf).unwrap_or(0), 0);
  h.step();
  assert_eq!(h.transport.connections(), 0);
}
