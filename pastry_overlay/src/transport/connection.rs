use crate::core::{
  Id, LocalRef, NodeHandle, PendingOp, Socket, TransportConfig, TransportError,
};
use crate::overlay::PastryMsg;
use crate::testkit::{LogLevel, LogSpecial, LoggerMsg};
use crate::transport::{
  read_header, write_frame, write_header, ConnectionHeader, Frame, FrameReader, Purpose,
};
use crate::{debug, trace, warn};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::timeout;

const LOG_LEVEL: LogLevel = LogLevel::Info;

pub type ConnId = u64;

#[derive(Debug)]
pub enum WriterCmd {
  Frame(Frame),
  /// Say goodbye once everything queued before this is written, then close.
  Close,
}

#[derive(Default)]
struct AbortSignal {
  reader: Notify,
  writer: Notify,
}

/// Tears a connection down without waiting for the peer. Used once the peer is declared dead,
/// when a blocked write would otherwise hold queued messages forever.
#[derive(Clone, Default)]
pub struct Abort(Arc<AbortSignal>);
impl Abort {
  pub fn abort(&self) {
    // permits are stored, so a task that is not waiting yet still sees it
    self.0.reader.notify_one();
    self.0.writer.notify_one();
  }
}
impl std::fmt::Debug for Abort {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("Abort")
  }
}

/// What connection tasks report to the actor owning the transport.
#[derive(Debug)]
pub enum TransportEvent {
  /// A connection finished its handshake. `outbound` if this side opened it.
  Up {
    conn: ConnId,
    peer: NodeHandle,
    purpose: Purpose,
    outbound: bool,
    writer: UnboundedSender<WriterCmd>,
    abort: Abort,
  },
  /// Messages a writer could not put on the wire, in send order. `abandoned` if the connection
  /// was aborted because the peer is dead; otherwise the write failed and they may be retried.
  Unsent {
    to: NodeHandle,
    msgs: Vec<PastryMsg>,
    abandoned: bool,
  },
  /// An outbound connection never came up. `peer` is `None` for the pilot.
  ConnectFailed {
    conn: ConnId,
    peer: Option<Id>,
    error: TransportError,
  },
  Frame {
    conn: ConnId,
    frame: Frame,
  },
  Down {
    conn: ConnId,
    error: Option<TransportError>,
  },
  /// Helper side: a connector wants to be spliced to `target`.
  RelayConnect {
    target: Id,
    token: u64,
    stream: TcpStream,
  },
  /// Helper side: the acceptor for `token` arrived.
  RelayAccept {
    token: u64,
    stream: TcpStream,
  },
}

/// What every connection task needs: who we are, the limits, and where to report.
#[derive(Clone)]
pub struct ConnContext {
  pub local: NodeHandle,
  pub config: Arc<TransportConfig>,
  pub events: LocalRef<TransportEvent>,
  pub logger: LocalRef<LoggerMsg>,
}

enum Handshake {
  Peer {
    stream: TcpStream,
    reader: FrameReader,
    peer: NodeHandle,
    purpose: Purpose,
  },
  /// The stream was handed to the relay bookkeeping.
  Relayed,
}

pub(crate) async fn listen(listener: TcpListener, cx: ConnContext, first_conn: ConnId) {
  let mut conn = first_conn;
  loop {
    match listener.accept().await {
      Ok((stream, addr)) => {
        trace!(LOG_LEVEL, &cx.logger, format!("accepted {}", addr));
        // inbound ids count down from the top so they never meet outbound ones
        conn = conn.wrapping_sub(1);
        tokio::spawn(accept(stream, cx.clone(), conn));
      }
      Err(e) => {
        warn!(LOG_LEVEL, &cx.logger, format!("accept failed: {}", e));
        tokio::time::sleep(cx.config.connect_backoff).await;
      }
    }
  }
}

async fn accept(stream: TcpStream, cx: ConnContext, conn: ConnId) {
  let _ = stream.set_nodelay(true);
  match timeout(cx.config.connect_timeout, accept_handshake(stream, &cx)).await {
    Err(_) => debug!(LOG_LEVEL, &cx.logger, "inbound handshake timed out"),
    Ok(Err(e)) => debug!(LOG_LEVEL, &cx.logger, format!("inbound handshake: {}", e)),
    Ok(Ok(Handshake::Relayed)) => {}
    Ok(Ok(Handshake::Peer {
      stream,
      reader,
      peer,
      purpose,
    })) => run_connection(stream, reader, peer, purpose, false, conn, cx).await,
  }
}

async fn accept_handshake(
  mut stream: TcpStream,
  cx: &ConnContext,
) -> Result<Handshake, TransportError> {
  let header = read_header(&mut stream).await?;
  let mut reader = FrameReader::new(cx.config.max_frame_size);
  let first = reader.read_frame(&mut stream).await?;
  match (header.purpose, first) {
    (Purpose::Direct, Some(Frame::Hello(peer))) | (Purpose::Pilot, Some(Frame::Hello(peer))) => {
      check_width(&peer, cx)?;
      let ack = Frame::HelloAck(cx.local.clone());
      write_frame(&mut stream, &ack, cx.config.max_frame_size).await?;
      Ok(Handshake::Peer {
        stream: stream,
        reader: reader,
        peer: peer,
        purpose: header.purpose,
      })
    }
    (Purpose::Connector, Some(Frame::Connect { target, token })) => {
      cx.events.send(TransportEvent::RelayConnect {
        target: target,
        token: token,
        stream: stream,
      });
      Ok(Handshake::Relayed)
    }
    (Purpose::Acceptor, Some(Frame::Accept { token })) => {
      cx.events.send(TransportEvent::RelayAccept {
        token: token,
        stream: stream,
      });
      Ok(Handshake::Relayed)
    }
    (purpose, first) => Err(TransportError::Protocol(format!(
      "{:?} connection opened with {:?}",
      purpose,
      first.as_ref().map(|f| f.kind())
    ))),
  }
}

// A peer from a ring of another width is turned away before it can say anything else.
fn check_width(peer: &NodeHandle, cx: &ConnContext) -> Result<(), TransportError> {
  if cx.local.id.same_width(&peer.id) {
    return Ok(());
  }
  Err(TransportError::Protocol(format!(
    "{} has a {} bit identifier, ours is {} bits",
    peer.socket,
    peer.id.bit_len(),
    cx.local.id.bit_len()
  )))
}

async fn dial(socket: &Socket) -> Result<TcpStream, TransportError> {
  let addrs = socket
    .as_addrs()
    .await
    .map_err(|e| TransportError::Unreachable(socket.to_string(), e.to_string()))?;
  let addr = addrs.into_iter().next().ok_or_else(|| {
    TransportError::Unreachable(socket.to_string(), "no address".to_string())
  })?;
  let stream = TcpStream::connect(addr)
    .await
    .map_err(|e| TransportError::Unreachable(socket.to_string(), e.to_string()))?;
  stream.set_nodelay(true)?;
  Ok(stream)
}

async fn connect_handshake(
  target: &NodeHandle,
  cx: &ConnContext,
) -> Result<(TcpStream, FrameReader, NodeHandle), TransportError> {
  let max = cx.config.max_frame_size;
  let mut reader = FrameReader::new(max);
  let mut stream = match &target.relay {
    None => {
      let mut stream = dial(&target.socket).await?;
      write_header(&mut stream, &ConnectionHeader::new(Purpose::Direct)).await?;
      stream
    }
    Some(helper) => {
      let mut stream = dial(helper).await?;
      write_header(&mut stream, &ConnectionHeader::new(Purpose::Connector)).await?;
      let connect = Frame::Connect {
        target: target.id.clone(),
        token: rand::random(),
      };
      write_frame(&mut stream, &connect, max).await?;
      match reader.read_frame(&mut stream).await? {
        Some(Frame::Spliced) => stream,
        Some(Frame::Refused(why)) => {
          return Err(TransportError::Unreachable(target.to_string(), why));
        }
        other => {
          return Err(TransportError::Protocol(format!(
            "helper answered {:?}",
            other.as_ref().map(|f| f.kind())
          )));
        }
      }
    }
  };
  write_frame(&mut stream, &Frame::Hello(cx.local.clone()), max).await?;
  match reader.read_frame(&mut stream).await? {
    Some(Frame::HelloAck(peer)) if peer.id == target.id => {
      check_width(&peer, cx)?;
      Ok((stream, reader, peer))
    }
    Some(Frame::HelloAck(peer)) => Err(TransportError::IdentityMismatch {
      addr: target.dial_socket().to_string(),
      expected: format!("{:?}", target.id),
      got: format!("{:?}", peer.id),
    }),
    other => Err(TransportError::Protocol(format!(
      "expected HelloAck, got {:?}",
      other.as_ref().map(|f| f.kind())
    ))),
  }
}

/// Open a connection to `target`, through its helper if it has one. Whoever loses the race on
/// `op` discards the result.
pub(crate) fn spawn_connect(target: NodeHandle, conn: ConnId, op: PendingOp, cx: ConnContext) {
  tokio::spawn(async move {
    let result = match timeout(cx.config.connect_timeout, connect_handshake(&target, &cx)).await
    {
      Ok(r) => r,
      Err(_) => Err(TransportError::ConnectTimeout(target.dial_socket().to_string())),
    };
    if !op.complete() {
      return;
    }
    match result {
      Ok((stream, reader, peer)) => {
        run_connection(stream, reader, peer, Purpose::Direct, true, conn, cx).await
      }
      Err(e) => {
        cx.events.send(TransportEvent::ConnectFailed {
          conn: conn,
          peer: Some(target.id.clone()),
          error: e,
        });
      }
    }
  });
}

async fn pilot_handshake(
  helper: &Socket,
  cx: &ConnContext,
) -> Result<(TcpStream, FrameReader, NodeHandle), TransportError> {
  let max = cx.config.max_frame_size;
  let mut stream = dial(helper).await?;
  write_header(&mut stream, &ConnectionHeader::new(Purpose::Pilot)).await?;
  write_frame(&mut stream, &Frame::Hello(cx.local.clone()), max).await?;
  let mut reader = FrameReader::new(max);
  match reader.read_frame(&mut stream).await? {
    Some(Frame::HelloAck(peer)) => {
      check_width(&peer, cx)?;
      Ok((stream, reader, peer))
    }
    other => Err(TransportError::Protocol(format!(
      "expected HelloAck from helper, got {:?}",
      other.as_ref().map(|f| f.kind())
    ))),
  }
}

/// Register with a rendezvous helper and keep the connection open.
pub(crate) fn spawn_pilot(helper: Socket, conn: ConnId, cx: ConnContext) {
  tokio::spawn(async move {
    let result = match timeout(cx.config.connect_timeout, pilot_handshake(&helper, &cx)).await {
      Ok(r) => r,
      Err(_) => Err(TransportError::ConnectTimeout(helper.to_string())),
    };
    match result {
      Ok((stream, reader, peer)) => {
        run_connection(stream, reader, peer, Purpose::Pilot, true, conn, cx).await
      }
      Err(e) => {
        cx.events.send(TransportEvent::ConnectFailed {
          conn: conn,
          peer: None,
          error: e,
        });
      }
    }
  });
}

async fn acceptor_handshake(
  helper: &Socket,
  token: u64,
  cx: &ConnContext,
) -> Result<(TcpStream, FrameReader, NodeHandle), TransportError> {
  let max = cx.config.max_frame_size;
  let mut stream = dial(helper).await?;
  write_header(&mut stream, &ConnectionHeader::new(Purpose::Acceptor)).await?;
  write_frame(&mut stream, &Frame::Accept { token: token }, max).await?;
  let mut reader = FrameReader::new(max);
  match reader.read_frame(&mut stream).await? {
    Some(Frame::Hello(peer)) => {
      check_width(&peer, cx)?;
      write_frame(&mut stream, &Frame::HelloAck(cx.local.clone()), max).await?;
      Ok((stream, reader, peer))
    }
    other => Err(TransportError::Protocol(format!(
      "expected Hello through the helper, got {:?}",
      other.as_ref().map(|f| f.kind())
    ))),
  }
}

/// Answer an `OpenRequest` from our helper: connect back with the token and take the accepting
/// side of the hello exchange with whoever is spliced to us.
pub(crate) fn spawn_acceptor(helper: Socket, token: u64, conn: ConnId, cx: ConnContext) {
  tokio::spawn(async move {
    let handshake = acceptor_handshake(&helper, token, &cx);
    match timeout(cx.config.connect_timeout, handshake).await {
      Ok(Ok((stream, reader, peer))) => {
        run_connection(stream, reader, peer, Purpose::Direct, false, conn, cx).await
      }
      Ok(Err(e)) => debug!(LOG_LEVEL, &cx.logger, format!("relayed accept: {}", e)),
      Err(_) => debug!(LOG_LEVEL, &cx.logger, "relayed accept timed out"),
    }
  });
}

/// Helper side: tell the connector it is through, then copy bytes both ways until either end
/// hangs up.
pub(crate) fn spawn_splice(mut connector: TcpStream, mut acceptor: TcpStream, cx: ConnContext) {
  tokio::spawn(async move {
    let max = cx.config.max_frame_size;
    if let Err(e) = write_frame(&mut connector, &Frame::Spliced, max).await {
      debug!(LOG_LEVEL, &cx.logger, format!("splice: {}", e));
      return;
    }
    match tokio::io::copy_bidirectional(&mut connector, &mut acceptor).await {
      Ok((a, b)) => trace!(
        LOG_LEVEL,
        &cx.logger,
        format!("splice closed after {} and {} bytes", a, b)
      ),
      Err(e) => debug!(LOG_LEVEL, &cx.logger, format!("splice: {}", e)),
    }
  });
}

pub(crate) fn spawn_refuse(mut stream: TcpStream, reason: String, cx: ConnContext) {
  tokio::spawn(async move {
    let _ = write_frame(&mut stream, &Frame::Refused(reason), cx.config.max_frame_size).await;
    let _ = stream.shutdown().await;
  });
}

async fn run_connection(
  stream: TcpStream,
  reader: FrameReader,
  peer: NodeHandle,
  purpose: Purpose,
  outbound: bool,
  conn: ConnId,
  cx: ConnContext,
) {
  let (tx, rx) = unbounded_channel();
  let abort = Abort::default();
  let up = TransportEvent::Up {
    conn: conn,
    peer: peer.clone(),
    purpose: purpose,
    outbound: outbound,
    writer: tx,
    abort: abort.clone(),
  };
  if !cx.events.send(up) {
    return;
  }
  let (read_half, write_half) = stream.into_split();
  let writer = Writer {
    half: write_half,
    rx: rx,
    peer: peer,
    abort: abort.clone(),
    conn: conn,
    cx: cx.clone(),
  };
  tokio::spawn(writer.run());
  reader_loop(read_half, reader, abort, conn, cx).await;
}

enum Read {
  Frame(Result<Option<Frame>, TransportError>),
  Aborted,
}

async fn reader_loop(
  mut read_half: OwnedReadHalf,
  mut reader: FrameReader,
  abort: Abort,
  conn: ConnId,
  cx: ConnContext,
) {
  let error = loop {
    let read = tokio::select! {
      r = reader.read_frame(&mut read_half) => Read::Frame(r),
      _ = abort.0.reader.notified() => Read::Aborted,
    };
    let result = match read {
      Read::Frame(r) => r,
      Read::Aborted => break Some(TransportError::Cancelled),
    };
    let n = reader.take_read_bytes();
    if n > 0 {
      cx.logger.send(LoggerMsg::Special(LogSpecial::RecvdBytes(n)));
    }
    match result {
      Ok(Some(frame)) => {
        if !cx.events.send(TransportEvent::Frame {
          conn: conn,
          frame: frame,
        }) {
          return;
        }
      }
      Ok(None) => break None,
      Err(e) => break Some(e),
    }
  };
  cx.events.send(TransportEvent::Down {
    conn: conn,
    error: error,
  });
}

enum Next {
  Cmd(Option<WriterCmd>),
  Aborted,
}

enum Wrote {
  Done(Result<usize, TransportError>),
  Aborted,
}

struct Writer {
  half: OwnedWriteHalf,
  rx: UnboundedReceiver<WriterCmd>,
  peer: NodeHandle,
  abort: Abort,
  conn: ConnId,
  cx: ConnContext,
}
impl Writer {
  async fn run(mut self) {
    let max = self.cx.config.max_frame_size;
    loop {
      let next = tokio::select! {
        cmd = self.rx.recv() => Next::Cmd(cmd),
        _ = self.abort.0.writer.notified() => Next::Aborted,
      };
      let frame = match next {
        Next::Cmd(Some(WriterCmd::Frame(frame))) => frame,
        Next::Cmd(Some(WriterCmd::Close)) => {
          let goodbye = write_frame(&mut self.half, &Frame::Goodbye, max);
          let _ = timeout(self.cx.config.connect_timeout, goodbye).await;
          break;
        }
        Next::Cmd(None) => break,
        Next::Aborted => {
          self.give_back(None, true);
          return;
        }
      };
      let wrote = tokio::select! {
        r = write_frame(&mut self.half, &frame, max) => Wrote::Done(r),
        _ = self.abort.0.writer.notified() => Wrote::Aborted,
      };
      match wrote {
        Wrote::Done(Ok(n)) => {
          self.cx.logger.send(LoggerMsg::Special(LogSpecial::SentBytes(n as u64)));
        }
        Wrote::Done(Err(e)) => {
          self.give_back(Some(frame), false);
          self.cx.events.send(TransportEvent::Down {
            conn: self.conn,
            error: Some(e),
          });
          return;
        }
        Wrote::Aborted => {
          self.give_back(Some(frame), true);
          return;
        }
      }
    }
    let _ = self.half.shutdown().await;
  }

  /// Hand the messages that never made it onto the wire back to the transport.
  fn give_back(&mut self, current: Option<Frame>, abandoned: bool) {
    self.rx.close();
    let mut msgs = Vec::new();
    if let Some(Frame::Msg(msg)) = current {
      msgs.push(msg);
    }
    while let Ok(cmd) = self.rx.try_recv() {
      if let WriterCmd::Frame(Frame::Msg(msg)) = cmd {
        msgs.push(msg);
      }
    }
    if msgs.is_empty() {
      return;
    }
    debug!(
      LOG_LEVEL,
      &self.cx.logger,
      format!("{} messages for {} never left", msgs.len(), self.peer)
    );
    self.cx.events.send(TransportEvent::Unsent {
      to: self.peer.clone(),
      msgs: msgs,
      abandoned: abandoned,
    });
  }
}
