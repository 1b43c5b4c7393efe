use crate::core::{run_single, Actor, ActorContext, LocalActorMsg, LocalRef, Socket};
use crate::testkit::{LogLevel, LogSink, LogSpecial, Logger, LoggerMsg};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::unbounded_channel;

/// Settings for the process-level runtime every actor runs on.
#[derive(Clone, Debug)]
pub struct NodeConfig {
  /// The address overlay listeners bind to.
  ///
  /// default: `0.0.0.0:0`
  pub socket: Socket,
  /// Worker threads in the tokio runtime.
  ///
  /// default: `1`
  pub actor_threads: usize,
  /// Threshold of the node-wide logger.
  ///
  /// default: `LogLevel::Warn`
  pub log_level: LogLevel,
}
impl Default for NodeConfig {
  fn default() -> Self {
    NodeConfig {
      socket: Socket::default(),
      actor_threads: 1,
      log_level: LogLevel::Warn,
    }
  }
}

struct NodeImpl {
  socket: Socket,
  rt: Option<Runtime>,
  logger: LocalRef<LoggerMsg>,
}
impl Drop for NodeImpl {
  fn drop(&mut self) {
    if let Some(rt) = self.rt.take() {
      rt.shutdown_background();
    }
  }
}

/// Owns the runtime, spawns actors and carries the node-wide logger.
#[derive(Clone)]
pub struct Node {
  node: Arc<NodeImpl>,
}
impl Node {
  pub fn new_sync(config: NodeConfig) -> std::io::Result<Node> {
    let rt = Builder::new_multi_thread()
      .enable_io()
      .enable_time()
      .worker_threads(std::cmp::max(config.actor_threads, 1))
      .thread_name("pastry-actor")
      .build()?;
    let (tx, rx) = unbounded_channel::<LocalActorMsg<LoggerMsg>>();
    let logger = ActorContext::create_local::<LoggerMsg>(tx.clone());
    let node = Node {
      node: Arc::new(NodeImpl {
        socket: config.socket,
        rt: Some(rt),
        logger: logger,
      }),
    };
    let ctx = ActorContext {
      tx: tx,
      name: "logger".to_string(),
      node: node.clone(),
    };
    node
      .rt()
      .spawn(run_single(Logger::new(config.log_level), ctx, rx));
    Ok(node)
  }

  pub fn socket(&self) -> &Socket {
    &self.node.socket
  }

  pub fn rt(&self) -> &Runtime {
    match &self.node.rt {
      Some(rt) => rt,
      None => unreachable!("runtime is only taken on drop"),
    }
  }

  pub fn logger(&self) -> &LocalRef<LoggerMsg> {
    &self.node.logger
  }

  /// Ask for the `(sent, received)` byte totals of every connection on this node.
  pub fn traffic(&self, recipient: LocalRef<(u64, u64)>) -> bool {
    let report = LogSpecial::ReportBytes(recipient);
    self.node.logger.send(LoggerMsg::Special(report))
  }

  pub fn spawn<S, A>(&self, actor: A, name: String) -> LocalRef<S>
  where
    S: Send + 'static,
    A: Actor<S> + Send + 'static,
  {
    let (tx, rx) = unbounded_channel::<LocalActorMsg<S>>();
    let local = ActorContext::create_local::<S>(tx.clone());
    let ctx = ActorContext {
      tx: tx,
      name: name,
      node: self.clone(),
    };
    self.rt().spawn(run_single(actor, ctx, rx));
    local
  }

  pub fn schedule_local_msg<T: Send + 'static>(
    &self,
    after: Duration,
    actor: LocalRef<T>,
    msg: T,
  ) -> tokio::task::JoinHandle<bool> {
    self.rt().spawn(async move {
      tokio::time::sleep(after).await;
      actor.send(msg)
    })
  }
}
impl LogSink for Node {
  fn log_msg<S: ToString + Send + 'static>(&self, level: LogLevel, msg: S) {
    self.node.logger.log_msg(level, msg);
  }
}
