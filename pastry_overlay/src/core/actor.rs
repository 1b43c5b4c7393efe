use crate::core::Node;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActorSignal {
  Term,
}

pub enum LocalActorMsg<T> {
  Msg(T),
  Signal(ActorSignal),
}

pub(crate) fn local_actor_msg_convert<S: From<I>, I>(
  msg: LocalActorMsg<I>,
) -> LocalActorMsg<S> {
  match msg {
    LocalActorMsg::Msg(s) => LocalActorMsg::Msg(S::from(s)),
    LocalActorMsg::Signal(s) => LocalActorMsg::Signal(s),
  }
}

/// A cheap handle for sending messages to something in the same process. Usually an actor's
/// mailbox, but any function can stand behind one. `send` returns false when the receiver is
/// gone, which is how observer lists prune themselves.
pub struct LocalRef<T> {
  pub(crate) func: Arc<dyn Fn(LocalActorMsg<T>) -> bool + Send + Sync>,
}
impl<T> Clone for LocalRef<T> {
  fn clone(&self) -> Self {
    LocalRef {
      func: self.func.clone(),
    }
  }
}
impl<T: Send + 'static> LocalRef<T> {
  pub fn send(&self, item: T) -> bool {
    (&self.func)(LocalActorMsg::Msg(item))
  }

  pub fn signal(&self, sig: ActorSignal) -> bool {
    (&self.func)(LocalActorMsg::Signal(sig))
  }

  pub fn transform<I: Send + 'static>(&self) -> LocalRef<I>
  where
    T: From<I>,
  {
    let func = self.func.clone();
    LocalRef {
      func: Arc::new(move |x: LocalActorMsg<I>| {
        func(local_actor_msg_convert(x))
      }),
    }
  }

  /// Wraps a plain function. Signals are reported as undeliverable.
  pub fn from_fn<F>(f: F) -> LocalRef<T>
  where
    F: Fn(T) -> bool + Send + Sync + 'static,
  {
    LocalRef {
      func: Arc::new(move |x: LocalActorMsg<T>| match x {
        LocalActorMsg::Msg(m) => f(m),
        LocalActorMsg::Signal(_) => false,
      }),
    }
  }

  pub fn void() -> LocalRef<T> {
    LocalRef {
      func: Arc::new(|_| false),
    }
  }
}
impl<T> std::fmt::Debug for LocalRef<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LocalRef")
      .field("Msg", &std::any::type_name::<T>())
      .finish()
  }
}

#[async_trait]
pub trait Actor<Msg: Send + 'static> {
  async fn pre_start(&mut self, _: &ActorContext<Msg>) {}
  async fn recv(&mut self, _: &ActorContext<Msg>, _: Msg);
  async fn post_stop(&mut self, _: &ActorContext<Msg>) {}
}

pub struct ActorContext<Specific> {
  pub tx: UnboundedSender<LocalActorMsg<Specific>>,
  pub name: String,
  pub node: Node,
}
impl<Specific: 'static + Send> ActorContext<Specific> {
  pub(crate) fn create_local<T: Send + 'static>(
    sender: UnboundedSender<LocalActorMsg<Specific>>,
  ) -> LocalRef<T>
  where
    Specific: From<T>,
  {
    LocalRef {
      func: Arc::new(move |x: LocalActorMsg<T>| {
        sender.send(local_actor_msg_convert(x)).is_ok()
      }),
    }
  }

  pub fn local_interface<T: Send + 'static>(&self) -> LocalRef<T>
  where
    Specific: From<T>,
  {
    Self::create_local::<T>(self.tx.clone())
  }
}

pub(crate) async fn run_single<S, A>(
  mut actor: A,
  ctx: ActorContext<S>,
  mut rx: UnboundedReceiver<LocalActorMsg<S>>,
) where
  S: 'static + Send,
  A: Actor<S> + Send + 'static,
{
  actor.pre_start(&ctx).await;
  // ctx holds a sender, so the channel never closes underneath us
  while let Some(msg) = rx.recv().await {
    match msg {
      LocalActorMsg::Msg(m) => actor.recv(&ctx, m).await,
      LocalActorMsg::Signal(ActorSignal::Term) => break,
    }
  }
  actor.post_stop(&ctx).await;
}

#[test]
fn test_local_ref_transform() {
  use std::sync::atomic::{AtomicUsize, Ordering};
  #[derive(Debug)]
  enum Wide {
    Narrow(u8),
  }
  impl From<u8> for Wide {
    fn from(x: u8) -> Self {
      Wide::Narrow(x)
    }
  }
  let seen = Arc::new(AtomicUsize::new(0));
  let s = seen.clone();
  let wide = LocalRef::<Wide>::from_fn(move |w| {
    let Wide::Narrow(x) = w;
    s.fetch_add(x as usize, Ordering::SeqCst);
    true
  });
  let narrow: LocalRef<u8> = wide.transform();
  assert!(narrow.send(3));
  assert!(narrow.send(4));
  assert!(!narrow.signal(ActorSignal::Term));
  assert_eq!(seen.load(Ordering::SeqCst), 7);
  assert!(!LocalRef::<u8>::void().send(1));
}
