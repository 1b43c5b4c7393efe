use crate::core::{Actor, ActorContext, LocalRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use LoggerMsg::*;

#[derive(
  Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  Fatal,
  Off,
}
impl LogLevel {
  pub const MIN: LogLevel = LogLevel::Trace;
}

pub enum LogSpecial {
  SentBytes(u64),
  RecvdBytes(u64),
  /// Reply with `(sent, received)` byte totals.
  ReportBytes(LocalRef<(u64, u64)>),
}

pub enum LoggerMsg {
  Log(LogLevel, Box<dyn ToString + Send + 'static>),
  SetLevel(LogLevel),
  Special(LogSpecial),
}

/// Anything the log macros can write to.
pub trait LogSink {
  fn log_msg<S: ToString + Send + 'static>(&self, level: LogLevel, msg: S);
}
impl LogSink for LocalRef<LoggerMsg> {
  fn log_msg<S: ToString + Send + 'static>(&self, level: LogLevel, msg: S) {
    self.send(Log(level, Box::new(msg)));
  }
}

pub struct Logger {
  bytes_sent: u64,
  bytes_recvd: u64,
  level: LogLevel,
}
impl Logger {
  pub fn new(level: LogLevel) -> Self {
    Logger {
      bytes_sent: 0,
      bytes_recvd: 0,
      level: level,
    }
  }
}
#[async_trait]
impl Actor<LoggerMsg> for Logger {
  async fn recv(&mut self, _: &ActorContext<LoggerMsg>, msg: LoggerMsg) {
    match msg {
      Log(level, s) => {
        if level >= self.level && level != LogLevel::Off {
          println!("[{:?}] {}", level, s.to_string());
        }
      }
      SetLevel(level) => self.level = level,
      Special(s) => match s {
        LogSpecial::SentBytes(b) => self.bytes_sent += b,
        LogSpecial::RecvdBytes(b) => self.bytes_recvd += b,
        LogSpecial::ReportBytes(r) => {
          r.send((self.bytes_sent, self.bytes_recvd));
        }
      },
    }
  }
}

#[macro_export]
macro_rules! log {
  ($env_level:expr, $level:expr, $sink:expr, $msg:expr) => {
    if $level >= $env_level {
      $crate::testkit::LogSink::log_msg($sink, $level, $msg);
    }
  };
}

#[macro_export]
macro_rules! trace {
  ($env_level:expr, $sink:expr, $msg:expr) => {
    $crate::log!($env_level, $crate::testkit::LogLevel::Trace, $sink, $msg)
  };
}

#[macro_export]
macro_rules! debug {
  ($env_level:expr, $sink:expr, $msg:expr) => {
    $crate::log!($env_level, $crate::testkit::LogLevel::Debug, $sink, $msg)
  };
}

#[macro_export]
macro_rules! info {
  ($env_level:expr, $sink:expr, $msg:expr) => {
    $crate::log!($env_level, $crate::testkit::LogLevel::Info, $sink, $msg)
  };
}

#[macro_export]
macro_rules! warn {
  ($env_level:expr, $sink:expr, $msg:expr) => {
    $crate::log!($env_level, $crate::testkit::LogLevel::Warn, $sink, $msg)
  };
}

#[macro_export]
macro_rules! error {
  ($env_level:expr, $sink:expr, $msg:expr) => {
    $crate::log!($env_level, $crate::testkit::LogLevel::Error, $sink, $msg)
  };
}

#[macro_export]
macro_rules! fatal {
  ($env_level:expr, $sink:expr, $msg:expr) => {
    $crate::log!($env_level, $crate::testkit::LogLevel::Fatal, $sink, $msg)
  };
}

#[test]
fn test_macro_threshold() {
  use std::sync::{Arc, Mutex};
  let seen = Arc::new(Mutex::new(Vec::new()));
  let s = seen.clone();
  let sink = LocalRef::<LoggerMsg>::from_fn(move |m| {
    if let Log(level, msg) = m {
      s.lock().unwrap().push((level, msg.to_string()));
    }
    true
  });
  const LEVEL: LogLevel = LogLevel::Info;
  crate::trace!(LEVEL, &sink, "kelp");
  crate::debug!(LEVEL, &sink, format!("{}", 1));
  crate::info!(LEVEL, &sink, "otters");
  crate::error!(LEVEL, &sink, format!("sharks {}", 2));
  let seen = seen.lock().unwrap();
  assert_eq!(
    *seen,
    vec![
      (LogLevel::Info, "otters".to_string()),
      (LogLevel::Error, "sharks 2".to_string())
    ]
  );
}
