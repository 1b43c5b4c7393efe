use crate::core::{ConfigError, Socket, MAX_ID_BYTES};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;

/// Tuning for the routing state and the join protocol.
///
/// Build one from `PastryConfig::default()` and overwrite the fields you care about. Every node
/// of a ring must agree on `id_bits` and `digit_bits`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PastryConfig {
  /// Width of node identifiers and keys. A positive multiple of 8.
  ///
  /// default: `160`
  pub id_bits: usize,
  /// Bits per routing digit, `b`. The table has `2^b` columns.
  ///
  /// default: `4`
  pub digit_bits: usize,
  /// Total leaf set size `L`, half on each side of the local node.
  ///
  /// default: `24`
  pub leaf_set_size: usize,
  /// Capacity of each routing table cell.
  ///
  /// default: `4`
  pub max_route_set_size: usize,
  /// Routed messages are dropped after this many hops.
  ///
  /// default: `64`
  pub max_hops: u32,
  /// Forwarding attempts per hop before a routed message is given up on.
  ///
  /// default: `3`
  pub max_route_attempts: u32,
  /// How long to wait for a join reply before asking the bootstrap again.
  ///
  /// default: `5s`
  pub join_timeout: Duration,
  /// Join requests sent before giving up on the bootstrap.
  ///
  /// default: `3`
  pub join_attempts: u32,
  /// Interval between re-probes of unacknowledged leaf set members.
  ///
  /// default: `1s`
  pub probe_retry: Duration,
  /// Probe rounds before the join is declared failed.
  ///
  /// default: `10`
  pub max_probe_rounds: u32,
  /// How often the node expects to be ticked.
  ///
  /// default: `200ms`
  pub tick_interval: Duration,
  /// A gap between ticks longer than this makes the node suspect itself and re-join.
  ///
  /// default: `5s`
  pub max_tick_delay: Duration,
  /// Interval between leaf set broadcasts to the neighbour set.
  ///
  /// default: `10s`
  pub leafset_maintenance: Duration,
  /// Interval between routing row refreshes.
  ///
  /// default: `30s`
  pub route_maintenance: Duration,
  #[serde(skip)]
  x: PhantomData<()>,
}
impl Default for PastryConfig {
  fn default() -> Self {
    PastryConfig {
      id_bits: 160,
      digit_bits: 4,
      leaf_set_size: 24,
      max_route_set_size: 4,
      max_hops: 64,
      max_route_attempts: 3,
      join_timeout: Duration::from_secs(5),
      join_attempts: 3,
      probe_retry: Duration::from_secs(1),
      max_probe_rounds: 10,
      tick_interval: Duration::from_millis(200),
      max_tick_delay: Duration::from_secs(5),
      leafset_maintenance: Duration::from_secs(10),
      route_maintenance: Duration::from_secs(30),
      x: PhantomData,
    }
  }
}
impl PastryConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.id_bits == 0 || self.id_bits % 8 != 0 || self.id_bits > MAX_ID_BYTES * 8 {
      return Err(ConfigError::IdBits(self.id_bits, MAX_ID_BYTES * 8));
    }
    if self.digit_bits == 0 || self.digit_bits > 8 {
      return Err(ConfigError::DigitBits(self.digit_bits));
    }
    if self.leaf_set_size < 2 || self.leaf_set_size % 2 != 0 {
      return Err(ConfigError::LeafSetSize(self.leaf_set_size));
    }
    if self.max_route_set_size == 0 {
      return Err(ConfigError::RouteSetSize);
    }
    let nonzero = [
      ("max_hops", self.max_hops as u128),
      ("max_route_attempts", self.max_route_attempts as u128),
      ("join_attempts", self.join_attempts as u128),
      ("join_timeout", self.join_timeout.as_nanos()),
      ("probe_retry", self.probe_retry.as_nanos()),
      ("tick_interval", self.tick_interval.as_nanos()),
      ("leafset_maintenance", self.leafset_maintenance.as_nanos()),
      ("route_maintenance", self.route_maintenance.as_nanos()),
    ];
    if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
      return Err(ConfigError::Zero(*name));
    }
    if self.max_tick_delay <= self.tick_interval {
      return Err(ConfigError::TickDelay);
    }
    Ok(())
  }

  /// Rows in the routing table: one per digit.
  pub fn rows(&self) -> usize {
    (self.id_bits + self.digit_bits - 1) / self.digit_bits
  }

  /// Columns in the routing table: one per digit value.
  pub fn cols(&self) -> usize {
    1 << self.digit_bits
  }
}

/// Tuning for connections, liveness probing and the socket working set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
  /// Idle connections are pinged this often.
  ///
  /// default: `2s`
  pub ping_interval: Duration,
  /// A ping not answered within this long counts as missed.
  ///
  /// default: `1s`
  pub pong_timeout: Duration,
  /// Missed pongs before a peer is declared dead. The first miss makes it suspected.
  ///
  /// default: `3`
  pub max_missed_pongs: u32,
  /// Time allowed for connecting and completing the hello handshake.
  ///
  /// default: `3s`
  pub connect_timeout: Duration,
  /// Failed connects before the peer is declared dead.
  ///
  /// default: `3`
  pub max_connect_attempts: u32,
  /// Delay before retrying a failed connect.
  ///
  /// default: `250ms`
  pub connect_backoff: Duration,
  /// Outbound sockets kept open at once.
  ///
  /// default: `40`
  pub max_open_sockets: usize,
  /// Largest frame body accepted or sent, in bytes.
  ///
  /// default: `4 MiB`
  pub max_frame_size: usize,
  /// Set when this node cannot accept inbound connections. Peers then reach it through the
  /// `relay` helper, over which this node keeps a pilot connection open.
  ///
  /// default: `false`
  pub behind_nat: bool,
  /// The helper a node behind NAT registers its pilot with.
  ///
  /// default: `None`
  pub relay: Option<Socket>,
  /// How long a helper holds a connector waiting for the target's acceptor.
  ///
  /// default: `5s`
  pub relay_timeout: Duration,
  #[serde(skip)]
  x: PhantomData<()>,
}
impl Default for TransportConfig {
  fn default() -> Self {
    TransportConfig {
      ping_interval: Duration::from_secs(2),
      pong_timeout: Duration::from_secs(1),
      max_missed_pongs: 3,
      connect_timeout: Duration::from_secs(3),
      max_connect_attempts: 3,
      connect_backoff: Duration::from_millis(250),
      max_open_sockets: 40,
      max_frame_size: 4 * 1024 * 1024,
      behind_nat: false,
      relay: None,
      relay_timeout: Duration::from_secs(5),
      x: PhantomData,
    }
  }
}
impl TransportConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    let nonzero = [
      ("ping_interval", self.ping_interval.as_nanos()),
      ("pong_timeout", self.pong_timeout.as_nanos()),
      ("max_missed_pongs", self.max_missed_pongs as u128),
      ("connect_timeout", self.connect_timeout.as_nanos()),
      ("max_connect_attempts", self.max_connect_attempts as u128),
      ("max_open_sockets", self.max_open_sockets as u128),
      ("max_frame_size", self.max_frame_size as u128),
      ("relay_timeout", self.relay_timeout.as_nanos()),
    ];
    if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
      return Err(ConfigError::Zero(*name));
    }
    if self.pong_timeout >= self.ping_interval {
      return Err(ConfigError::PongTimeout);
    }
    if self.behind_nat && self.relay.is_none() {
      return Err(ConfigError::Missing("relay"));
    }
    Ok(())
  }
}

#[test]
fn test_config_validation() {
  let config = PastryConfig::default();
  assert_eq!(config.validate(), Ok(()));
  assert_eq!(config.rows(), 40);
  assert_eq!(config.cols(), 16);

  let mut bad = PastryConfig::default();
  bad.id_bits = 12;
  assert_eq!(bad.validate(), Err(ConfigError::IdBits(12, 256)));
  let mut bad = PastryConfig::default();
  bad.digit_bits = 0;
  assert_eq!(bad.validate(), Err(ConfigError::DigitBits(0)));
  let mut bad = PastryConfig::default();
  bad.leaf_set_size = 7;
  assert_eq!(bad.validate(), Err(ConfigError::LeafSetSize(7)));
  let mut bad = PastryConfig::default();
  bad.probe_retry = Duration::from_secs(0);
  assert_eq!(bad.validate(), Err(ConfigError::Zero("probe_retry")));

  let mut odd = PastryConfig::default();
  odd.id_bits = 8;
  odd.digit_bits = 3;
  assert_eq!(odd.validate(), Ok(()));
  assert_eq!(odd.rows(), 3);

  let mut nat = TransportConfig::default();
  assert_eq!(nat.validate(), Ok(()));
  nat.behind_nat = true;
  let err = nat.validate().unwrap_err();
  assert_eq!(err, ConfigError::Missing("relay"));
  assert_eq!(err.to_string(), "relay must be set");
  nat.relay = Some(Socket::localhost(9000));
  assert_eq!(nat.validate(), Ok(()));
}
