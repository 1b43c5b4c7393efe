use crate::core::Socket;
use im::HashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureMode {
  /// Whole overlay messages are dropped or delayed before they reach the transport.
  Message,
  None,
}
impl Default for FailureMode {
  fn default() -> Self {
    FailureMode::None
  }
}

#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug)]
pub struct FailureConfig {
  pub drop_prob: f64,
  pub delay: Option<(Duration, Duration)>,
}
impl FailureConfig {
  /// `None` when the message is lost, otherwise how long to hold it back.
  pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Duration> {
    if self.drop_prob > 0.0 && rng.gen_bool(self.drop_prob.min(1.0)) {
      return None;
    }
    Some(match self.delay {
      Some((lo, hi)) if hi > lo => rng.gen_range(lo..hi),
      Some((lo, _)) => lo,
      None => Duration::from_millis(0),
    })
  }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct FailureConfigMap {
  pub mode: FailureMode,
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<Socket, FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, socket: &Socket) -> &FailureConfig {
    self.node_wide.get(socket).unwrap_or(&self.cluster_wide)
  }
}

#[test]
fn test_failure_sampling() {
  use rand::rngs::SmallRng;
  use rand::SeedableRng;
  let mut rng = SmallRng::seed_from_u64(3);
  let lossless = FailureConfig::default();
  for _ in 0..100 {
    assert_eq!(lossless.sample(&mut rng), Some(Duration::from_millis(0)));
  }
  let lossy = FailureConfig {
    drop_prob: 1.0,
    delay: None,
  };
  assert_eq!(lossy.sample(&mut rng), None);
  let slow = FailureConfig {
    drop_prob: 0.0,
    delay: Some((Duration::from_millis(10), Duration::from_millis(20))),
  };
  for _ in 0..100 {
    let d = slow.sample(&mut rng).unwrap();
    assert!(d >= Duration::from_millis(10) && d < Duration::from_millis(20));
  }

  let mut map = FailureConfigMap::default();
  map.node_wide.insert(Socket::localhost(1), lossy);
  assert_eq!(map.get(&Socket::localhost(1)).drop_prob, 1.0);
  assert_eq!(map.get(&Socket::localhost(2)).drop_prob, 0.0);
}
