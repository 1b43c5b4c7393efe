use itertools::Itertools;
use pastry_overlay::core::{Id, PastryConfig, RouteError};
use pastry_overlay::overlay::PastryNode;
use pastry_overlay::testkit::SimNetwork;
use rand::Rng;
use std::time::Duration;

const NODES: usize = 40;

fn config() -> PastryConfig {
  let mut config = PastryConfig::default();
  config.id_bits = 32;
  config.digit_bits = 4;
  config.leaf_set_size = 8;
  config.max_route_set_size = 2;
  config
}

/// The `half` nearest live identifiers clockwise and counter-clockwise of `id`, nearest first.
fn expected_leaf_set(ring: &[Id], id: &Id, half: usize) -> (Vec<Id>, Vec<Id>) {
  let pos = ring.iter().position(|x| x == id).unwrap();
  let n = ring.len();
  let take = std::cmp::min(half, n - 1);
  let cw = (1..=take).map(|i| ring[(pos + i) % n].clone()).collect();
  let ccw = (1..=take).map(|i| ring[(pos + n - i) % n].clone()).collect();
  (cw, ccw)
}

fn leaf_ids(node: &PastryNode) -> (Vec<Id>, Vec<Id>) {
  let snapshot = node.leaf_set().snapshot();
  (
    snapshot.cw.iter().map(|h| h.id.clone()).collect(),
    snapshot.ccw.iter().map(|h| h.id.clone()).collect(),
  )
}

fn assert_leaf_sets_correct(net: &SimNetwork) {
  let ring = net.alive();
  let half = config().leaf_set_size / 2;
  for id in ring.iter() {
    let node = net.node(id).unwrap();
    assert_eq!(
      leaf_ids(node),
      expected_leaf_set(&ring, id, half),
      "leaf set of {:?}",
      id
    );
  }
}

fn assert_routes_to_closest(net: &mut SimNetwork, messages: usize) {
  net.clear_log();
  let ring = net.alive();
  let mut expected = Vec::new();
  for i in 0..messages {
    let src = ring[net.rng().gen_range(0..ring.len())].clone();
    let key = Id::random(config().id_bits, net.rng());
    expected.push((i as u32, net.responsible(&key).unwrap()));
    net.route(&src, key, (i as u32).to_be_bytes().to_vec());
  }
  net.run_until_idle();
  let delivered = net
    .deliveries()
    .into_iter()
    .map(|d| {
      let mut tag = [0u8; 4];
      tag.copy_from_slice(&d.msg.payload);
      assert!(d.msg.hops <= 12, "{} hops", d.msg.hops);
      (u32::from_be_bytes(tag), d.at)
    })
    .sorted()
    .collect::<Vec<_>>();
  assert_eq!(delivered, expected);
  assert_eq!(net.failures(), vec![]);
}

#[test]
fn sequential_joins_converge() {
  let mut net = SimNetwork::new(config(), 11);
  let first = net.add_random_node(None).unwrap().id;
  net.run_until_idle();
  for _ in 1..NODES {
    let ring = net.alive();
    let bootstrap = ring[net.rng().gen_range(0..ring.len())].clone();
    net.add_random_node(Some(&bootstrap)).unwrap();
    net.run_until_idle();
  }
  assert!(net.all_ready());
  assert_eq!(net.ready_events().len(), NODES);
  assert_eq!(net.ready_events()[0], first);
  assert_leaf_sets_correct(&net);

  // maintenance traffic leaves a converged ring as it is
  net.run_for(Duration::from_secs(35));
  assert_leaf_sets_correct(&net);
}

#[test]
fn routing_table_rows_share_prefixes() {
  let mut net = SimNetwork::new(config(), 12);
  let first = net.add_random_node(None).unwrap().id;
  for _ in 1..NODES {
    net.add_random_node(Some(&first)).unwrap();
    net.run_until_idle();
  }
  let digit_bits = config().digit_bits;
  for id in net.alive() {
    let table = net.node(&id).unwrap().routing_table();
    for row in 0..table.num_rows() {
      for col in 0..table.num_cols() {
        for h in table.get_route_set(row, col).unwrap().iter() {
          assert_eq!(id.index_of_msdd(&h.id, digit_bits), Some(row));
          assert_eq!(h.id.digit(row, digit_bits), col);
        }
      }
    }
    assert!(!table.is_empty());
  }
}

#[test]
fn every_key_reaches_the_closest_node() {
  let mut net = SimNetwork::new(config(), 13);
  let first = net.add_random_node(None).unwrap().id;
  for _ in 1..NODES {
    net.add_random_node(Some(&first)).unwrap();
    net.run_until_idle();
  }
  assert_routes_to_closest(&mut net, 300);
}

#[test]
fn concurrent_joins_converge() {
  let mut net = SimNetwork::new(config(), 14);
  let first = net.add_random_node(None).unwrap().id;
  for _ in 1..10 {
    net.add_random_node(Some(&first)).unwrap();
    net.run_until_idle();
  }
  // a burst of joins through different bootstraps, all in flight at once
  let ring = net.alive();
  for i in 0..10 {
    let bootstrap = ring[i % ring.len()].clone();
    net.add_random_node(Some(&bootstrap)).unwrap();
  }
  net.run_for(Duration::from_secs(30));
  assert!(net.all_ready());
  assert_eq!(net.alive().len(), 20);
  assert_leaf_sets_correct(&net);
  assert_routes_to_closest(&mut net, 100);
}

fn small_ring(net: &mut SimNetwork) {
  let first = Id::from_u128(0x1000_0000, 32);
  net.add_node(first.clone(), None).unwrap();
  net.run_until_idle();
  for id in [0x3000_0000u128, 0x4000_0000, 0x5000_0000, 0x8000_0000].iter() {
    net.add_node(Id::from_u128(*id, 32), Some(&first)).unwrap();
    net.run_until_idle();
  }
  assert!(net.all_ready());
  net.clear_log();
}

#[test]
fn message_for_a_dead_hop_is_rerouted() {
  let mut net = SimNetwork::new(config(), 15);
  small_ring(&mut net);
  let from = Id::from_u128(0x3000_0000, 32);
  // nobody has noticed yet, so the first hop still points at it
  net.kill(&Id::from_u128(0x4000_0000, 32));
  net.route(&from, Id::from_u128(0x4100_0000, 32), b"around".to_vec());
  net.run_until_idle();
  let deliveries = net.deliveries();
  assert_eq!(deliveries.len(), 1);
  assert_eq!(deliveries[0].at, Id::from_u128(0x5000_0000, 32));
  assert_eq!(deliveries[0].msg.payload, b"around".to_vec());
  assert!(net.failures().is_empty());
}

#[test]
fn rerouting_stops_after_max_attempts() {
  let mut config = config();
  config.max_route_attempts = 2;
  let mut net = SimNetwork::new(config, 16);
  small_ring(&mut net);
  let from = Id::from_u128(0x3000_0000, 32);
  net.kill(&Id::from_u128(0x4000_0000, 32));
  net.kill(&Id::from_u128(0x5000_0000, 32));
  net.route(&from, Id::from_u128(0x4100_0000, 32), b"lost".to_vec());
  net.run_until_idle();
  assert!(net.deliveries().is_empty());
  assert_eq!(net.failures(), vec![(from, RouteError::AttemptsExhausted(2))]);
}
