use maplit::btreeset;
use pastry_overlay::core::{Id, JoinError, PastryConfig, RouteError};
use pastry_overlay::overlay::{JoinState, PastryMsg};
use pastry_overlay::testkit::SimNetwork;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn config() -> PastryConfig {
  let mut config = PastryConfig::default();
  config.id_bits = 16;
  config.digit_bits = 2;
  config.leaf_set_size = 4;
  config
}

fn id(x: u128) -> Id {
  Id::from_u128(x, 16)
}

fn leaf_members(net: &SimNetwork, of: &Id) -> BTreeSet<Id> {
  net
    .node(of)
    .unwrap()
    .leaf_set()
    .members()
    .iter()
    .map(|h| h.id.clone())
    .collect()
}

#[test]
fn dropped_ack_delays_readiness() {
  let mut net = SimNetwork::new(config(), 1);
  let a = id(0x1000);
  let b = id(0x5000);
  net.add_node(a.clone(), None).unwrap();
  let dropped = Arc::new(AtomicUsize::new(0));
  let d = dropped.clone();
  let joiner = b.clone();
  net.drop_when(move |_, to, msg| match msg {
    PastryMsg::ConsistentJoin(c) if !c.request && to.id == joiner => {
      d.fetch_add(1, Ordering::SeqCst) == 0
    }
    _ => false,
  });
  net.add_node(b.clone(), Some(&a)).unwrap();
  net.run_until_idle();
  assert_eq!(dropped.load(Ordering::SeqCst), 1);
  // a already knows b, but b has no acknowledgement from a
  assert!(leaf_members(&net, &a).contains(&b));
  assert_eq!(net.node(&b).unwrap().join_state(), &JoinState::Probing);
  assert_eq!(net.ready_events(), vec![a.clone()]);

  net.run_for(config().probe_retry + config().tick_interval * 2);
  assert_eq!(net.node(&b).unwrap().join_state(), &JoinState::Ready);
  assert_eq!(net.ready_events(), vec![a, b]);
}

#[test]
fn probes_exhausted_fails_the_join() {
  let mut conf = config();
  conf.max_probe_rounds = 2;
  let mut net = SimNetwork::new(conf.clone(), 2);
  let a = id(0x1000);
  let b = id(0x5000);
  net.add_node(a.clone(), None).unwrap();
  let joiner = b.clone();
  net.drop_when(move |_, to, msg| {
    matches!(msg, PastryMsg::ConsistentJoin(c) if !c.request) && to.id == joiner
  });
  net.add_node(b.clone(), Some(&a)).unwrap();
  net.run_for(conf.probe_retry * 4);
  assert_eq!(
    net.node(&b).unwrap().join_state(),
    &JoinState::Failed(JoinError::ProbesExhausted(2))
  );
}

#[test]
fn unreachable_bootstrap_fails_the_join() {
  let mut net = SimNetwork::new(config(), 3);
  let a = id(0x1000);
  let b = id(0x5000);
  net.add_node(a.clone(), None).unwrap();
  net.kill(&a);
  net.add_node(b.clone(), Some(&a)).unwrap();
  net.run_for(config().join_timeout * 4);
  assert_eq!(
    net.node(&b).unwrap().join_state(),
    &JoinState::Failed(JoinError::BootstrapUnreachable(config().join_attempts))
  );
  assert!(!net.node(&b).unwrap().is_ready());
}

#[test]
fn join_learns_the_whole_neighbourhood() {
  let mut net = SimNetwork::new(config(), 4);
  let ids = vec![id(0x1000), id(0x3000), id(0x5000), id(0x7000), id(0x9000)];
  net.add_node(ids[0].clone(), None).unwrap();
  for x in ids.iter().skip(1) {
    net.add_node(x.clone(), Some(&ids[0])).unwrap();
    net.run_until_idle();
  }
  // joins next to 0x5000 through the far side of the ring
  let joiner = id(0x5800);
  net.add_node(joiner.clone(), Some(&ids[0])).unwrap();
  net.run_until_idle();
  assert!(net.all_ready());
  assert_eq!(
    leaf_members(&net, &joiner),
    btreeset! {id(0x3000), id(0x5000), id(0x7000), id(0x9000)}
  );
  for x in [id(0x3000), id(0x5000), id(0x7000), id(0x9000)].iter() {
    assert!(leaf_members(&net, x).contains(&joiner), "{:?}", x);
  }
  assert!(!leaf_members(&net, &id(0x1000)).contains(&joiner));
}

#[test]
fn stalled_node_probes_again() {
  let mut net = SimNetwork::new(config(), 5);
  let a = id(0x1000);
  let b = id(0x5000);
  let c = id(0x9000);
  net.add_node(a.clone(), None).unwrap();
  net.add_node(b.clone(), Some(&a)).unwrap();
  net.run_until_idle();
  net.add_node(c.clone(), Some(&a)).unwrap();
  net.run_until_idle();
  assert!(net.all_ready());
  net.clear_log();

  net.stall(&b, config().max_tick_delay + Duration::from_secs(1));
  net.run_for(config().max_tick_delay + Duration::from_secs(2));
  // b noticed the gap, re-probed its leaf set and became ready again
  assert_eq!(net.ready_events(), vec![b.clone()]);
  assert!(net.all_ready());
}

#[test]
fn dead_neighbour_is_repaired() {
  let mut net = SimNetwork::new(config(), 6);
  let ids: Vec<Id> = (1..=8u128).map(|i| id(i * 0x1000)).collect();
  net.add_node(ids[0].clone(), None).unwrap();
  for x in ids.iter().skip(1) {
    net.add_node(x.clone(), Some(&ids[0])).unwrap();
    net.run_until_idle();
  }
  let victim = id(0x4000);
  net.kill(&victim);
  net.run_for(config().leafset_maintenance * 2);
  for x in net.alive() {
    let members = leaf_members(&net, &x);
    assert!(!members.contains(&victim), "{:?} still lists the dead node", x);
    assert_eq!(members.len(), 4, "{:?} did not refill its leaf set", x);
  }
  assert_eq!(
    leaf_members(&net, &id(0x3000)),
    btreeset! {id(0x1000), id(0x2000), id(0x5000), id(0x6000)}
  );

  // keys the dead node was responsible for now land next to it
  net.clear_log();
  net.route(&id(0x8000), id(0x4100), b"late".to_vec());
  net.run_until_idle();
  let d = net.deliveries();
  assert_eq!(d.len(), 1);
  assert_eq!(d[0].at, id(0x5000));
  assert_eq!(net.failures(), Vec::<(Id, RouteError)>::new());
}
