//! CREATE_CHILD_SA scenarios: child rekey with PFS and IKE SA rekey

mod common;

use std::time::Duration;

use common::Pair;
use ikewire::definitions::params::KeyExchangeMethod;

#[test]
fn child_rekey_with_pfs() {
    let mut pair = Pair::psk_with(|conn_a, conn_b| {
        conn_a.esp.key_exchange = vec![KeyExchangeMethod::Ecp384];
        conn_b.esp.key_exchange = vec![KeyExchangeMethod::Ecp384];
    });
    let (a_ike, _) = pair.establish();
    let old_child = pair.a.store().newest_child("test").unwrap();
    let old_outbound = pair.a.store().child(old_child).unwrap().outbound_spi;

    pair.a.rekey_child(old_child).unwrap();
    pair.pump();

    let new_child = pair.a.store().newest_child("test").unwrap();
    assert_ne!(new_child, old_child);
    let new_state = pair.a.store().child(new_child).unwrap();
    assert_ne!(new_state.outbound_spi, old_outbound);
    assert_eq!(new_state.predecessor, Some(old_child));
    assert_eq!(new_state.pfs_group, Some(KeyExchangeMethod::Ecp384));
    let new_outbound_spi = new_state.outbound_spi;
    let new_inbound_spi = new_state.inbound_spi;

    // the replaced child survives the grace window, then goes away
    assert!(pair.a.store().child(old_child).is_some());
    pair.advance(Duration::from_secs(2));
    assert!(pair.a.store().child(old_child).is_none());

    // the parent IKE SA stayed up the whole time
    assert!(pair.a.store().ike(a_ike).is_some());

    // both ends still agree on the new SPI pair
    let b_child = pair.b.store().newest_child("test").unwrap();
    let b_state = pair.b.store().child(b_child).unwrap();
    assert_eq!(b_state.inbound_spi, new_outbound_spi);
    assert_eq!(b_state.outbound_spi, new_inbound_spi);
}

#[test]
fn rekey_preserves_exact_selectors() {
    let mut pair = Pair::psk();
    pair.establish();
    let old_child = pair.a.store().newest_child("test").unwrap();
    let old_ts = pair.a.store().child(old_child).unwrap().local_ts.clone();

    pair.a.rekey_child(old_child).unwrap();
    pair.pump();

    let new_child = pair.a.store().newest_child("test").unwrap();
    assert_eq!(pair.a.store().child(new_child).unwrap().local_ts, old_ts);
}

#[test]
fn ike_rekey_emancipates_children() {
    let mut pair = Pair::psk();
    let (a_ike, b_ike) = pair.establish();
    let a_child = pair.a.store().newest_child("test").unwrap();

    pair.a.rekey_ike(a_ike).unwrap();
    pair.pump();

    let a_new = pair.a.store().newest_ike("test").unwrap();
    let b_new = pair.b.store().newest_ike("test").unwrap();
    assert_ne!(a_new, a_ike);
    assert_ne!(b_new, b_ike);

    // the children moved over without being rekeyed themselves
    assert_eq!(pair.a.store().child(a_child).unwrap().parent, a_new);
    assert_eq!(
        pair.a.store().ike(a_new).unwrap().children,
        vec![a_child]
    );

    // the predecessors expire after the grace window
    pair.advance(Duration::from_secs(2));
    assert!(pair.a.store().ike(a_ike).is_none());
    assert!(pair.b.store().ike(b_ike).is_none());
    assert!(pair.a.store().ike(a_new).is_some());
    assert!(pair.b.store().ike(b_new).is_some());

    // the surviving child still works: rekey it over the new parent
    pair.a.rekey_child(a_child).unwrap();
    pair.pump();
    assert_ne!(pair.a.store().newest_child("test").unwrap(), a_child);
}

#[test]
fn new_ike_sa_uses_fresh_spis_and_keys() {
    let mut pair = Pair::psk();
    let (a_ike, _) = pair.establish();
    let old_pair = {
        let sa = pair.a.store().ike(a_ike).unwrap();
        (sa.initiator_spi, sa.responder_spi)
    };

    pair.a.rekey_ike(a_ike).unwrap();
    pair.pump();

    let a_new = pair.a.store().newest_ike("test").unwrap();
    let sa = pair.a.store().ike(a_new).unwrap();
    assert_ne!((sa.initiator_spi, sa.responder_spi), old_pair);
    assert!(sa.keys.is_some());

    // the new SA carries live message windows: a liveness probe round-trips
    pair.advance(Duration::from_secs(2));
    pair.a.probe_liveness(a_new).unwrap();
    pair.pump();
    assert!(!pair.a.store().ike(a_new).unwrap().liveness_probe_sent);
}
