//! INFORMATIONAL scenarios: delete, liveness, reply caching, MOBIKE and DPD

mod common;

use std::time::Duration;

use common::{addr, Pair};

#[test]
fn delete_ike_cascades_to_children() {
    let mut pair = Pair::psk();
    let (a_ike, _) = pair.establish();
    let a_spis = {
        let child = pair.a.store().newest_child("test").unwrap();
        let child = pair.a.store().child(child).unwrap();
        (child.inbound_spi, child.outbound_spi)
    };

    pair.a.delete_ike(a_ike).unwrap();
    pair.pump();

    // both families are gone, lookups by SPI yield nothing
    assert!(pair.a.store().ike_serials().is_empty());
    assert!(pair.b.store().ike_serials().is_empty());
    assert!(pair.a.store().child_by_outbound_spi(a_spis.1).is_none());

    // every kernel SA of the children was deleted on both ends
    let a_deleted = pair.a_kernel.0.lock().unwrap().deleted.clone();
    assert!(a_deleted.contains(&a_spis.0) && a_deleted.contains(&a_spis.1));
    let b_deleted = pair.b_kernel.0.lock().unwrap().deleted.clone();
    assert!(b_deleted.contains(&a_spis.0) && b_deleted.contains(&a_spis.1));
}

#[test]
fn liveness_probe_roundtrip() {
    let mut pair = Pair::psk();
    let (a_ike, _) = pair.establish();

    pair.a.probe_liveness(a_ike).unwrap();
    assert!(pair.a.store().ike(a_ike).unwrap().liveness_probe_sent);
    pair.pump();
    assert!(!pair.a.store().ike(a_ike).unwrap().liveness_probe_sent);
    assert!(pair.a.store().ike(a_ike).is_some());
}

#[test]
fn duplicate_request_is_answered_from_cache() {
    let mut pair = Pair::psk();
    let (a_ike, _) = pair.establish();

    // capture the probe instead of letting pump shuttle it
    pair.a.probe_liveness(a_ike).unwrap();
    let request = pair.a.take_datagrams().pop().unwrap();

    pair.b
        .handle_datagram(pair.now, pair.a_addr, request.bytes.clone());
    let first = pair.b.take_datagrams().pop().unwrap();

    // the retransmitted request must yield the identical bytes without the
    // handler running again
    pair.b
        .handle_datagram(pair.now, pair.a_addr, request.bytes);
    let second = pair.b.take_datagrams().pop().unwrap();
    assert_eq!(first.bytes, second.bytes);
}

#[test]
fn mobike_address_update() {
    let mut pair = Pair::psk_with(|conn_a, conn_b| {
        conn_a.mobike = true;
        conn_b.mobike = true;
    });
    let (a_ike, b_ike) = pair.establish();
    let old_a_addr = pair.a_addr;
    let new_a_addr = addr(7, 4500);

    pair.a.update_local_address(a_ike, new_a_addr).unwrap();
    pair.a_addr = new_a_addr;
    pair.pump();

    // the responder rebound to the new endpoint and migrated the kernel SAs
    assert_eq!(pair.b.store().ike(b_ike).unwrap().peer_addr, new_a_addr);
    let migrations = pair.b_kernel.0.lock().unwrap().migrations.clone();
    assert!(migrations.contains(&(old_a_addr, new_a_addr)));

    // our COOKIE2 was echoed correctly and the exchange closed
    assert!(pair.a.store().ike(a_ike).unwrap().mobike_cookie2.is_none());
    assert!(pair.a.store().ike(a_ike).is_some());
}

#[test]
fn dead_peer_detection_tears_down() {
    let mut pair = Pair::psk_with(|conn_a, _| {
        conn_a.lifetimes.dpd_delay = Some(Duration::from_secs(5));
    });
    let (a_ike, _) = pair.establish();
    assert!(pair.a.store().ike(a_ike).is_some());

    // cut the wire; the probe goes unanswered and the ladder runs out
    pair.partitioned = true;
    pair.advance(Duration::from_secs(180));
    assert!(pair.a.store().ike_serials().is_empty());
}

#[test]
fn delete_child_roundtrip() {
    let mut pair = Pair::psk();
    pair.establish();
    let a_child = pair.a.store().newest_child("test").unwrap();
    let (inbound, outbound) = {
        let child = pair.a.store().child(a_child).unwrap();
        (child.inbound_spi, child.outbound_spi)
    };

    pair.a.delete_child(a_child).unwrap();
    pair.pump();

    assert!(pair.a.store().child(a_child).is_none());
    assert!(pair.b.store().child_by_inbound_spi(outbound).is_none());
    let a_deleted = pair.a_kernel.0.lock().unwrap().deleted.clone();
    assert!(a_deleted.contains(&inbound) && a_deleted.contains(&outbound));

    // the IKE SA itself survives a child delete
    assert!(pair.a.store().newest_ike("test").is_some());
}
