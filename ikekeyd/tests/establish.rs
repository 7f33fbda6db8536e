//! End-to-end IKE_SA_INIT + IKE_AUTH scenarios over the in-memory pair

mod common;

use std::time::Duration;

use common::Pair;
use ikewire::definitions::params::{EncryptionAlgorithm, KeyExchangeMethod};

#[test]
fn happy_path_psk() {
    let mut pair = Pair::psk();
    let (a_ike, b_ike) = pair.establish();

    let a_sa = pair.a.store().ike(a_ike).unwrap();
    let b_sa = pair.b.store().ike(b_ike).unwrap();
    assert_eq!(a_sa.initiator_spi, b_sa.initiator_spi);
    assert_eq!(a_sa.responder_spi, b_sa.responder_spi);
    assert_ne!(a_sa.initiator_spi, 0);
    assert_ne!(a_sa.responder_spi, 0);

    // one Child SA pair on each side, cross-wired SPIs
    let a_child = pair.a.store().newest_child("test").unwrap();
    let b_child = pair.b.store().newest_child("test").unwrap();
    let a_child = pair.a.store().child(a_child).unwrap();
    let b_child = pair.b.store().child(b_child).unwrap();
    assert_eq!(a_child.outbound_spi, b_child.inbound_spi);
    assert_eq!(a_child.inbound_spi, b_child.outbound_spi);

    // the narrowed selectors mirror each other
    assert_eq!(a_child.local_ts, b_child.remote_ts);
    assert_eq!(a_child.remote_ts, b_child.local_ts);

    // both kernels hold an inbound and an outbound SA
    assert_eq!(pair.a_kernel.0.lock().unwrap().installed.len(), 2);
    assert_eq!(pair.b_kernel.0.lock().unwrap().installed.len(), 2);
}

#[test]
fn invalid_ke_recovery() {
    let mut pair = Pair::psk_with(|conn_a, conn_b| {
        conn_a.ike.key_exchange = vec![KeyExchangeMethod::Ecp256, KeyExchangeMethod::Ecp384];
        conn_b.ike.key_exchange = vec![KeyExchangeMethod::Ecp384];
    });
    let (a_ike, _) = pair.establish();

    let a_sa = pair.a.store().ike(a_ike).unwrap();
    assert_eq!(a_sa.invalid_ke_count, 1);
    assert_eq!(
        a_sa.algorithms.as_ref().unwrap().key_exchange,
        KeyExchangeMethod::Ecp384
    );
}

#[test]
fn cookie_challenge_under_load() {
    let mut pair = Pair::psk();
    // a threshold of zero means every fresh initiator gets challenged
    pair.b = {
        let mut config = ikekeyd::config::EngineConfig {
            local_addr: pair.b_addr,
            connections: vec![ikekeyd::config::ConnectionConfig::psk(
                "test",
                pair.a_addr,
                b"hunter2",
            )],
            cookie_threshold: 0,
            ..Default::default()
        };
        config.connections[0].local_ts = vec![common::subnet([10, 0, 1, 0])];
        config.connections[0].remote_ts = vec![common::subnet([10, 0, 0, 0])];
        ikekeyd::Engine::new(
            config,
            ikekeyd::impair::Impair::default(),
            Box::new(pair.b_kernel.clone()),
            std::sync::Arc::new(ikekeyd::ifaces::MemoryCertAuthority::default()),
            Box::new(ikekeyd::ifaces::MemoryPpkStore::default()),
            std::sync::Arc::new(ikekeyd::ifaces::MemoryDnsResolver::default()),
        )
    };

    let (a_ike, _) = pair.establish();
    let a_sa = pair.a.store().ike(a_ike).unwrap();
    assert!(a_sa.cookie.is_some(), "initiator should have echoed a cookie");
}

#[test]
fn fragmentation_of_large_auth() {
    let mut pair = Pair::psk_with(|conn_a, conn_b| {
        // an identity large enough to push IKE_AUTH over the threshold
        conn_a.local_id.data = vec![0x41; 2000];
        conn_b.peer_id = None;
    });
    pair.establish();
    assert!(pair.a.store().newest_child("test").is_some());
    assert!(pair.b.store().newest_child("test").is_some());
}

#[test]
fn chacha20_suite_negotiates() {
    let mut pair = Pair::psk_with(|conn_a, conn_b| {
        conn_a.ike.encryption = vec![
            (EncryptionAlgorithm::ChaCha20Poly1305, None),
            (EncryptionAlgorithm::AesGcm16, Some(256)),
        ];
        conn_b.ike.encryption = vec![(EncryptionAlgorithm::ChaCha20Poly1305, None)];
    });
    let (a_ike, _) = pair.establish();
    let a_sa = pair.a.store().ike(a_ike).unwrap();
    assert_eq!(
        a_sa.algorithms.as_ref().unwrap().encryption,
        (EncryptionAlgorithm::ChaCha20Poly1305, None)
    );
}

#[test]
fn wrong_psk_fails_authentication() {
    let mut pair = Pair::psk_with(|_, conn_b| {
        conn_b.auth = ikekeyd::config::AuthConfig::PreSharedKey {
            secret: b"other secret".to_vec(),
        };
        conn_b.peer_auth = ikekeyd::config::AuthConfig::PreSharedKey {
            secret: b"other secret".to_vec(),
        };
    });
    pair.a.initiate("test").unwrap();
    pair.pump();

    // the responder refuses, both ends drop all state
    assert!(pair.a.store().newest_ike("test").is_none());
    assert!(pair.b.store().newest_ike("test").is_none());
    assert!(pair.a_kernel.0.lock().unwrap().installed.is_empty());
    assert!(pair.b_kernel.0.lock().unwrap().installed.is_empty());
}

#[test]
fn ppk_mixes_when_both_sides_hold_it() {
    let mut pair = Pair::psk_with(|conn_a, conn_b| {
        conn_a.ppk = ikekeyd::config::PpkPolicy::Allow;
        conn_a.ppk_id = Some(b"ppk-1".to_vec());
        conn_b.ppk = ikekeyd::config::PpkPolicy::Allow;
    });
    // both stores know the same PPK
    pair.a = {
        let mut store = ikekeyd::ifaces::MemoryPpkStore::default();
        store.insert(b"ppk-1".to_vec(), b"very post quantum".to_vec());
        rebuild_with_ppks(&pair, pair.a_addr, pair.b_addr, true, store)
    };
    pair.b = {
        let mut store = ikekeyd::ifaces::MemoryPpkStore::default();
        store.insert(b"ppk-1".to_vec(), b"very post quantum".to_vec());
        rebuild_with_ppks(&pair, pair.b_addr, pair.a_addr, false, store)
    };

    let (a_ike, b_ike) = pair.establish();
    assert!(pair.a.store().ike(a_ike).unwrap().ppk_used);
    assert!(pair.b.store().ike(b_ike).unwrap().ppk_used);
}

#[test]
fn retransmit_ladder_is_bounded() {
    let mut pair = Pair::psk();
    pair.partitioned = true;
    pair.a.initiate("test").unwrap();
    pair.pump();

    // let the whole ladder run out
    pair.advance(Duration::from_secs(120));
    assert!(
        pair.a.store().ike_serials().is_empty(),
        "exhausted retransmits must reap the state"
    );
}

#[test]
fn intermediate_round_reaches_establishment() {
    let mut pair = Pair::psk_with(|conn_a, conn_b| {
        conn_a.intermediate_ke = Some(KeyExchangeMethod::Curve25519);
        conn_b.intermediate_ke = Some(KeyExchangeMethod::Curve25519);
    });
    let (a_ike, b_ike) = pair.establish();
    assert_eq!(pair.a.store().ike(a_ike).unwrap().intermediate_rounds, 1);
    assert_eq!(pair.b.store().ike(b_ike).unwrap().intermediate_rounds, 1);
    assert!(pair.a.store().newest_child("test").is_some());
}

fn rebuild_with_ppks(
    pair: &Pair,
    local: std::net::SocketAddr,
    peer: std::net::SocketAddr,
    initiator_side: bool,
    ppks: ikekeyd::ifaces::MemoryPpkStore,
) -> ikekeyd::Engine {
    let mut conn = ikekeyd::config::ConnectionConfig::psk("test", peer, b"hunter2");
    conn.ppk = ikekeyd::config::PpkPolicy::Allow;
    conn.ppk_id = Some(b"ppk-1".to_vec());
    if initiator_side {
        conn.local_ts = vec![common::subnet([10, 0, 0, 0])];
        conn.remote_ts = vec![common::subnet([10, 0, 1, 0])];
    } else {
        conn.local_id = ikewire::definitions::Identification {
            id_type: ikewire::definitions::params::IdType::Fqdn,
            data: b"responder.local".to_vec(),
        };
        conn.local_ts = vec![common::subnet([10, 0, 1, 0])];
        conn.remote_ts = vec![common::subnet([10, 0, 0, 0])];
    }
    let kernel = if initiator_side {
        pair.a_kernel.clone()
    } else {
        pair.b_kernel.clone()
    };
    ikekeyd::Engine::new(
        ikekeyd::config::EngineConfig {
            local_addr: local,
            connections: vec![conn],
            ..Default::default()
        },
        ikekeyd::impair::Impair::default(),
        Box::new(kernel),
        std::sync::Arc::new(ikekeyd::ifaces::MemoryCertAuthority::default()),
        Box::new(ppks),
        std::sync::Arc::new(ikekeyd::ifaces::MemoryDnsResolver::default()),
    )
}
