//! The exchange handlers, one module per exchange family, plus the helpers
//! they share

pub(crate) mod create_child_sa;
pub(crate) mod ike_auth;
pub(crate) mod ike_intermediate;
pub(crate) mod ike_sa_init;
pub(crate) mod informational;

use std::net::SocketAddr;
use std::sync::Arc;

use ikecrypto::aead::AeadKey;
use ikecrypto::SymKey;
use ikewire::definitions::params::NotifyType;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::engine::{Engine, EngineError, Timestamp};
use crate::ifaces::{SaDirection, SaInstall};
use crate::keymat;
use crate::md::MessageDigest;
use crate::nat;
use crate::state::{ChildSaState, IkeSa, IkeSaState, PeerSupport, Role, Serial};

/// A blank IKE SA with every negotiated field still unset
#[allow(clippy::too_many_arguments)]
pub(crate) fn blank_ike_sa(
    serial: Serial,
    role: Role,
    conn: Arc<ConnectionConfig>,
    initiator_spi: u64,
    responder_spi: u64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    now: Timestamp,
) -> IkeSa {
    IkeSa {
        serial,
        role,
        state: IkeSaState::Initial,
        conn,
        initiator_spi,
        responder_spi,
        peer_addr,
        local_addr,
        algorithms: None,
        keys: None,
        no_ppk_keys: None,
        ppk_used: false,
        local_nonce: vec![],
        peer_nonce: vec![],
        dh_group: None,
        ke_secret: None,
        local_ke_public: vec![],
        peer_ke_public: vec![],
        first_packet_local: vec![],
        first_packet_peer: vec![],
        peer_id: None,
        peer_key: None,
        children: vec![],
        next_request_id: 0,
        expected_request_id: 0,
        outstanding: None,
        last_response: None,
        pending: None,
        child_exchange: None,
        peer_support: PeerSupport::default(),
        nat_detected: false,
        cookie: None,
        mobike_cookie2: None,
        invalid_ke_count: 0,
        intermediate_rounds: 0,
        predecessor: None,
        last_inbound: now,
        liveness_probe_sent: false,
        established_at: None,
        viable_parent: true,
        timer_generation: 0,
    }
}

/// Record the capability notifies of an IKE_SA_INIT message
pub(crate) fn record_peer_support(sa: &mut IkeSa, md: &MessageDigest) {
    sa.peer_support.fragmentation |= md.notify(NotifyType::FragmentationSupported).is_some();
    sa.peer_support.ppk |= md.notify(NotifyType::UsePpk).is_some();
    sa.peer_support.intermediate |= md
        .notify(NotifyType::IntermediateExchangeSupported)
        .is_some();
    sa.peer_support.redirect |= md.notify(NotifyType::RedirectSupported).is_some();
}

/// Compare the NAT detection notifies against what the addresses should hash
/// to; any mismatch means a NAT rewrote something on the path
pub(crate) fn detect_nat(md: &MessageDigest, local_addr: SocketAddr) -> bool {
    let Some(source) = md.notify(NotifyType::NatDetectionSourceIp) else {
        return false;
    };
    let Some(destination) = md.notify(NotifyType::NatDetectionDestinationIp) else {
        return false;
    };
    let expected_source =
        nat::nat_detection_hash(md.initiator_spi, md.responder_spi, md.sender);
    let expected_destination =
        nat::nat_detection_hash(md.initiator_spi, md.responder_spi, local_addr);
    source.data != expected_source || destination.data != expected_destination
}

/// Derive a fresh child's keymat from its parent and install both directions
///
/// The split of the prf+ stream follows the exchange roles: the keys for the
/// SA carrying initiator-to-responder traffic come first.
pub(crate) fn install_child(
    engine: &mut Engine,
    parent: Serial,
    child_serial: Serial,
    pfs_shared: Option<&SymKey>,
    exchange_nonces: (&[u8], &[u8]),
) -> Result<(), EngineError> {
    let (prf_alg, sk_d, local_addr, peer_addr) = {
        let sa = engine
            .store
            .ike(parent)
            .ok_or(EngineError::UnknownState(parent))?;
        let algorithms = sa
            .algorithms
            .as_ref()
            .ok_or(EngineError::NotEstablished(parent))?;
        let keys = sa
            .keys
            .as_ref()
            .ok_or(EngineError::NotEstablished(parent))?;
        (
            algorithms.prf,
            keys.sk_d.clone(),
            sa.local_addr,
            sa.peer_addr,
        )
    };

    let (initiator_nonce, responder_nonce) = exchange_nonces;
    let (role, algorithms, inbound_spi, outbound_spi, local_ts, remote_ts, transport, ipcomp) = {
        let child = engine
            .store
            .child(child_serial)
            .ok_or(EngineError::UnknownState(child_serial))?;
        let algorithms = child
            .algorithms
            .clone()
            .ok_or(EngineError::NotEstablished(child_serial))?;
        (
            child.role,
            algorithms,
            child.inbound_spi,
            child.outbound_spi,
            child.local_ts.clone(),
            child.remote_ts.clone(),
            child.transport_mode,
            child.ipcomp_cpi,
        )
    };

    let keymat_size = AeadKey::keymat_size(algorithms.encryption.0, algorithms.encryption.1)?
        + algorithms.integrity.key_size();
    let (initiator_to_responder, responder_to_initiator) = keymat::derive_child_keymat(
        prf_alg,
        &sk_d,
        pfs_shared,
        initiator_nonce,
        responder_nonce,
        keymat_size,
    )?;
    let (inbound_keymat, outbound_keymat) = match role {
        Role::Initiator => (responder_to_initiator, initiator_to_responder),
        Role::Responder => (initiator_to_responder, responder_to_initiator),
    };

    let inbound = SaInstall {
        direction: SaDirection::Inbound,
        spi: inbound_spi,
        algorithms: algorithms.clone(),
        keymat: inbound_keymat,
        local_addr,
        peer_addr,
        local_ts: local_ts.clone(),
        remote_ts: remote_ts.clone(),
        transport_mode: transport,
        ipcomp_cpi: ipcomp,
    };
    let outbound = SaInstall {
        direction: SaDirection::Outbound,
        spi: outbound_spi,
        algorithms,
        keymat: outbound_keymat,
        local_addr,
        peer_addr,
        local_ts,
        remote_ts,
        transport_mode: transport,
        ipcomp_cpi: ipcomp,
    };

    engine
        .kernel
        .install_sa(&inbound)
        .map_err(|error| {
            debug!("Kernel rejected inbound SA of child {child_serial}: {error}");
            EngineError::NotEstablished(child_serial)
        })?;
    if let Err(error) = engine.kernel.install_sa(&outbound) {
        debug!("Kernel rejected outbound SA of child {child_serial}: {error}");
        engine.kernel.delete_sa(inbound_spi, inbound.algorithms.protocol);
        return Err(EngineError::NotEstablished(child_serial));
    }

    let now = engine.now();
    let conn_name = engine
        .store
        .ike(parent)
        .map(|sa| sa.conn.name.clone())
        .unwrap_or_default();
    if let Some(child) = engine.store.child_mut(child_serial) {
        child.state = ChildSaState::Established;
        child.established_at = Some(now);
    }
    engine.store.set_newest_child(&conn_name, child_serial);
    engine.schedule_child_lifetime(child_serial);
    Ok(())
}

/// RFC 5685 gateway identity: type 1 is an IPv4 address, type 2 an IPv6 one
pub(crate) fn parse_redirect_gateway(data: &[u8]) -> Option<SocketAddr> {
    let [gw_type, rest @ ..] = data else {
        return None;
    };
    match gw_type {
        1 => rest
            .first_chunk::<4>()
            .map(|raw| SocketAddr::new(std::net::IpAddr::from(*raw), 500)),
        2 => rest
            .first_chunk::<16>()
            .map(|raw| SocketAddr::new(std::net::IpAddr::from(*raw), 500)),
        _ => None,
    }
}

/// The set of error notify types that mark a failed exchange in a response
pub(crate) fn first_error_notify(md: &MessageDigest) -> Option<NotifyType> {
    md.notifies()
        .map(|notification| notification.notify_type)
        .find(|notify_type| notify_type.is_error())
}
