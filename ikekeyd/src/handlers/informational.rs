//! The INFORMATIONAL exchange: deletes, liveness probes, MOBIKE address
//! updates and REDIRECT handling
//!
//! An empty protected request is a liveness probe and its empty answer the
//! ACK; both refresh the peer's last-seen stamp as a side effect of passing
//! the integrity check.

use std::net::SocketAddr;

use ikewire::definitions::params::{ExchangeType, NotifyType, SecurityProtocol};
use ikewire::definitions::{Delete, Notification, Payload};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::md::MessageDigest;
use crate::nat;
use crate::state::{ChildSaState, IkeSaState, Serial};
use crate::transitions::Outcome;

// ---------------------------------------------------------------------------
// outbound requests
// ---------------------------------------------------------------------------

/// Tear down the whole family by telling the peer first
pub(crate) fn send_delete_ike(engine: &mut Engine, serial: Serial) -> Result<(), EngineError> {
    {
        let sa = engine
            .store
            .ike(serial)
            .ok_or(EngineError::UnknownState(serial))?;
        if sa.state != IkeSaState::Established {
            return Err(EngineError::NotEstablished(serial));
        }
    }
    // a delete in flight wins over any in-progress rekey of ours
    crate::handlers::create_child_sa::abort_exchange_for_delete(engine, serial);

    let payloads = vec![Payload::Delete(Delete {
        protocol: SecurityProtocol::InternetKeyExchange,
        spis: vec![],
    })];
    engine.seal_and_send_request(serial, ExchangeType::Informational, &payloads)?;
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.state = IkeSaState::Deleting;
    }
    info!("Deleting IKE SA {serial}");
    Ok(())
}

/// Delete one Child SA pair
pub(crate) fn send_delete_child(engine: &mut Engine, child: Serial) -> Result<(), EngineError> {
    let (parent, inbound_spi, protocol) = {
        let child_state = engine
            .store
            .child(child)
            .ok_or(EngineError::UnknownState(child))?;
        let protocol = child_state
            .algorithms
            .as_ref()
            .map(|algorithms| algorithms.protocol)
            .unwrap_or(SecurityProtocol::EncapsulatingSecurityPayload);
        (child_state.parent, child_state.inbound_spi, protocol)
    };
    {
        let sa = engine
            .store
            .ike(parent)
            .ok_or(EngineError::UnknownState(parent))?;
        if sa.state != IkeSaState::Established || sa.outstanding.is_some() {
            return Err(EngineError::NotEstablished(parent));
        }
    }

    let payloads = vec![Payload::Delete(Delete {
        protocol,
        spis: vec![inbound_spi],
    })];
    engine.seal_and_send_request(parent, ExchangeType::Informational, &payloads)?;
    if let Some(child_state) = engine.store.child_mut(child) {
        child_state.state = ChildSaState::Deleting;
    }
    info!("Deleting child {child}");
    Ok(())
}

/// An empty protected request; any authenticated answer proves liveness
pub(crate) fn send_liveness_probe(engine: &mut Engine, serial: Serial) -> Result<(), EngineError> {
    {
        let sa = engine
            .store
            .ike(serial)
            .ok_or(EngineError::UnknownState(serial))?;
        if sa.state != IkeSaState::Established || sa.outstanding.is_some() {
            return Err(EngineError::NotEstablished(serial));
        }
    }
    engine.seal_and_send_request(serial, ExchangeType::Informational, &[])?;
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.liveness_probe_sent = true;
    }
    Ok(())
}

/// MOBIKE: our address changed, tell the peer to rebind
pub(crate) fn send_update_sa_addresses(
    engine: &mut Engine,
    serial: Serial,
    new_local: SocketAddr,
) -> Result<(), EngineError> {
    let (old_local, initiator_spi, responder_spi, peer_addr, mobike) = {
        let sa = engine
            .store
            .ike(serial)
            .ok_or(EngineError::UnknownState(serial))?;
        if sa.state != IkeSaState::Established || sa.outstanding.is_some() {
            return Err(EngineError::NotEstablished(serial));
        }
        (
            sa.local_addr,
            sa.initiator_spi,
            sa.responder_spi,
            sa.peer_addr,
            sa.conn.mobike && sa.peer_support.mobike,
        )
    };
    if !mobike {
        return Err(EngineError::Misconfigured(
            "MOBIKE was not negotiated on this SA".into(),
        ));
    }

    let mut cookie2 = vec![0u8; 16];
    ikecrypto::nonce::fill_random(&mut cookie2);
    let payloads = vec![
        Payload::Notify(Notification::bare(NotifyType::UpdateSaAddresses)),
        Payload::Notify(Notification::with_data(
            NotifyType::NatDetectionSourceIp,
            nat::nat_detection_hash(initiator_spi, responder_spi, new_local),
        )),
        Payload::Notify(Notification::with_data(
            NotifyType::NatDetectionDestinationIp,
            nat::nat_detection_hash(initiator_spi, responder_spi, peer_addr),
        )),
        Payload::Notify(Notification::with_data(NotifyType::Cookie2, cookie2.clone())),
    ];

    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.local_addr = new_local;
        sa.mobike_cookie2 = Some(cookie2);
    }
    engine.seal_and_send_request(serial, ExchangeType::Informational, &payloads)?;
    engine.kernel.migrate_sa(old_local, new_local);
    info!("MOBIKE: moved {serial} from {old_local} to {new_local}");
    Ok(())
}

// ---------------------------------------------------------------------------
// inbound
// ---------------------------------------------------------------------------

/// An INFORMATIONAL request: deletes, MOBIKE, REDIRECT or pure liveness
pub(crate) fn process_informational_request(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let mut reply: Vec<Payload> = vec![];
    let mut delete_family = false;
    let mut deleted_children: Vec<u32> = vec![];
    let mut redirect_to: Option<SocketAddr> = None;

    for delete in md.deletes() {
        match delete.protocol {
            SecurityProtocol::InternetKeyExchange => {
                info!("Peer deletes IKE SA {serial} and all its children");
                delete_family = true;
            }
            SecurityProtocol::EncapsulatingSecurityPayload
            | SecurityProtocol::AuthenticationHeader => {
                for spi in &delete.spis {
                    // the peer lists its inbound SPIs, which we send with
                    let Some(child) = engine.store.child_by_outbound_spi(*spi) else {
                        debug!("Delete for unknown child SPI {spi:#x} on {serial}");
                        continue;
                    };
                    let our_spi = engine
                        .store
                        .child(child)
                        .map(|child| child.inbound_spi)
                        .unwrap_or_default();
                    info!("Peer deletes child {child} of {serial}");
                    engine.remove_child(child, true);
                    deleted_children.push(our_spi);
                }
            }
            SecurityProtocol::Reserved => {}
        }
    }
    if !deleted_children.is_empty() {
        reply.push(Payload::Delete(Delete {
            protocol: SecurityProtocol::EncapsulatingSecurityPayload,
            spis: deleted_children,
        }));
    }

    // MOBIKE rebind: only with valid NAT detection and negotiated support
    if md.notify(NotifyType::UpdateSaAddresses).is_some() && !delete_family {
        let allowed = engine
            .store
            .ike(serial)
            .map(|sa| sa.conn.mobike && sa.peer_support.mobike)
            .unwrap_or(false);
        let nat_forbidden = md.notify(NotifyType::NoNatsAllowed).is_some()
            && crate::handlers::detect_nat(&md, engine.config.local_addr);
        if allowed && !nat_forbidden {
            let old_peer = engine
                .store
                .ike(serial)
                .map(|sa| sa.peer_addr)
                .unwrap_or(md.sender);
            if old_peer != md.sender {
                info!("MOBIKE: peer of {serial} moved from {old_peer} to {}", md.sender);
                if let Some(sa) = engine.store.ike_mut(serial) {
                    sa.peer_addr = md.sender;
                }
                engine.kernel.migrate_sa(old_peer, md.sender);
            }
            let (initiator_spi, responder_spi, local_addr) = engine
                .store
                .ike(serial)
                .map(|sa| (sa.initiator_spi, sa.responder_spi, sa.local_addr))
                .unwrap_or((0, 0, md.sender));
            reply.push(Payload::Notify(Notification::with_data(
                NotifyType::NatDetectionSourceIp,
                nat::nat_detection_hash(initiator_spi, responder_spi, local_addr),
            )));
            reply.push(Payload::Notify(Notification::with_data(
                NotifyType::NatDetectionDestinationIp,
                nat::nat_detection_hash(initiator_spi, responder_spi, md.sender),
            )));
            if let Some(cookie2) = md.notify(NotifyType::Cookie2) {
                reply.push(Payload::Notify(Notification::with_data(
                    NotifyType::Cookie2,
                    cookie2.data.clone(),
                )));
            }
        } else {
            debug!("Refusing MOBIKE update on {serial}");
            reply.push(Payload::Notify(Notification::bare(
                NotifyType::NoNatsAllowed,
            )));
        }
    }

    // REDIRECT: the gateway wants us elsewhere
    if let Some(redirect) = md.notify(NotifyType::Redirect) {
        let accepted = engine
            .store
            .ike(serial)
            .map(|sa| sa.conn.accept_redirects)
            .unwrap_or(false);
        if accepted {
            redirect_to = crate::handlers::parse_redirect_gateway(&redirect.data);
        } else {
            debug!("Ignoring REDIRECT on {serial}, policy refuses redirects");
        }
    }

    if let Err(error) =
        engine.seal_and_respond(serial, ExchangeType::Informational, md.message_id, &reply)
    {
        warn!("Failed to answer INFORMATIONAL on {serial}: {error}");
        return Outcome::Fatal;
    }

    if delete_family {
        // the reply is already queued; the delete also wins over any rekey
        // we have in flight
        crate::handlers::create_child_sa::abort_exchange_for_delete(engine, serial);
        engine.teardown_ike(serial, true);
        return Outcome::Ok;
    }
    if let Some(gateway) = redirect_to {
        let conn_name = engine
            .store
            .ike(serial)
            .map(|sa| sa.conn.name.clone());
        info!("Following REDIRECT of {serial} to {gateway}");
        engine.teardown_ike(serial, true);
        if let Some(conn_name) = conn_name {
            if let Err(error) = engine.initiate_toward(&conn_name, gateway) {
                warn!("Re-initiation after REDIRECT failed: {error}");
            }
        }
    }
    Outcome::Ok
}

/// An INFORMATIONAL response: delete ACKs, liveness ACKs, MOBIKE echoes
pub(crate) fn process_informational_response(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };

    if sa.state == IkeSaState::Deleting {
        info!("Delete of {serial} acknowledged");
        engine.teardown_ike(serial, true);
        return Outcome::Ok;
    }

    // a MOBIKE update we sent must echo our COOKIE2 verbatim
    if let Some(expected) = sa.mobike_cookie2.clone() {
        let echoed = md
            .notify(NotifyType::Cookie2)
            .map(|notification| notification.data.clone());
        if echoed.as_deref() != Some(expected.as_slice()) {
            warn!("COOKIE2 mismatch on {serial}, peer or path is lying");
            return Outcome::Fatal;
        }
        if let Some(sa) = engine.store.ike_mut(serial) {
            sa.mobike_cookie2 = None;
        }
    }

    // children we asked to delete are gone once the peer answered
    let deleting: Vec<Serial> = engine
        .store
        .ike(serial)
        .map(|sa| {
            sa.children
                .iter()
                .copied()
                .filter(|child| {
                    engine
                        .store
                        .child(*child)
                        .map(|child| child.state == ChildSaState::Deleting)
                        .unwrap_or(false)
                })
                .collect()
        })
        .unwrap_or_default();
    for child in deleting {
        engine.remove_child(child, true);
    }

    // everything else (liveness ACK included) already did its job by
    // passing the integrity check
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.liveness_probe_sent = false;
    }
    Outcome::Ok
}
