//! The CREATE_CHILD_SA exchange in its three shapes: additional child,
//! child rekey (N(REKEY_SA)) and rekey of the IKE SA itself
//!
//! A rekeyed predecessor is not deleted on the spot; it is scheduled to
//! expire after a short grace window so straggling traffic still decrypts.
//! Simultaneous rekeys are broken by nonce comparison: the side that drew
//! the lower nonce wins, the loser abandons its attempt.

use ikecrypto::dh::KeSecret;
use ikecrypto::SymKey;
use ikewire::definitions::params::{ExchangeType, NotifyType, SecurityProtocol};
use ikewire::definitions::{KeyExchange, Notification, Payload};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::handlers::{blank_ike_sa, first_error_notify, install_child};
use crate::keymat;
use crate::md::MessageDigest;
use crate::proposals;
use crate::state::{
    ChildExchange, ChildIntent, ChildSa, ChildSaState, IkeSaState, Pending, Role, Serial,
};
use crate::tasks::TaskKind;
use crate::transitions::Outcome;
use crate::ts;

/// What an inbound CREATE_CHILD_SA request turned out to be
enum RequestShape {
    NewChild,
    RekeyChild { old: Serial },
    RekeyIke,
}

fn classify(engine: &Engine, md: &MessageDigest) -> Result<RequestShape, NotifyType> {
    if let Some(offer) = md.sa() {
        if offer
            .proposals
            .iter()
            .any(|p| p.protocol == SecurityProtocol::InternetKeyExchange)
        {
            return Ok(RequestShape::RekeyIke);
        }
    }
    match md.notify(NotifyType::RekeySa) {
        Some(notification) => {
            let spi = notification
                .spi
                .as_ref()
                .and_then(|spi| spi.first_chunk::<4>())
                .map(|spi| u32::from_be_bytes(*spi))
                .ok_or(NotifyType::InvalidSyntax)?;
            // the peer names its inbound SPI, which is our outbound
            let old = engine
                .store
                .child_by_outbound_spi(spi)
                .ok_or(NotifyType::ChildSaNotFound)?;
            Ok(RequestShape::RekeyChild { old })
        }
        None => Ok(RequestShape::NewChild),
    }
}

// ---------------------------------------------------------------------------
// initiator
// ---------------------------------------------------------------------------

/// Admin entry: negotiate an additional Child SA on a viable IKE SA
pub(crate) fn start_new_child(engine: &mut Engine, conn_name: &str) -> Result<Serial, EngineError> {
    let parent = engine
        .store
        .viable_ike_for_conn(conn_name)
        .ok_or_else(|| EngineError::NoViableParent(conn_name.to_owned()))?;
    let conn = engine
        .store
        .ike(parent)
        .map(|sa| sa.conn.clone())
        .ok_or(EngineError::UnknownState(parent))?;

    let child_serial = engine.store.next_serial();
    let child = ChildSa {
        serial: child_serial,
        parent,
        role: Role::Initiator,
        state: ChildSaState::Larval,
        algorithms: None,
        inbound_spi: ikecrypto::nonce::random_child_spi(),
        outbound_spi: 0,
        pfs_group: conn.esp.key_exchange.first().copied(),
        local_ts: conn.local_ts.clone(),
        remote_ts: conn.remote_ts.clone(),
        transport_mode: conn.transport_mode,
        ipcomp_cpi: None,
        virtual_ip: None,
        predecessor: None,
        established_at: None,
        timer_generation: 0,
    };
    start_child_exchange(engine, parent, ChildIntent::New { child: child_serial }, child)?;
    Ok(child_serial)
}

/// Admin entry: replace an existing Child SA
pub(crate) fn start_rekey_child(engine: &mut Engine, old: Serial) -> Result<(), EngineError> {
    let (parent, local_ts, remote_ts, transport, pfs_group) = {
        let child = engine
            .store
            .child(old)
            .ok_or(EngineError::UnknownState(old))?;
        if child.state != ChildSaState::Established {
            return Err(EngineError::NotEstablished(old));
        }
        (
            child.parent,
            child.local_ts.clone(),
            child.remote_ts.clone(),
            child.transport_mode,
            child.pfs_group,
        )
    };
    let conn = engine
        .store
        .ike(parent)
        .map(|sa| sa.conn.clone())
        .ok_or(EngineError::UnknownState(parent))?;

    let new_serial = engine.store.next_serial();
    info!("Rekeying child {old} as {new_serial}");
    let replacement = ChildSa {
        serial: new_serial,
        parent,
        role: Role::Initiator,
        state: ChildSaState::Larval,
        algorithms: None,
        inbound_spi: ikecrypto::nonce::random_child_spi(),
        outbound_spi: 0,
        pfs_group: pfs_group.or_else(|| conn.esp.key_exchange.first().copied()),
        local_ts,
        remote_ts,
        transport_mode: transport,
        ipcomp_cpi: None,
        virtual_ip: None,
        predecessor: Some(old),
        established_at: None,
        timer_generation: 0,
    };
    start_child_exchange(
        engine,
        parent,
        ChildIntent::RekeyChild {
            old,
            new: new_serial,
        },
        replacement,
    )
}

fn start_child_exchange(
    engine: &mut Engine,
    parent: Serial,
    intent: ChildIntent,
    child: ChildSa,
) -> Result<(), EngineError> {
    let group = child.pfs_group;
    let child_serial = child.serial;
    {
        let sa = engine
            .store
            .ike(parent)
            .ok_or(EngineError::UnknownState(parent))?;
        if sa.state != IkeSaState::Established
            || sa.child_exchange.is_some()
            || sa.outstanding.is_some()
        {
            return Err(EngineError::NotEstablished(parent));
        }
    }
    engine.store.insert_child(child);
    {
        let Some(sa) = engine.store.ike_mut(parent) else {
            return Err(EngineError::UnknownState(parent));
        };
        sa.children.push(child_serial);
        sa.child_exchange = Some(ChildExchange {
            intent,
            local_nonce: ikecrypto::nonce::random_nonce(),
            group,
            ke_secret: None,
            local_public: vec![],
            aborted: false,
        });
    }
    match group {
        Some(group) => {
            if let Some(sa) = engine.store.ike_mut(parent) {
                sa.pending = Some(Pending::ChildKe);
            }
            engine.submit(parent, TaskKind::KeGen { group });
        }
        None => send_create_child_request(engine, parent),
    }
    Ok(())
}

/// Admin entry: replace the IKE SA itself
pub(crate) fn start_rekey_ike(engine: &mut Engine, old: Serial) -> Result<(), EngineError> {
    let (conn, local_addr, peer_addr) = {
        let sa = engine
            .store
            .ike(old)
            .ok_or(EngineError::UnknownState(old))?;
        if sa.state != IkeSaState::Established {
            return Err(EngineError::NotEstablished(old));
        }
        if sa.child_exchange.is_some() || sa.outstanding.is_some() {
            return Err(EngineError::NotEstablished(old));
        }
        (sa.conn.clone(), sa.local_addr, sa.peer_addr)
    };
    let group = *conn
        .ike
        .key_exchange
        .first()
        .ok_or_else(|| EngineError::Misconfigured("no IKE key exchange method".into()))?;

    let new_serial = engine.store.next_serial();
    let now = engine.now();
    info!("Rekeying IKE SA {old} as {new_serial}");
    let mut replacement = blank_ike_sa(
        new_serial,
        Role::Initiator,
        conn,
        ikecrypto::nonce::random_ike_spi(),
        0,
        local_addr,
        peer_addr,
        now,
    );
    replacement.predecessor = Some(old);
    engine.store.insert_ike(replacement);

    if let Some(sa) = engine.store.ike_mut(old) {
        sa.child_exchange = Some(ChildExchange {
            intent: ChildIntent::RekeyIke { new: new_serial },
            local_nonce: ikecrypto::nonce::random_nonce(),
            group: Some(group),
            ke_secret: None,
            local_public: vec![],
            aborted: false,
        });
        sa.pending = Some(Pending::ChildKe);
    }
    engine.submit(old, TaskKind::KeGen { group });
    Ok(())
}

/// Our KE for the outbound CREATE_CHILD_SA is ready
pub(crate) fn child_ke_done(
    engine: &mut Engine,
    serial: Serial,
    public: Vec<u8>,
    secret: KeSecret,
) {
    if let Some(sa) = engine.store.ike_mut(serial) {
        if let Some(exchange) = sa.child_exchange.as_mut() {
            exchange.local_public = public;
            exchange.ke_secret = Some(secret);
        }
        sa.pending = None;
    }
    send_create_child_request(engine, serial);
}

fn send_create_child_request(engine: &mut Engine, serial: Serial) {
    let Some(sa) = engine.store.ike(serial) else {
        return;
    };
    let conn = sa.conn.clone();
    let Some(exchange) = sa.child_exchange.as_ref() else {
        return;
    };

    let mut payloads = vec![];
    match exchange.intent {
        ChildIntent::RekeyChild { old, new } => {
            let Some(old_child) = engine.store.child(old) else {
                abandon_exchange(engine, serial);
                return;
            };
            let Some(new_child) = engine.store.child(new) else {
                abandon_exchange(engine, serial);
                return;
            };
            payloads.push(Payload::Notify(Notification::for_child(
                NotifyType::RekeySa,
                SecurityProtocol::EncapsulatingSecurityPayload,
                old_child.inbound_spi,
            )));
            payloads.push(Payload::SecurityAssociation(proposals::build_offer(
                &conn.esp,
                SecurityProtocol::EncapsulatingSecurityPayload,
                Some(new_child.inbound_spi.to_be_bytes().to_vec()),
            )));
            payloads.push(Payload::Nonce(exchange.local_nonce.clone()));
            if let (Some(group), false) = (exchange.group, exchange.local_public.is_empty()) {
                payloads.push(Payload::KeyExchange(KeyExchange {
                    group,
                    data: exchange.local_public.clone(),
                }));
            }
            // rekeys repeat the existing selectors verbatim
            payloads.push(Payload::TrafficSelectorsInitiator(old_child.local_ts.clone()));
            payloads.push(Payload::TrafficSelectorsResponder(old_child.remote_ts.clone()));
        }
        ChildIntent::New { child } => {
            let Some(new_child) = engine.store.child(child) else {
                abandon_exchange(engine, serial);
                return;
            };
            payloads.push(Payload::SecurityAssociation(proposals::build_offer(
                &conn.esp,
                SecurityProtocol::EncapsulatingSecurityPayload,
                Some(new_child.inbound_spi.to_be_bytes().to_vec()),
            )));
            payloads.push(Payload::Nonce(exchange.local_nonce.clone()));
            if let (Some(group), false) = (exchange.group, exchange.local_public.is_empty()) {
                payloads.push(Payload::KeyExchange(KeyExchange {
                    group,
                    data: exchange.local_public.clone(),
                }));
            }
            payloads.push(Payload::TrafficSelectorsInitiator(conn.local_ts.clone()));
            payloads.push(Payload::TrafficSelectorsResponder(conn.remote_ts.clone()));
        }
        ChildIntent::RekeyIke { new } => {
            let Some(new_sa) = engine.store.ike(new) else {
                abandon_exchange(engine, serial);
                return;
            };
            payloads.push(Payload::SecurityAssociation(proposals::build_offer(
                &conn.ike,
                SecurityProtocol::InternetKeyExchange,
                Some(new_sa.initiator_spi.to_be_bytes().to_vec()),
            )));
            payloads.push(Payload::Nonce(exchange.local_nonce.clone()));
            if let Some(group) = exchange.group {
                payloads.push(Payload::KeyExchange(KeyExchange {
                    group,
                    data: exchange.local_public.clone(),
                }));
            }
        }
    }

    if let Err(error) = engine.seal_and_send_request(serial, ExchangeType::CreateChildSa, &payloads)
    {
        warn!("Failed to send CREATE_CHILD_SA request on {serial}: {error}");
        abandon_exchange(engine, serial);
    }
}

/// A valid Delete always wins over an in-flight rekey: the rekey's larval
/// state is discarded before the delete proceeds
pub(crate) fn abort_exchange_for_delete(engine: &mut Engine, serial: Serial) {
    let busy = engine
        .store
        .ike(serial)
        .map(|sa| sa.child_exchange.is_some())
        .unwrap_or(false);
    if busy {
        info!("Delete on {serial} aborts the rekey in flight");
        abandon_exchange(engine, serial);
        if let Some(sa) = engine.store.ike_mut(serial) {
            sa.outstanding = None;
        }
    }
}

/// Drop the larval state of a failed or lost exchange
fn abandon_exchange(engine: &mut Engine, serial: Serial) {
    let Some(sa) = engine.store.ike_mut(serial) else {
        return;
    };
    let Some(exchange) = sa.child_exchange.take() else {
        return;
    };
    match exchange.intent {
        ChildIntent::New { child } | ChildIntent::RekeyChild { new: child, .. } => {
            engine.remove_child(child, false);
        }
        ChildIntent::RekeyIke { new } => {
            engine.teardown_ike(new, false);
        }
    }
}

/// The CREATE_CHILD_SA response arrived
pub(crate) fn process_create_child_response(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let Some(exchange) = sa.child_exchange.as_ref() else {
        debug!("CREATE_CHILD_SA response on {serial} without an exchange in flight");
        return Outcome::Ignore;
    };
    if exchange.aborted {
        info!("Discarding response of the lost simultaneous rekey on {serial}");
        abandon_exchange(engine, serial);
        return Outcome::Ok;
    }
    if let Some(error) = first_error_notify(&md) {
        info!("CREATE_CHILD_SA on {serial} refused with {error:?}");
        abandon_exchange(engine, serial);
        return Outcome::Ok;
    }

    match (exchange.group, md.ke()) {
        (Some(group), Some(ke)) if ke.group == group => {
            let Some(secret) = exchange.ke_secret.clone() else {
                abandon_exchange(engine, serial);
                return Outcome::Ok;
            };
            let peer_public = ke.data.clone();
            if let Some(sa) = engine.store.ike_mut(serial) {
                sa.pending = Some(Pending::ChildShared { md });
            }
            engine.submit(
                serial,
                TaskKind::KeShared {
                    group,
                    secret,
                    peer_public,
                },
            );
            Outcome::Suspend
        }
        (Some(_), _) => {
            info!("CREATE_CHILD_SA response on {serial} lacks the agreed KE");
            abandon_exchange(engine, serial);
            Outcome::Ok
        }
        (None, _) => finish_child_exchange(engine, serial, md, None),
    }
}

/// PFS or rekey DH of our outbound exchange finished
pub(crate) fn child_shared_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    shared: SymKey,
) {
    let message_id = md.message_id;
    let outcome = finish_child_exchange(engine, serial, md, Some(shared));
    engine.apply_outcome(serial, outcome, false, ExchangeType::CreateChildSa, message_id);
}

fn finish_child_exchange(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    shared: Option<SymKey>,
) -> Outcome {
    let Some(sa) = engine.store.ike_mut(serial) else {
        return Outcome::Ignore;
    };
    let conn = sa.conn.clone();
    let Some(exchange) = sa.child_exchange.take() else {
        return Outcome::Ignore;
    };
    sa.pending = None;

    let Some(peer_nonce) = md.nonce().map(|nonce| nonce.to_vec()) else {
        restore_and_abandon(engine, serial, exchange);
        return Outcome::Ok;
    };

    match exchange.intent {
        ChildIntent::New { child } | ChildIntent::RekeyChild { new: child, .. } => {
            let Some(offer) = md.sa() else {
                restore_and_abandon(engine, serial, exchange);
                return Outcome::Ok;
            };
            let Some(selected) = proposals::select_child(&conn.esp, offer) else {
                info!("CREATE_CHILD_SA answer on {serial} selects nothing we offered");
                restore_and_abandon(engine, serial, exchange);
                return Outcome::Ok;
            };
            let Some(outbound_spi) = selected
                .spi
                .first_chunk::<4>()
                .map(|spi| u32::from_be_bytes(*spi))
            else {
                restore_and_abandon(engine, serial, exchange);
                return Outcome::Ok;
            };
            if let Some(child_state) = engine.store.child_mut(child) {
                child_state.algorithms = Some(selected.algorithms.clone());
                child_state.outbound_spi = outbound_spi;
                if let (Some(ts_i), Some(ts_r)) = (md.ts_initiator(), md.ts_responder()) {
                    child_state.local_ts = ts_i.clone();
                    child_state.remote_ts = ts_r.clone();
                }
            }
            if let Err(error) = install_child(
                engine,
                serial,
                child,
                shared.as_ref(),
                (&exchange.local_nonce, &peer_nonce),
            ) {
                warn!("Failed to install child {child} on {serial}: {error}");
                engine.remove_child(child, false);
                return Outcome::Ok;
            }
            if let ChildIntent::RekeyChild { old, .. } = exchange.intent {
                info!("Child {old} rekeyed, expiring it after the grace window");
                engine.expire_predecessor(old);
            }
            Outcome::Ok
        }
        ChildIntent::RekeyIke { new } => {
            let Some(shared) = shared else {
                engine.teardown_ike(new, false);
                return Outcome::Ok;
            };
            match emancipate_rekeyed_ike(
                engine,
                serial,
                new,
                &md,
                &exchange.local_nonce,
                &peer_nonce,
                &shared,
                Role::Initiator,
            ) {
                Ok(()) => Outcome::Ok,
                Err(error) => {
                    warn!("IKE rekey completion on {serial} failed: {error}");
                    engine.teardown_ike(new, false);
                    Outcome::Ok
                }
            }
        }
    }
}

fn restore_and_abandon(engine: &mut Engine, serial: Serial, exchange: ChildExchange) {
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.child_exchange = Some(exchange);
    }
    abandon_exchange(engine, serial);
}

/// Seed the replacement IKE SA from the old SK_d, move the children over and
/// put the predecessor on its grace-window expiry
#[allow(clippy::too_many_arguments)]
fn emancipate_rekeyed_ike(
    engine: &mut Engine,
    old: Serial,
    new: Serial,
    md: &MessageDigest,
    local_nonce: &[u8],
    peer_nonce: &[u8],
    shared: &SymKey,
    our_role: Role,
) -> Result<(), EngineError> {
    let (old_sk_d, old_prf, conn) = {
        let sa = engine.store.ike(old).ok_or(EngineError::UnknownState(old))?;
        let keys = sa.keys.as_ref().ok_or(EngineError::NotEstablished(old))?;
        let algorithms = sa
            .algorithms
            .as_ref()
            .ok_or(EngineError::NotEstablished(old))?;
        (keys.sk_d.clone(), algorithms.prf, sa.conn.clone())
    };

    let Some(offer) = md.sa() else {
        return Err(EngineError::NotEstablished(new));
    };
    let Some(selected) = proposals::select_ike(&conn.ike, offer) else {
        return Err(EngineError::NotEstablished(new));
    };
    let Some(peer_spi) = selected
        .spi
        .first_chunk::<8>()
        .map(|spi| u64::from_be_bytes(*spi))
    else {
        return Err(EngineError::NotEstablished(new));
    };

    // nonce order follows the exchange roles, not the parent SA's
    let (ni, nr) = match our_role {
        Role::Initiator => (local_nonce, peer_nonce),
        Role::Responder => (peer_nonce, local_nonce),
    };
    let skeyseed = keymat::skeyseed_rekey(old_prf, &old_sk_d, shared, ni, nr)?;

    let old_pair = {
        let sa = engine
            .store
            .ike_mut(new)
            .ok_or(EngineError::UnknownState(new))?;
        let old_pair = sa.spi_pair();
        match our_role {
            Role::Initiator => sa.responder_spi = peer_spi,
            Role::Responder => sa.initiator_spi = peer_spi,
        }
        sa.algorithms = Some(selected.algorithms.clone());
        sa.local_nonce = local_nonce.to_vec();
        sa.peer_nonce = peer_nonce.to_vec();
        let keys = keymat::derive_ike_keys(
            &selected.algorithms,
            &skeyseed,
            ni,
            nr,
            sa.initiator_spi,
            sa.responder_spi,
        )?;
        sa.keys = Some(keys);
        sa.state = IkeSaState::Established;
        old_pair
    };
    engine.store.reindex_ike(new, old_pair);

    // the children emancipate to the replacement SA
    let moved: Vec<Serial> = engine
        .store
        .ike(old)
        .map(|sa| sa.children.clone())
        .unwrap_or_default();
    for child in &moved {
        if let Some(child_state) = engine.store.child_mut(*child) {
            child_state.parent = new;
        }
    }
    if let Some(sa) = engine.store.ike_mut(old) {
        sa.children.clear();
        sa.viable_parent = false;
    }
    let now = engine.now();
    if let Some(sa) = engine.store.ike_mut(new) {
        sa.children = moved;
        sa.established_at = Some(now);
        sa.predecessor = Some(old);
    }

    engine.store.set_newest_ike(&conn.name, new);
    engine.schedule_ike_lifetime(new);
    engine.schedule_liveness(new);
    engine.expire_predecessor(old);
    info!("IKE SA {old} rekeyed, {new} took over");
    Ok(())
}

// ---------------------------------------------------------------------------
// responder
// ---------------------------------------------------------------------------

/// An inbound CREATE_CHILD_SA request
pub(crate) fn process_create_child_request(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let shape = match classify(engine, &md) {
        Ok(shape) => shape,
        Err(notify_type) => {
            engine.send_notify_response(
                serial,
                ExchangeType::CreateChildSa,
                md.message_id,
                notify_type,
            );
            return Outcome::Ok;
        }
    };
    let Some(nonce) = md.nonce() else {
        engine.send_notify_response(
            serial,
            ExchangeType::CreateChildSa,
            md.message_id,
            NotifyType::InvalidSyntax,
        );
        return Outcome::Ok;
    };

    // simultaneous rekey: the lower nonce wins, the loser backs off
    if let Some(sa) = engine.store.ike(serial) {
        if let Some(exchange) = sa.child_exchange.as_ref() {
            let collision = match (&shape, exchange.intent) {
                (RequestShape::RekeyIke, ChildIntent::RekeyIke { .. }) => true,
                (RequestShape::RekeyChild { old }, ChildIntent::RekeyChild { old: ours, .. }) => {
                    *old == ours
                }
                _ => false,
            };
            if collision {
                if exchange.local_nonce.as_slice() < nonce {
                    info!("Simultaneous rekey on {serial}: our nonce wins, refusing theirs");
                    engine.send_notify_response(
                        serial,
                        ExchangeType::CreateChildSa,
                        md.message_id,
                        NotifyType::TemporaryFailure,
                    );
                    return Outcome::Ok;
                }
                info!("Simultaneous rekey on {serial}: their nonce wins, abandoning ours");
                if let Some(sa) = engine.store.ike_mut(serial) {
                    if let Some(exchange) = sa.child_exchange.as_mut() {
                        exchange.aborted = true;
                    }
                }
            }
        }
    }

    match shape {
        RequestShape::RekeyChild { old } => {
            // rekeys must repeat the existing selectors exactly
            let matches = {
                let Some(old_child) = engine.store.child(old) else {
                    engine.send_notify_response(
                        serial,
                        ExchangeType::CreateChildSa,
                        md.message_id,
                        NotifyType::ChildSaNotFound,
                    );
                    return Outcome::Ok;
                };
                match (md.ts_initiator(), md.ts_responder()) {
                    (Some(ts_i), Some(ts_r)) => {
                        ts::sets_equal(ts_i, &old_child.remote_ts)
                            && ts::sets_equal(ts_r, &old_child.local_ts)
                    }
                    _ => false,
                }
            };
            if !matches {
                info!("Rekey of child {old} on {serial} altered the selectors");
                engine.send_notify_response(
                    serial,
                    ExchangeType::CreateChildSa,
                    md.message_id,
                    NotifyType::TsUnacceptable,
                );
                return Outcome::Ok;
            }
            respond_child_common(engine, serial, md)
        }
        RequestShape::NewChild => respond_child_common(engine, serial, md),
        RequestShape::RekeyIke => respond_rekey_ike(engine, serial, md),
    }
}

/// Shared path of new-child and rekey-child responses; handles optional PFS
fn respond_child_common(engine: &mut Engine, serial: Serial, md: MessageDigest) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let conn = sa.conn.clone();
    let Some(offer) = md.sa() else {
        return Outcome::Ignore;
    };
    if proposals::select_child(&conn.esp, offer).is_none() {
        info!("No proposal chosen for CREATE_CHILD_SA on {serial}");
        engine.send_notify_response(
            serial,
            ExchangeType::CreateChildSa,
            md.message_id,
            NotifyType::NoProposalChosen,
        );
        return Outcome::Ok;
    }

    match md.ke() {
        Some(ke) => {
            let group = ke.group;
            if !conn.esp.key_exchange.contains(&group) {
                let suggestion = conn.esp.key_exchange.first().copied();
                match suggestion {
                    Some(wanted) => {
                        let payloads = vec![Payload::Notify(Notification::with_data(
                            NotifyType::InvalidKePayload,
                            (wanted as u16).to_be_bytes().to_vec(),
                        ))];
                        if let Err(error) = engine.seal_and_respond(
                            serial,
                            ExchangeType::CreateChildSa,
                            md.message_id,
                            &payloads,
                        ) {
                            debug!("Failed to refuse the PFS group on {serial}: {error}");
                        }
                    }
                    None => engine.send_notify_response(
                        serial,
                        ExchangeType::CreateChildSa,
                        md.message_id,
                        NotifyType::NoProposalChosen,
                    ),
                }
                return Outcome::Ok;
            }
            if let Some(sa) = engine.store.ike_mut(serial) {
                sa.pending = Some(Pending::RespondChildKe { md });
            }
            engine.submit(serial, TaskKind::KeGen { group });
            Outcome::Suspend
        }
        None => finalize_child_response(engine, serial, md, None, vec![]),
    }
}

/// IKE rekey requests always carry a KE, start our half
fn respond_rekey_ike(engine: &mut Engine, serial: Serial, md: MessageDigest) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let conn = sa.conn.clone();
    let Some(offer) = md.sa() else {
        return Outcome::Ignore;
    };
    if proposals::select_ike(&conn.ike, offer).is_none() {
        engine.send_notify_response(
            serial,
            ExchangeType::CreateChildSa,
            md.message_id,
            NotifyType::NoProposalChosen,
        );
        return Outcome::Ok;
    }
    let Some(ke) = md.ke() else {
        engine.send_notify_response(
            serial,
            ExchangeType::CreateChildSa,
            md.message_id,
            NotifyType::InvalidSyntax,
        );
        return Outcome::Ok;
    };
    let group = ke.group;
    if !conn.ike.key_exchange.contains(&group) {
        let wanted = conn.ike.key_exchange.first().copied();
        if let Some(wanted) = wanted {
            let payloads = vec![Payload::Notify(Notification::with_data(
                NotifyType::InvalidKePayload,
                (wanted as u16).to_be_bytes().to_vec(),
            ))];
            if let Err(error) = engine.seal_and_respond(
                serial,
                ExchangeType::CreateChildSa,
                md.message_id,
                &payloads,
            ) {
                debug!("Failed to refuse the rekey group on {serial}: {error}");
            }
        }
        return Outcome::Ok;
    }
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.pending = Some(Pending::RespondChildKe { md });
    }
    engine.submit(serial, TaskKind::KeGen { group });
    Outcome::Suspend
}

/// Our KE for the CREATE_CHILD_SA response is ready
pub(crate) fn respond_child_ke_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    public: Vec<u8>,
    secret: KeSecret,
) {
    let Some(ke) = md.ke() else {
        engine.teardown_ike(serial, false);
        return;
    };
    let group = ke.group;
    let peer_public = ke.data.clone();
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.pending = Some(Pending::RespondChildShared {
            md,
            local_public: public,
        });
    }
    engine.submit(
        serial,
        TaskKind::KeShared {
            group,
            secret,
            peer_public,
        },
    );
}

/// Shared secret for the CREATE_CHILD_SA response is ready
pub(crate) fn respond_child_shared_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    local_public: Vec<u8>,
    shared: SymKey,
) {
    let message_id = md.message_id;
    let outcome = match classify(engine, &md) {
        Ok(RequestShape::RekeyIke) => {
            finalize_rekey_ike_response(engine, serial, md, local_public, shared)
        }
        Ok(_) => finalize_child_response(engine, serial, md, Some(shared), local_public),
        Err(notify_type) => {
            engine.send_notify_response(
                serial,
                ExchangeType::CreateChildSa,
                message_id,
                notify_type,
            );
            Outcome::Ok
        }
    };
    engine.apply_outcome(serial, outcome, true, ExchangeType::CreateChildSa, message_id);
}

/// Install the child and answer (new child and child rekey)
fn finalize_child_response(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    pfs_shared: Option<SymKey>,
    local_public: Vec<u8>,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let conn = sa.conn.clone();
    let (Some(offer), Some(peer_nonce)) = (md.sa(), md.nonce()) else {
        return Outcome::Ignore;
    };
    let Some(selected) = proposals::select_child(&conn.esp, offer) else {
        engine.send_notify_response(
            serial,
            ExchangeType::CreateChildSa,
            md.message_id,
            NotifyType::NoProposalChosen,
        );
        return Outcome::Ok;
    };
    let Some(outbound_spi) = selected
        .spi
        .first_chunk::<4>()
        .map(|spi| u32::from_be_bytes(*spi))
    else {
        engine.send_notify_response(
            serial,
            ExchangeType::CreateChildSa,
            md.message_id,
            NotifyType::InvalidSyntax,
        );
        return Outcome::Ok;
    };
    let rekeyed = md
        .notify(NotifyType::RekeySa)
        .and_then(|n| n.spi.as_ref())
        .and_then(|spi| spi.first_chunk::<4>())
        .map(|spi| u32::from_be_bytes(*spi))
        .and_then(|spi| engine.store.child_by_outbound_spi(spi));

    let (ts_initiator, ts_responder) = match (md.ts_initiator(), md.ts_responder()) {
        (Some(ts_i), Some(ts_r)) => {
            if rekeyed.is_some() {
                // exactness was checked before the DH round trip
                (ts_i.clone(), ts_r.clone())
            } else {
                let narrowed_i = ts::narrow(&conn.remote_ts, ts_i);
                let narrowed_r = ts::narrow(&conn.local_ts, ts_r);
                if narrowed_i.is_empty() || narrowed_r.is_empty() {
                    engine.send_notify_response(
                        serial,
                        ExchangeType::CreateChildSa,
                        md.message_id,
                        NotifyType::TsUnacceptable,
                    );
                    return Outcome::Ok;
                }
                (narrowed_i, narrowed_r)
            }
        }
        _ => {
            engine.send_notify_response(
                serial,
                ExchangeType::CreateChildSa,
                md.message_id,
                NotifyType::TsUnacceptable,
            );
            return Outcome::Ok;
        }
    };

    let pfs_group = md.ke().map(|ke| ke.group);
    let transport = conn.transport_mode && md.notify(NotifyType::UseTransportMode).is_some();
    let child_serial = engine.store.next_serial();
    let inbound_spi = ikecrypto::nonce::random_child_spi();
    let local_nonce = ikecrypto::nonce::random_nonce();
    let child = ChildSa {
        serial: child_serial,
        parent: serial,
        role: Role::Responder,
        state: ChildSaState::Larval,
        algorithms: Some(selected.algorithms.clone()),
        inbound_spi,
        outbound_spi,
        pfs_group,
        local_ts: ts_responder.clone(),
        remote_ts: ts_initiator.clone(),
        transport_mode: transport,
        ipcomp_cpi: None,
        virtual_ip: None,
        predecessor: rekeyed,
        established_at: None,
        timer_generation: 0,
    };
    engine.store.insert_child(child);
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.children.push(child_serial);
        sa.pending = None;
    }

    if let Err(error) = install_child(
        engine,
        serial,
        child_serial,
        pfs_shared.as_ref(),
        (peer_nonce, &local_nonce),
    ) {
        warn!("Failed to install child {child_serial} on {serial}: {error}");
        engine.remove_child(child_serial, false);
        engine.send_notify_response(
            serial,
            ExchangeType::CreateChildSa,
            md.message_id,
            NotifyType::NoProposalChosen,
        );
        return Outcome::Ok;
    }

    let mut payloads = vec![
        Payload::SecurityAssociation(proposals::accepted_child_sa(
            &selected,
            inbound_spi,
            pfs_group,
        )),
        Payload::Nonce(local_nonce),
    ];
    if let (Some(group), false) = (pfs_group, local_public.is_empty()) {
        payloads.push(Payload::KeyExchange(KeyExchange {
            group,
            data: local_public,
        }));
    }
    payloads.push(Payload::TrafficSelectorsInitiator(ts_initiator));
    payloads.push(Payload::TrafficSelectorsResponder(ts_responder));

    if let Err(error) =
        engine.seal_and_respond(serial, ExchangeType::CreateChildSa, md.message_id, &payloads)
    {
        warn!("Failed to answer CREATE_CHILD_SA on {serial}: {error}");
        engine.remove_child(child_serial, true);
        return Outcome::Fatal;
    }
    if let Some(old) = rekeyed {
        info!("Child {old} rekeyed by the peer, expiring it after the grace window");
        engine.expire_predecessor(old);
    }
    Outcome::Ok
}

/// Build the replacement IKE SA and answer (IKE rekey)
fn finalize_rekey_ike_response(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    local_public: Vec<u8>,
    shared: SymKey,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let conn = sa.conn.clone();
    let (local_addr, peer_addr) = (sa.local_addr, sa.peer_addr);
    let (Some(offer), Some(peer_nonce)) = (md.sa(), md.nonce().map(|n| n.to_vec())) else {
        return Outcome::Ignore;
    };
    let Some(selected) = proposals::select_ike(&conn.ike, offer) else {
        engine.send_notify_response(
            serial,
            ExchangeType::CreateChildSa,
            md.message_id,
            NotifyType::NoProposalChosen,
        );
        return Outcome::Ok;
    };
    let Some(group) = md.ke().map(|ke| ke.group) else {
        return Outcome::Ignore;
    };

    let new_serial = engine.store.next_serial();
    let responder_spi = ikecrypto::nonce::random_ike_spi();
    let local_nonce = ikecrypto::nonce::random_nonce();
    let now = engine.now();
    let mut replacement = blank_ike_sa(
        new_serial,
        Role::Responder,
        conn.clone(),
        0, // the peer's new initiator SPI is patched in during emancipation
        responder_spi,
        local_addr,
        peer_addr,
        now,
    );
    replacement.dh_group = Some(group);
    engine.store.insert_ike(replacement);

    // the old SA stays the owner until the answer is on the wire; only then
    // does the replacement take over
    let payloads = vec![
        Payload::SecurityAssociation(proposals::accepted_ike_sa(
            &selected,
            Some(responder_spi.to_be_bytes().to_vec()),
        )),
        Payload::Nonce(local_nonce.clone()),
        Payload::KeyExchange(KeyExchange {
            group,
            data: local_public,
        }),
    ];
    if let Err(error) =
        engine.seal_and_respond(serial, ExchangeType::CreateChildSa, md.message_id, &payloads)
    {
        warn!("Failed to answer the IKE rekey on {serial}: {error}");
        engine.teardown_ike(new_serial, false);
        return Outcome::Fatal;
    }

    if let Err(error) = emancipate_rekeyed_ike(
        engine,
        serial,
        new_serial,
        &md,
        &local_nonce,
        &peer_nonce,
        &shared,
        Role::Responder,
    ) {
        warn!("IKE rekey emancipation on {serial} failed: {error}");
        engine.teardown_ike(new_serial, false);
        return Outcome::Ok;
    }
    Outcome::Ok
}
