//! The IKE_SA_INIT exchange: proposal and key exchange negotiation, cookie
//! challenges and INVALID_KE_PAYLOAD recovery

use ikecrypto::dh::KeSecret;
use ikecrypto::SymKey;
use ikewire::definitions::params::{
    ExchangeType, KeyExchangeMethod, NotifyType, SignatureHashAlgorithm,
};
use ikewire::definitions::{KeyExchange, Message, Notification, Payload};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::handlers::{blank_ike_sa, detect_nat, record_peer_support};
use crate::impair::SendImpairment;
use crate::keymat;
use crate::md::MessageDigest;
use crate::nat;
use crate::proposals;
use crate::state::{IkeSaState, Pending, Role, Serial};
use crate::tasks::TaskKind;
use crate::transitions::Outcome;

/// Hashes announced in SIGNATURE_HASH_ALGORITHMS; SHA-1 stays out (RFC 8247)
const OFFERED_SIGNATURE_HASHES: [SignatureHashAlgorithm; 3] = [
    SignatureHashAlgorithm::Sha2_256,
    SignatureHashAlgorithm::Sha2_384,
    SignatureHashAlgorithm::Sha2_512,
];

fn signature_hash_notify() -> Notification {
    let mut data = vec![];
    for hash in OFFERED_SIGNATURE_HASHES {
        data.extend_from_slice(&(hash as u16).to_be_bytes());
    }
    Notification::with_data(NotifyType::SignatureHashAlgorithms, data)
}

/// Apply the KE payload impair knob while emitting
fn push_ke_payload(engine: &Engine, payloads: &mut Vec<Payload>, ke: KeyExchange) {
    match engine.impair.ke_payload {
        SendImpairment::Normal => payloads.push(Payload::KeyExchange(ke)),
        SendImpairment::Omit => warn!("IMPAIR: omitting KE payload"),
        SendImpairment::Empty => {
            warn!("IMPAIR: sending empty KE payload");
            payloads.push(Payload::KeyExchange(KeyExchange {
                group: ke.group,
                data: vec![],
            }));
        }
        SendImpairment::Duplicate => {
            warn!("IMPAIR: duplicating KE payload");
            payloads.push(Payload::KeyExchange(ke.clone()));
            payloads.push(Payload::KeyExchange(ke));
        }
    }
}

// ---------------------------------------------------------------------------
// initiator
// ---------------------------------------------------------------------------

/// Admin entry: create the SA and start computing KE and nonce
pub(crate) fn start_initiator(
    engine: &mut Engine,
    conn: std::sync::Arc<crate::config::ConnectionConfig>,
) -> Result<Serial, EngineError> {
    let group = *conn
        .ike
        .key_exchange
        .first()
        .ok_or_else(|| EngineError::Misconfigured("no IKE key exchange method".into()))?;

    let serial = engine.store.next_serial();
    let initiator_spi = engine
        .impair
        .ike_initiator_spi
        .unwrap_or_else(ikecrypto::nonce::random_ike_spi);
    let local_addr = engine.config.local_addr;
    let peer_addr = conn.peer_addr;
    let now = engine.now();

    info!("Initiating IKE SA {serial} for connection {:?}", conn.name);
    let mut sa = blank_ike_sa(
        serial,
        Role::Initiator,
        conn,
        initiator_spi,
        0,
        local_addr,
        peer_addr,
        now,
    );
    sa.state = IkeSaState::InitPreparing;
    sa.dh_group = Some(group);
    sa.local_nonce = ikecrypto::nonce::random_nonce();
    sa.pending = Some(Pending::InitKe);
    engine.store.insert_ike(sa);
    engine.submit(serial, TaskKind::KeGen { group });
    Ok(serial)
}

/// KE and nonce are ready, put the first request on the wire
pub(crate) fn init_ke_done(
    engine: &mut Engine,
    serial: Serial,
    public: Vec<u8>,
    secret: KeSecret,
) {
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.local_ke_public = public;
        sa.ke_secret = Some(secret);
    }
    send_init_request(engine, serial);
}

/// Build and send (or re-send after cookie/INVALID_KE) the IKE_SA_INIT
/// request; always message ID zero
fn send_init_request(engine: &mut Engine, serial: Serial) {
    let Some(sa) = engine.store.ike(serial) else {
        return;
    };
    let conn = sa.conn.clone();
    let Some(group) = sa.dh_group else {
        return;
    };

    let mut payloads = vec![];
    if let Some(cookie) = &sa.cookie {
        payloads.push(Payload::Notify(Notification::with_data(
            NotifyType::Cookie,
            cookie.clone(),
        )));
    }
    payloads.push(Payload::SecurityAssociation(proposals::build_offer(
        &conn.ike,
        ikewire::definitions::params::SecurityProtocol::InternetKeyExchange,
        None,
    )));
    push_ke_payload(
        engine,
        &mut payloads,
        KeyExchange {
            group,
            data: sa.local_ke_public.clone(),
        },
    );
    payloads.push(Payload::Nonce(sa.local_nonce.clone()));
    payloads.push(Payload::Notify(Notification::with_data(
        NotifyType::NatDetectionSourceIp,
        nat::nat_detection_hash(sa.initiator_spi, 0, sa.local_addr),
    )));
    payloads.push(Payload::Notify(Notification::with_data(
        NotifyType::NatDetectionDestinationIp,
        nat::nat_detection_hash(sa.initiator_spi, 0, sa.peer_addr),
    )));
    if conn.fragmentation {
        payloads.push(Payload::Notify(Notification::bare(
            NotifyType::FragmentationSupported,
        )));
    }
    if conn.ppk != crate::config::PpkPolicy::Never {
        payloads.push(Payload::Notify(Notification::bare(NotifyType::UsePpk)));
    }
    if conn.intermediate_ke.is_some() {
        payloads.push(Payload::Notify(Notification::bare(
            NotifyType::IntermediateExchangeSupported,
        )));
    }
    if conn.accept_redirects {
        payloads.push(Payload::Notify(Notification::bare(
            NotifyType::RedirectSupported,
        )));
    }
    if !engine.impair.omit_hash_notify {
        payloads.push(Payload::Notify(signature_hash_notify()));
    } else {
        warn!("IMPAIR: omitting SIGNATURE_HASH_ALGORITHMS notify");
    }

    let message = Message {
        initiator_spi: sa.initiator_spi,
        responder_spi: 0,
        exchange_type: ExchangeType::IkeSaInit,
        initiator: true,
        response: false,
        message_id: 0,
        payloads,
    };
    let peer = sa.peer_addr;
    let bytes = match message.try_build() {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!("Failed to build IKE_SA_INIT request for {serial}: {error}");
            engine.teardown_ike(serial, false);
            return;
        }
    };

    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.first_packet_local = bytes.clone();
        sa.state = IkeSaState::InitSent;
        sa.next_request_id = 1;
        sa.pending = None;
    }
    engine.register_outstanding(serial, 0, vec![bytes.clone()]);
    engine.send_raw(peer, bytes);
}

/// The responder wants a cookie; echo it in a fresh attempt
pub(crate) fn process_init_cookie(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let Some(sa) = engine.store.ike_mut(serial) else {
        return Outcome::Ignore;
    };
    if sa.cookie.is_some() {
        // a second challenge in a row won't converge, give up
        debug!("Repeated cookie challenge on {serial}");
        return Outcome::Fatal;
    }
    let Some(cookie) = md.notify(NotifyType::Cookie) else {
        return Outcome::Ignore;
    };
    if cookie.data.is_empty() || cookie.data.len() > 64 {
        return Outcome::Fatal;
    }
    info!("Peer of {serial} demands a cookie, retrying IKE_SA_INIT");
    sa.cookie = Some(cookie.data.clone());
    send_init_request(engine, serial);
    Outcome::Ok
}

/// The responder rejected our KE group and suggested another
pub(crate) fn process_init_invalid_ke(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let limit = engine.config.invalid_ke_limit;
    let Some(sa) = engine.store.ike_mut(serial) else {
        return Outcome::Ignore;
    };
    sa.invalid_ke_count += 1;
    if sa.invalid_ke_count > limit {
        debug!("Ignoring INVALID_KE_PAYLOAD on {serial}, received too many (DoS?)");
        return Outcome::Ignore;
    }

    let Some(notification) = md.notify(NotifyType::InvalidKePayload) else {
        return Outcome::Ignore;
    };
    let suggested = notification
        .data
        .first_chunk::<2>()
        .map(|raw| u16::from_be_bytes(*raw))
        .and_then(|raw| KeyExchangeMethod::try_from(raw).ok());
    let Some(suggested) = suggested else {
        debug!("INVALID_KE_PAYLOAD on {serial} without a usable suggestion");
        return Outcome::Ignore;
    };
    if !sa.conn.ike.key_exchange.contains(&suggested) || Some(suggested) == sa.dh_group {
        info!(
            "Discarding unauthenticated INVALID_KE_PAYLOAD on {serial}; suggested group {suggested:?} is not acceptable"
        );
        return Outcome::Ignore;
    }

    info!(
        "Received unauthenticated INVALID_KE_PAYLOAD on {serial}; resending with suggested group {suggested:?}"
    );
    sa.dh_group = Some(suggested);
    sa.state = IkeSaState::InitPreparing;
    sa.pending = Some(Pending::InitKe);
    engine.submit(serial, TaskKind::KeGen { group: suggested });
    Outcome::Suspend
}

/// The responder redirected us to another gateway before any state existed
pub(crate) fn process_init_redirect(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    if !sa.conn.accept_redirects {
        debug!("Ignoring REDIRECT on {serial}, policy refuses redirects");
        return Outcome::Ignore;
    }
    let conn_name = sa.conn.name.clone();
    let Some(gateway) = md
        .notify(NotifyType::Redirect)
        .and_then(|notification| crate::handlers::parse_redirect_gateway(&notification.data))
    else {
        return Outcome::Ignore;
    };
    info!("Following REDIRECT of {serial} to {gateway}");
    engine.teardown_ike(serial, false);
    if let Err(error) = engine.initiate_toward(&conn_name, gateway) {
        warn!("Re-initiation after REDIRECT failed: {error}");
    }
    Outcome::Ok
}

/// The real IKE_SA_INIT response: check the choice, start the DH
pub(crate) fn process_init_response(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let conn = sa.conn.clone();

    let Some(offer) = md.sa() else {
        return Outcome::Fatal;
    };
    let Some(selected) = proposals::select_ike(&conn.ike, offer) else {
        debug!("Responder of {serial} chose a suite outside our policy");
        return Outcome::Fatal;
    };
    let Some(ke) = md.ke() else {
        return Outcome::Fatal;
    };
    if Some(ke.group) != sa.dh_group || ke.group != selected.algorithms.key_exchange {
        debug!("Responder of {serial} answered with a different KE group");
        return Outcome::Fatal;
    }
    let Some(nonce) = md.nonce() else {
        return Outcome::Fatal;
    };
    if nonce.len() < 16 || nonce.len() > 256 {
        return Outcome::Fatal;
    }
    let Some(secret) = engine
        .store
        .ike(serial)
        .and_then(|sa| sa.ke_secret.clone())
    else {
        return Outcome::Fatal;
    };

    let group = ke.group;
    let peer_public = ke.data.clone();
    let nat = detect_nat(&md, engine.config.local_addr);
    let old_pair = (md.initiator_spi, 0);
    {
        let Some(sa) = engine.store.ike_mut(serial) else {
            return Outcome::Ignore;
        };
        sa.algorithms = Some(selected.algorithms.clone());
        sa.peer_nonce = nonce.to_vec();
        sa.peer_ke_public = peer_public.clone();
        sa.responder_spi = md.responder_spi;
        sa.first_packet_peer = md.raw.clone();
        sa.nat_detected = nat;
        record_peer_support(sa, &md);
        sa.pending = Some(Pending::InitShared { md });
    }
    engine.store.reindex_ike(serial, old_pair);
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

/// The DH finished on the initiator: derive keys, move on to the next
/// exchange
pub(crate) fn init_shared_done(
    engine: &mut Engine,
    serial: Serial,
    _md: MessageDigest,
    shared: SymKey,
) {
    if derive_initial_keys(engine, serial, &shared).is_err() {
        engine.teardown_ike(serial, false);
        return;
    }
    let continue_intermediate = engine
        .store
        .ike(serial)
        .map(|sa| sa.conn.intermediate_ke.is_some() && sa.peer_support.intermediate)
        .unwrap_or(false);
    if continue_intermediate {
        crate::handlers::ike_intermediate::start_intermediate(engine, serial);
    } else {
        crate::handlers::ike_auth::start_auth(engine, serial);
    }
}

fn derive_initial_keys(
    engine: &mut Engine,
    serial: Serial,
    shared: &SymKey,
) -> Result<(), EngineError> {
    let Some(sa) = engine.store.ike_mut(serial) else {
        return Err(EngineError::UnknownState(serial));
    };
    let algorithms = sa
        .algorithms
        .clone()
        .ok_or(EngineError::NotEstablished(serial))?;
    let (ni, nr) = match sa.role {
        Role::Initiator => (sa.local_nonce.clone(), sa.peer_nonce.clone()),
        Role::Responder => (sa.peer_nonce.clone(), sa.local_nonce.clone()),
    };
    let skeyseed = keymat::skeyseed_initial(algorithms.prf, (&ni, &nr), shared)?;
    let keys = keymat::derive_ike_keys(
        &algorithms,
        &skeyseed,
        &ni,
        &nr,
        sa.initiator_spi,
        sa.responder_spi,
    )?;
    sa.keys = Some(keys);
    sa.ke_secret = None;
    Ok(())
}

// ---------------------------------------------------------------------------
// responder
// ---------------------------------------------------------------------------

/// First contact from an unknown initiator: stateless gates, then state
pub(crate) fn handle_first_contact(engine: &mut Engine, md: MessageDigest) {
    let Some(conn) = engine.connection_for_sender(md.sender) else {
        debug!("IKE_SA_INIT from {} but no connection configured", md.sender);
        return;
    };
    let header = summary_header(&md);

    let (Some(offer), Some(ke), Some(nonce)) = (md.sa(), md.ke(), md.nonce()) else {
        debug!("IKE_SA_INIT from {} lacks mandatory payloads", md.sender);
        return;
    };
    if nonce.len() < 16 || nonce.len() > 256 {
        debug!("IKE_SA_INIT from {} carries an illegal nonce", md.sender);
        return;
    }

    // cookie gate: under load, prove reachability before any state exists
    if engine.store.half_open_count() >= engine.config.cookie_threshold {
        let expected = nat::compute_cookie(
            &engine.cookie_secret,
            nonce,
            md.initiator_spi,
            md.sender,
        );
        let echoed = md.notify(NotifyType::Cookie).map(|n| n.data.clone());
        if echoed.as_deref() != Some(expected.as_slice()) {
            info!("Overloaded, challenging {} with a cookie", md.sender);
            engine.send_init_reject(
                md.sender,
                &header,
                Notification::with_data(NotifyType::Cookie, expected),
            );
            return;
        }
    }

    let Some(selected) = proposals::select_ike(&conn.ike, offer) else {
        info!("No proposal chosen for IKE_SA_INIT from {}", md.sender);
        engine.send_init_reject(
            md.sender,
            &header,
            Notification::bare(NotifyType::NoProposalChosen),
        );
        return;
    };
    if ke.group != selected.algorithms.key_exchange {
        info!(
            "Initiator guessed wrong keying material group ({:?}); responding with INVALID_KE_PAYLOAD requesting {:?}",
            ke.group, selected.algorithms.key_exchange
        );
        engine.send_init_reject(
            md.sender,
            &header,
            Notification::with_data(
                NotifyType::InvalidKePayload,
                (selected.algorithms.key_exchange as u16).to_be_bytes().to_vec(),
            ),
        );
        return;
    }

    let serial = engine.store.next_serial();
    let responder_spi = engine
        .impair
        .ike_responder_spi
        .unwrap_or_else(ikecrypto::nonce::random_ike_spi);
    let local_addr = engine.config.local_addr;
    let now = engine.now();
    info!("Responding to IKE_SA_INIT from {} as {serial}", md.sender);

    let mut sa = blank_ike_sa(
        serial,
        Role::Responder,
        conn,
        md.initiator_spi,
        responder_spi,
        local_addr,
        md.sender,
        now,
    );
    sa.algorithms = Some(selected.algorithms.clone());
    sa.dh_group = Some(selected.algorithms.key_exchange);
    sa.local_nonce = ikecrypto::nonce::random_nonce();
    sa.peer_nonce = nonce.to_vec();
    sa.peer_ke_public = ke.data.clone();
    sa.first_packet_peer = md.raw.clone();
    sa.nat_detected = detect_nat(&md, local_addr);
    record_peer_support(&mut sa, &md);
    engine.store.insert_ike(sa);

    let group = selected.algorithms.key_exchange;
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.pending = Some(Pending::RespondInitKe { md });
    }
    engine.submit(serial, TaskKind::KeGen { group });
}

/// The dispatcher's table entry for a request on a freshly created SA; the
/// actual work happened in [handle_first_contact], so a direct hit here
/// means a confused peer
pub(crate) fn process_init_request(
    _engine: &mut Engine,
    serial: Serial,
    _md: MessageDigest,
) -> Outcome {
    debug!("Duplicate IKE_SA_INIT request for {serial} while preparing, dropping");
    Outcome::Ignore
}

/// Our KE is ready, combine with the initiator's public value
pub(crate) fn respond_init_ke_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    public: Vec<u8>,
    secret: KeSecret,
) {
    let Some(sa) = engine.store.ike_mut(serial) else {
        return;
    };
    sa.local_ke_public = public;
    sa.ke_secret = Some(secret.clone());
    let Some(group) = sa.dh_group else {
        engine.teardown_ike(serial, false);
        return;
    };
    let peer_public = sa.peer_ke_public.clone();
    sa.pending = Some(Pending::RespondInitShared { md });
    engine.submit(
        serial,
        TaskKind::KeShared {
            group,
            secret,
            peer_public,
        },
    );
}

/// DH done on the responder: derive keys and answer the initiator
pub(crate) fn respond_init_shared_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    shared: SymKey,
) {
    if derive_initial_keys(engine, serial, &shared).is_err() {
        engine.teardown_ike(serial, false);
        return;
    }
    let Some(sa) = engine.store.ike(serial) else {
        return;
    };
    let conn = sa.conn.clone();

    let Some(selected) = md.sa().and_then(|offer| proposals::select_ike(&conn.ike, offer)) else {
        engine.teardown_ike(serial, false);
        return;
    };

    let mut payloads = vec![Payload::SecurityAssociation(proposals::accepted_ike_sa(
        &selected, None,
    ))];
    push_ke_payload(
        engine,
        &mut payloads,
        KeyExchange {
            group: selected.algorithms.key_exchange,
            data: sa.local_ke_public.clone(),
        },
    );
    payloads.push(Payload::Nonce(sa.local_nonce.clone()));
    payloads.push(Payload::Notify(Notification::with_data(
        NotifyType::NatDetectionSourceIp,
        nat::nat_detection_hash(sa.initiator_spi, sa.responder_spi, sa.local_addr),
    )));
    payloads.push(Payload::Notify(Notification::with_data(
        NotifyType::NatDetectionDestinationIp,
        nat::nat_detection_hash(sa.initiator_spi, sa.responder_spi, sa.peer_addr),
    )));
    if conn.fragmentation && sa.peer_support.fragmentation {
        payloads.push(Payload::Notify(Notification::bare(
            NotifyType::FragmentationSupported,
        )));
    }
    if conn.ppk != crate::config::PpkPolicy::Never && sa.peer_support.ppk {
        payloads.push(Payload::Notify(Notification::bare(NotifyType::UsePpk)));
    }
    if conn.intermediate_ke.is_some() && sa.peer_support.intermediate {
        payloads.push(Payload::Notify(Notification::bare(
            NotifyType::IntermediateExchangeSupported,
        )));
    }
    if !engine.impair.omit_hash_notify {
        payloads.push(Payload::Notify(signature_hash_notify()));
    }

    let message = Message {
        initiator_spi: sa.initiator_spi,
        responder_spi: sa.responder_spi,
        exchange_type: ExchangeType::IkeSaInit,
        initiator: false,
        response: true,
        message_id: md.message_id,
        payloads,
    };
    let peer = sa.peer_addr;
    let bytes = match message.try_build() {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!("Failed to build IKE_SA_INIT response for {serial}: {error}");
            engine.teardown_ike(serial, false);
            return;
        }
    };

    let message_id = md.message_id;
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.first_packet_local = bytes.clone();
        sa.state = IkeSaState::RespondedInit;
        sa.pending = None;
    }
    engine.cache_response(serial, message_id, vec![bytes.clone()]);
    engine.send_raw(peer, bytes);
    engine.schedule_half_open_reap(serial);
}

/// Rebuild the header view a stateless reject needs from a digest
fn summary_header(md: &MessageDigest) -> ikewire::parser::RawHeader {
    ikewire::parser::RawHeader {
        initiator_spi: md.initiator_spi,
        responder_spi: md.responder_spi,
        exchange_type: md.exchange_type as u8,
        initiator: md.from_initiator,
        response: md.response,
        message_id: md.message_id,
        length: md.raw.len() as u32,
    }
}
