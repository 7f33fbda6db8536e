//! The IKE_AUTH exchange: identity proof, PPK mixing, the first Child SA,
//! traffic selector narrowing and virtual address leases

use std::net::IpAddr;

use ikecrypto::prf::prf_chunks;
use ikecrypto::sign::{PrivateKey, PublicKey};
use ikecrypto::{CryptoError, SymKey};
use ikewire::definitions::params::{
    AuthMethod, CfgType, ConfigAttributeType, ExchangeType, NotifyType, SignatureHashAlgorithm,
};
use ikewire::definitions::{
    Authentication, ConfigAttribute, Configuration, Notification, Payload, TrafficSelector,
};
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, ConnectionConfig, PpkPolicy, SignKeyConfig};
use crate::engine::{Engine, EngineError};
use crate::handlers::{first_error_notify, install_child};
use crate::ifaces::{CertError, PeerCredential};
use crate::impair::SendImpairment;
use crate::keymat;
use crate::md::MessageDigest;
use crate::proposals;
use crate::state::{ChildSa, ChildSaState, IkeSaState, Pending, Role, Serial};
use crate::tasks::TaskKind;
use crate::transitions::Outcome;
use crate::ts;

/// The fixed pad of RFC 7296 section 2.15
const KEY_PAD: &[u8] = b"Key Pad for IKEv2";

/// AUTH data for the shared-secret methods: prf(prf(secret, pad), octets)
fn shared_key_auth(
    prf_alg: ikewire::definitions::params::PseudorandomFunction,
    secret: &[u8],
    octets: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = prf_chunks(prf_alg, secret, &[KEY_PAD])?;
    prf_chunks(prf_alg, &key, &[octets])
}

/// The octets every AUTH method signs: first packet, peer nonce, MACed ID
fn auth_octets(
    first_packet: &[u8],
    peer_nonce: &[u8],
    prf_alg: ikewire::definitions::params::PseudorandomFunction,
    sk_p: &SymKey,
    id_body: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let maced_id = prf_chunks(prf_alg, sk_p.as_bytes(), &[id_body])?;
    let mut octets =
        Vec::with_capacity(first_packet.len() + peer_nonce.len() + maced_id.len());
    octets.extend_from_slice(first_packet);
    octets.extend_from_slice(peer_nonce);
    octets.extend(maced_id);
    Ok(octets)
}

/// The wire method our configuration authenticates with
fn local_auth_method(auth: &AuthConfig) -> AuthMethod {
    match auth {
        AuthConfig::PreSharedKey { .. } => AuthMethod::SharedKeyMic,
        AuthConfig::Null => AuthMethod::NullAuthentication,
        AuthConfig::RsaSignature { .. } => AuthMethod::RsaDigitalSignature,
        AuthConfig::DigitalSignature { .. } => AuthMethod::DigitalSignature,
    }
}

/// Our signing key and the hash that goes with it
fn local_signing_key(auth: &AuthConfig) -> Option<(PrivateKey, SignatureHashAlgorithm)> {
    match auth {
        AuthConfig::RsaSignature { private_der } => PrivateKey::rsa_from_der(private_der)
            .ok()
            .map(|key| (key, SignatureHashAlgorithm::Sha2_256)),
        AuthConfig::DigitalSignature { key } => match key {
            SignKeyConfig::RsaDer(der) => PrivateKey::rsa_from_der(der)
                .ok()
                .map(|key| (key, SignatureHashAlgorithm::Sha2_256)),
            SignKeyConfig::Ed25519Seed(seed) => Some((
                PrivateKey::ed25519_from_seed(*seed),
                SignatureHashAlgorithm::Identity,
            )),
        },
        _ => None,
    }
}

/// Apply the AUTH payload impair knob while emitting
fn push_auth_payload(engine: &Engine, payloads: &mut Vec<Payload>, auth: Authentication) {
    match engine.impair.auth_payload {
        SendImpairment::Normal => payloads.push(Payload::Authentication(auth)),
        SendImpairment::Omit => warn!("IMPAIR: omitting AUTH payload"),
        SendImpairment::Empty => {
            warn!("IMPAIR: sending empty AUTH payload");
            payloads.push(Payload::Authentication(Authentication {
                method: auth.method,
                data: vec![],
            }));
        }
        SendImpairment::Duplicate => {
            warn!("IMPAIR: duplicating AUTH payload");
            payloads.push(Payload::Authentication(auth.clone()));
            payloads.push(Payload::Authentication(auth));
        }
    }
}

// ---------------------------------------------------------------------------
// initiator
// ---------------------------------------------------------------------------

/// Build the IKE_AUTH request; called once keys exist
pub(crate) fn start_auth(engine: &mut Engine, serial: Serial) {
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.state = IkeSaState::AuthPreparing;
    }
    // PPK first: it rewrites SK_d/SK_pi/SK_pr before any proof is computed
    if !apply_initiator_ppk(engine, serial) {
        engine.teardown_ike(serial, false);
        return;
    }

    let Some(sa) = engine.store.ike(serial) else {
        return;
    };
    let conn = sa.conn.clone();
    let Some(algorithms) = sa.algorithms.clone() else {
        engine.teardown_ike(serial, false);
        return;
    };
    let Some(keys) = sa.keys.clone() else {
        engine.teardown_ike(serial, false);
        return;
    };
    let id_body = conn.local_id.body();
    let octets = match auth_octets(
        &sa.first_packet_local,
        &sa.peer_nonce,
        algorithms.prf,
        &keys.sk_pi,
        &id_body,
    ) {
        Ok(octets) => octets,
        Err(error) => {
            warn!("Failed to compute AUTH octets on {serial}: {error}");
            engine.teardown_ike(serial, false);
            return;
        }
    };

    match &conn.auth {
        AuthConfig::PreSharedKey { secret } => {
            let auth_data = match shared_key_auth(algorithms.prf, secret, &octets) {
                Ok(data) => data,
                Err(error) => {
                    warn!("PSK AUTH computation failed on {serial}: {error}");
                    engine.teardown_ike(serial, false);
                    return;
                }
            };
            let no_ppk_auth = compute_no_ppk_auth(engine, serial, secret, &id_body);
            send_auth_request(
                engine,
                serial,
                Authentication {
                    method: AuthMethod::SharedKeyMic,
                    data: auth_data,
                },
                no_ppk_auth,
            );
        }
        AuthConfig::Null => {
            let auth_data = match shared_key_auth(algorithms.prf, keys.sk_pi.as_bytes(), &octets)
            {
                Ok(data) => data,
                Err(error) => {
                    warn!("NULL AUTH computation failed on {serial}: {error}");
                    engine.teardown_ike(serial, false);
                    return;
                }
            };
            send_auth_request(
                engine,
                serial,
                Authentication {
                    method: AuthMethod::NullAuthentication,
                    data: auth_data,
                },
                None,
            );
        }
        AuthConfig::RsaSignature { .. } | AuthConfig::DigitalSignature { .. } => {
            let Some((key, hash)) = local_signing_key(&conn.auth) else {
                warn!("Signing key of {serial} doesn't decode");
                engine.teardown_ike(serial, false);
                return;
            };
            if let Some(sa) = engine.store.ike_mut(serial) {
                sa.pending = Some(Pending::AuthSign);
            }
            engine.submit(serial, TaskKind::Sign { key, hash, octets });
        }
    }
}

/// PPK policy on the initiator: mix when available, fail when insisted upon.
/// Returns false when the SA must be torn down.
fn apply_initiator_ppk(engine: &mut Engine, serial: Serial) -> bool {
    let Some(sa) = engine.store.ike(serial) else {
        return false;
    };
    let conn = sa.conn.clone();
    if conn.ppk == PpkPolicy::Never || !sa.peer_support.ppk {
        return true;
    }
    if !matches!(conn.auth, AuthConfig::PreSharedKey { .. }) {
        debug!("PPK is only combined with shared-key authentication, skipping");
        return true;
    }
    let secret = conn
        .ppk_id
        .as_ref()
        .and_then(|id| engine.ppks.lookup_by_id(id));
    match secret {
        Some(ppk) => {
            let Some(sa) = engine.store.ike_mut(serial) else {
                return false;
            };
            let Some(algorithms) = sa.algorithms.clone() else {
                return false;
            };
            let Some(keys) = sa.keys.as_mut() else {
                return false;
            };
            match keymat::mix_ppk(algorithms.prf, &ppk, keys) {
                Ok(shadow) => {
                    info!("PPK AUTH calculated as initiator on {serial}");
                    sa.no_ppk_keys = Some(shadow);
                    sa.ppk_used = true;
                    true
                }
                Err(error) => {
                    warn!("PPK mixing failed on {serial}: {error}");
                    false
                }
            }
        }
        None if conn.ppk == PpkPolicy::Insist => {
            warn!("Connection requires PPK, but we didn't find one");
            false
        }
        None => {
            debug!("Failed to find PPK and PPK_ID, continuing without PPK");
            true
        }
    }
}

/// The NO_PPK_AUTH fallback value, computed with the shadow SK_pi
fn compute_no_ppk_auth(
    engine: &Engine,
    serial: Serial,
    secret: &[u8],
    id_body: &[u8],
) -> Option<Vec<u8>> {
    let sa = engine.store.ike(serial)?;
    if !sa.ppk_used || sa.conn.ppk != PpkPolicy::Allow {
        return None;
    }
    let shadow = sa.no_ppk_keys.as_ref()?;
    let algorithms = sa.algorithms.as_ref()?;
    let octets = auth_octets(
        &sa.first_packet_local,
        &sa.peer_nonce,
        algorithms.prf,
        &shadow.sk_pi,
        id_body,
    )
    .ok()?;
    shared_key_auth(algorithms.prf, secret, &octets).ok()
}

/// The asymmetric signature came back from the worker
pub(crate) fn auth_sign_done(engine: &mut Engine, serial: Serial, signature: Vec<u8>) {
    let Some(sa) = engine.store.ike(serial) else {
        return;
    };
    let conn = sa.conn.clone();
    let auth = match &conn.auth {
        AuthConfig::RsaSignature { .. } => Authentication {
            method: AuthMethod::RsaDigitalSignature,
            data: signature,
        },
        AuthConfig::DigitalSignature { .. } => {
            let Some((key, hash)) = local_signing_key(&conn.auth) else {
                engine.teardown_ike(serial, false);
                return;
            };
            let Ok(algorithm) = ikecrypto::sign::digsig_algorithm(&key, hash) else {
                engine.teardown_ike(serial, false);
                return;
            };
            Authentication {
                method: AuthMethod::DigitalSignature,
                data: ikecrypto::sign::encode_digsig(algorithm, &signature),
            }
        }
        _ => {
            engine.teardown_ike(serial, false);
            return;
        }
    };
    send_auth_request(engine, serial, auth, None);
}

/// Assemble and send the full IKE_AUTH request with the first Child SA
fn send_auth_request(
    engine: &mut Engine,
    serial: Serial,
    auth: Authentication,
    no_ppk_auth: Option<Vec<u8>>,
) {
    let Some(sa) = engine.store.ike(serial) else {
        return;
    };
    let conn = sa.conn.clone();
    let ppk_used = sa.ppk_used;

    // the first Child SA rides along; larval until the response confirms it
    let child_serial = engine.store.next_serial();
    let inbound_spi = ikecrypto::nonce::random_child_spi();
    let child = ChildSa {
        serial: child_serial,
        parent: serial,
        role: Role::Initiator,
        state: ChildSaState::Larval,
        algorithms: None,
        inbound_spi,
        outbound_spi: 0,
        pfs_group: None,
        local_ts: conn.local_ts.clone(),
        remote_ts: conn.remote_ts.clone(),
        transport_mode: conn.transport_mode,
        ipcomp_cpi: None,
        virtual_ip: None,
        predecessor: None,
        established_at: None,
        timer_generation: 0,
    };
    engine.store.insert_child(child);
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.children.push(child_serial);
        sa.pending = None;
    }

    let mut payloads = vec![Payload::IdentificationInitiator(conn.local_id.clone())];
    push_auth_payload(engine, &mut payloads, auth);
    if conn.send_initial_contact {
        payloads.push(Payload::Notify(Notification::bare(NotifyType::InitialContact)));
    }
    if ppk_used {
        if let Some(ppk_id) = &conn.ppk_id {
            payloads.push(Payload::Notify(Notification::with_data(
                NotifyType::PpkIdentity,
                ppk_id.clone(),
            )));
        }
        if let Some(no_ppk) = no_ppk_auth {
            payloads.push(Payload::Notify(Notification::with_data(
                NotifyType::NoPpkAuth,
                no_ppk,
            )));
        }
    }
    if conn.mobike {
        payloads.push(Payload::Notify(Notification::bare(NotifyType::MobikeSupported)));
    }
    if conn.request_virtual_ip {
        payloads.push(Payload::Configuration(Configuration {
            cfg_type: CfgType::Request,
            attributes: vec![ConfigAttribute {
                attribute_type: ConfigAttributeType::InternalIp4Address,
                value: vec![],
            }],
        }));
    }

    // ESP offer: the AUTH child is keyed from SK_d alone, no PFS transform
    let mut esp_policy = conn.esp.clone();
    esp_policy.key_exchange.clear();
    payloads.push(Payload::SecurityAssociation(proposals::build_offer(
        &esp_policy,
        ikewire::definitions::params::SecurityProtocol::EncapsulatingSecurityPayload,
        Some(inbound_spi.to_be_bytes().to_vec()),
    )));
    payloads.push(Payload::TrafficSelectorsInitiator(conn.local_ts.clone()));
    payloads.push(Payload::TrafficSelectorsResponder(conn.remote_ts.clone()));
    if conn.transport_mode {
        payloads.push(Payload::Notify(Notification::bare(NotifyType::UseTransportMode)));
    }
    if conn.ipcomp {
        let mut data = ((inbound_spi & 0xffff) as u16).to_be_bytes().to_vec();
        data.push(2); // IPCOMP_DEFLATE
        payloads.push(Payload::Notify(Notification::with_data(
            NotifyType::IpcompSupported,
            data,
        )));
    }

    match engine.seal_and_send_request(serial, ExchangeType::IkeAuth, &payloads) {
        Ok(_) => {
            if let Some(sa) = engine.store.ike_mut(serial) {
                sa.state = IkeSaState::AuthSent;
            }
        }
        Err(error) => {
            warn!("Failed to send IKE_AUTH request on {serial}: {error}");
            engine.teardown_ike(serial, false);
        }
    }
}

/// The IKE_AUTH response arrived
pub(crate) fn process_auth_response(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    if let Some(error) = first_error_notify(&md) {
        // credentials cannot change, retrying is pointless
        info!("IKE_AUTH on {serial} failed: peer answered {error:?}");
        return Outcome::Fatal;
    }
    let (Some(_), Some(auth)) = (md.id_responder(), md.auth()) else {
        return Outcome::Fatal;
    };

    // the responder not confirming PPK use forces the no-PPK shadow back in
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let conn = sa.conn.clone();
    if sa.ppk_used && md.notify(NotifyType::PpkIdentity).is_none() {
        if conn.ppk == PpkPolicy::Insist {
            info!("Responder of {serial} ignored our PPK but policy insists");
            return Outcome::Fatal;
        }
        let Some(sa) = engine.store.ike_mut(serial) else {
            return Outcome::Ignore;
        };
        if let (Some(shadow), Some(keys)) = (sa.no_ppk_keys.take(), sa.keys.as_mut()) {
            keys.sk_d = shadow.sk_d;
            keys.sk_pi = shadow.sk_pi;
            keys.sk_pr = shadow.sk_pr;
        }
        sa.ppk_used = false;
    }

    let auth_method = auth.method;
    match expected_peer_method(&conn.peer_auth) {
        method if method == auth_method => {}
        _ => {
            info!("Responder of {serial} used auth method {auth_method:?} against policy");
            return Outcome::Fatal;
        }
    }

    match &conn.peer_auth {
        AuthConfig::PreSharedKey { .. } | AuthConfig::Null => {
            match verify_peer_auth_inline(engine, serial, &md, None) {
                Ok(true) => finish_initiator_establish(engine, serial, md),
                Ok(false) => {
                    info!("Responder AUTH verification failed on {serial}");
                    Outcome::Fatal
                }
                Err(_) => Outcome::Fatal,
            }
        }
        AuthConfig::RsaSignature { .. } | AuthConfig::DigitalSignature { .. } => {
            let certificates = md.certificates();
            if !certificates.is_empty() {
                let authority = engine.certs.clone();
                if let Some(sa) = engine.store.ike_mut(serial) {
                    sa.pending = Some(Pending::AuthRespCerts { md });
                }
                engine.submit(
                    serial,
                    TaskKind::DecodeCerts {
                        chain: certificates,
                        authority,
                    },
                );
                Outcome::Suspend
            } else if engine
                .store
                .ike(serial)
                .map(|sa| sa.peer_key.is_some())
                .unwrap_or(false)
            {
                submit_peer_sig_verify(engine, serial, md, false)
            } else {
                // no credentials on the wire: fall back to a published key
                submit_ipseckey_lookup(engine, serial, md, false)
            }
        }
    }
}

fn expected_peer_method(auth: &AuthConfig) -> AuthMethod {
    local_auth_method(auth)
}

/// Certificates of the IKE_AUTH response decoded
pub(crate) fn auth_resp_certs_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    result: Result<PeerCredential, CertError>,
) {
    match accept_credential(engine, serial, &md, result, false) {
        Ok(()) => {
            let outcome = submit_peer_sig_verify(engine, serial, md, false);
            engine.apply_outcome(serial, outcome, false, ExchangeType::IkeAuth, 0);
        }
        Err(outcome) => engine.apply_outcome(serial, outcome, false, ExchangeType::IkeAuth, 0),
    }
}

/// The responder's signature checked out
pub(crate) fn auth_resp_verify_done(engine: &mut Engine, serial: Serial, md: MessageDigest) {
    let outcome = finish_initiator_establish(engine, serial, md);
    engine.apply_outcome(serial, outcome, false, ExchangeType::IkeAuth, 0);
}

/// Everything after the responder proved itself: first child, timers, done
fn finish_initiator_establish(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let conn = sa.conn.clone();
    let peer_id = md.id_responder().cloned();
    let (local_nonce, peer_nonce) = (sa.local_nonce.clone(), sa.peer_nonce.clone());
    let larval = sa
        .children
        .iter()
        .copied()
        .find(|child| {
            engine
                .store
                .child(*child)
                .map(|child| child.state == ChildSaState::Larval)
                .unwrap_or(false)
        });

    let now = engine.now();
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.peer_id = peer_id;
        sa.state = IkeSaState::Established;
        sa.established_at = Some(now);
        sa.peer_support.mobike |= md.notify(NotifyType::MobikeSupported).is_some();
    }
    engine.store.set_newest_ike(&conn.name, serial);
    engine.schedule_ike_lifetime(serial);
    engine.schedule_liveness(serial);
    info!("IKE SA {serial} established for connection {:?}", conn.name);

    let Some(child_serial) = larval else {
        return Outcome::Ok;
    };
    // a child error notify fails the child but leaves the IKE SA up
    if let Some(error) = first_error_notify(&md) {
        info!("First child of {serial} refused with {error:?}");
        engine.remove_child(child_serial, false);
        return Outcome::Ok;
    }

    let Some(offer) = md.sa() else {
        engine.remove_child(child_serial, false);
        return Outcome::Ok;
    };
    let Some(selected) = proposals::select_child(&conn.esp, offer) else {
        info!("Child answer of {serial} selects nothing we offered");
        engine.remove_child(child_serial, false);
        return Outcome::Ok;
    };
    let Some(outbound_spi) = selected
        .spi
        .first_chunk::<4>()
        .map(|spi| u32::from_be_bytes(*spi))
    else {
        engine.remove_child(child_serial, false);
        return Outcome::Ok;
    };

    let (Some(ts_initiator), Some(ts_responder)) = (md.ts_initiator(), md.ts_responder()) else {
        engine.remove_child(child_serial, false);
        return Outcome::Ok;
    };
    // the responder may only have narrowed what we proposed
    if !ts::set_is_subset(ts_initiator, &conn.local_ts)
        || !ts::set_is_subset(ts_responder, &conn.remote_ts)
    {
        info!("Responder widened the traffic selectors on {serial}, refusing the child");
        engine.remove_child(child_serial, false);
        return Outcome::Ok;
    }

    let virtual_ip = md.configuration().and_then(|cp| {
        if cp.cfg_type != CfgType::Reply {
            return None;
        }
        cp.attributes.iter().find_map(|attribute| {
            if attribute.attribute_type == ConfigAttributeType::InternalIp4Address {
                attribute
                    .value
                    .first_chunk::<4>()
                    .map(|raw| IpAddr::from(*raw))
            } else {
                None
            }
        })
    });
    if let Some(ip) = virtual_ip {
        info!("Responder of {serial} leased us {ip}");
    }
    let transport_confirmed = md.notify(NotifyType::UseTransportMode).is_some();
    let ipcomp_cpi = md.notify(NotifyType::IpcompSupported).and_then(|n| {
        n.data.first_chunk::<2>().map(|raw| u16::from_be_bytes(*raw))
    });

    if let Some(child) = engine.store.child_mut(child_serial) {
        child.algorithms = Some(selected.algorithms.clone());
        child.outbound_spi = outbound_spi;
        child.local_ts = ts_initiator.clone();
        child.remote_ts = ts_responder.clone();
        child.transport_mode = transport_confirmed;
        child.ipcomp_cpi = if conn.ipcomp { ipcomp_cpi } else { None };
        child.virtual_ip = virtual_ip;
    }
    if let Err(error) = install_child(
        engine,
        serial,
        child_serial,
        None,
        (&local_nonce, &peer_nonce),
    ) {
        warn!("Failed to install first child of {serial}: {error}");
        engine.remove_child(child_serial, false);
    }
    Outcome::Ok
}

// ---------------------------------------------------------------------------
// responder
// ---------------------------------------------------------------------------

/// The IKE_AUTH request arrived on a half-open SA
pub(crate) fn process_auth_request(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let Some(sa) = engine.store.ike_mut(serial) else {
        return Outcome::Ignore;
    };
    sa.peer_support.mobike |= md.notify(NotifyType::MobikeSupported).is_some();
    let conn = sa.conn.clone();

    // peer identity policy gate
    if let (Some(expected), Some(claimed)) = (&conn.peer_id, md.id_initiator()) {
        if expected != claimed {
            info!("Initiator of {serial} claims an identity outside policy");
            return Outcome::Fail(NotifyType::AuthenticationFailed);
        }
    }

    let needs_certs = matches!(
        conn.peer_auth,
        AuthConfig::RsaSignature { .. } | AuthConfig::DigitalSignature { .. }
    );
    let certificates = md.certificates();
    if needs_certs && !certificates.is_empty() {
        let authority = engine.certs.clone();
        if let Some(sa) = engine.store.ike_mut(serial) {
            sa.pending = Some(Pending::AuthReqCerts { md });
        }
        engine.submit(
            serial,
            TaskKind::DecodeCerts {
                chain: certificates,
                authority,
            },
        );
        return Outcome::Suspend;
    }
    continue_auth_request_verify(engine, serial, md)
}

/// Certificates of the IKE_AUTH request decoded
pub(crate) fn auth_req_certs_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    result: Result<PeerCredential, CertError>,
) {
    match accept_credential(engine, serial, &md, result, true) {
        Ok(()) => {
            let message_id = md.message_id;
            let outcome = continue_auth_request_verify(engine, serial, md);
            engine.apply_outcome(serial, outcome, true, ExchangeType::IkeAuth, message_id);
        }
        Err(outcome) => {
            let message_id = md.message_id;
            engine.apply_outcome(serial, outcome, true, ExchangeType::IkeAuth, message_id);
        }
    }
}

/// Shared credential checks of both directions
fn accept_credential(
    engine: &mut Engine,
    serial: Serial,
    md: &MessageDigest,
    result: Result<PeerCredential, CertError>,
    of_initiator: bool,
) -> Result<(), Outcome> {
    let credential = match result {
        Ok(credential) => credential,
        Err(error) => {
            info!("Certificate chain of {serial} refused: {error}");
            return Err(Outcome::Fail(NotifyType::AuthenticationFailed));
        }
    };
    let claimed = if of_initiator {
        md.id_initiator()
    } else {
        md.id_responder()
    };
    if let Some(claimed) = claimed {
        if claimed != &credential.identity {
            info!("Credentials of {serial} vouch for a different identity");
            return Err(Outcome::Fail(NotifyType::AuthenticationFailed));
        }
    }
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.peer_key = Some(credential.public_key);
    }
    Ok(())
}

/// PPK processing and AUTH verification of the initiator's request
fn continue_auth_request_verify(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let conn = sa.conn.clone();

    // RFC 8784: mix the PPK or fall back to NO_PPK_AUTH, policy deciding;
    // a second pass through here (after an async lookup) must not mix again
    let already_mixed = engine
        .store
        .ike(serial)
        .map(|sa| sa.ppk_used)
        .unwrap_or(false);
    let mut use_no_ppk_auth = false;
    if conn.ppk != PpkPolicy::Never && !already_mixed {
        match md.notify(NotifyType::PpkIdentity) {
            Some(identity) => match engine.ppks.lookup_by_id(&identity.data) {
                Some(ppk) => {
                    let Some(sa) = engine.store.ike_mut(serial) else {
                        return Outcome::Ignore;
                    };
                    let Some(algorithms) = sa.algorithms.clone() else {
                        return Outcome::Fatal;
                    };
                    let Some(keys) = sa.keys.as_mut() else {
                        return Outcome::Fatal;
                    };
                    match keymat::mix_ppk(algorithms.prf, &ppk, keys) {
                        Ok(shadow) => {
                            info!("PPK AUTH calculated as responder on {serial}");
                            sa.no_ppk_keys = Some(shadow);
                            sa.ppk_used = true;
                        }
                        Err(error) => {
                            warn!("PPK mixing failed on {serial}: {error}");
                            return Outcome::Fail(NotifyType::AuthenticationFailed);
                        }
                    }
                }
                None if md.notify(NotifyType::NoPpkAuth).is_some()
                    && conn.ppk != PpkPolicy::Insist =>
                {
                    debug!("Unknown PPK_IDENTITY on {serial}, falling back to NO_PPK_AUTH");
                    use_no_ppk_auth = true;
                }
                None => {
                    info!("No PPK for the claimed identity on {serial} and policy insists");
                    return Outcome::Fail(NotifyType::AuthenticationFailed);
                }
            },
            None if conn.ppk == PpkPolicy::Insist => {
                info!("Connection requires PPK but the initiator offered none");
                return Outcome::Fail(NotifyType::AuthenticationFailed);
            }
            None => {}
        }
    }

    match &conn.peer_auth {
        AuthConfig::PreSharedKey { .. } | AuthConfig::Null => {
            match verify_peer_auth_inline(engine, serial, &md, Some(use_no_ppk_auth)) {
                Ok(true) => continue_auth_respond(engine, serial, md),
                Ok(false) => {
                    info!("Initiator AUTH verification failed on {serial}");
                    Outcome::Fail(NotifyType::AuthenticationFailed)
                }
                Err(_) => Outcome::Fail(NotifyType::AuthenticationFailed),
            }
        }
        AuthConfig::RsaSignature { .. } | AuthConfig::DigitalSignature { .. } => {
            if engine
                .store
                .ike(serial)
                .map(|sa| sa.peer_key.is_none())
                .unwrap_or(true)
            {
                // no credentials on the wire: fall back to a published key
                return submit_ipseckey_lookup(engine, serial, md, true);
            }
            submit_peer_sig_verify(engine, serial, md, true)
        }
    }
}

/// Inline verification of the shared-secret methods; Some(true) on success
fn verify_peer_auth_inline(
    engine: &Engine,
    serial: Serial,
    md: &MessageDigest,
    responder_side_no_ppk: Option<bool>,
) -> Result<bool, CryptoError> {
    let Some(sa) = engine.store.ike(serial) else {
        return Ok(false);
    };
    let conn = &sa.conn;
    let Some(algorithms) = sa.algorithms.as_ref() else {
        return Ok(false);
    };
    let Some(keys) = sa.keys.as_ref() else {
        return Ok(false);
    };

    // which ID and sk_p the peer MACed depends on who the peer is
    let verifying_initiator = responder_side_no_ppk.is_some();
    let use_no_ppk = responder_side_no_ppk.unwrap_or(false);
    let (id, sk_p) = if verifying_initiator {
        let Some(id) = md.id_initiator() else {
            return Ok(false);
        };
        let sk_pi = if use_no_ppk {
            sa.no_ppk_keys.as_ref().map(|shadow| &shadow.sk_pi).unwrap_or(&keys.sk_pi)
        } else {
            &keys.sk_pi
        };
        (id, sk_pi)
    } else {
        let Some(id) = md.id_responder() else {
            return Ok(false);
        };
        (id, &keys.sk_pr)
    };

    let octets = auth_octets(
        &sa.first_packet_peer,
        &sa.local_nonce,
        algorithms.prf,
        sk_p,
        &id.body(),
    )?;

    // NO_PPK_AUTH fallback replaces the AUTH value; the NULL-only policy
    // accepts a NULL_AUTH notify in place of it
    let auth = md.auth();
    let (claimed, method) = if use_no_ppk {
        let Some(no_ppk) = md.notify(NotifyType::NoPpkAuth) else {
            return Ok(false);
        };
        (no_ppk.data.clone(), AuthMethod::SharedKeyMic)
    } else if matches!(conn.peer_auth, AuthConfig::Null)
        && auth.map(|a| a.method != AuthMethod::NullAuthentication).unwrap_or(true)
    {
        let Some(null_auth) = md.notify(NotifyType::NullAuth) else {
            return Ok(false);
        };
        (null_auth.data.clone(), AuthMethod::NullAuthentication)
    } else {
        let Some(auth) = auth else {
            return Ok(false);
        };
        (auth.data.clone(), auth.method)
    };

    let expected = match (&conn.peer_auth, method) {
        (AuthConfig::PreSharedKey { secret }, AuthMethod::SharedKeyMic) => {
            shared_key_auth(algorithms.prf, secret, &octets)?
        }
        (AuthConfig::Null, AuthMethod::NullAuthentication)
        | (_, AuthMethod::NullAuthentication) => {
            shared_key_auth(algorithms.prf, sk_p.as_bytes(), &octets)?
        }
        _ => return Ok(false),
    };
    Ok(expected == claimed)
}

/// Offload the asymmetric verification of the peer's AUTH payload
fn submit_peer_sig_verify(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    of_initiator: bool,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let Some(algorithms) = sa.algorithms.as_ref() else {
        return Outcome::Fatal;
    };
    let Some(keys) = sa.keys.as_ref() else {
        return Outcome::Fatal;
    };
    let Some(peer_key) = sa.peer_key.clone() else {
        return Outcome::Fail(NotifyType::AuthenticationFailed);
    };
    let Some(auth) = md.auth() else {
        return Outcome::Fail(NotifyType::AuthenticationFailed);
    };

    let (id, sk_p) = if of_initiator {
        let Some(id) = md.id_initiator() else {
            return Outcome::Fail(NotifyType::AuthenticationFailed);
        };
        (id, &keys.sk_pi)
    } else {
        let Some(id) = md.id_responder() else {
            return Outcome::Fatal;
        };
        (id, &keys.sk_pr)
    };
    let octets = match auth_octets(
        &sa.first_packet_peer,
        &sa.local_nonce,
        algorithms.prf,
        sk_p,
        &id.body(),
    ) {
        Ok(octets) => octets,
        Err(_) => return Outcome::Fatal,
    };

    let (hash, signature) = match auth.method {
        AuthMethod::RsaDigitalSignature => (SignatureHashAlgorithm::Sha2_256, auth.data.clone()),
        AuthMethod::DigitalSignature => {
            let Ok((algorithm, signature)) = ikecrypto::sign::split_digsig(&auth.data) else {
                return fail_or_fatal(of_initiator);
            };
            let Ok(hash) = ikecrypto::sign::hash_for_algorithm(algorithm) else {
                return fail_or_fatal(of_initiator);
            };
            (hash, signature.to_vec())
        }
        _ => return fail_or_fatal(of_initiator),
    };

    let pending = if of_initiator {
        Pending::AuthReqVerify { md }
    } else {
        Pending::AuthRespVerify { md }
    };
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.pending = Some(pending);
    }
    engine.submit(
        serial,
        TaskKind::VerifySig {
            key: peer_key,
            hash,
            octets,
            signature,
        },
    );
    Outcome::Suspend
}

/// Ask the DNS collaborator for the peer's published key
fn submit_ipseckey_lookup(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    of_initiator: bool,
) -> Outcome {
    let identity = if of_initiator {
        md.id_initiator().cloned()
    } else {
        md.id_responder().cloned()
    };
    let Some(identity) = identity else {
        return fail_or_fatal(of_initiator);
    };
    info!("Looking up a published key for the peer of {serial}");
    let resolver = engine.dns.clone();
    let pending = if of_initiator {
        Pending::AuthReqDns { md }
    } else {
        Pending::AuthRespDns { md }
    };
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.pending = Some(pending);
    }
    engine.submit(serial, TaskKind::FetchIpseckey { identity, resolver });
    Outcome::Suspend
}

/// The responder's IPSECKEY lookup finished
pub(crate) fn auth_req_dns_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    result: Result<ikecrypto::sign::PublicKey, crate::ifaces::DnsError>,
) {
    let message_id = md.message_id;
    let outcome = match result {
        Ok(key) => {
            if let Some(sa) = engine.store.ike_mut(serial) {
                sa.peer_key = Some(key);
            }
            submit_peer_sig_verify(engine, serial, md, true)
        }
        Err(error) => {
            info!("IPSECKEY lookup for {serial} failed: {error}");
            Outcome::Fail(NotifyType::AuthenticationFailed)
        }
    };
    engine.apply_outcome(serial, outcome, true, ExchangeType::IkeAuth, message_id);
}

/// The initiator's IPSECKEY lookup finished
pub(crate) fn auth_resp_dns_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    result: Result<ikecrypto::sign::PublicKey, crate::ifaces::DnsError>,
) {
    let outcome = match result {
        Ok(key) => {
            if let Some(sa) = engine.store.ike_mut(serial) {
                sa.peer_key = Some(key);
            }
            submit_peer_sig_verify(engine, serial, md, false)
        }
        Err(error) => {
            info!("IPSECKEY lookup for {serial} failed: {error}");
            Outcome::Fatal
        }
    };
    engine.apply_outcome(serial, outcome, false, ExchangeType::IkeAuth, 0);
}

fn fail_or_fatal(request_side: bool) -> Outcome {
    if request_side {
        Outcome::Fail(NotifyType::AuthenticationFailed)
    } else {
        Outcome::Fatal
    }
}

/// The initiator's signature checked out on the responder
pub(crate) fn auth_req_verify_done(engine: &mut Engine, serial: Serial, md: MessageDigest) {
    let message_id = md.message_id;
    let outcome = continue_auth_respond(engine, serial, md);
    engine.apply_outcome(serial, outcome, true, ExchangeType::IkeAuth, message_id);
}

/// The initiator is authenticated; produce our own proof (maybe async),
/// then the full response
fn continue_auth_respond(engine: &mut Engine, serial: Serial, md: MessageDigest) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let conn = sa.conn.clone();
    let Some(algorithms) = sa.algorithms.clone() else {
        return Outcome::Fatal;
    };
    let Some(keys) = sa.keys.clone() else {
        return Outcome::Fatal;
    };

    // INITIAL_CONTACT: drop every other SA authenticated to this peer
    if md.notify(NotifyType::InitialContact).is_some() {
        let peer_id = md.id_initiator().cloned();
        let stale: Vec<Serial> = engine
            .store
            .ike_serials()
            .into_iter()
            .filter(|other| *other != serial)
            .filter(|other| {
                engine
                    .store
                    .ike(*other)
                    .map(|other_sa| {
                        other_sa.conn.name == conn.name
                            && other_sa.state == IkeSaState::Established
                            && (peer_id.is_none() || other_sa.peer_id == peer_id)
                    })
                    .unwrap_or(false)
            })
            .collect();
        for other in stale {
            info!("INITIAL_CONTACT on {serial} supersedes {other}");
            engine.teardown_ike(other, true);
        }
    }

    let id_body = conn.local_id.body();
    let octets = match auth_octets(
        &engine
            .store
            .ike(serial)
            .map(|sa| sa.first_packet_local.clone())
            .unwrap_or_default(),
        &engine
            .store
            .ike(serial)
            .map(|sa| sa.peer_nonce.clone())
            .unwrap_or_default(),
        algorithms.prf,
        &keys.sk_pr,
        &id_body,
    ) {
        Ok(octets) => octets,
        Err(_) => return Outcome::Fatal,
    };

    match &conn.auth {
        AuthConfig::PreSharedKey { secret } => {
            let Ok(data) = shared_key_auth(algorithms.prf, secret, &octets) else {
                return Outcome::Fatal;
            };
            finalize_auth_response(
                engine,
                serial,
                md,
                Authentication {
                    method: AuthMethod::SharedKeyMic,
                    data,
                },
            )
        }
        AuthConfig::Null => {
            let Ok(data) = shared_key_auth(algorithms.prf, keys.sk_pr.as_bytes(), &octets) else {
                return Outcome::Fatal;
            };
            finalize_auth_response(
                engine,
                serial,
                md,
                Authentication {
                    method: AuthMethod::NullAuthentication,
                    data,
                },
            )
        }
        AuthConfig::RsaSignature { .. } | AuthConfig::DigitalSignature { .. } => {
            let Some((key, hash)) = local_signing_key(&conn.auth) else {
                return Outcome::Fail(NotifyType::AuthenticationFailed);
            };
            if let Some(sa) = engine.store.ike_mut(serial) {
                sa.pending = Some(Pending::AuthReqSign { md });
            }
            engine.submit(serial, TaskKind::Sign { key, hash, octets });
            Outcome::Suspend
        }
    }
}

/// Our signature for the IKE_AUTH response came back
pub(crate) fn auth_req_sign_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    signature: Vec<u8>,
) {
    let Some(sa) = engine.store.ike(serial) else {
        return;
    };
    let conn = sa.conn.clone();
    let auth = match &conn.auth {
        AuthConfig::RsaSignature { .. } => Authentication {
            method: AuthMethod::RsaDigitalSignature,
            data: signature,
        },
        AuthConfig::DigitalSignature { .. } => {
            let Some((key, hash)) = local_signing_key(&conn.auth) else {
                engine.teardown_ike(serial, false);
                return;
            };
            let Ok(algorithm) = ikecrypto::sign::digsig_algorithm(&key, hash) else {
                engine.teardown_ike(serial, false);
                return;
            };
            Authentication {
                method: AuthMethod::DigitalSignature,
                data: ikecrypto::sign::encode_digsig(algorithm, &signature),
            }
        }
        _ => {
            engine.teardown_ike(serial, false);
            return;
        }
    };
    let message_id = md.message_id;
    let outcome = finalize_auth_response(engine, serial, md, auth);
    engine.apply_outcome(serial, outcome, true, ExchangeType::IkeAuth, message_id);
}

/// What became of the child half of an IKE_AUTH request
enum ChildVerdict {
    Install {
        child: Serial,
        payloads: Vec<Payload>,
    },
    Refuse(NotifyType),
}

/// Build and send the IKE_AUTH response; the IKE SA establishes regardless
/// of whether the child half succeeded
fn finalize_auth_response(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    auth: Authentication,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let conn = sa.conn.clone();
    let ppk_used = sa.ppk_used;
    let peer_id = md.id_initiator().cloned();
    let (local_nonce, peer_nonce) = (sa.local_nonce.clone(), sa.peer_nonce.clone());

    // the child's kernel state must exist before the answer claims it does,
    // so install failures can still be turned into a notify
    let mut verdict = prepare_responder_child(engine, serial, &conn, &md);
    if let ChildVerdict::Install { child, .. } = &verdict {
        let child = *child;
        if let Err(error) =
            install_child(engine, serial, child, None, (&peer_nonce, &local_nonce))
        {
            warn!("Failed to install first child of {serial}: {error}");
            engine.remove_child(child, false);
            verdict = ChildVerdict::Refuse(NotifyType::NoProposalChosen);
        }
    }

    let mut payloads = vec![Payload::IdentificationResponder(conn.local_id.clone())];
    push_auth_payload(engine, &mut payloads, auth);
    if ppk_used {
        if let Some(ppk_id) = md
            .notify(NotifyType::PpkIdentity)
            .map(|notification| notification.data.clone())
        {
            payloads.push(Payload::Notify(Notification::with_data(
                NotifyType::PpkIdentity,
                ppk_id,
            )));
        }
    }
    if conn.mobike {
        payloads.push(Payload::Notify(Notification::bare(NotifyType::MobikeSupported)));
    }

    match verdict {
        ChildVerdict::Install { payloads: child_payloads, .. } => {
            payloads.extend(child_payloads);
        }
        ChildVerdict::Refuse(notify_type) => {
            payloads.push(Payload::Notify(Notification::bare(notify_type)));
        }
    }

    if let Err(error) =
        engine.seal_and_respond(serial, ExchangeType::IkeAuth, md.message_id, &payloads)
    {
        warn!("Failed to send IKE_AUTH response on {serial}: {error}");
        return Outcome::Fatal;
    }

    let now = engine.now();
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.peer_id = peer_id;
        sa.state = IkeSaState::Established;
        sa.established_at = Some(now);
        sa.pending = None;
    }
    engine.store.set_newest_ike(&conn.name, serial);
    engine.schedule_ike_lifetime(serial);
    engine.schedule_liveness(serial);
    info!("IKE SA {serial} established for connection {:?}", conn.name);
    Outcome::Ok
}

/// Select, narrow and lease for the first child of an inbound IKE_AUTH
fn prepare_responder_child(
    engine: &mut Engine,
    serial: Serial,
    conn: &ConnectionConfig,
    md: &MessageDigest,
) -> ChildVerdict {
    let Some(offer) = md.sa() else {
        return ChildVerdict::Refuse(NotifyType::NoProposalChosen);
    };
    let Some(selected) = proposals::select_child(&conn.esp, offer) else {
        info!("No child proposal chosen on {serial}");
        return ChildVerdict::Refuse(NotifyType::NoProposalChosen);
    };
    let Some(outbound_spi) = selected
        .spi
        .first_chunk::<4>()
        .map(|spi| u32::from_be_bytes(*spi))
    else {
        return ChildVerdict::Refuse(NotifyType::NoProposalChosen);
    };

    let (Some(proposed_initiator), Some(proposed_responder)) =
        (md.ts_initiator(), md.ts_responder())
    else {
        return ChildVerdict::Refuse(NotifyType::TsUnacceptable);
    };

    // virtual address: lease before narrowing so the lease wins the TSi side
    let mut virtual_ip = None;
    let mut cp_reply = None;
    let wants_address = md
        .configuration()
        .map(|cp| {
            cp.cfg_type == CfgType::Request
                && cp
                    .attributes
                    .iter()
                    .any(|a| a.attribute_type == ConfigAttributeType::InternalIp4Address)
        })
        .unwrap_or(false);
    if wants_address {
        match engine.lease_virtual_ip(conn) {
            Some(leased) => {
                info!("Leasing {leased} to the peer of {serial}");
                cp_reply = Some(Payload::Configuration(Configuration {
                    cfg_type: CfgType::Reply,
                    attributes: vec![ConfigAttribute {
                        attribute_type: ConfigAttributeType::InternalIp4Address,
                        value: leased.octets().to_vec(),
                    }],
                }));
                virtual_ip = Some(IpAddr::V4(leased));
            }
            None => {
                info!("Address pool of {serial} exhausted or missing");
                return ChildVerdict::Refuse(NotifyType::InternalAddressFailure);
            }
        }
    }

    // narrow: TSi against what we allow the peer, TSr against our own side
    let narrowed_initiator = match virtual_ip {
        Some(ip) => vec![TrafficSelector {
            ip_protocol: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: ip,
            end_addr: ip,
        }],
        None => ts::narrow(&conn.remote_ts, proposed_initiator),
    };
    let narrowed_responder = ts::narrow(&conn.local_ts, proposed_responder);
    if narrowed_initiator.is_empty() || narrowed_responder.is_empty() {
        info!("Traffic selectors on {serial} have no overlap with policy");
        return ChildVerdict::Refuse(NotifyType::TsUnacceptable);
    }

    let transport = conn.transport_mode && md.notify(NotifyType::UseTransportMode).is_some();
    let ipcomp_cpi = if conn.ipcomp {
        md.notify(NotifyType::IpcompSupported).and_then(|n| {
            n.data.first_chunk::<2>().map(|raw| u16::from_be_bytes(*raw))
        })
    } else {
        None
    };

    let child_serial = engine.store.next_serial();
    let inbound_spi = ikecrypto::nonce::random_child_spi();
    let child = ChildSa {
        serial: child_serial,
        parent: serial,
        role: Role::Responder,
        state: ChildSaState::Larval,
        algorithms: Some(selected.algorithms.clone()),
        inbound_spi,
        outbound_spi,
        pfs_group: None,
        local_ts: narrowed_responder.clone(),
        remote_ts: narrowed_initiator.clone(),
        transport_mode: transport,
        ipcomp_cpi,
        virtual_ip,
        predecessor: None,
        established_at: None,
        timer_generation: 0,
    };
    engine.store.insert_child(child);
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.children.push(child_serial);
    }

    let mut child_payloads = vec![];
    if let Some(cp) = cp_reply {
        child_payloads.push(cp);
    }
    child_payloads.push(Payload::SecurityAssociation(proposals::accepted_child_sa(
        &selected,
        inbound_spi,
        None,
    )));
    child_payloads.push(Payload::TrafficSelectorsInitiator(narrowed_initiator));
    child_payloads.push(Payload::TrafficSelectorsResponder(narrowed_responder));
    if transport {
        child_payloads.push(Payload::Notify(Notification::bare(
            NotifyType::UseTransportMode,
        )));
    }
    if let Some(_cpi) = ipcomp_cpi {
        let mut data = ((inbound_spi & 0xffff) as u16).to_be_bytes().to_vec();
        data.push(2); // IPCOMP_DEFLATE
        child_payloads.push(Payload::Notify(Notification::with_data(
            NotifyType::IpcompSupported,
            data,
        )));
    }

    ChildVerdict::Install {
        child: child_serial,
        payloads: child_payloads,
    }
}
