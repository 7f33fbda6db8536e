//! The optional IKE_INTERMEDIATE round (RFC 9242): one extra authenticated
//! key exchange between IKE_SA_INIT and IKE_AUTH, typically to mix a second
//! group into the keys
//!
//! After the round, SKEYSEED' = prf(SK_d, g^ir (new) | Ni | Nr) and the whole
//! SK_* set is replaced atomically. The AUTH octets keep referring to the
//! IKE_SA_INIT messages only.

use ikecrypto::dh::KeSecret;
use ikecrypto::SymKey;
use ikewire::definitions::params::{ExchangeType, NotifyType};
use ikewire::definitions::{KeyExchange, Payload};
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::keymat;
use crate::md::MessageDigest;
use crate::state::{IkeSaState, Pending, Role, Serial};
use crate::tasks::TaskKind;
use crate::transitions::Outcome;

// ---------------------------------------------------------------------------
// initiator
// ---------------------------------------------------------------------------

/// Kick off the intermediate round after IKE_SA_INIT keys exist
pub(crate) fn start_intermediate(engine: &mut Engine, serial: Serial) {
    let Some(sa) = engine.store.ike_mut(serial) else {
        return;
    };
    let Some(group) = sa.conn.intermediate_ke else {
        return;
    };
    debug!("Starting IKE_INTERMEDIATE round on {serial} with {group:?}");
    sa.pending = Some(Pending::IntermediateKe);
    engine.submit(serial, TaskKind::KeGen { group });
}

/// The extra KE is ready, send the protected request
pub(crate) fn intermediate_ke_done(
    engine: &mut Engine,
    serial: Serial,
    public: Vec<u8>,
    secret: KeSecret,
) {
    let payloads = {
        let Some(sa) = engine.store.ike_mut(serial) else {
            return;
        };
        let Some(group) = sa.conn.intermediate_ke else {
            return;
        };
        sa.ke_secret = Some(secret);
        sa.local_ke_public = public.clone();
        sa.pending = None;
        vec![Payload::KeyExchange(KeyExchange {
            group,
            data: public,
        })]
    };
    match engine.seal_and_send_request(serial, ExchangeType::IkeIntermediate, &payloads) {
        Ok(_) => {
            if let Some(sa) = engine.store.ike_mut(serial) {
                sa.state = IkeSaState::IntermediateSent;
            }
        }
        Err(error) => {
            warn!("Failed to send IKE_INTERMEDIATE request on {serial}: {error}");
            engine.teardown_ike(serial, false);
        }
    }
}

/// The peer's KE arrived, combine it
pub(crate) fn process_intermediate_response(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let Some(group) = sa.conn.intermediate_ke else {
        return Outcome::Fatal;
    };
    let Some(ke) = md.ke() else {
        return Outcome::Fatal;
    };
    if ke.group != group {
        return Outcome::Fatal;
    }
    let Some(secret) = sa.ke_secret.clone() else {
        return Outcome::Fatal;
    };
    let peer_public = ke.data.clone();
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.pending = Some(Pending::IntermediateShared { md });
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

/// Shared secret of the extra round done: replace the keys, go to IKE_AUTH
pub(crate) fn intermediate_shared_done(
    engine: &mut Engine,
    serial: Serial,
    _md: MessageDigest,
    shared: SymKey,
) {
    if rederive_keys(engine, serial, &shared).is_err() {
        engine.teardown_ike(serial, false);
        return;
    }
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.intermediate_rounds += 1;
    }
    crate::handlers::ike_auth::start_auth(engine, serial);
}

// ---------------------------------------------------------------------------
// responder
// ---------------------------------------------------------------------------

/// Protected request with an extra KE: answer in kind, then replace keys
pub(crate) fn process_intermediate_request(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
) -> Outcome {
    let Some(sa) = engine.store.ike(serial) else {
        return Outcome::Ignore;
    };
    let Some(group) = sa.conn.intermediate_ke else {
        debug!("IKE_INTERMEDIATE on {serial} but no extra group configured");
        return Outcome::Fail(NotifyType::InvalidSyntax);
    };
    let Some(ke) = md.ke() else {
        return Outcome::Fail(NotifyType::InvalidSyntax);
    };
    if ke.group != group {
        return Outcome::Fail(NotifyType::InvalidKePayload);
    }
    let peer_public = ke.data.clone();
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.peer_ke_public = peer_public;
        sa.pending = Some(Pending::RespondIntermediateKe { md });
    }
    engine.submit(serial, TaskKind::KeGen { group });
    Outcome::Suspend
}

/// Our KE for the intermediate response is ready
pub(crate) fn respond_intermediate_ke_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    public: Vec<u8>,
    secret: KeSecret,
) {
    let Some(sa) = engine.store.ike_mut(serial) else {
        return;
    };
    let Some(group) = sa.conn.intermediate_ke else {
        engine.teardown_ike(serial, false);
        return;
    };
    sa.local_ke_public = public;
    sa.ke_secret = Some(secret.clone());
    let peer_public = sa.peer_ke_public.clone();
    sa.pending = Some(Pending::RespondIntermediateShared { md });
    engine.submit(
        serial,
        TaskKind::KeShared {
            group,
            secret,
            peer_public,
        },
    );
}

/// Shared secret done on the responder: answer, then replace keys
pub(crate) fn respond_intermediate_shared_done(
    engine: &mut Engine,
    serial: Serial,
    md: MessageDigest,
    shared: SymKey,
) {
    let payloads = {
        let Some(sa) = engine.store.ike_mut(serial) else {
            return;
        };
        let Some(group) = sa.conn.intermediate_ke else {
            engine.teardown_ike(serial, false);
            return;
        };
        sa.pending = None;
        vec![Payload::KeyExchange(KeyExchange {
            group,
            data: sa.local_ke_public.clone(),
        })]
    };

    // answer under the old keys, then swap; the initiator does the same
    if let Err(error) =
        engine.seal_and_respond(serial, ExchangeType::IkeIntermediate, md.message_id, &payloads)
    {
        warn!("Failed to answer IKE_INTERMEDIATE on {serial}: {error}");
        engine.teardown_ike(serial, false);
        return;
    }
    if rederive_keys(engine, serial, &shared).is_err() {
        engine.teardown_ike(serial, false);
        return;
    }
    if let Some(sa) = engine.store.ike_mut(serial) {
        sa.intermediate_rounds += 1;
        // stay half-open awaiting IKE_AUTH
        sa.state = IkeSaState::RespondedInit;
    }
}

/// Replace the SK_* set from the freshly mixed shared secret
fn rederive_keys(engine: &mut Engine, serial: Serial, shared: &SymKey) -> Result<(), ()> {
    let Some(sa) = engine.store.ike_mut(serial) else {
        return Err(());
    };
    let Some(algorithms) = sa.algorithms.clone() else {
        return Err(());
    };
    let Some(keys) = sa.keys.as_ref() else {
        return Err(());
    };
    let (ni, nr) = match sa.role {
        Role::Initiator => (sa.local_nonce.clone(), sa.peer_nonce.clone()),
        Role::Responder => (sa.peer_nonce.clone(), sa.local_nonce.clone()),
    };
    let skeyseed = keymat::skeyseed_rekey(algorithms.prf, &keys.sk_d, shared, &ni, &nr)
        .map_err(|_| ())?;
    let replaced = keymat::derive_ike_keys(
        &algorithms,
        &skeyseed,
        &ni,
        &nr,
        sa.initiator_spi,
        sa.responder_spi,
    )
    .map_err(|_| ())?;
    sa.keys = Some(replaced);
    sa.ke_secret = None;
    Ok(())
}
