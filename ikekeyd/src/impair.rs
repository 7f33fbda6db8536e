//! Protocol deviation hooks for testing
//!
//! One record enumerates every supported way to deviate from the protocol.
//! Production deployments use [Impair::default], where every field is a
//! no-op; all call sites read the record through the engine so there is a
//! single place to audit.

use serde::{Deserialize, Serialize};

/// Meddle with the emission of a single payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SendImpairment {
    /// Emit the payload as the protocol requires
    #[default]
    Normal,
    /// Leave the payload out entirely
    Omit,
    /// Emit the payload with an empty body
    Empty,
    /// Emit the payload twice
    Duplicate,
}

/// The impair record
///
/// Each field documents its observable effect; everything defaults to the
/// behavior the RFC mandates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Impair {
    /// Meddle with the KE payload of IKE_SA_INIT and CREATE_CHILD_SA requests
    pub ke_payload: SendImpairment,
    /// Meddle with the AUTH payload of IKE_AUTH messages
    pub auth_payload: SendImpairment,
    /// Append this raw octet to every outbound datagram
    pub inject_payload_byte: Option<u8>,
    /// Leave the SIGNATURE_HASH_ALGORITHMS notify out of IKE_SA_INIT
    pub omit_hash_notify: bool,
    /// Never retransmit an outstanding request
    pub suppress_retransmits: bool,
    /// Treat the first retransmit as if the ladder were exhausted
    pub timeout_on_retransmit: bool,
    /// Delete the state instead of retransmitting
    pub delete_on_retransmit: bool,
    /// Flip a byte inside the ciphertext of every outbound SK payload
    pub corrupt_encrypted: bool,
    /// Add an unknown payload with the critical bit set to IKE_AUTH requests
    pub unknown_payload_critical: bool,
    /// Log instead of silently dropping messages whose integrity check
    /// failed; the AEAD ciphers cannot yield plaintext without a valid ICV,
    /// so the drop itself still happens
    pub bypass_integrity: bool,
    /// Replay every outbound datagram once
    pub replay_duplicates: bool,
    /// Force the initiator SPI of new IKE SAs to this value
    pub ike_initiator_spi: Option<u64>,
    /// Force the responder SPI of new IKE SAs to this value
    pub ike_responder_spi: Option<u64>,
}

impl Impair {
    /// Whether any field deviates from the no-op default
    pub fn any_active(&self) -> bool {
        let Impair {
            ke_payload,
            auth_payload,
            inject_payload_byte,
            omit_hash_notify,
            suppress_retransmits,
            timeout_on_retransmit,
            delete_on_retransmit,
            corrupt_encrypted,
            unknown_payload_critical,
            bypass_integrity,
            replay_duplicates,
            ike_initiator_spi,
            ike_responder_spi,
        } = self;
        *ke_payload != SendImpairment::Normal
            || *auth_payload != SendImpairment::Normal
            || inject_payload_byte.is_some()
            || *omit_hash_notify
            || *suppress_retransmits
            || *timeout_on_retransmit
            || *delete_on_retransmit
            || *corrupt_encrypted
            || *unknown_payload_critical
            || *bypass_integrity
            || *replay_duplicates
            || ike_initiator_spi.is_some()
            || ike_responder_spi.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_noop() {
        assert!(!Impair::default().any_active());
    }

    #[test]
    fn active_field_is_detected() {
        let impair = Impair {
            corrupt_encrypted: true,
            ..Default::default()
        };
        assert!(impair.any_active());
    }
}
