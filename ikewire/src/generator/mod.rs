//! Implementations for the associated function `try_build` of various IKEv2
//! payload types that convert high-level Rust structs into network-encoded
//! byte arrays

mod message;
mod misc;
mod notify;
mod sa;
mod ts;

use thiserror::Error;
use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::GenericPayloadHeader;
use crate::definitions::params::PayloadType;
use crate::definitions::Payload;

/// Rough per-payload size estimate used to preallocate buffers
pub(crate) const ESTIMATED_PAYLOAD_LENGTH: usize = 48;
/// Rough per-proposal size estimate used to preallocate buffers
pub(crate) const ESTIMATED_PROPOSAL_LENGTH: usize = 44;

/// Failure while building the network-level byte representation of a packet
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum GeneratorError {
    #[error("A packet must have fewer than 255 payloads")]
    TooManyPayloads,
    #[error("A security association must have fewer than 255 proposals")]
    TooManyProposals,
    #[error("A proposal must have fewer than 255 transforms")]
    TooManyTransforms,
    #[error("A nonce must be between 16 and 256 octets")]
    InvalidNonceLength,
    #[error("A payload body exceeds the representable length")]
    PayloadTooLarge,
    #[error("SPI length doesn't fit the protocol of the structure")]
    InvalidSpiLength,
    #[error("Traffic selector mixes address families")]
    MixedAddressFamilies,
}

/// Build a payload chain, yielding the type of the first payload and the
/// encoded bytes of all payloads with their next-payload fields linked up
///
/// This is used both for the payloads of a whole message and for the inner
/// plaintext chain that the engine seals into an SK payload.
pub fn build_payload_chain(payloads: &[Payload]) -> Result<(PayloadType, Vec<u8>), GeneratorError> {
    if payloads.len() >= 255 {
        return Err(GeneratorError::TooManyPayloads);
    }
    let first = match payloads.first() {
        None => PayloadType::NoNextPayload,
        Some(p) => p.into(),
    };
    let mut buf = Vec::with_capacity(ESTIMATED_PAYLOAD_LENGTH * payloads.len());
    for (i, payload) in payloads.iter().enumerate() {
        buf.extend(payload.try_build(match payloads.get(i + 1) {
            None => PayloadType::NoNextPayload,
            Some(next) => next.into(),
        })?);
    }
    Ok((first, buf))
}

impl Payload {
    pub(crate) fn try_build(&self, next_payload: PayloadType) -> Result<Vec<u8>, GeneratorError> {
        if let Payload::Nonce(v) = self {
            if v.len() < 16 || v.len() > 256 {
                return Err(GeneratorError::InvalidNonceLength);
            }
        }
        match self {
            Payload::SecurityAssociation(v) => v.try_build(next_payload),
            Payload::KeyExchange(v) => Ok(v.build(next_payload)),
            Payload::IdentificationInitiator(v) | Payload::IdentificationResponder(v) => {
                Ok(v.build(next_payload))
            }
            Payload::Certificate(v) => Ok(v.build(next_payload)),
            Payload::CertificateRequest(v) => Ok(v.build(next_payload)),
            Payload::Authentication(v) => Ok(v.build(next_payload)),
            Payload::Notify(v) => v.try_build(next_payload),
            Payload::Delete(v) => v.try_build(next_payload),
            Payload::TrafficSelectorsInitiator(v) | Payload::TrafficSelectorsResponder(v) => {
                ts::build_traffic_selectors(v, next_payload)
            }
            Payload::Encrypted(v) => Ok(v.build()),
            Payload::EncryptedFragment(v) => Ok(v.build()),
            Payload::Configuration(v) => Ok(v.build(next_payload)),
            Payload::Nonce(v) | Payload::VendorID(v) => Ok(build_generic(next_payload, v)),
        }
    }
}

/// Helper to build all payloads that are a generic header plus opaque data
pub(crate) fn build_generic(next_payload: PayloadType, data: &[u8]) -> Vec<u8> {
    let header = GenericPayloadHeader {
        next_payload: next_payload as u8,
        critical_reserved: 0,
        payload_length: U16::from(data.len() as u16 + 4),
    };
    let mut packet = Vec::with_capacity(data.len() + 4);
    packet.extend_from_slice(header.as_bytes());
    packet.extend(data);
    packet
}
