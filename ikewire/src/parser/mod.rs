//! Parser functionality to convert network-level bytes into [Message] structs
//!
//! Use the [Message::try_parse] associated function as an entrypoint for
//! whole datagrams and [parse_payload_chain] for the plaintext recovered
//! from an SK payload.

mod message;
mod misc;
mod notify;
mod sa;
mod ts;

use log::warn;
use thiserror::Error;
use zerocopy::FromBytes;

use crate::definitions::header::{GenericPayloadHeader, FLAG_CRITICAL};
use crate::definitions::params::PayloadType;
use crate::definitions::{Payload, UnparseableParameter};

pub use message::RawHeader;

/// Failure while parsing a [Message](crate::definitions::Message) from
/// network-level byte representation
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ParserError {
    #[error("Buffer too small to parse the packet")]
    BufferTooSmall,
    #[error("Wrong protocol, expected IKEv2")]
    WrongProtocol,
    #[error("Parameter could not be parsed: {0:#?}")]
    UnparseableParameter(UnparseableParameter),
    #[error("Proposal numbering isn't monotonically increasing")]
    InvalidProposalNumbering,
    #[error("Payload or substructure violates a structural rule of the RFC")]
    ProtocolViolation,
    #[error("Reserved bits set where the RFC requires zero")]
    ReservedBitsSet,
    #[error("Unknown payload type {0} with the critical bit set")]
    UnsupportedCriticalPayload(u8),
}

impl From<UnparseableParameter> for ParserError {
    fn from(value: UnparseableParameter) -> Self {
        Self::UnparseableParameter(value)
    }
}

/// Simple type alias for results of payload parser functions
///
/// The `Ok` tuple contains the resulting payload and the size it consumed in
/// bytes; the next payload type is handled by the chain walker.
pub type ParserResult<T> = Result<(T, usize), ParserError>;

/// Walk a chain of payloads starting with the given type
///
/// Each payload's generic header determines the type of the payload that
/// follows it. Unknown payload types are skipped with a warning unless their
/// critical bit is set, in which case parsing fails so the caller can answer
/// with UNSUPPORTED_CRITICAL_PAYLOAD. An SK payload (or SK fragment) must be
/// the last payload; everything after it is ignored.
pub fn parse_payload_chain(
    first_payload: u8,
    buf: &[u8],
) -> Result<Vec<Payload>, ParserError> {
    let mut offset = 0usize;
    let mut next_raw = first_payload;
    let mut payloads = vec![];

    while next_raw != PayloadType::NoNextPayload as u8 {
        let remaining = &buf[offset..];
        let header =
            GenericPayloadHeader::ref_from_prefix(remaining).ok_or(ParserError::BufferTooSmall)?;
        let length = header.payload_length.get() as usize;
        if length < size_of::<GenericPayloadHeader>() || length > remaining.len() {
            return Err(ParserError::BufferTooSmall);
        }
        if header.critical_reserved & !FLAG_CRITICAL != 0 {
            return Err(ParserError::ReservedBitsSet);
        }

        let chained_next = header.next_payload;
        let body = &remaining[size_of::<GenericPayloadHeader>()..length];

        match PayloadType::try_from(next_raw) {
            Err(_) => {
                if header.critical_reserved & FLAG_CRITICAL == FLAG_CRITICAL {
                    return Err(ParserError::UnsupportedCriticalPayload(next_raw));
                }
                warn!("Skipping unknown non-critical payload type {next_raw}");
            }
            Ok(payload_type) => {
                let payload = parse_payload_body(payload_type, header, body)?;
                let is_sk = matches!(
                    payload,
                    Payload::Encrypted(_) | Payload::EncryptedFragment(_)
                );
                payloads.push(payload);
                if is_sk {
                    // The encrypted payload is always the last payload of a
                    // message and its next payload field names the first
                    // payload of the inner chain instead of a sibling
                    break;
                }
            }
        }

        offset += length;
        next_raw = chained_next;
    }

    Ok(payloads)
}

fn parse_payload_body(
    payload_type: PayloadType,
    header: &GenericPayloadHeader,
    body: &[u8],
) -> Result<Payload, ParserError> {
    Ok(match payload_type {
        // handled by the caller before dispatching here
        PayloadType::NoNextPayload => return Err(ParserError::ProtocolViolation),
        PayloadType::SecurityAssociation => {
            Payload::SecurityAssociation(sa::parse_security_association(body)?)
        }
        PayloadType::KeyExchange => Payload::KeyExchange(misc::parse_key_exchange(body)?),
        PayloadType::IdentificationInitiator => {
            Payload::IdentificationInitiator(misc::parse_identification(body)?)
        }
        PayloadType::IdentificationResponder => {
            Payload::IdentificationResponder(misc::parse_identification(body)?)
        }
        PayloadType::Certificate => Payload::Certificate(misc::parse_certificate(body)?),
        PayloadType::CertificateRequest => {
            Payload::CertificateRequest(misc::parse_certificate_request(body)?)
        }
        PayloadType::Authentication => Payload::Authentication(misc::parse_authentication(body)?),
        PayloadType::Nonce => Payload::Nonce(body.to_vec()),
        PayloadType::Notify => Payload::Notify(notify::parse_notification(body)?),
        PayloadType::Delete => Payload::Delete(notify::parse_delete(body)?),
        PayloadType::VendorID => Payload::VendorID(body.to_vec()),
        PayloadType::TrafficSelectorInitiator => {
            Payload::TrafficSelectorsInitiator(ts::parse_traffic_selectors(body)?)
        }
        PayloadType::TrafficSelectorResponder => {
            Payload::TrafficSelectorsResponder(ts::parse_traffic_selectors(body)?)
        }
        PayloadType::EncryptedAndAuthenticated => {
            Payload::Encrypted(misc::parse_encrypted(header, body)?)
        }
        PayloadType::Configuration => Payload::Configuration(misc::parse_configuration(body)?),
        PayloadType::ExtensibleAuthentication => {
            // EAP is not negotiated by this implementation
            return Err(ParserError::ProtocolViolation);
        }
        PayloadType::EncryptedAndAuthenticatedFragment => {
            Payload::EncryptedFragment(misc::parse_encrypted_fragment(header, body)?)
        }
    })
}
