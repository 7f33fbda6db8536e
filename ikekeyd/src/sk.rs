//! Sealing and opening of SK payloads, including RFC 7383 fragmentation
//!
//! The associated data of the AEAD covers the fixed IKE header and the SK
//! (or SKF) payload header, so header tampering voids the ICV. The plaintext
//! carries a trailing pad-length octet as RFC 5282 requires; AEAD ciphers
//! never need actual padding, so it is always zero on emission.

use std::collections::HashMap;
use std::net::SocketAddr;

use ikecrypto::aead::{AeadKey, IV_SIZE, TAG_SIZE};
use ikecrypto::CryptoError;
use ikewire::definitions::header::{EncryptedFragmentHeader, GenericPayloadHeader, Header};
use ikewire::definitions::params::{ExchangeType, PayloadType, FLAG_INITIATOR, FLAG_RESPONSE};
use ikewire::definitions::{Encrypted, EncryptedFragment, Payload};
use ikewire::generator::{build_payload_chain, GeneratorError};
use ikewire::parser::{parse_payload_chain, ParserError};
use ikewire::zerocopy::network_endian::{U16, U32, U64};
use ikewire::zerocopy::AsBytes;
use ikewire::{IKE_2_VERSION_VALUE, IKE_HEADER_SIZE};

use crate::engine::Timestamp;
use crate::state::Serial;

/// Fixed header fields of an outbound protected message
#[derive(Debug, Clone, Copy)]
pub struct SkHeader {
    /// SPI chosen by the original initiator
    pub initiator_spi: u64,
    /// SPI chosen by the responder
    pub responder_spi: u64,
    /// Exchange of the message
    pub exchange_type: ExchangeType,
    /// Whether we are the original initiator
    pub initiator: bool,
    /// Whether the message is a response
    pub response: bool,
    /// Message ID
    pub message_id: u32,
}

/// Failures while sealing an outbound protected message
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum SealError {
    #[error("Payload generation failed: {0}")]
    Generator(#[from] GeneratorError),
    #[error("Sealing failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Failures while opening an inbound protected message
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum OpenError {
    #[error("Integrity check failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Inner payload chain doesn't parse: {0}")]
    Parser(#[from] ParserError),
    #[error("Padding declaration exceeds the plaintext")]
    BadPadding,
}

fn header_bytes(info: &SkHeader, first_payload: u8, total_length: usize) -> Vec<u8> {
    let header = Header {
        initiator_spi: U64::from(info.initiator_spi),
        responder_spi: U64::from(info.responder_spi),
        next_payload: first_payload,
        version: IKE_2_VERSION_VALUE,
        exchange_type: info.exchange_type as u8,
        flags: (if info.initiator { FLAG_INITIATOR } else { 0 })
            | (if info.response { FLAG_RESPONSE } else { 0 }),
        message_id: U32::from(info.message_id),
        length: U32::from(total_length as u32),
    };
    header.as_bytes().to_vec()
}

fn generic_header(next_payload: u8, payload_length: usize) -> Vec<u8> {
    let header = GenericPayloadHeader {
        next_payload,
        critical_reserved: 0,
        payload_length: U16::from(payload_length as u16),
    };
    header.as_bytes().to_vec()
}

/// Payload type value used by the unknown-critical-payload impair hook; it
/// sits in the unassigned range so no implementation recognizes it
const UNKNOWN_PAYLOAD_TYPE: u8 = 99;

/// Seal an inner payload chain into a single-SK-payload datagram
pub fn seal(
    key: &AeadKey,
    info: &SkHeader,
    inner: &[Payload],
) -> Result<Vec<u8>, SealError> {
    seal_with(key, info, inner, false)
}

/// [seal] with the unknown-critical-payload impair hook: when set, an
/// unassigned payload type with the critical bit is spliced in front of the
/// inner chain
pub fn seal_with(
    key: &AeadKey,
    info: &SkHeader,
    inner: &[Payload],
    unknown_critical: bool,
) -> Result<Vec<u8>, SealError> {
    let (first_inner, mut plaintext) = build_payload_chain(inner)?;
    let mut first_byte = first_inner as u8;
    if unknown_critical {
        let mut prefixed = vec![
            first_byte,
            ikewire::definitions::header::FLAG_CRITICAL,
            0x00,
            0x05,
            0xfe,
        ];
        prefixed.extend(plaintext);
        plaintext = prefixed;
        first_byte = UNKNOWN_PAYLOAD_TYPE;
    }
    // RFC 5282 keeps the pad length octet even for AEAD ciphers
    plaintext.push(0);

    let sk_payload_len = 4 + IV_SIZE + plaintext.len() + TAG_SIZE;
    let total = IKE_HEADER_SIZE + sk_payload_len;

    let mut aad = header_bytes(info, PayloadType::EncryptedAndAuthenticated as u8, total);
    aad.extend(generic_header(first_byte, sk_payload_len));

    let sealed = key.seal(&aad, &plaintext)?;
    let mut datagram = aad;
    datagram.extend(sealed);
    Ok(datagram)
}

/// Seal an inner payload chain into SKF fragments so no datagram exceeds
/// `threshold` octets
pub fn seal_fragmented(
    key: &AeadKey,
    info: &SkHeader,
    inner: &[Payload],
    threshold: usize,
) -> Result<Vec<Vec<u8>>, SealError> {
    let (first_inner, plaintext) = build_payload_chain(inner)?;

    // room for plaintext in one fragment datagram: header, SKF generic
    // header, fragment counters, IV, pad octet, ICV
    let overhead = IKE_HEADER_SIZE + 4 + 4 + IV_SIZE + 1 + TAG_SIZE;
    let chunk_size = threshold.saturating_sub(overhead).max(1);
    let chunks: Vec<&[u8]> = plaintext.chunks(chunk_size).collect();
    let total_fragments = chunks.len().max(1) as u16;

    let mut datagrams = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        let fragment_number = index as u16 + 1;
        let mut fragment_plaintext = chunk.to_vec();
        fragment_plaintext.push(0);

        let skf_payload_len = 4 + 4 + IV_SIZE + fragment_plaintext.len() + TAG_SIZE;
        let total = IKE_HEADER_SIZE + skf_payload_len;

        // only fragment 1 names the inner chain's first payload
        let first = if fragment_number == 1 {
            first_inner
        } else {
            PayloadType::NoNextPayload
        };
        let mut aad = header_bytes(
            info,
            PayloadType::EncryptedAndAuthenticatedFragment as u8,
            total,
        );
        aad.extend(generic_header(first as u8, skf_payload_len));
        let counters = EncryptedFragmentHeader {
            fragment_number: U16::from(fragment_number),
            total_fragments: U16::from(total_fragments),
        };
        aad.extend_from_slice(counters.as_bytes());

        let sealed = key.seal(&aad, &fragment_plaintext)?;
        let mut datagram = aad;
        datagram.extend(sealed);
        datagrams.push(datagram);
    }
    Ok(datagrams)
}

fn strip_padding(mut plaintext: Vec<u8>) -> Result<Vec<u8>, OpenError> {
    let Some(pad_length) = plaintext.pop() else {
        return Err(OpenError::BadPadding);
    };
    let pad_length = pad_length as usize;
    if pad_length > plaintext.len() {
        return Err(OpenError::BadPadding);
    }
    plaintext.truncate(plaintext.len() - pad_length);
    Ok(plaintext)
}

/// Open the SK payload of a whole received datagram and parse the inner chain
pub fn open(
    key: &AeadKey,
    raw_datagram: &[u8],
    payload: &Encrypted,
) -> Result<Vec<Payload>, OpenError> {
    // associated data: fixed header plus the SK generic header
    let aad_len = IKE_HEADER_SIZE + 4;
    if raw_datagram.len() < aad_len {
        return Err(OpenError::Crypto(CryptoError::IntegrityCheckFailed));
    }
    let plaintext = key.open(&raw_datagram[..aad_len], &payload.data)?;
    let plaintext = strip_padding(plaintext)?;
    Ok(parse_payload_chain(
        payload.first_payload as u8,
        &plaintext,
    )?)
}

/// Open one SKF fragment, yielding its plaintext chunk
pub fn open_fragment(
    key: &AeadKey,
    raw_datagram: &[u8],
    payload: &EncryptedFragment,
) -> Result<Vec<u8>, OpenError> {
    // associated data: fixed header, SKF generic header, fragment counters
    let aad_len = IKE_HEADER_SIZE + 4 + 4;
    if raw_datagram.len() < aad_len {
        return Err(OpenError::Crypto(CryptoError::IntegrityCheckFailed));
    }
    let plaintext = key.open(&raw_datagram[..aad_len], &payload.data)?;
    strip_padding(plaintext)
}

/// Key of a reassembly group
pub type FragKey = (Serial, u32);

/// One partially reassembled fragmented message
#[derive(Debug)]
pub struct FragGroup {
    /// Claimed number of fragments
    pub total: u16,
    /// Opened plaintext chunks by fragment number
    pub chunks: HashMap<u16, Vec<u8>>,
    /// First payload type announced by fragment 1
    pub first_payload: PayloadType,
    /// Where the fragments came from
    pub sender: SocketAddr,
    /// When the group was opened, for reaping
    pub created: Timestamp,
}

/// Bounded store of in-progress reassemblies keyed by SA and message ID
#[derive(Debug, Default)]
pub struct FragmentStore {
    groups: HashMap<FragKey, FragGroup>,
}

/// Cap on simultaneously tracked reassembly groups
const MAX_GROUPS: usize = 16;

impl FragmentStore {
    /// Add an opened fragment; returns the reassembled inner chain once all
    /// fragments arrived
    pub fn add(
        &mut self,
        now: Timestamp,
        key: FragKey,
        sender: SocketAddr,
        fragment: &EncryptedFragment,
        plaintext: Vec<u8>,
    ) -> Result<Option<Vec<Payload>>, OpenError> {
        if !self.groups.contains_key(&key) {
            if self.groups.len() >= MAX_GROUPS {
                return Ok(None);
            }
            self.groups.insert(
                key,
                FragGroup {
                    total: fragment.total_fragments,
                    chunks: HashMap::new(),
                    first_payload: PayloadType::NoNextPayload,
                    sender,
                    created: now,
                },
            );
        }
        let Some(group) = self.groups.get_mut(&key) else {
            return Ok(None);
        };
        if group.total != fragment.total_fragments {
            // a differing count marks a forged or confused sender
            return Ok(None);
        }
        if fragment.fragment_number == 1 {
            group.first_payload = fragment.first_payload;
        }
        group.chunks.entry(fragment.fragment_number).or_insert(plaintext);

        if group.chunks.len() < group.total as usize {
            return Ok(None);
        }
        let Some(group) = self.groups.remove(&key) else {
            return Ok(None);
        };
        let mut assembled = vec![];
        for number in 1..=group.total {
            match group.chunks.get(&number) {
                Some(chunk) => assembled.extend_from_slice(chunk),
                None => return Ok(None),
            }
        }
        Ok(Some(parse_payload_chain(
            group.first_payload as u8,
            &assembled,
        )?))
    }

    /// Drop groups older than the timeout
    pub fn reap(&mut self, now: Timestamp, timeout: std::time::Duration) {
        self.groups.retain(|_, group| {
            let keep = now.since(group.created) < timeout;
            if !keep {
                tracing::debug!("Dropping stale fragment group from {}", group.sender);
            }
            keep
        });
    }

    /// Drop all groups belonging to a reaped SA
    pub fn forget(&mut self, serial: Serial) {
        self.groups.retain(|(owner, _), _| *owner != serial);
    }
}

#[cfg(test)]
mod tests {
    use ikecrypto::SymKey;
    use ikewire::definitions::params::EncryptionAlgorithm;
    use ikewire::definitions::Message;

    use super::*;

    fn key() -> AeadKey {
        #[allow(clippy::unwrap_used)]
        AeadKey::new(EncryptionAlgorithm::AesGcm16, SymKey::new(vec![0x42; 36])).unwrap()
    }

    fn info() -> SkHeader {
        SkHeader {
            initiator_spi: 0x1111,
            responder_spi: 0x2222,
            exchange_type: ExchangeType::Informational,
            initiator: true,
            response: false,
            message_id: 3,
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn seal_open_roundtrip() {
        let inner = vec![Payload::Nonce(vec![0x13; 32])];
        let datagram = seal(&key(), &info(), &inner).unwrap();

        let message = Message::try_parse(&datagram).unwrap();
        let Payload::Encrypted(encrypted) = &message.payloads[0] else {
            panic!("expected SK payload");
        };
        let opened = open(&key(), &datagram, encrypted).unwrap();
        assert_eq!(opened, inner);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn empty_chain_seals_as_liveness_probe() {
        let datagram = seal(&key(), &info(), &[]).unwrap();
        let message = Message::try_parse(&datagram).unwrap();
        let Payload::Encrypted(encrypted) = &message.payloads[0] else {
            panic!("expected SK payload");
        };
        assert_eq!(encrypted.first_payload, PayloadType::NoNextPayload);
        let opened = open(&key(), &datagram, encrypted).unwrap();
        assert!(opened.is_empty());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn tampered_header_is_refused() {
        let inner = vec![Payload::Nonce(vec![0x13; 32])];
        let mut datagram = seal(&key(), &info(), &inner).unwrap();
        datagram[20] ^= 0x01; // message ID byte
        let message_id_patch = datagram.clone();
        let message = Message::try_parse(&message_id_patch).unwrap();
        let Payload::Encrypted(encrypted) = &message.payloads[0] else {
            panic!("expected SK payload");
        };
        assert!(open(&key(), &datagram, encrypted).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn fragmentation_reassembles() {
        let inner = vec![Payload::VendorID(vec![0x5a; 600])];
        let datagrams = seal_fragmented(&key(), &info(), &inner, 256).unwrap();
        assert!(datagrams.len() > 1);
        for datagram in &datagrams {
            assert!(datagram.len() <= 256);
        }

        let mut store = FragmentStore::default();
        let sender = "192.0.2.1:500".parse().unwrap();
        let mut reassembled = None;
        for datagram in &datagrams {
            let message = Message::try_parse(datagram).unwrap();
            let Payload::EncryptedFragment(fragment) = &message.payloads[0] else {
                panic!("expected SKF payload");
            };
            let chunk = open_fragment(&key(), datagram, fragment).unwrap();
            if let Some(inner) = store
                .add(Timestamp::default(), (Serial(1), 3), sender, fragment, chunk)
                .unwrap()
            {
                reassembled = Some(inner);
            }
        }
        assert_eq!(reassembled.unwrap(), inner);
    }
}
