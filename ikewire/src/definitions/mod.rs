//! Typed model of IKEv2 messages and payloads together with the network
//! level header structs ([header]) and IANA parameters ([params])

pub mod header;
mod impls;
pub mod params;

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub use header::GenericPayloadHeader;
pub use header::Header;
use params::{
    AuthMethod, CertificateEncoding, CfgType, ConfigAttributeType, EncryptionAlgorithm,
    ExchangeType, IdType, IntegrityAlgorithm, KeyExchangeMethod, NotifyType, PayloadType,
    PseudorandomFunction, SecurityProtocol, SequenceNumbers,
};

/// When parsing a parameter from its wire value, there are several "regions"
/// in the definitions that can't be defined by Rusts enum. Typically, the
/// last two regions of the parameter definitions are unassigned and/or
/// reserved for private use.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UnparseableParameter {
    /// The parameter is reserved and must not be used, as it may conflict
    /// with older standards
    Reserved,
    /// The parameter has no recognized meaning by any known standard
    Unassigned,
    /// The parameter is reserved for Private Use by proprietary
    /// implementations and not part of a standard
    PrivateUse,
    /// The parameter can not reach the value this resolves to,
    /// as such the packet where it originates from must be invalid
    OutOfRange,
}

/// A whole IKEv2 message: the fixed header fields plus the ordered payload
/// chain. Building and parsing keep the payload order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// SPI chosen by the original initiator of the IKE SA
    pub initiator_spi: u64,
    /// SPI chosen by the responder, zero before the responder answered
    pub responder_spi: u64,
    /// Exchange this message is part of
    pub exchange_type: ExchangeType,
    /// Whether the sender is the original initiator of the IKE SA
    pub initiator: bool,
    /// Whether this message answers a request with the same message ID
    pub response: bool,
    /// Per-direction monotonic message counter
    pub message_id: u32,
    /// Ordered payload chain
    pub payloads: Vec<Payload>,
}

/// All payload types this implementation can represent
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Payload {
    SecurityAssociation(SecurityAssociation),
    KeyExchange(KeyExchange),
    IdentificationInitiator(Identification),
    IdentificationResponder(Identification),
    Certificate(Certificate),
    CertificateRequest(CertificateRequest),
    Authentication(Authentication),
    Nonce(Vec<u8>),
    Notify(Notification),
    Delete(Delete),
    VendorID(Vec<u8>),
    TrafficSelectorsInitiator(Vec<TrafficSelector>),
    TrafficSelectorsResponder(Vec<TrafficSelector>),
    Encrypted(Encrypted),
    Configuration(Configuration),
    EncryptedFragment(EncryptedFragment),
}

impl From<&Payload> for PayloadType {
    fn from(value: &Payload) -> Self {
        match value {
            Payload::SecurityAssociation(_) => PayloadType::SecurityAssociation,
            Payload::KeyExchange(_) => PayloadType::KeyExchange,
            Payload::IdentificationInitiator(_) => PayloadType::IdentificationInitiator,
            Payload::IdentificationResponder(_) => PayloadType::IdentificationResponder,
            Payload::Certificate(_) => PayloadType::Certificate,
            Payload::CertificateRequest(_) => PayloadType::CertificateRequest,
            Payload::Authentication(_) => PayloadType::Authentication,
            Payload::Nonce(_) => PayloadType::Nonce,
            Payload::Notify(_) => PayloadType::Notify,
            Payload::Delete(_) => PayloadType::Delete,
            Payload::VendorID(_) => PayloadType::VendorID,
            Payload::TrafficSelectorsInitiator(_) => PayloadType::TrafficSelectorInitiator,
            Payload::TrafficSelectorsResponder(_) => PayloadType::TrafficSelectorResponder,
            Payload::Encrypted(_) => PayloadType::EncryptedAndAuthenticated,
            Payload::Configuration(_) => PayloadType::Configuration,
            Payload::EncryptedFragment(_) => PayloadType::EncryptedAndAuthenticatedFragment,
        }
    }
}

/// A Security Association payload: an ordered list of proposals
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityAssociation {
    /// The proposals in preference order; numbering must be monotone
    pub proposals: Vec<Proposal>,
}

/// One proposal of an SA payload with its transforms grouped by type
///
/// The wire order of transforms inside a proposal carries no meaning, so the
/// grouped representation loses nothing while making first-match selection
/// straightforward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Number of this proposal within the SA payload
    pub number: u8,
    /// Protocol the proposal negotiates keys for
    pub protocol: SecurityProtocol,
    /// SPI of the sending entity: empty in the first IKE negotiation, 8
    /// octets when rekeying an IKE SA, 4 octets for AH/ESP
    pub spi: Vec<u8>,
    /// Offered encryption algorithms with their optional key length attribute
    pub encryption_algorithms: Vec<(EncryptionAlgorithm, Option<u16>)>,
    /// Offered pseudorandom functions
    pub pseudo_random_functions: Vec<PseudorandomFunction>,
    /// Offered integrity algorithms
    pub integrity_algorithms: Vec<IntegrityAlgorithm>,
    /// Offered key exchange methods
    pub key_exchange_methods: Vec<KeyExchangeMethod>,
    /// Offered sequence number modes
    pub sequence_numbers: Vec<SequenceNumbers>,
}

/// A single transformation of a [Proposal]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Transform {
    Encryption(EncryptionAlgorithm, Option<u16>),
    PseudoRandomFunction(PseudorandomFunction),
    Integrity(IntegrityAlgorithm),
    KeyExchange(KeyExchangeMethod),
    SequenceNumber(SequenceNumbers),
}

/// A key exchange payload carrying one side's public value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchange {
    /// Group the public value was computed in
    pub group: KeyExchangeMethod,
    /// The raw public value
    pub data: Vec<u8>,
}

/// An identification payload (IDi or IDr)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    /// Type of the identification data
    pub id_type: IdType,
    /// The raw identification data
    pub data: Vec<u8>,
}

/// A certificate payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// Encoding of the carried certificate data
    pub encoding: CertificateEncoding,
    /// The raw certificate data
    pub data: Vec<u8>,
}

/// A certificate request payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    /// Requested encoding of the certificates
    pub encoding: CertificateEncoding,
    /// Concatenated SHA-1 hashes of acceptable certification authorities
    pub authorities: Vec<u8>,
}

/// An authentication payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    /// Method the authentication data was computed with
    pub method: AuthMethod,
    /// The raw authentication data
    pub data: Vec<u8>,
}

/// A notify payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Protocol of the SA the notification concerns, [SecurityProtocol::Reserved]
    /// when no SPI is carried
    pub protocol: SecurityProtocol,
    /// SPI of the SA the notification concerns, if any
    pub spi: Option<Vec<u8>>,
    /// Type of this notification
    pub notify_type: NotifyType,
    /// Type specific notification data
    pub data: Vec<u8>,
}

/// A delete payload listing SAs by SPI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    /// Protocol of the SAs being deleted
    pub protocol: SecurityProtocol,
    /// SPIs of the deleted Child SAs; empty when deleting the IKE SA itself
    pub spis: Vec<u32>,
}

/// A single traffic selector of a TSi or TSr payload
///
/// The address family is implied by the address variants; mixing families
/// within one selector is refused by both halves of the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSelector {
    /// IP protocol the selector is narrowed to, zero for any
    pub ip_protocol: u8,
    /// First port of the matched range
    pub start_port: u16,
    /// Last port of the matched range
    pub end_port: u16,
    /// First address of the matched range
    pub start_addr: IpAddr,
    /// Last address of the matched range
    pub end_addr: IpAddr,
}

/// An SK payload: the encrypted and integrity protected container for the
/// actual payload chain of all exchanges after IKE_SA_INIT
///
/// The codec treats the contents as opaque: on parse, `data` holds
/// IV || ciphertext || ICV exactly as received; building emits it unchanged.
/// Sealing and opening is the engine's job since it owns the keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encrypted {
    /// Payload type of the first payload of the inner chain
    pub first_payload: PayloadType,
    /// IV || ciphertext || ICV
    pub data: Vec<u8>,
}

/// One fragment of a fragmented SK payload (RFC 7383)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFragment {
    /// Payload type of the first payload of the inner chain; only meaningful
    /// on fragment number 1, [PayloadType::NoNextPayload] otherwise
    pub first_payload: PayloadType,
    /// One-based index of this fragment
    pub fragment_number: u16,
    /// Total number of fragments
    pub total_fragments: u16,
    /// IV || ciphertext || ICV of this fragment
    pub data: Vec<u8>,
}

/// A configuration payload carrying virtual address attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// Kind of the configuration exchange
    pub cfg_type: CfgType,
    /// The carried attributes in order
    pub attributes: Vec<ConfigAttribute>,
}

/// A single attribute of a [Configuration] payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigAttribute {
    /// Type of the attribute
    pub attribute_type: ConfigAttributeType,
    /// Raw value; empty in requests asking the peer to assign one
    pub value: Vec<u8>,
}
