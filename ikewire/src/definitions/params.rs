//! IKEv2 parameters and their parsers as defined in the IANA IKEv2 list
//! found at https://www.iana.org/assignments/ikev2-parameters/ikev2-parameters.xhtml

use serde::{Deserialize, Serialize};
use strum::EnumIter;

use super::UnparseableParameter;

/// Flag inside [Header](super::header::Header) flags marking the message as
/// sent by the original initiator of the IKE SA
pub const FLAG_INITIATOR: u8 = 0b0000_1000;
/// Flag inside [Header](super::header::Header) flags marking the message as a
/// response to a request carrying the same message ID
pub const FLAG_RESPONSE: u8 = 0b0010_0000;

/// Type of the exchange being used
///
/// This constrains the payloads sent in each message in an exchange.
/// Notably, values 0-33 are reserved, 45-239 are currently unassigned
/// and 240-255 reserved for private use. Also see [UnparseableParameter].
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ExchangeType {
    // RFC 7296
    IkeSaInit = 34,
    // RFC 7296
    IkeAuth = 35,
    // RFC 7296
    CreateChildSa = 36,
    // RFC 7296
    Informational = 37,
    // RFC9242
    IkeIntermediate = 43,
}

impl TryFrom<u8> for ExchangeType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0..=33 => Err(UnparseableParameter::Reserved),
            34 => Ok(ExchangeType::IkeSaInit),
            35 => Ok(ExchangeType::IkeAuth),
            36 => Ok(ExchangeType::CreateChildSa),
            37 => Ok(ExchangeType::Informational),
            43 => Ok(ExchangeType::IkeIntermediate),
            38..=42 | 44..=239 => Err(UnparseableParameter::Unassigned),
            240..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of the payload being used
///
/// Refer to https://www.iana.org/assignments/ikev2-parameters/ikev2-parameters.xhtml
/// for details. Notably, values 1-32 are reserved, 55-127 are currently
/// unassigned and 128-255 reserved for private use.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum PayloadType {
    // RFC 7296, this also matches the IKEv1 value while all other values do not
    NoNextPayload = 0,
    // RFC 7296
    SecurityAssociation = 33,
    // RFC 7296
    KeyExchange = 34,
    // RFC 7296
    IdentificationInitiator = 35,
    // RFC 7296
    IdentificationResponder = 36,
    // RFC 7296
    Certificate = 37,
    // RFC 7296
    CertificateRequest = 38,
    // RFC 7296
    Authentication = 39,
    // RFC 7296
    Nonce = 40,
    // RFC 7296
    Notify = 41,
    // RFC 7296
    Delete = 42,
    // RFC 7296
    VendorID = 43,
    // RFC 7296
    TrafficSelectorInitiator = 44,
    // RFC 7296
    TrafficSelectorResponder = 45,
    // RFC 7296
    EncryptedAndAuthenticated = 46,
    // RFC 7296
    Configuration = 47,
    // RFC 7296
    ExtensibleAuthentication = 48,
    // RFC 7383
    EncryptedAndAuthenticatedFragment = 53,
}

impl TryFrom<u8> for PayloadType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PayloadType::NoNextPayload),
            1..=32 => Err(UnparseableParameter::Reserved),
            33 => Ok(PayloadType::SecurityAssociation),
            34 => Ok(PayloadType::KeyExchange),
            35 => Ok(PayloadType::IdentificationInitiator),
            36 => Ok(PayloadType::IdentificationResponder),
            37 => Ok(PayloadType::Certificate),
            38 => Ok(PayloadType::CertificateRequest),
            39 => Ok(PayloadType::Authentication),
            40 => Ok(PayloadType::Nonce),
            41 => Ok(PayloadType::Notify),
            42 => Ok(PayloadType::Delete),
            43 => Ok(PayloadType::VendorID),
            44 => Ok(PayloadType::TrafficSelectorInitiator),
            45 => Ok(PayloadType::TrafficSelectorResponder),
            46 => Ok(PayloadType::EncryptedAndAuthenticated),
            47 => Ok(PayloadType::Configuration),
            48 => Ok(PayloadType::ExtensibleAuthentication),
            53 => Ok(PayloadType::EncryptedAndAuthenticatedFragment),
            49..=52 | 54..=127 => Err(UnparseableParameter::Unassigned),
            128..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of the transform being used
///
/// Value 0 is reserved, 6-240 is unassigned for the purposes of this
/// implementation and 241-255 is reserved for private use.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TransformType {
    EncryptionAlgorithm = 1,
    PseudoRandomFunction = 2,
    IntegrityAlgorithm = 3,
    KeyExchangeMethod = 4,
    SequenceNumber = 5,
}

impl TryFrom<u8> for TransformType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(TransformType::EncryptionAlgorithm),
            2 => Ok(TransformType::PseudoRandomFunction),
            3 => Ok(TransformType::IntegrityAlgorithm),
            4 => Ok(TransformType::KeyExchangeMethod),
            5 => Ok(TransformType::SequenceNumber),
            6..=240 => Err(UnparseableParameter::Unassigned),
            241..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Transform Type 1 - encryption algorithms
///
/// Only AEAD ciphers and AES-CBC are recognized; everything else in the
/// registry is either deprecated or of no use for ESP/IKE here.
#[derive(
    Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, EnumIter, Serialize, Deserialize,
)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum EncryptionAlgorithm {
    // RFC 3602
    AesCbc = 12,
    // RFC 4106
    AesGcm8 = 18,
    // RFC 4106
    AesGcm12 = 19,
    // RFC 4106
    AesGcm16 = 20,
    // RFC 8439
    ChaCha20Poly1305 = 28,
}

impl TryFrom<u16> for EncryptionAlgorithm {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            12 => Ok(EncryptionAlgorithm::AesCbc),
            18 => Ok(EncryptionAlgorithm::AesGcm8),
            19 => Ok(EncryptionAlgorithm::AesGcm12),
            20 => Ok(EncryptionAlgorithm::AesGcm16),
            28 => Ok(EncryptionAlgorithm::ChaCha20Poly1305),
            1024..=65535 => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

impl EncryptionAlgorithm {
    /// Whether the cipher provides its own integrity protection
    pub fn is_aead(&self) -> bool {
        !matches!(self, EncryptionAlgorithm::AesCbc)
    }
}

/// Transform Type 2 - pseudorandom functions
#[derive(
    Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, EnumIter, Serialize, Deserialize,
)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum PseudorandomFunction {
    // RFC 4868
    HmacSha2_256 = 5,
    // RFC 4868
    HmacSha2_384 = 6,
    // RFC 4868
    HmacSha2_512 = 7,
}

impl TryFrom<u16> for PseudorandomFunction {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            5 => Ok(PseudorandomFunction::HmacSha2_256),
            6 => Ok(PseudorandomFunction::HmacSha2_384),
            7 => Ok(PseudorandomFunction::HmacSha2_512),
            1024..=65535 => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

impl PseudorandomFunction {
    /// Size in octets of the function's output and preferred key
    pub fn output_size(&self) -> usize {
        match self {
            PseudorandomFunction::HmacSha2_256 => 32,
            PseudorandomFunction::HmacSha2_384 => 48,
            PseudorandomFunction::HmacSha2_512 => 64,
        }
    }
}

/// Transform Type 3 - integrity algorithms
#[derive(
    Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, EnumIter, Serialize, Deserialize,
)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum IntegrityAlgorithm {
    // RFC 7296, only valid in combination with an AEAD cipher
    None = 0,
    // RFC 4868
    HmacSha2_256_128 = 12,
    // RFC 4868
    HmacSha2_384_192 = 13,
    // RFC 4868
    HmacSha2_512_256 = 14,
}

impl TryFrom<u16> for IntegrityAlgorithm {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IntegrityAlgorithm::None),
            12 => Ok(IntegrityAlgorithm::HmacSha2_256_128),
            13 => Ok(IntegrityAlgorithm::HmacSha2_384_192),
            14 => Ok(IntegrityAlgorithm::HmacSha2_512_256),
            1024..=65535 => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

impl IntegrityAlgorithm {
    /// Size in octets of the truncated MAC carried on the wire
    pub fn tag_size(&self) -> usize {
        match self {
            IntegrityAlgorithm::None => 0,
            IntegrityAlgorithm::HmacSha2_256_128 => 16,
            IntegrityAlgorithm::HmacSha2_384_192 => 24,
            IntegrityAlgorithm::HmacSha2_512_256 => 32,
        }
    }

    /// Size in octets of the key feeding the MAC
    pub fn key_size(&self) -> usize {
        match self {
            IntegrityAlgorithm::None => 0,
            IntegrityAlgorithm::HmacSha2_256_128 => 32,
            IntegrityAlgorithm::HmacSha2_384_192 => 48,
            IntegrityAlgorithm::HmacSha2_512_256 => 64,
        }
    }
}

/// Transform Type 4 - key exchange methods
///
/// Originally named "Diffie-Hellman Group (D-H)" and referenced by that name
/// in a number of RFCs published prior to RFC 9370, which gave it the current
/// title.
#[derive(
    Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, EnumIter, Serialize, Deserialize,
)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum KeyExchangeMethod {
    // RFC 3526
    Modp2048 = 14,
    // RFC 3526
    Modp3072 = 15,
    // RFC 3526
    Modp4096 = 16,
    // RFC 5903
    Ecp256 = 19,
    // RFC 5903
    Ecp384 = 20,
    // RFC 8031
    Curve25519 = 31,
    // RFC 8031
    Curve448 = 32,
}

impl TryFrom<u16> for KeyExchangeMethod {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            14 => Ok(KeyExchangeMethod::Modp2048),
            15 => Ok(KeyExchangeMethod::Modp3072),
            16 => Ok(KeyExchangeMethod::Modp4096),
            19 => Ok(KeyExchangeMethod::Ecp256),
            20 => Ok(KeyExchangeMethod::Ecp384),
            31 => Ok(KeyExchangeMethod::Curve25519),
            32 => Ok(KeyExchangeMethod::Curve448),
            1024..=65535 => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

/// Transform Type 5 - extended sequence numbers
#[derive(
    Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, EnumIter, Serialize, Deserialize,
)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum SequenceNumbers {
    NoExtended = 0,
    Extended = 1,
}

impl TryFrom<u16> for SequenceNumbers {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SequenceNumbers::NoExtended),
            1 => Ok(SequenceNumbers::Extended),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

/// Identifier for the protocol inside a Proposal, Notify or Delete
///
/// Value 0 is reserved as a placeholder for "no protocol", which is only
/// legal in notifications that carry no SPI.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum SecurityProtocol {
    Reserved = 0,
    InternetKeyExchange = 1,
    AuthenticationHeader = 2,
    EncapsulatingSecurityPayload = 3,
}

impl TryFrom<u8> for SecurityProtocol {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SecurityProtocol::Reserved),
            1 => Ok(SecurityProtocol::InternetKeyExchange),
            2 => Ok(SecurityProtocol::AuthenticationHeader),
            3 => Ok(SecurityProtocol::EncapsulatingSecurityPayload),
            4..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of authentication method being used
///
/// Value 0 is reserved, values 4-8 and 15-200 are unassigned and
/// values 201-255 are reserved for private use.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Copy, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum AuthMethod {
    RsaDigitalSignature = 1,
    SharedKeyMic = 2,
    DssDigitalSignature = 3,
    EcdsaSha256 = 9,  // with P-256 curve
    EcdsaSha384 = 10, // with P-384 curve
    EcdsaSha512 = 11, // with P-521 curve
    NullAuthentication = 13,
    DigitalSignature = 14,
}

impl TryFrom<u8> for AuthMethod {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(AuthMethod::RsaDigitalSignature),
            2 => Ok(AuthMethod::SharedKeyMic),
            3 => Ok(AuthMethod::DssDigitalSignature),
            4..=8 => Err(UnparseableParameter::Unassigned),
            9 => Ok(AuthMethod::EcdsaSha256),
            10 => Ok(AuthMethod::EcdsaSha384),
            11 => Ok(AuthMethod::EcdsaSha512),
            13 => Ok(AuthMethod::NullAuthentication),
            14 => Ok(AuthMethod::DigitalSignature),
            12 | 15..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of the identification data carried in an IDi or IDr payload
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Copy, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum IdType {
    Ipv4Addr = 1,
    Fqdn = 2,
    Rfc822Addr = 3,
    Ipv6Addr = 5,
    DerAsn1Dn = 9,
    DerAsn1Gn = 10,
    KeyId = 11,
    // RFC 7619
    Null = 13,
}

impl TryFrom<u8> for IdType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(IdType::Ipv4Addr),
            2 => Ok(IdType::Fqdn),
            3 => Ok(IdType::Rfc822Addr),
            4 => Err(UnparseableParameter::Unassigned),
            5 => Ok(IdType::Ipv6Addr),
            6..=8 => Err(UnparseableParameter::Reserved),
            9 => Ok(IdType::DerAsn1Dn),
            10 => Ok(IdType::DerAsn1Gn),
            11 => Ok(IdType::KeyId),
            12 => Err(UnparseableParameter::Reserved),
            13 => Ok(IdType::Null),
            14..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Indicator for the encoding of certificates and related data
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Copy, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum CertificateEncoding {
    X509CertificateSignature = 4,
    HashUrlX509Certificate = 12,
    RawPublicKey = 15,
}

impl TryFrom<u8> for CertificateEncoding {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 | 5 => Err(UnparseableParameter::Reserved),
            4 => Ok(CertificateEncoding::X509CertificateSignature),
            12 => Ok(CertificateEncoding::HashUrlX509Certificate),
            15 => Ok(CertificateEncoding::RawPublicKey),
            201..=255 => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

/// Address family of a traffic selector
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Copy, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TsType {
    Ipv4AddrRange = 7,
    Ipv6AddrRange = 8,
}

impl TryFrom<u8> for TsType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            7 => Ok(TsType::Ipv4AddrRange),
            8 => Ok(TsType::Ipv6AddrRange),
            241..=255 => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

/// Kind of a configuration payload exchange
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Copy, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum CfgType {
    Request = 1,
    Reply = 2,
    Set = 3,
    Ack = 4,
}

impl TryFrom<u8> for CfgType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(CfgType::Request),
            2 => Ok(CfgType::Reply),
            3 => Ok(CfgType::Set),
            4 => Ok(CfgType::Ack),
            5..=127 => Err(UnparseableParameter::Unassigned),
            128..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Attribute types inside a configuration payload
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Copy, Hash, Serialize, Deserialize)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum ConfigAttributeType {
    InternalIp4Address = 1,
    InternalIp4Netmask = 2,
    InternalIp4Dns = 3,
    ApplicationVersion = 7,
    InternalIp6Address = 8,
    InternalIp6Dns = 10,
}

impl TryFrom<u16> for ConfigAttributeType {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(ConfigAttributeType::InternalIp4Address),
            2 => Ok(ConfigAttributeType::InternalIp4Netmask),
            3 => Ok(ConfigAttributeType::InternalIp4Dns),
            7 => Ok(ConfigAttributeType::ApplicationVersion),
            8 => Ok(ConfigAttributeType::InternalIp6Address),
            10 => Ok(ConfigAttributeType::InternalIp6Dns),
            16384..=32767 => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

/// Hash algorithms negotiable through the SIGNATURE_HASH_ALGORITHMS notify
/// (RFC 7427); SHA-1 is recognized on receipt but never offered or accepted
/// for signing (RFC 8247)
#[derive(
    Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Copy, Hash, EnumIter, Serialize, Deserialize,
)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum SignatureHashAlgorithm {
    Sha1 = 1,
    Sha2_256 = 2,
    Sha2_384 = 3,
    Sha2_512 = 4,
    Identity = 5,
}

impl TryFrom<u16> for SignatureHashAlgorithm {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(SignatureHashAlgorithm::Sha1),
            2 => Ok(SignatureHashAlgorithm::Sha2_256),
            3 => Ok(SignatureHashAlgorithm::Sha2_384),
            4 => Ok(SignatureHashAlgorithm::Sha2_512),
            5 => Ok(SignatureHashAlgorithm::Identity),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

/// Specifies the type of a notification message
///
/// Types in the range 0-16383 are intended for reporting errors. An
/// implementation receiving a Notify payload with one of these types
/// that it does not recognize in a response MUST assume that the
/// corresponding request has failed entirely. Unrecognized error types
/// in a request and status types in a request or response MUST be
/// ignored, and they should be logged. Notify payloads with status types
/// greater than 16383 MAY be added to any message and MUST be ignored if not
/// recognized. They are intended to indicate capabilities, and as part
/// of SA negotiation, are used to negotiate non-cryptographic parameters.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, Serialize, Deserialize)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum NotifyType {
    // --- error types, RFC 7296 unless noted ---
    UnsupportedCriticalPayload = 1,
    InvalidIkeSpi = 4,
    InvalidMajorVersion = 5,
    InvalidSyntax = 7,
    InvalidMessageId = 9,
    InvalidSpi = 11,
    NoProposalChosen = 14,
    InvalidKePayload = 17,
    AuthenticationFailed = 24,
    SinglePairRequired = 34,
    NoAdditionalSas = 35,
    InternalAddressFailure = 36,
    FailedCpRequired = 37,
    TsUnacceptable = 38,
    InvalidSelectors = 39,
    TemporaryFailure = 43,
    ChildSaNotFound = 44,

    // --- status types ---
    // RFC 7296
    InitialContact = 16384,
    // RFC 7296
    SetWindowSize = 16385,
    // RFC 7296
    AdditionalTsPossible = 16386,
    // RFC 7296
    IpcompSupported = 16387,
    // RFC 7296
    NatDetectionSourceIp = 16388,
    // RFC 7296
    NatDetectionDestinationIp = 16389,
    // RFC 7296
    Cookie = 16390,
    // RFC 7296
    UseTransportMode = 16391,
    // RFC 7296
    HttpCertLookupSupported = 16392,
    // RFC 7296
    RekeySa = 16393,
    // RFC 7296
    EspTfcPaddingNotSupported = 16394,
    // RFC 7296
    NonFirstFragmentsAlso = 16395,
    // RFC 4555
    MobikeSupported = 16396,
    // RFC 4555
    AdditionalIp4Address = 16397,
    // RFC 4555
    AdditionalIp6Address = 16398,
    // RFC 4555
    NoAdditionalAddresses = 16399,
    // RFC 4555
    UpdateSaAddresses = 16400,
    // RFC 4555
    Cookie2 = 16401,
    // RFC 4555
    NoNatsAllowed = 16402,
    // RFC 5685
    RedirectSupported = 16406,
    // RFC 5685
    Redirect = 16407,
    // RFC 5685
    RedirectedFrom = 16408,
    // RFC 7383
    FragmentationSupported = 16430,
    // RFC 7427
    SignatureHashAlgorithms = 16431,
    // RFC 8784
    UsePpk = 16435,
    // RFC 8784
    PpkIdentity = 16436,
    // RFC 8784
    NoPpkAuth = 16437,
    // RFC 9242
    IntermediateExchangeSupported = 16438,
    // draft-smyslov-ipsecme-ikev2-null-auth, private-use range
    NullAuth = 40960,
}

impl TryFrom<u16> for NotifyType {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NotifyType::UnsupportedCriticalPayload),
            4 => Ok(NotifyType::InvalidIkeSpi),
            5 => Ok(NotifyType::InvalidMajorVersion),
            7 => Ok(NotifyType::InvalidSyntax),
            9 => Ok(NotifyType::InvalidMessageId),
            11 => Ok(NotifyType::InvalidSpi),
            14 => Ok(NotifyType::NoProposalChosen),
            17 => Ok(NotifyType::InvalidKePayload),
            24 => Ok(NotifyType::AuthenticationFailed),
            34 => Ok(NotifyType::SinglePairRequired),
            35 => Ok(NotifyType::NoAdditionalSas),
            36 => Ok(NotifyType::InternalAddressFailure),
            37 => Ok(NotifyType::FailedCpRequired),
            38 => Ok(NotifyType::TsUnacceptable),
            39 => Ok(NotifyType::InvalidSelectors),
            43 => Ok(NotifyType::TemporaryFailure),
            44 => Ok(NotifyType::ChildSaNotFound),
            16384 => Ok(NotifyType::InitialContact),
            16385 => Ok(NotifyType::SetWindowSize),
            16386 => Ok(NotifyType::AdditionalTsPossible),
            16387 => Ok(NotifyType::IpcompSupported),
            16388 => Ok(NotifyType::NatDetectionSourceIp),
            16389 => Ok(NotifyType::NatDetectionDestinationIp),
            16390 => Ok(NotifyType::Cookie),
            16391 => Ok(NotifyType::UseTransportMode),
            16392 => Ok(NotifyType::HttpCertLookupSupported),
            16393 => Ok(NotifyType::RekeySa),
            16394 => Ok(NotifyType::EspTfcPaddingNotSupported),
            16395 => Ok(NotifyType::NonFirstFragmentsAlso),
            16396 => Ok(NotifyType::MobikeSupported),
            16397 => Ok(NotifyType::AdditionalIp4Address),
            16398 => Ok(NotifyType::AdditionalIp6Address),
            16399 => Ok(NotifyType::NoAdditionalAddresses),
            16400 => Ok(NotifyType::UpdateSaAddresses),
            16401 => Ok(NotifyType::Cookie2),
            16402 => Ok(NotifyType::NoNatsAllowed),
            16406 => Ok(NotifyType::RedirectSupported),
            16407 => Ok(NotifyType::Redirect),
            16408 => Ok(NotifyType::RedirectedFrom),
            16430 => Ok(NotifyType::FragmentationSupported),
            16431 => Ok(NotifyType::SignatureHashAlgorithms),
            16435 => Ok(NotifyType::UsePpk),
            16436 => Ok(NotifyType::PpkIdentity),
            16437 => Ok(NotifyType::NoPpkAuth),
            16438 => Ok(NotifyType::IntermediateExchangeSupported),
            40960 => Ok(NotifyType::NullAuth),
            0 | 2..=3 | 6 | 8 | 10 | 12..=13 | 15..=16 | 18..=23 | 25..=33 | 40..=42 => {
                Err(UnparseableParameter::Reserved)
            }
            45..=8191 | 16403..=16405 | 16409..=16429 | 16432..=16434 | 16439..=40959 => {
                Err(UnparseableParameter::Unassigned)
            }
            8192..=16383 | 40961..=65535 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

impl NotifyType {
    /// Whether the type falls into the error range below 16384
    pub fn is_error(&self) -> bool {
        (*self as u16) < 16384
    }
}
