//! Module containing network level header structs for pieces of the protocol

use zerocopy::network_endian::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Fixed header starting every IKEv2 message
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                       IKE SA Initiator's SPI                  |
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                       IKE SA Responder's SPI                  |
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                          Message ID                           |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                            Length                             |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct Header {
    /// SPI chosen by the initiator of the IKE SA, must never be zero
    pub initiator_spi: U64,
    /// SPI chosen by the responder, zero in the first message of IKE_SA_INIT
    pub responder_spi: U64,
    /// Type of the first payload following the header, see
    /// [PayloadType](super::params::PayloadType)
    pub next_payload: u8,
    /// Major and minor version in 4 bits each, must be 2.0 for IKEv2
    pub version: u8,
    /// Type of the exchange this message belongs to, see
    /// [ExchangeType](super::params::ExchangeType)
    pub exchange_type: u8,
    /// Flag bits, of which only Initiator (bit 3), Version (bit 4)
    /// and Response (bit 5) are defined
    pub flags: u8,
    /// Monotonic per-direction counter used to match requests and responses
    /// and to reject replays
    pub message_id: U32,
    /// Length in octets of the whole message including this header
    pub length: U32,
}

/// Generic header starting every IKEv2 payload
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Next Payload  |C|  RESERVED   |         Payload Length        |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// The critical bit and the reserved bits share the second octet; the
/// reserved bits must be zero on emission and cause the payload to be
/// refused when set on receipt.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct GenericPayloadHeader {
    /// Type of the payload following this one, or zero for the last payload
    pub next_payload: u8,
    /// Critical flag in the top bit, all other bits reserved and zero
    pub critical_reserved: u8,
    /// Length in octets of the current payload, including this header
    pub payload_length: U16,
}

/// Mask of the critical bit within [GenericPayloadHeader::critical_reserved]
pub const FLAG_CRITICAL: u8 = 0b1000_0000;

/// Protocol header for a Proposal substructure of an SA payload
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Last Substruc |   RESERVED    |         Proposal Length       |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Proposal Num  |  Protocol ID  |    SPI Size   |Num  Transforms|
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     ~                        SPI (variable)                         ~
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                        <Transforms>                           ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct ProposalHeader {
    /// Specification whether the Proposal is the last of the Security
    /// Association, uses value 0 for the last and value 2 for any other
    pub last_substruct: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: u8,
    /// Length in octets of the current Proposal, including the header itself
    pub proposal_length: U16,
    /// Number of this Proposal in the Security Association; it must start at 1
    /// and increment by 1 in a request; a response repeats the number of the
    /// accepted proposal
    pub proposal_num: u8,
    /// Identifier for the protocol inside the Proposal (IKE, AH or ESP), see
    /// [SecurityProtocol](super::params::SecurityProtocol)
    pub protocol_id: u8,
    /// Size of the SPI in octets: 0 for the initial IKE negotiation, 8 for an
    /// IKE SA being rekeyed and 4 for AH/ESP proposals
    pub spi_size: u8,
    /// Number of transformations
    pub num_transforms: u8,
    // following: the variable-size SPI and a list of Transforms
}

/// Protocol header for a Transform substructure of a Proposal
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Last Substruc |   RESERVED    |        Transform Length       |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |Transform Type |   RESERVED    |          Transform ID         |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                      Transform Attributes                     ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// The transform attributes are not part of the header and thus not included
/// in the struct.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TransformHeader {
    /// Specification whether the Transform is the last of the Proposal, uses
    /// value 0 for the last and value 3 for any other
    pub last_substruct: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: u8,
    /// Length in octets of the current Transform, including the header itself
    pub transform_length: U16,
    /// Type of transformation found in the body of this payload;
    /// see RFC 7296, section 3.3.2; also see
    /// [TransformType](super::params::TransformType)
    pub transform_type: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved2: u8,
    /// Identifier for the actually used transformation inside the Transform
    /// body, where the ID depends on the transform type; for example, if the
    /// transform type was 1 (encryption algorithms) and the transform ID was
    /// 20, then the selected encryption algorithm was AES-GCM with a 16 octet
    /// ICV
    pub transform_id: U16,
}

/// Protocol field for attributes of a Transform as per RFC 7296, section 3.3.5
///
///                         1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |A|       Attribute Type        |    AF=0  Attribute Length     |
///     |F|                             |    AF=1  Attribute Value      |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                   AF=0  Attribute Value                       |
///     |                   AF=1  Not Transmitted                       |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// Only the fixed-length TV variant is emitted by this implementation, as the
/// single supported attribute (key length) uses it.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct AttributeHeader {
    /// Type of the attribute encoded in the value field; the top bit set to 1
    /// selects the fixed-length variant
    pub attribute_type: U16,
    /// Fixed-length attribute value specific for a transformation, currently
    /// only the key length is supported as valid attribute
    pub attribute_value: U16,
}

/// Flag inside [AttributeHeader::attribute_type] selecting the TV format
pub const FLAG_ATTRIBUTE_FORMAT: u16 = 0b1000_0000_0000_0000;

impl AttributeHeader {
    /// Determine whether the fixed-length TV variant is used or the
    /// variable-length TLV variant
    pub fn is_fixed_length(&self) -> bool {
        u16::from(self.attribute_type) & FLAG_ATTRIBUTE_FORMAT == FLAG_ATTRIBUTE_FORMAT
    }
}

/// Protocol header for key exchange payloads
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |   Diffie-Hellman Group Num    |           RESERVED            |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                       Key Exchange Data                       ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// The group number must match a key exchange method transform offered in the
/// SA payload of the same message. The key exchange data is not part of the
/// header and thus not included in the struct.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct KeyExchangeHeader {
    /// DH group number as per [KeyExchangeMethod](super::params::KeyExchangeMethod)
    pub dh_group_num: U16,
    /// Ignored but must be set to 0
    pub reserved: U16,
}

/// Protocol header for notify payloads
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |  Protocol ID  |   SPI Size    |      Notify Message Type      |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                Security Parameter Index (SPI)                 ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                       Notification Data                       ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// Of the notifications defined in RFC 7296, an SPI is included only with
/// INVALID_SELECTORS, REKEY_SA and CHILD_SA_NOT_FOUND. If the SPI field is
/// empty, the protocol ID must be sent as zero and ignored on receipt.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct NotifyHeader {
    /// Type of the SA the notification concerns (AH or ESP for Child SAs),
    /// or zero when no SPI is carried
    pub protocol_id: u8,
    /// Length in octets of the SPI as defined by the protocol ID, or zero
    pub spi_size: u8,
    /// Specifies the type of notification message, see
    /// [NotifyType](super::params::NotifyType). Types in the range 0-16383
    /// report errors; status types greater than 16383 indicate capabilities
    /// and must be ignored if not recognized.
    pub notify_message_type: U16,
}

impl NotifyHeader {
    /// Whether the carried type falls into the error range
    pub fn is_error(&self) -> bool {
        self.notify_message_type.get() < 16384
    }
}

/// Protocol header for delete payloads
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |  Protocol ID  |   SPI Size    |          Num of SPIs          |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~               Security Parameter Index(es) (SPI)              ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// A delete of the IKE SA itself carries protocol ID 1 with an SPI size and
/// count of zero; deletes of Child SAs list one or more 4 octet SPIs.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct DeleteHeader {
    /// Protocol of the SAs being deleted
    pub protocol_id: u8,
    /// Size of each SPI in the list, zero for IKE
    pub spi_size: u8,
    /// Number of SPIs following, zero for IKE
    pub num_spis: U16,
}

/// Protocol header for identification payloads (IDi and IDr)
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |   ID Type     |                 RESERVED                      |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                   Identification Data                         ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// This header together with the identification data forms exactly the bytes
/// MACed into the AUTH payload computation, which is why the reserved bytes
/// are modeled explicitly.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct IdentificationHeader {
    /// Type of the identification data, see [IdType](super::params::IdType)
    pub id_type: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: [u8; 3],
}

/// Protocol header for the authentication payload
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Auth Method   |                RESERVED                       |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                      Authentication Data                      ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct AuthenticationHeader {
    /// Method used to compute the authentication data, see
    /// [AuthMethod](super::params::AuthMethod)
    pub auth_method: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: [u8; 3],
}

/// Protocol header for a single traffic selector substructure
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |   TS Type     |IP Protocol ID*|       Selector Length         |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |           Start Port*         |           End Port*           |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                         Starting Address*                     ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                         Ending Address*                       ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// The TS payload itself starts with a one octet selector count and three
/// reserved octets before the list of selector substructures.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TrafficSelectorHeader {
    /// Address family of the selector, see [TsType](super::params::TsType)
    pub ts_type: u8,
    /// IP protocol (e.g. UDP or TCP) the selector is narrowed to, or zero
    pub ip_protocol_id: u8,
    /// Length in octets of this selector substructure including this header
    pub selector_length: U16,
    /// First port of the matched range, zero for "any"
    pub start_port: U16,
    /// Last port of the matched range, 65535 for "any"
    pub end_port: U16,
}

/// Protocol header for configuration payloads
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |   CFG Type    |                    RESERVED                   |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                   Configuration Attributes                    ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct ConfigurationHeader {
    /// Kind of the configuration exchange, see [CfgType](super::params::CfgType)
    pub cfg_type: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: [u8; 3],
}

/// Protocol field for a single configuration attribute
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |R|         Attribute Type      |            Length             |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                             Value                             ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct ConfigurationAttributeHeader {
    /// Attribute type with the top (reserved) bit zero, see
    /// [ConfigAttributeType](super::params::ConfigAttributeType)
    pub attribute_type: U16,
    /// Length in octets of the value
    pub length: U16,
}

/// Protocol header for an encrypted fragment payload (RFC 7383)
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |        Fragment Number        |        Total Fragments        |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                Initialization Vector + Ciphertext             ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// The fragment number is one-based. Only the first fragment carries the
/// payload type of the inner chain in its generic header's next payload
/// field, all others carry zero.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct EncryptedFragmentHeader {
    /// One-based index of this fragment
    pub fragment_number: U16,
    /// Total number of fragments the message was split into
    pub total_fragments: U16,
}
