use log::warn;
use zerocopy::FromBytes;

use crate::definitions::params::{ExchangeType, FLAG_INITIATOR, FLAG_RESPONSE};
use crate::definitions::{Header, Message};
use crate::parser::{parse_payload_chain, ParserError};
use crate::{IKE_2_VERSION_VALUE, IKE_HEADER_SIZE};

/// The fixed header fields in host representation, available before deciding
/// whether the rest of the message is worth parsing
#[derive(Debug, Clone, Copy)]
pub struct RawHeader {
    /// SPI chosen by the original initiator
    pub initiator_spi: u64,
    /// SPI chosen by the responder
    pub responder_spi: u64,
    /// Exchange type byte, unvalidated
    pub exchange_type: u8,
    /// Whether the initiator flag is set
    pub initiator: bool,
    /// Whether the response flag is set
    pub response: bool,
    /// Message ID
    pub message_id: u32,
    /// Claimed total length
    pub length: u32,
}

impl RawHeader {
    /// Peek at the fixed header without touching the payload chain
    ///
    /// The engine uses this to locate the owning IKE SA and validate the
    /// message ID window before spending cycles on full payload parsing.
    pub fn try_parse(buf: &[u8]) -> Result<Self, ParserError> {
        let header = Header::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
        if header.version != IKE_2_VERSION_VALUE {
            return Err(ParserError::WrongProtocol);
        }
        Ok(Self {
            initiator_spi: header.initiator_spi.get(),
            responder_spi: header.responder_spi.get(),
            exchange_type: header.exchange_type,
            initiator: header.flags & FLAG_INITIATOR == FLAG_INITIATOR,
            response: header.flags & FLAG_RESPONSE == FLAG_RESPONSE,
            message_id: header.message_id.get(),
            length: header.length.get(),
        })
    }
}

impl Message {
    /// Parse a buffer into a [Message], if possible.
    ///
    /// The parser functionality considers the size of payloads noted in
    /// the header of the respective payload to split the buffer and feed
    /// them into sub-parser functions. These parse the structure of the
    /// payload based on the length and "next payload" fields; a packet
    /// must have both correct payload header information and inner
    /// structural integrity, otherwise parsing fails.
    pub fn try_parse(buf: &[u8]) -> Result<Self, ParserError> {
        let header = Header::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
        if header.version != IKE_2_VERSION_VALUE {
            return Err(ParserError::WrongProtocol);
        }
        let claimed = header.length.get() as usize;
        if claimed < IKE_HEADER_SIZE || claimed > buf.len() {
            return Err(ParserError::BufferTooSmall);
        }
        if claimed != buf.len() {
            warn!("Buffer length does not match header length, ignoring trailing bytes");
        }

        let payloads = parse_payload_chain(header.next_payload, &buf[IKE_HEADER_SIZE..claimed])?;

        Ok(Self {
            initiator_spi: header.initiator_spi.get(),
            responder_spi: header.responder_spi.get(),
            exchange_type: ExchangeType::try_from(header.exchange_type)?,
            initiator: header.flags & FLAG_INITIATOR == FLAG_INITIATOR,
            response: header.flags & FLAG_RESPONSE == FLAG_RESPONSE,
            message_id: header.message_id.get(),
            payloads,
        })
    }
}
