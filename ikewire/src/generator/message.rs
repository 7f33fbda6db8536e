use zerocopy::network_endian::{U32, U64};
use zerocopy::AsBytes;

use crate::definitions::params::{FLAG_INITIATOR, FLAG_RESPONSE};
use crate::definitions::{Header, Message};
use crate::generator::{build_payload_chain, GeneratorError};
use crate::{IKE_2_VERSION_VALUE, IKE_HEADER_SIZE};

impl Message {
    /// Build a network-level packet from a [Message]
    ///
    /// This might fail if the packet would not conform to the standard, for
    /// example if a proposal doesn't provide all details required to build
    /// it, or if too many of a certain type of structure is required.
    pub fn try_build(&self) -> Result<Vec<u8>, GeneratorError> {
        let (first_payload, payloads) = build_payload_chain(&self.payloads)?;

        let packet_length = IKE_HEADER_SIZE as u32 + payloads.len() as u32;
        let header = Header {
            initiator_spi: U64::from(self.initiator_spi),
            responder_spi: U64::from(self.responder_spi),
            next_payload: first_payload as u8,
            version: IKE_2_VERSION_VALUE,
            exchange_type: self.exchange_type as u8,
            flags: (if self.initiator { FLAG_INITIATOR } else { 0 })
                | (if self.response { FLAG_RESPONSE } else { 0 }),
            message_id: U32::from(self.message_id),
            length: U32::from(packet_length),
        };

        let mut packet = Vec::with_capacity(packet_length as usize);
        packet.extend_from_slice(header.as_bytes());
        packet.extend(payloads);
        Ok(packet)
    }
}
