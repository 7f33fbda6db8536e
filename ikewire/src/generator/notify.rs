use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::{DeleteHeader, GenericPayloadHeader, NotifyHeader};
use crate::definitions::params::{PayloadType, SecurityProtocol};
use crate::definitions::{Delete, Notification};
use crate::generator::GeneratorError;

impl Notification {
    pub(crate) fn try_build(&self, next_payload: PayloadType) -> Result<Vec<u8>, GeneratorError> {
        let spi_len = match &self.spi {
            None => 0,
            Some(spi) if spi.len() < 256 => spi.len() as u8,
            Some(_) => return Err(GeneratorError::InvalidSpiLength),
        };
        let generic_header = GenericPayloadHeader {
            next_payload: next_payload as u8,
            critical_reserved: 0,
            payload_length: U16::from(8 + spi_len as u16 + self.data.len() as u16),
        };
        let notify_header = NotifyHeader {
            protocol_id: if self.spi.is_none() {
                SecurityProtocol::Reserved as u8
            } else {
                self.protocol as u8
            },
            spi_size: spi_len,
            notify_message_type: U16::from(self.notify_type as u16),
        };

        let mut packet = Vec::with_capacity(self.data.len() + 8);
        packet.extend_from_slice(generic_header.as_bytes());
        packet.extend_from_slice(notify_header.as_bytes());
        if let Some(spi) = &self.spi {
            packet.extend_from_slice(spi);
        }
        packet.extend_from_slice(&self.data);
        Ok(packet)
    }
}

impl Delete {
    pub(crate) fn try_build(&self, next_payload: PayloadType) -> Result<Vec<u8>, GeneratorError> {
        let (spi_size, num_spis) = match self.protocol {
            SecurityProtocol::InternetKeyExchange => {
                if !self.spis.is_empty() {
                    return Err(GeneratorError::InvalidSpiLength);
                }
                (0u8, 0usize)
            }
            SecurityProtocol::AuthenticationHeader
            | SecurityProtocol::EncapsulatingSecurityPayload => (4, self.spis.len()),
            SecurityProtocol::Reserved => return Err(GeneratorError::InvalidSpiLength),
        };

        let generic_header = GenericPayloadHeader {
            next_payload: next_payload as u8,
            critical_reserved: 0,
            payload_length: U16::from(8 + (spi_size as usize * num_spis) as u16),
        };
        let delete_header = DeleteHeader {
            protocol_id: self.protocol as u8,
            spi_size,
            num_spis: U16::from(num_spis as u16),
        };

        let mut packet = Vec::with_capacity(8 + 4 * num_spis);
        packet.extend_from_slice(generic_header.as_bytes());
        packet.extend_from_slice(delete_header.as_bytes());
        for spi in &self.spis {
            packet.extend_from_slice(&spi.to_be_bytes());
        }
        Ok(packet)
    }
}
