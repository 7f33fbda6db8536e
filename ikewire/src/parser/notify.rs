use zerocopy::FromBytes;

use crate::definitions::header::{DeleteHeader, NotifyHeader};
use crate::definitions::params::{NotifyType, SecurityProtocol};
use crate::definitions::{Delete, Notification};
use crate::parser::ParserError;

/// Parses a buffer into a [Notification]. The buffer must not contain the
/// generic payload header. Fails if the buffer is empty.
pub(crate) fn parse_notification(buf: &[u8]) -> Result<Notification, ParserError> {
    let header = NotifyHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    let spi_size = header.spi_size as usize;
    let notify_type = NotifyType::try_from(header.notify_message_type.get())?;
    let protocol = SecurityProtocol::try_from(header.protocol_id)?;

    if spi_size > 0 && protocol == SecurityProtocol::InternetKeyExchange {
        // It is not legal to have both an SPI and use IKE
        return Err(ParserError::ProtocolViolation);
    } else if spi_size == 0 && protocol != SecurityProtocol::Reserved {
        // If the SPI is not sent, the protocol ID must be 0 (=reserved)
        return Err(ParserError::ProtocolViolation);
    }
    if buf.len() < size_of::<NotifyHeader>() + spi_size {
        return Err(ParserError::BufferTooSmall);
    }

    let spi = if spi_size > 0 {
        Some(buf[size_of::<NotifyHeader>()..size_of::<NotifyHeader>() + spi_size].to_vec())
    } else {
        None
    };

    Ok(Notification {
        protocol,
        spi,
        notify_type,
        data: buf[size_of::<NotifyHeader>() + spi_size..].to_vec(),
    })
}

/// Parses a buffer into a [Delete]. The buffer must not contain the generic
/// payload header.
pub(crate) fn parse_delete(buf: &[u8]) -> Result<Delete, ParserError> {
    let header = DeleteHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    let protocol = SecurityProtocol::try_from(header.protocol_id)?;
    let num_spis = header.num_spis.get() as usize;
    let spi_size = header.spi_size as usize;

    match protocol {
        SecurityProtocol::InternetKeyExchange => {
            // a delete for the IKE SA carries neither SPI size nor SPIs
            if spi_size != 0 || num_spis != 0 {
                return Err(ParserError::ProtocolViolation);
            }
        }
        SecurityProtocol::AuthenticationHeader
        | SecurityProtocol::EncapsulatingSecurityPayload => {
            if spi_size != 4 {
                return Err(ParserError::ProtocolViolation);
            }
        }
        SecurityProtocol::Reserved => return Err(ParserError::ProtocolViolation),
    }

    let body = &buf[size_of::<DeleteHeader>()..];
    if body.len() != num_spis * spi_size {
        return Err(ParserError::BufferTooSmall);
    }

    let mut spis = Vec::with_capacity(num_spis);
    for chunk in body.chunks_exact(4) {
        let [a, b, c, d] = chunk else {
            return Err(ParserError::BufferTooSmall);
        };
        spis.push(u32::from_be_bytes([*a, *b, *c, *d]));
    }

    Ok(Delete { protocol, spis })
}
