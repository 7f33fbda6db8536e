use zerocopy::FromBytes;

use crate::definitions::header::{
    AttributeHeader, ProposalHeader, TransformHeader, FLAG_ATTRIBUTE_FORMAT,
};
use crate::definitions::params::{
    EncryptionAlgorithm, IntegrityAlgorithm, KeyExchangeMethod, PseudorandomFunction,
    SecurityProtocol, SequenceNumbers, TransformType,
};
use crate::definitions::{Proposal, SecurityAssociation, Transform};
use crate::parser::ParserError;

/// Attribute type of the only transform attribute in use, the key length
const ATTRIBUTE_KEY_LENGTH: u16 = 14;

/// Parses a buffer into a [SecurityAssociation]. The buffer must not contain
/// the generic payload header, only the list of proposals.
pub(crate) fn parse_security_association(buf: &[u8]) -> Result<SecurityAssociation, ParserError> {
    let mut proposals = vec![];
    let mut offset = 0usize;
    let mut previous_num = 0u8;

    while offset < buf.len() {
        let remaining = &buf[offset..];
        let header =
            ProposalHeader::ref_from_prefix(remaining).ok_or(ParserError::BufferTooSmall)?;
        if header.reserved != 0 {
            return Err(ParserError::ReservedBitsSet);
        }
        let length = header.proposal_length.get() as usize;
        if length < size_of::<ProposalHeader>() || length > remaining.len() {
            return Err(ParserError::BufferTooSmall);
        }
        // 0 marks the last proposal, 2 any other; both must agree with the
        // remaining buffer
        match header.last_substruct {
            0 if length != remaining.len() => return Err(ParserError::ProtocolViolation),
            0 | 2 => {}
            _ => return Err(ParserError::ProtocolViolation),
        }
        if header.proposal_num <= previous_num {
            return Err(ParserError::InvalidProposalNumbering);
        }
        previous_num = header.proposal_num;

        proposals.push(parse_proposal(header, &remaining[..length])?);
        offset += length;
    }

    Ok(SecurityAssociation { proposals })
}

fn parse_proposal(header: &ProposalHeader, buf: &[u8]) -> Result<Proposal, ParserError> {
    let header_len = size_of::<ProposalHeader>();
    let spi_len = header.spi_size as usize;
    if buf.len() < header_len + spi_len {
        return Err(ParserError::BufferTooSmall);
    }
    let spi = Vec::from(&buf[header_len..header_len + spi_len]);
    let protocol = SecurityProtocol::try_from(header.protocol_id)?;
    if protocol == SecurityProtocol::Reserved {
        return Err(ParserError::ProtocolViolation);
    }

    let mut proposal = Proposal::new_empty(header.proposal_num, protocol, Some(spi));
    let mut body = &buf[header_len + spi_len..];

    for i in 0..header.num_transforms {
        let (transform, consumed, last) = parse_transform(body)?;
        proposal.add(vec![transform]);
        body = &body[consumed..];
        let is_final = i == header.num_transforms - 1;
        if last != is_final {
            return Err(ParserError::ProtocolViolation);
        }
    }
    if !body.is_empty() {
        return Err(ParserError::ProtocolViolation);
    }

    Ok(proposal)
}

/// Parse a single transform substructure, yielding the transform, the number
/// of consumed bytes and whether the header marked it as the last one
fn parse_transform(buf: &[u8]) -> Result<(Transform, usize, bool), ParserError> {
    let header = TransformHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    if header.reserved != 0 || header.reserved2 != 0 {
        return Err(ParserError::ReservedBitsSet);
    }
    let length = header.transform_length.get() as usize;
    if length < size_of::<TransformHeader>() || length > buf.len() {
        return Err(ParserError::BufferTooSmall);
    }
    let last = match header.last_substruct {
        0 => true,
        3 => false,
        _ => return Err(ParserError::ProtocolViolation),
    };

    let id = header.transform_id.get();
    let attributes = &buf[size_of::<TransformHeader>()..length];
    let key_length = parse_key_length_attribute(attributes)?;

    let transform = match TransformType::try_from(header.transform_type)? {
        TransformType::EncryptionAlgorithm => {
            Transform::Encryption(EncryptionAlgorithm::try_from(id)?, key_length)
        }
        TransformType::PseudoRandomFunction => {
            Transform::PseudoRandomFunction(PseudorandomFunction::try_from(id)?)
        }
        TransformType::IntegrityAlgorithm => {
            Transform::Integrity(IntegrityAlgorithm::try_from(id)?)
        }
        TransformType::KeyExchangeMethod => {
            Transform::KeyExchange(KeyExchangeMethod::try_from(id)?)
        }
        TransformType::SequenceNumber => {
            Transform::SequenceNumber(SequenceNumbers::try_from(id)?)
        }
    };

    Ok((transform, length, last))
}

/// Extract the key length attribute, the only one defined for the supported
/// transform types; any other attribute is a protocol violation
fn parse_key_length_attribute(buf: &[u8]) -> Result<Option<u16>, ParserError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let header = AttributeHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    if !header.is_fixed_length() {
        return Err(ParserError::ProtocolViolation);
    }
    if buf.len() != size_of::<AttributeHeader>() {
        return Err(ParserError::ProtocolViolation);
    }
    let attribute_type = header.attribute_type.get() & !FLAG_ATTRIBUTE_FORMAT;
    if attribute_type != ATTRIBUTE_KEY_LENGTH {
        return Err(ParserError::ProtocolViolation);
    }
    Ok(Some(header.attribute_value.get()))
}
