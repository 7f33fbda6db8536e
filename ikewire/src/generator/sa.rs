use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::{
    AttributeHeader, GenericPayloadHeader, ProposalHeader, TransformHeader, FLAG_ATTRIBUTE_FORMAT,
};
use crate::definitions::params::{PayloadType, TransformType};
use crate::definitions::{Proposal, SecurityAssociation, Transform};
use crate::generator::{GeneratorError, ESTIMATED_PROPOSAL_LENGTH};

/// Attribute type of the only transform attribute in use, the key length
const ATTRIBUTE_KEY_LENGTH: u16 = 14;

impl SecurityAssociation {
    /// Build a network-level payload from a [SecurityAssociation]
    ///
    /// This might fail if the payload would not conform to the standard, for
    /// example if a proposal doesn't provide all details required to build it,
    /// or if too many of a certain type of structure is required
    pub fn try_build(&self, next_payload: PayloadType) -> Result<Vec<u8>, GeneratorError> {
        if self.proposals.len() >= 255 {
            return Err(GeneratorError::TooManyProposals);
        }
        let mut proposals = Vec::with_capacity(ESTIMATED_PROPOSAL_LENGTH * self.proposals.len());
        for (i, proposal) in self.proposals.iter().enumerate() {
            proposals.extend(proposal.try_build(i == self.proposals.len() - 1)?);
        }

        let packet_length = 4 + proposals.len() as u16;
        let header = GenericPayloadHeader {
            next_payload: next_payload as u8,
            critical_reserved: 0,
            payload_length: packet_length.into(),
        };
        let mut packet = Vec::with_capacity(packet_length.into());
        packet.extend_from_slice(header.as_bytes());
        packet.extend(proposals);
        Ok(packet)
    }
}

impl Proposal {
    fn try_build(&self, last: bool) -> Result<Vec<u8>, GeneratorError> {
        if self.len() >= 255 {
            return Err(GeneratorError::TooManyTransforms);
        }
        if self.spi.len() > 255 {
            return Err(GeneratorError::InvalidSpiLength);
        }

        let transforms: Vec<Transform> = self.transforms().collect();
        let mut body = vec![];
        for (i, transform) in transforms.iter().enumerate() {
            body.extend(build_transform(transform, i == transforms.len() - 1));
        }

        let proposal_length =
            size_of::<ProposalHeader>() + self.spi.len() + body.len();
        let header = ProposalHeader {
            last_substruct: if last { 0 } else { 2 },
            reserved: 0,
            proposal_length: U16::from(proposal_length as u16),
            proposal_num: self.number,
            protocol_id: self.protocol as u8,
            spi_size: self.spi.len() as u8,
            num_transforms: transforms.len() as u8,
        };

        let mut packet = Vec::with_capacity(proposal_length);
        packet.extend_from_slice(header.as_bytes());
        packet.extend_from_slice(&self.spi);
        packet.extend(body);
        Ok(packet)
    }
}

fn build_transform(transform: &Transform, last: bool) -> Vec<u8> {
    let (transform_type, transform_id, key_length) = match transform {
        Transform::Encryption(a, key_length) => {
            (TransformType::EncryptionAlgorithm, *a as u16, *key_length)
        }
        Transform::PseudoRandomFunction(p) => {
            (TransformType::PseudoRandomFunction, *p as u16, None)
        }
        Transform::Integrity(i) => (TransformType::IntegrityAlgorithm, *i as u16, None),
        Transform::KeyExchange(k) => (TransformType::KeyExchangeMethod, *k as u16, None),
        Transform::SequenceNumber(s) => (TransformType::SequenceNumber, *s as u16, None),
    };

    let attribute = key_length.map(|len| AttributeHeader {
        attribute_type: U16::from(ATTRIBUTE_KEY_LENGTH | FLAG_ATTRIBUTE_FORMAT),
        attribute_value: U16::from(len),
    });

    let transform_length =
        size_of::<TransformHeader>() + attribute.map_or(0, |_| size_of::<AttributeHeader>());
    let header = TransformHeader {
        last_substruct: if last { 0 } else { 3 },
        reserved: 0,
        transform_length: U16::from(transform_length as u16),
        transform_type: transform_type as u8,
        reserved2: 0,
        transform_id: U16::from(transform_id),
    };

    let mut buf = Vec::with_capacity(transform_length);
    buf.extend_from_slice(header.as_bytes());
    if let Some(attribute) = attribute {
        buf.extend_from_slice(attribute.as_bytes());
    }
    buf
}
