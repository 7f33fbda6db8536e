//! Parsers for the payloads that are a single header plus opaque data

use zerocopy::FromBytes;

use crate::definitions::header::{
    AuthenticationHeader, ConfigurationAttributeHeader, ConfigurationHeader,
    EncryptedFragmentHeader, GenericPayloadHeader, IdentificationHeader, KeyExchangeHeader,
};
use crate::definitions::params::{
    AuthMethod, CertificateEncoding, CfgType, ConfigAttributeType, IdType, KeyExchangeMethod,
    PayloadType,
};
use crate::definitions::{
    Authentication, Certificate, CertificateRequest, ConfigAttribute, Configuration, Encrypted,
    EncryptedFragment, Identification, KeyExchange,
};
use crate::parser::ParserError;

pub(crate) fn parse_key_exchange(buf: &[u8]) -> Result<KeyExchange, ParserError> {
    let header = KeyExchangeHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    if header.reserved.get() != 0 {
        return Err(ParserError::ReservedBitsSet);
    }
    Ok(KeyExchange {
        group: KeyExchangeMethod::try_from(header.dh_group_num.get())?,
        data: buf[size_of::<KeyExchangeHeader>()..].to_vec(),
    })
}

pub(crate) fn parse_identification(buf: &[u8]) -> Result<Identification, ParserError> {
    let header =
        IdentificationHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    if header.reserved != [0, 0, 0] {
        return Err(ParserError::ReservedBitsSet);
    }
    Ok(Identification {
        id_type: IdType::try_from(header.id_type)?,
        data: buf[size_of::<IdentificationHeader>()..].to_vec(),
    })
}

pub(crate) fn parse_certificate(buf: &[u8]) -> Result<Certificate, ParserError> {
    let [encoding, data @ ..] = buf else {
        return Err(ParserError::BufferTooSmall);
    };
    Ok(Certificate {
        encoding: CertificateEncoding::try_from(*encoding)?,
        data: data.to_vec(),
    })
}

pub(crate) fn parse_certificate_request(buf: &[u8]) -> Result<CertificateRequest, ParserError> {
    let [encoding, authorities @ ..] = buf else {
        return Err(ParserError::BufferTooSmall);
    };
    Ok(CertificateRequest {
        encoding: CertificateEncoding::try_from(*encoding)?,
        authorities: authorities.to_vec(),
    })
}

pub(crate) fn parse_authentication(buf: &[u8]) -> Result<Authentication, ParserError> {
    let header =
        AuthenticationHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    if header.reserved != [0, 0, 0] {
        return Err(ParserError::ReservedBitsSet);
    }
    Ok(Authentication {
        method: AuthMethod::try_from(header.auth_method)?,
        data: buf[size_of::<AuthenticationHeader>()..].to_vec(),
    })
}

pub(crate) fn parse_encrypted(
    header: &GenericPayloadHeader,
    buf: &[u8],
) -> Result<Encrypted, ParserError> {
    Ok(Encrypted {
        first_payload: PayloadType::try_from(header.next_payload)?,
        data: buf.to_vec(),
    })
}

pub(crate) fn parse_encrypted_fragment(
    generic: &GenericPayloadHeader,
    buf: &[u8],
) -> Result<EncryptedFragment, ParserError> {
    let header =
        EncryptedFragmentHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    let fragment_number = header.fragment_number.get();
    let total_fragments = header.total_fragments.get();
    if fragment_number == 0 || fragment_number > total_fragments {
        return Err(ParserError::ProtocolViolation);
    }
    // only the first fragment names the inner chain's first payload
    let first_payload = if fragment_number == 1 {
        PayloadType::try_from(generic.next_payload)?
    } else if generic.next_payload != PayloadType::NoNextPayload as u8 {
        return Err(ParserError::ProtocolViolation);
    } else {
        PayloadType::NoNextPayload
    };
    Ok(EncryptedFragment {
        first_payload,
        fragment_number,
        total_fragments,
        data: buf[size_of::<EncryptedFragmentHeader>()..].to_vec(),
    })
}

pub(crate) fn parse_configuration(buf: &[u8]) -> Result<Configuration, ParserError> {
    let header = ConfigurationHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    if header.reserved != [0, 0, 0] {
        return Err(ParserError::ReservedBitsSet);
    }
    let cfg_type = CfgType::try_from(header.cfg_type)?;

    let mut attributes = vec![];
    let mut remaining = &buf[size_of::<ConfigurationHeader>()..];
    while !remaining.is_empty() {
        let attr_header = ConfigurationAttributeHeader::ref_from_prefix(remaining)
            .ok_or(ParserError::BufferTooSmall)?;
        if attr_header.attribute_type.get() & 0b1000_0000_0000_0000 != 0 {
            return Err(ParserError::ReservedBitsSet);
        }
        let value_len = attr_header.length.get() as usize;
        let total = size_of::<ConfigurationAttributeHeader>() + value_len;
        if total > remaining.len() {
            return Err(ParserError::BufferTooSmall);
        }
        attributes.push(ConfigAttribute {
            attribute_type: ConfigAttributeType::try_from(attr_header.attribute_type.get())?,
            value: remaining[size_of::<ConfigurationAttributeHeader>()..total].to_vec(),
        });
        remaining = &remaining[total..];
    }

    Ok(Configuration {
        cfg_type,
        attributes,
    })
}
