//! Builders for the payloads that are a single header plus opaque data

use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::{
    AuthenticationHeader, ConfigurationAttributeHeader, ConfigurationHeader,
    EncryptedFragmentHeader, IdentificationHeader, KeyExchangeHeader,
};
use crate::definitions::params::PayloadType;
use crate::definitions::{
    Authentication, Certificate, CertificateRequest, Configuration, Encrypted, EncryptedFragment,
    Identification, KeyExchange,
};
use crate::generator::build_generic;

impl KeyExchange {
    pub(crate) fn build(&self, next_payload: PayloadType) -> Vec<u8> {
        let header = KeyExchangeHeader {
            dh_group_num: U16::from(self.group as u16),
            reserved: U16::from(0),
        };
        let mut body = Vec::with_capacity(size_of::<KeyExchangeHeader>() + self.data.len());
        body.extend_from_slice(header.as_bytes());
        body.extend_from_slice(&self.data);
        build_generic(next_payload, &body)
    }
}

impl Identification {
    pub(crate) fn build(&self, next_payload: PayloadType) -> Vec<u8> {
        build_generic(next_payload, &self.body())
    }

    /// The payload body without the generic header: exactly the octets that
    /// feed the MACedID half of the AUTH computation
    pub fn body(&self) -> Vec<u8> {
        let header = IdentificationHeader {
            id_type: self.id_type as u8,
            reserved: [0, 0, 0],
        };
        let mut body = Vec::with_capacity(size_of::<IdentificationHeader>() + self.data.len());
        body.extend_from_slice(header.as_bytes());
        body.extend_from_slice(&self.data);
        body
    }
}

impl Certificate {
    pub(crate) fn build(&self, next_payload: PayloadType) -> Vec<u8> {
        let mut body = Vec::with_capacity(1 + self.data.len());
        body.push(self.encoding as u8);
        body.extend_from_slice(&self.data);
        build_generic(next_payload, &body)
    }
}

impl CertificateRequest {
    pub(crate) fn build(&self, next_payload: PayloadType) -> Vec<u8> {
        let mut body = Vec::with_capacity(1 + self.authorities.len());
        body.push(self.encoding as u8);
        body.extend_from_slice(&self.authorities);
        build_generic(next_payload, &body)
    }
}

impl Authentication {
    pub(crate) fn build(&self, next_payload: PayloadType) -> Vec<u8> {
        let header = AuthenticationHeader {
            auth_method: self.method as u8,
            reserved: [0, 0, 0],
        };
        let mut body = Vec::with_capacity(size_of::<AuthenticationHeader>() + self.data.len());
        body.extend_from_slice(header.as_bytes());
        body.extend_from_slice(&self.data);
        build_generic(next_payload, &body)
    }
}

impl Encrypted {
    /// The SK payload is always last, so its next payload field carries the
    /// type of the first payload of the inner chain instead of a sibling
    pub(crate) fn build(&self) -> Vec<u8> {
        build_generic(self.first_payload, &self.data)
    }
}

impl EncryptedFragment {
    pub(crate) fn build(&self) -> Vec<u8> {
        let header = EncryptedFragmentHeader {
            fragment_number: U16::from(self.fragment_number),
            total_fragments: U16::from(self.total_fragments),
        };
        let mut body =
            Vec::with_capacity(size_of::<EncryptedFragmentHeader>() + self.data.len());
        body.extend_from_slice(header.as_bytes());
        body.extend_from_slice(&self.data);
        // only the first fragment names the inner chain's first payload
        let first = if self.fragment_number == 1 {
            self.first_payload
        } else {
            PayloadType::NoNextPayload
        };
        build_generic(first, &body)
    }
}

impl Configuration {
    pub(crate) fn build(&self, next_payload: PayloadType) -> Vec<u8> {
        let header = ConfigurationHeader {
            cfg_type: self.cfg_type as u8,
            reserved: [0, 0, 0],
        };
        let mut body = Vec::with_capacity(size_of::<ConfigurationHeader>());
        body.extend_from_slice(header.as_bytes());
        for attribute in &self.attributes {
            let attr_header = ConfigurationAttributeHeader {
                attribute_type: U16::from(attribute.attribute_type as u16),
                length: U16::from(attribute.value.len() as u16),
            };
            body.extend_from_slice(attr_header.as_bytes());
            body.extend_from_slice(&attribute.value);
        }
        build_generic(next_payload, &body)
    }
}
