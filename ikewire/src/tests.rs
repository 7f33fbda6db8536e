use std::net::{IpAddr, Ipv4Addr};

use crate::definitions::params::{
    CfgType, ConfigAttributeType, EncryptionAlgorithm, ExchangeType, IdType, KeyExchangeMethod,
    NotifyType, PayloadType, PseudorandomFunction, SecurityProtocol,
};
use crate::definitions::{
    ConfigAttribute, Configuration, Delete, Encrypted, Identification, KeyExchange, Message,
    Notification, Payload, Proposal, SecurityAssociation, Transform, TrafficSelector,
};
use crate::parser::{parse_payload_chain, ParserError};

#[test]
#[allow(clippy::unwrap_used)]
fn parse_empty_packet() {
    let buff = vec![
        0x00, 0x04, 0xc0, 0x1d, 0xb4, 0x00, 0xb0, 0xc9, // initiator
        0x00, 0x00, 0x00, 0x00, 0x11, 0xf1, 0x5b, 0xa3, // responder
        0x00, // next payload
        0x20, // version
        0x25, // exchange type
        0x20, // flags, 0b00100000
        0x3b, 0x9a, 0xc9, 0xff, // message ID
        0x00, 0x00, 0x00, 0x1c, // length
    ];
    let packet = Message::try_parse(buff.as_slice()).unwrap();
    assert_eq!(packet.initiator_spi, 1337133713371337);
    assert_eq!(packet.responder_spi, 301030307);
    assert_eq!(packet.message_id, 0x3b9ac9ff);
    assert_eq!(packet.exchange_type, ExchangeType::Informational);
    assert!(packet.response);
    assert_eq!(packet.payloads.len(), 0);
}

#[test]
#[allow(clippy::unwrap_used)]
fn generate_and_parse_full_sa() {
    let mut p = Proposal::new_empty(1, SecurityProtocol::InternetKeyExchange, None);
    p.add(vec![
        Transform::Encryption(EncryptionAlgorithm::AesGcm16, Some(256)),
        Transform::PseudoRandomFunction(PseudorandomFunction::HmacSha2_256),
        Transform::KeyExchange(KeyExchangeMethod::Modp2048),
    ]);
    let sa = SecurityAssociation { proposals: vec![p] };
    let sa_repr = sa.try_build(PayloadType::NoNextPayload).unwrap();
    let buff = vec![
        0x00, 0x00, 0x00, 0x28, // Security Association header
        0x00, 0x00, 0x00, 0x24, 0x01, 0x01, 0x00, 0x03, // Proposal header
        0x03, 0x00, 0x00, 0x0c, 0x01, 0x00, 0x00, 0x14, // Transform 1, encryption
        0x80, 0x0e, 0x01, 0x00, // Transform 1, key length attribute
        0x03, 0x00, 0x00, 0x08, 0x02, 0x00, 0x00, 0x05, // Transform 2, PRF
        0x00, 0x00, 0x00, 0x08, 0x04, 0x00, 0x00, 0x0e, // Transform 3, KE
    ];
    assert_eq!(sa_repr, buff);

    let chain = parse_payload_chain(PayloadType::SecurityAssociation as u8, &buff).unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0], Payload::SecurityAssociation(sa));
}

#[test]
#[allow(clippy::unwrap_used)]
fn generate_and_parse_sa_with_child_spi() {
    let mut p = Proposal::new_empty(
        1,
        SecurityProtocol::EncapsulatingSecurityPayload,
        Some(vec![0xa1, 0xa1, 0xa1, 0xa1]),
    );
    p.add(vec![
        Transform::Encryption(EncryptionAlgorithm::AesGcm16, Some(256)),
        Transform::SequenceNumber(crate::definitions::params::SequenceNumbers::NoExtended),
    ]);
    let sa = SecurityAssociation { proposals: vec![p] };
    let built = sa.try_build(PayloadType::NoNextPayload).unwrap();
    let chain = parse_payload_chain(PayloadType::SecurityAssociation as u8, &built).unwrap();
    assert_eq!(chain[0], Payload::SecurityAssociation(sa));
}

#[test]
#[allow(clippy::unwrap_used)]
fn generate_and_parse_packet() {
    let nonce = vec![
        0x13, 0x37, 0x13, 0x37, 0x13, 0x37, 0x13, 0x37, //
        0x13, 0x37, 0x13, 0x37, 0x13, 0x37, 0x13, 0x37,
    ];
    let ike = Message {
        initiator_spi: 0x48cfb887c03b2e7f, // random data
        responder_spi: 0x55bf4a6acd91535e, // random data
        exchange_type: ExchangeType::IkeSaInit,
        initiator: true,
        response: false,
        message_id: 0,
        payloads: vec![
            Payload::SecurityAssociation(SecurityAssociation { proposals: vec![] }),
            Payload::KeyExchange(KeyExchange {
                group: KeyExchangeMethod::Curve25519,
                data: vec![0xab; 32],
            }),
            Payload::Nonce(nonce.clone()),
            Payload::Notify(Notification::bare(NotifyType::FragmentationSupported)),
            Payload::VendorID(vec![0x42]),
        ],
    };
    let generated_packet = ike.try_build().unwrap();
    let parsed_ike = Message::try_parse(generated_packet.as_slice()).unwrap();
    assert_eq!(ike, parsed_ike);
    assert_eq!(parsed_ike.payloads[2], Payload::Nonce(nonce));
}

#[test]
#[allow(clippy::unwrap_used)]
fn notify_with_spi_roundtrip() {
    let payloads = vec![Payload::Notify(Notification::for_child(
        NotifyType::RekeySa,
        SecurityProtocol::EncapsulatingSecurityPayload,
        0xa1a1a1a1,
    ))];
    let (first, built) = crate::generator::build_payload_chain(&payloads).unwrap();
    assert_eq!(first, PayloadType::Notify);
    let parsed = parse_payload_chain(first as u8, &built).unwrap();
    assert_eq!(parsed, payloads);
}

#[test]
#[allow(clippy::unwrap_used)]
fn delete_roundtrip() {
    for delete in [
        Delete {
            protocol: SecurityProtocol::InternetKeyExchange,
            spis: vec![],
        },
        Delete {
            protocol: SecurityProtocol::EncapsulatingSecurityPayload,
            spis: vec![0xdeadbeef, 0x01020304],
        },
    ] {
        let payloads = vec![Payload::Delete(delete)];
        let (first, built) = crate::generator::build_payload_chain(&payloads).unwrap();
        let parsed = parse_payload_chain(first as u8, &built).unwrap();
        assert_eq!(parsed, payloads);
    }
}

#[test]
#[allow(clippy::unwrap_used)]
fn traffic_selectors_roundtrip() {
    let payloads = vec![
        Payload::TrafficSelectorsInitiator(vec![TrafficSelector {
            ip_protocol: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)),
            end_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 255)),
        }]),
        Payload::TrafficSelectorsResponder(vec![TrafficSelector {
            ip_protocol: 17,
            start_port: 500,
            end_port: 500,
            start_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 1, 0)),
            end_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 1, 255)),
        }]),
    ];
    let (first, built) = crate::generator::build_payload_chain(&payloads).unwrap();
    let parsed = parse_payload_chain(first as u8, &built).unwrap();
    assert_eq!(parsed, payloads);
}

#[test]
#[allow(clippy::unwrap_used)]
fn identification_and_configuration_roundtrip() {
    let payloads = vec![
        Payload::IdentificationInitiator(Identification {
            id_type: IdType::Ipv4Addr,
            data: vec![1, 2, 3, 4],
        }),
        Payload::Configuration(Configuration {
            cfg_type: CfgType::Request,
            attributes: vec![ConfigAttribute {
                attribute_type: ConfigAttributeType::InternalIp4Address,
                value: vec![],
            }],
        }),
    ];
    let (first, built) = crate::generator::build_payload_chain(&payloads).unwrap();
    let parsed = parse_payload_chain(first as u8, &built).unwrap();
    assert_eq!(parsed, payloads);
}

#[test]
#[allow(clippy::unwrap_used)]
fn sk_payload_keeps_inner_first_payload() {
    let ike = Message {
        initiator_spi: 1,
        responder_spi: 2,
        exchange_type: ExchangeType::IkeAuth,
        initiator: true,
        response: false,
        message_id: 1,
        payloads: vec![Payload::Encrypted(Encrypted {
            first_payload: PayloadType::IdentificationInitiator,
            data: vec![0x54, 0x65, 0x73, 0x74],
        })],
    };
    let built = ike.try_build().unwrap();
    // the SK generic header's next payload field names the inner chain
    assert_eq!(built[16], PayloadType::IdentificationInitiator as u8);
    let parsed = Message::try_parse(&built).unwrap();
    assert_eq!(ike, parsed);
}

#[test]
fn unknown_critical_payload_is_refused() {
    let buff = vec![
        0x00, // next payload (end)
        0x80, // critical bit set
        0x00, 0x04, // length
    ];
    match parse_payload_chain(99, &buff) {
        Err(ParserError::UnsupportedCriticalPayload(99)) => {}
        other => panic!("expected UnsupportedCriticalPayload, got {other:?}"),
    }
}

#[test]
#[allow(clippy::unwrap_used)]
fn unknown_noncritical_payload_is_skipped() {
    let mut buff = vec![
        0x28, // next payload: nonce
        0x00, 0x00, 0x08, // length
        0xde, 0xad, 0xbe, 0xef, // opaque body
    ];
    buff.extend([
        0x00, 0x00, 0x00, 0x14, // nonce generic header
    ]);
    buff.extend([0x77; 16]); // nonce body
    let parsed = parse_payload_chain(99, &buff).unwrap();
    assert_eq!(parsed, vec![Payload::Nonce(vec![0x77; 16])]);
}

#[test]
fn reserved_bits_are_refused() {
    let buff = vec![
        0x00, // next payload
        0x01, // reserved bit set
        0x00, 0x14, // length
        0x77, 0x77, 0x77, 0x77, 0x77, 0x77, 0x77, 0x77, //
        0x77, 0x77, 0x77, 0x77, 0x77, 0x77, 0x77, 0x77,
    ];
    assert!(matches!(
        parse_payload_chain(PayloadType::Nonce as u8, &buff),
        Err(ParserError::ReservedBitsSet)
    ));
}

#[test]
fn nonce_length_is_validated_on_build() {
    let ike = Message {
        initiator_spi: 1,
        responder_spi: 0,
        exchange_type: ExchangeType::IkeSaInit,
        initiator: true,
        response: false,
        message_id: 0,
        payloads: vec![Payload::Nonce(vec![0x01; 8])],
    };
    assert!(ike.try_build().is_err());
}

#[test]
fn truncated_packet_is_refused() {
    let buff = vec![
        0x00, 0x04, 0xc0, 0x1d, 0xb4, 0x00, 0xb0, 0xc9, //
        0x00, 0x00, 0x00, 0x00, 0x11, 0xf1, 0x5b, 0xa3, //
        0x21, // next payload: SA
        0x20, 0x22, 0x08, //
        0x00, 0x00, 0x00, 0x00, // message ID
        0x00, 0x00, 0x00, 0x30, // length larger than the buffer
    ];
    assert!(matches!(
        Message::try_parse(&buff),
        Err(ParserError::BufferTooSmall)
    ));
}
