use std::net::IpAddr;

use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::{GenericPayloadHeader, TrafficSelectorHeader};
use crate::definitions::params::{PayloadType, TsType};
use crate::definitions::TrafficSelector;
use crate::generator::GeneratorError;

pub(crate) fn build_traffic_selectors(
    selectors: &[TrafficSelector],
    next_payload: PayloadType,
) -> Result<Vec<u8>, GeneratorError> {
    if selectors.len() >= 255 {
        return Err(GeneratorError::TooManyPayloads);
    }

    let mut body = vec![selectors.len() as u8, 0, 0, 0];
    for selector in selectors {
        body.extend(build_selector(selector)?);
    }

    let generic_header = GenericPayloadHeader {
        next_payload: next_payload as u8,
        critical_reserved: 0,
        payload_length: U16::from(4 + body.len() as u16),
    };
    let mut packet = Vec::with_capacity(4 + body.len());
    packet.extend_from_slice(generic_header.as_bytes());
    packet.extend(body);
    Ok(packet)
}

fn build_selector(selector: &TrafficSelector) -> Result<Vec<u8>, GeneratorError> {
    let (ts_type, addr_len) = match (&selector.start_addr, &selector.end_addr) {
        (IpAddr::V4(_), IpAddr::V4(_)) => (TsType::Ipv4AddrRange, 4),
        (IpAddr::V6(_), IpAddr::V6(_)) => (TsType::Ipv6AddrRange, 16),
        _ => return Err(GeneratorError::MixedAddressFamilies),
    };

    let length = size_of::<TrafficSelectorHeader>() + 2 * addr_len;
    let header = TrafficSelectorHeader {
        ts_type: ts_type as u8,
        ip_protocol_id: selector.ip_protocol,
        selector_length: U16::from(length as u16),
        start_port: U16::from(selector.start_port),
        end_port: U16::from(selector.end_port),
    };

    let mut buf = Vec::with_capacity(length);
    buf.extend_from_slice(header.as_bytes());
    match (selector.start_addr, selector.end_addr) {
        (IpAddr::V4(start), IpAddr::V4(end)) => {
            buf.extend_from_slice(&start.octets());
            buf.extend_from_slice(&end.octets());
        }
        (IpAddr::V6(start), IpAddr::V6(end)) => {
            buf.extend_from_slice(&start.octets());
            buf.extend_from_slice(&end.octets());
        }
        _ => return Err(GeneratorError::MixedAddressFamilies),
    }
    Ok(buf)
}
