use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use zerocopy::FromBytes;

use crate::definitions::header::TrafficSelectorHeader;
use crate::definitions::params::TsType;
use crate::definitions::TrafficSelector;
use crate::parser::ParserError;

/// Parses the body of a TSi or TSr payload into its list of selectors. The
/// buffer must not contain the generic payload header.
pub(crate) fn parse_traffic_selectors(buf: &[u8]) -> Result<Vec<TrafficSelector>, ParserError> {
    let [count, r1, r2, r3] = buf.get(..4).ok_or(ParserError::BufferTooSmall)? else {
        return Err(ParserError::BufferTooSmall);
    };
    if *r1 != 0 || *r2 != 0 || *r3 != 0 {
        return Err(ParserError::ReservedBitsSet);
    }
    if *count == 0 {
        // a TS payload must carry at least one selector
        return Err(ParserError::ProtocolViolation);
    }

    let mut selectors = Vec::with_capacity(*count as usize);
    let mut remaining = &buf[4..];
    for _ in 0..*count {
        let (selector, consumed) = parse_selector(remaining)?;
        selectors.push(selector);
        remaining = &remaining[consumed..];
    }
    if !remaining.is_empty() {
        return Err(ParserError::ProtocolViolation);
    }

    Ok(selectors)
}

fn parse_selector(buf: &[u8]) -> Result<(TrafficSelector, usize), ParserError> {
    let header =
        TrafficSelectorHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
    let length = header.selector_length.get() as usize;
    if length > buf.len() {
        return Err(ParserError::BufferTooSmall);
    }
    let addr_len = match TsType::try_from(header.ts_type)? {
        TsType::Ipv4AddrRange => 4,
        TsType::Ipv6AddrRange => 16,
    };
    if length != size_of::<TrafficSelectorHeader>() + 2 * addr_len {
        return Err(ParserError::ProtocolViolation);
    }

    let body = &buf[size_of::<TrafficSelectorHeader>()..length];
    let (start_addr, end_addr) = match addr_len {
        4 => {
            let start: [u8; 4] = body[..4].try_into().map_err(|_| ParserError::BufferTooSmall)?;
            let end: [u8; 4] = body[4..8].try_into().map_err(|_| ParserError::BufferTooSmall)?;
            (
                IpAddr::V4(Ipv4Addr::from(start)),
                IpAddr::V4(Ipv4Addr::from(end)),
            )
        }
        _ => {
            let start: [u8; 16] =
                body[..16].try_into().map_err(|_| ParserError::BufferTooSmall)?;
            let end: [u8; 16] =
                body[16..32].try_into().map_err(|_| ParserError::BufferTooSmall)?;
            (
                IpAddr::V6(Ipv6Addr::from(start)),
                IpAddr::V6(Ipv6Addr::from(end)),
            )
        }
    };

    Ok((
        TrafficSelector {
            ip_protocol: header.ip_protocol_id,
            start_port: header.start_port.get(),
            end_port: header.end_port.get(),
            start_addr,
            end_addr,
        },
        length,
    ))
}
