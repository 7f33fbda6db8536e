//! Traffic selector narrowing and comparison
//!
//! The responder may narrow the initiator's selectors but the result must be
//! a non-empty subset; child rekeys must reproduce the existing selectors
//! exactly.

use std::net::IpAddr;

use ikewire::definitions::TrafficSelector;

fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(ip) => u32::from(ip) as u128,
        IpAddr::V6(ip) => u128::from(ip),
    }
}

fn same_family(a: IpAddr, b: IpAddr) -> bool {
    matches!(
        (a, b),
        (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
    )
}

/// The overlap of two selectors, if there is any
pub fn intersect(a: &TrafficSelector, b: &TrafficSelector) -> Option<TrafficSelector> {
    if !same_family(a.start_addr, b.start_addr) {
        return None;
    }
    // protocol 0 means any; two concrete protocols must agree
    let ip_protocol = match (a.ip_protocol, b.ip_protocol) {
        (0, p) | (p, 0) => p,
        (p, q) if p == q => p,
        _ => return None,
    };

    let start_port = a.start_port.max(b.start_port);
    let end_port = a.end_port.min(b.end_port);
    if start_port > end_port {
        return None;
    }

    let start_addr = if addr_to_u128(a.start_addr) >= addr_to_u128(b.start_addr) {
        a.start_addr
    } else {
        b.start_addr
    };
    let end_addr = if addr_to_u128(a.end_addr) <= addr_to_u128(b.end_addr) {
        a.end_addr
    } else {
        b.end_addr
    };
    if addr_to_u128(start_addr) > addr_to_u128(end_addr) {
        return None;
    }
    Some(TrafficSelector {
        ip_protocol,
        start_port,
        end_port,
        start_addr,
        end_addr,
    })
}

/// Whether `inner` matches only traffic that `outer` also matches
pub fn contains(outer: &TrafficSelector, inner: &TrafficSelector) -> bool {
    same_family(outer.start_addr, inner.start_addr)
        && (outer.ip_protocol == 0 || outer.ip_protocol == inner.ip_protocol)
        && outer.start_port <= inner.start_port
        && outer.end_port >= inner.end_port
        && addr_to_u128(outer.start_addr) <= addr_to_u128(inner.start_addr)
        && addr_to_u128(outer.end_addr) >= addr_to_u128(inner.end_addr)
}

/// Narrow the peer's proposed selectors against the local policy
///
/// Each proposed selector is intersected with every policy selector; the
/// collected overlaps form the narrowed set. Empty means TS_UNACCEPTABLE.
pub fn narrow(
    policy: &[TrafficSelector],
    proposed: &[TrafficSelector],
) -> Vec<TrafficSelector> {
    let mut narrowed = vec![];
    for wanted in proposed {
        for allowed in policy {
            if let Some(overlap) = intersect(allowed, wanted) {
                if !narrowed.contains(&overlap) {
                    narrowed.push(overlap);
                }
            }
        }
    }
    narrowed
}

/// Whether two selector sets describe exactly the same traffic, order
/// included (child rekeys)
pub fn sets_equal(a: &[TrafficSelector], b: &[TrafficSelector]) -> bool {
    a == b
}

/// Whether every selector of `inner` is covered by some selector of `outer`
pub fn set_is_subset(inner: &[TrafficSelector], outer: &[TrafficSelector]) -> bool {
    inner
        .iter()
        .all(|i| outer.iter().any(|o| contains(o, i)))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn ts(start: [u8; 4], end: [u8; 4], proto: u8, ports: (u16, u16)) -> TrafficSelector {
        TrafficSelector {
            ip_protocol: proto,
            start_port: ports.0,
            end_port: ports.1,
            start_addr: IpAddr::V4(Ipv4Addr::from(start)),
            end_addr: IpAddr::V4(Ipv4Addr::from(end)),
        }
    }

    #[test]
    fn narrowing_produces_subset() {
        let policy = vec![ts([10, 0, 0, 0], [10, 0, 0, 127], 0, (0, 65535))];
        let proposed = vec![ts([10, 0, 0, 0], [10, 0, 0, 255], 0, (0, 65535))];
        let narrowed = narrow(&policy, &proposed);
        assert_eq!(narrowed.len(), 1);
        assert!(set_is_subset(&narrowed, &proposed));
        assert_eq!(narrowed[0].end_addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 127)));
    }

    #[test]
    fn disjoint_ranges_do_not_narrow() {
        let policy = vec![ts([10, 0, 0, 0], [10, 0, 0, 255], 0, (0, 65535))];
        let proposed = vec![ts([10, 0, 1, 0], [10, 0, 1, 255], 0, (0, 65535))];
        assert!(narrow(&policy, &proposed).is_empty());
    }

    #[test]
    fn protocol_mismatch_is_refused() {
        let policy = vec![ts([10, 0, 0, 0], [10, 0, 0, 255], 6, (0, 65535))];
        let proposed = vec![ts([10, 0, 0, 0], [10, 0, 0, 255], 17, (0, 65535))];
        assert!(narrow(&policy, &proposed).is_empty());
    }

    #[test]
    fn port_ranges_intersect() {
        let policy = vec![ts([10, 0, 0, 0], [10, 0, 0, 255], 17, (0, 1000))];
        let proposed = vec![ts([10, 0, 0, 0], [10, 0, 0, 255], 17, (500, 2000))];
        let narrowed = narrow(&policy, &proposed);
        assert_eq!(narrowed[0].start_port, 500);
        assert_eq!(narrowed[0].end_port, 1000);
    }

    #[test]
    fn exact_set_comparison() {
        let a = vec![ts([10, 0, 0, 0], [10, 0, 0, 255], 0, (0, 65535))];
        let b = vec![ts([10, 0, 0, 0], [10, 0, 0, 255], 0, (0, 65535))];
        let c = vec![ts([10, 0, 0, 0], [10, 0, 0, 254], 0, (0, 65535))];
        assert!(sets_equal(&a, &b));
        assert!(!sets_equal(&a, &c));
    }
}
