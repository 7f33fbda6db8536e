use std::collections::HashMap;

use crate::state::{ChildSa, IkeSa, IkeSaState, Serial};

/// The indexed collection of all live IKE and Child SA states
///
/// Insertion-only plus explicit deletion; nothing iterates while mutating.
/// Serials are handed out monotonically and never reused, so a dangling
/// serial can always be detected by a failed lookup.
#[derive(Debug, Default)]
pub struct StateStore {
    next_serial: u64,
    ikes: HashMap<Serial, IkeSa>,
    children: HashMap<Serial, ChildSa>,
    ike_by_spi: HashMap<(u64, u64), Serial>,
    newest_ike_by_conn: HashMap<String, Serial>,
    newest_child_by_conn: HashMap<String, Serial>,
}

impl StateStore {
    /// Draw the next serial number
    pub fn next_serial(&mut self) -> Serial {
        self.next_serial += 1;
        Serial(self.next_serial)
    }

    /// Insert a freshly built IKE SA and index its SPI pair
    pub fn insert_ike(&mut self, sa: IkeSa) {
        self.ike_by_spi.insert(sa.spi_pair(), sa.serial);
        self.ikes.insert(sa.serial, sa);
    }

    /// Insert a freshly built Child SA
    pub fn insert_child(&mut self, sa: ChildSa) {
        self.children.insert(sa.serial, sa);
    }

    /// Re-index an IKE SA after one of its SPIs was learned or changed
    pub fn reindex_ike(&mut self, serial: Serial, old_pair: (u64, u64)) {
        self.ike_by_spi.remove(&old_pair);
        if let Some(sa) = self.ikes.get(&serial) {
            self.ike_by_spi.insert(sa.spi_pair(), serial);
        }
    }

    /// Look up an IKE SA by serial
    pub fn ike(&self, serial: Serial) -> Option<&IkeSa> {
        self.ikes.get(&serial)
    }

    /// Mutable lookup of an IKE SA by serial
    pub fn ike_mut(&mut self, serial: Serial) -> Option<&mut IkeSa> {
        self.ikes.get_mut(&serial)
    }

    /// Look up a Child SA by serial
    pub fn child(&self, serial: Serial) -> Option<&ChildSa> {
        self.children.get(&serial)
    }

    /// Mutable lookup of a Child SA by serial
    pub fn child_mut(&mut self, serial: Serial) -> Option<&mut ChildSa> {
        self.children.get_mut(&serial)
    }

    /// Locate the IKE SA a message belongs to
    ///
    /// An exact SPI pair match wins. An IKE_SA_INIT response addresses an SA
    /// that still has a zero responder SPI, and an IKE_SA_INIT request
    /// retransmit addresses one where only the initiator half matches.
    pub fn ike_by_spis(&self, initiator_spi: u64, responder_spi: u64) -> Option<Serial> {
        if let Some(serial) = self.ike_by_spi.get(&(initiator_spi, responder_spi)) {
            return Some(*serial);
        }
        self.ike_by_spi.get(&(initiator_spi, 0)).copied()
    }

    /// Locate an IKE SA by the initiator SPI alone (IKE_SA_INIT retransmits)
    pub fn ike_by_initiator_spi(&self, initiator_spi: u64) -> Option<Serial> {
        self.ikes
            .values()
            .find(|sa| sa.initiator_spi == initiator_spi)
            .map(|sa| sa.serial)
    }

    /// Locate a Child SA of ours by the SPI we send with (the peer names
    /// this SPI when rekeying or deleting)
    pub fn child_by_outbound_spi(&self, spi: u32) -> Option<Serial> {
        self.children
            .values()
            .find(|child| child.outbound_spi == spi)
            .map(|child| child.serial)
    }

    /// Locate a Child SA by the SPI the peer sends with
    pub fn child_by_inbound_spi(&self, spi: u32) -> Option<Serial> {
        self.children
            .values()
            .find(|child| child.inbound_spi == spi)
            .map(|child| child.serial)
    }

    /// All serials of live IKE SAs, snapshot for iterate-then-mutate
    pub fn ike_serials(&self) -> Vec<Serial> {
        self.ikes.keys().copied().collect()
    }

    /// Number of half-open IKE SAs, the input to cookie arming
    pub fn half_open_count(&self) -> usize {
        self.ikes
            .values()
            .filter(|sa| sa.state.is_half_open())
            .count()
    }

    /// Remove a single Child SA, unhooking it from its parent
    pub fn remove_child(&mut self, serial: Serial) -> Option<ChildSa> {
        let child = self.children.remove(&serial)?;
        if let Some(parent) = self.ikes.get_mut(&child.parent) {
            parent.children.retain(|c| *c != serial);
        }
        Some(child)
    }

    /// Remove an IKE SA and all its children; the children are returned so
    /// the caller can unwind their kernel state
    pub fn remove_ike_cascade(&mut self, serial: Serial) -> Option<(IkeSa, Vec<ChildSa>)> {
        let sa = self.ikes.remove(&serial)?;
        self.ike_by_spi.remove(&sa.spi_pair());
        let removed = sa
            .children
            .iter()
            .filter_map(|child| self.children.remove(child))
            .collect();
        Some((sa, removed))
    }

    /// Record the newest established IKE SA of a connection
    pub fn set_newest_ike(&mut self, conn: &str, serial: Serial) {
        self.newest_ike_by_conn.insert(conn.to_owned(), serial);
    }

    /// Record the newest installed Child SA of a connection
    pub fn set_newest_child(&mut self, conn: &str, serial: Serial) {
        self.newest_child_by_conn.insert(conn.to_owned(), serial);
    }

    /// The newest established IKE SA of a connection, if it is still live
    pub fn newest_ike(&self, conn: &str) -> Option<Serial> {
        self.newest_ike_by_conn
            .get(conn)
            .copied()
            .filter(|serial| self.ikes.contains_key(serial))
    }

    /// The newest installed Child SA of a connection, if it is still live
    pub fn newest_child(&self, conn: &str) -> Option<Serial> {
        self.newest_child_by_conn
            .get(conn)
            .copied()
            .filter(|serial| self.children.contains_key(serial))
    }

    /// A viable established IKE SA for a connection, for new child requests
    pub fn viable_ike_for_conn(&self, conn: &str) -> Option<Serial> {
        self.newest_ike(conn)
            .filter(|serial| {
                self.ikes
                    .get(serial)
                    .map(|sa| sa.is_viable())
                    .unwrap_or(false)
            })
            .or_else(|| {
                self.ikes
                    .values()
                    .filter(|sa| sa.conn.name == conn && sa.is_viable())
                    .max_by_key(|sa| sa.serial)
                    .map(|sa| sa.serial)
            })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::engine::Timestamp;
    use crate::state::{ChildSaState, PeerSupport, Role};

    fn dummy_ike(serial: Serial, ispi: u64, rspi: u64) -> IkeSa {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 500);
        IkeSa {
            serial,
            role: Role::Initiator,
            state: IkeSaState::Initial,
            conn: Arc::new(ConnectionConfig::psk("test", addr, b"secret")),
            initiator_spi: ispi,
            responder_spi: rspi,
            peer_addr: addr,
            local_addr: addr,
            algorithms: None,
            keys: None,
            no_ppk_keys: None,
            ppk_used: false,
            local_nonce: vec![],
            peer_nonce: vec![],
            dh_group: None,
            ke_secret: None,
            local_ke_public: vec![],
            peer_ke_public: vec![],
            first_packet_local: vec![],
            first_packet_peer: vec![],
            peer_id: None,
            peer_key: None,
            children: vec![],
            next_request_id: 0,
            expected_request_id: 0,
            outstanding: None,
            last_response: None,
            pending: None,
            child_exchange: None,
            peer_support: PeerSupport::default(),
            nat_detected: false,
            cookie: None,
            mobike_cookie2: None,
            invalid_ke_count: 0,
            intermediate_rounds: 0,
            predecessor: None,
            last_inbound: Timestamp::default(),
            liveness_probe_sent: false,
            established_at: None,
            viable_parent: true,
            timer_generation: 0,
        }
    }

    fn dummy_child(serial: Serial, parent: Serial, outbound_spi: u32) -> ChildSa {
        ChildSa {
            serial,
            parent,
            role: Role::Initiator,
            state: ChildSaState::Larval,
            algorithms: None,
            inbound_spi: 1,
            outbound_spi,
            pfs_group: None,
            local_ts: vec![],
            remote_ts: vec![],
            transport_mode: false,
            ipcomp_cpi: None,
            virtual_ip: None,
            predecessor: None,
            established_at: None,
            timer_generation: 0,
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn cascade_removes_children() {
        let mut store = StateStore::default();
        let ike_serial = store.next_serial();
        let mut ike = dummy_ike(ike_serial, 0x1111, 0x2222);
        let child_serial = store.next_serial();
        ike.children.push(child_serial);
        store.insert_ike(ike);
        store.insert_child(dummy_child(child_serial, ike_serial, 0xa1a1a1a1));

        let (_, children) = store.remove_ike_cascade(ike_serial).expect("present");
        assert_eq!(children.len(), 1);
        assert!(store.ike(ike_serial).is_none());
        assert!(store.child(child_serial).is_none());
        assert!(store.ike_by_spis(0x1111, 0x2222).is_none());
    }

    #[test]
    fn spi_pair_fallback_matches_unanswered_initiator() {
        let mut store = StateStore::default();
        let serial = store.next_serial();
        store.insert_ike(dummy_ike(serial, 0x1111, 0));
        // the responder's first reply carries its fresh SPI
        assert_eq!(store.ike_by_spis(0x1111, 0x9999), Some(serial));
    }

    #[test]
    fn child_lookup_by_outbound_spi() {
        let mut store = StateStore::default();
        let ike_serial = store.next_serial();
        store.insert_ike(dummy_ike(ike_serial, 1, 2));
        let child_serial = store.next_serial();
        store.insert_child(dummy_child(child_serial, ike_serial, 0xa1a1a1a1));
        assert_eq!(store.child_by_outbound_spi(0xa1a1a1a1), Some(child_serial));
        assert_eq!(store.child_by_outbound_spi(0xdeadbeef), None);
    }
}
