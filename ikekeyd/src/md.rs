//! The message digest: one parsed inbound datagram with indexed payloads
//!
//! The digest is built twice for protected exchanges: once over the outer
//! message (where it only carries the SK payload) and again after the engine
//! opened the SK payload, at which point `payloads` holds the inner chain.

use std::net::SocketAddr;

use ikewire::definitions::params::{ExchangeType, NotifyType, PayloadType};
use ikewire::definitions::{
    Authentication, Configuration, Delete, Identification, KeyExchange, Message, Notification,
    Payload, SecurityAssociation, TrafficSelector,
};

/// A parsed inbound message with everything handlers need to look at
#[derive(Debug)]
pub struct MessageDigest {
    /// Where the datagram came from
    pub sender: SocketAddr,
    /// The raw datagram bytes as received
    pub raw: Vec<u8>,
    /// Exchange the message belongs to
    pub exchange_type: ExchangeType,
    /// Initiator flag of the header
    pub from_initiator: bool,
    /// Response flag of the header
    pub response: bool,
    /// Message ID of the header
    pub message_id: u32,
    /// SPI pair of the header
    pub initiator_spi: u64,
    /// SPI pair of the header
    pub responder_spi: u64,
    /// The payload chain handlers operate on; the decrypted inner chain for
    /// protected exchanges
    pub payloads: Vec<Payload>,
    /// Whether `payloads` came out of a verified SK payload
    pub protected: bool,
}

impl MessageDigest {
    /// Build a digest from a parsed outer message
    pub fn new(sender: SocketAddr, raw: Vec<u8>, message: Message) -> Self {
        Self {
            sender,
            raw,
            exchange_type: message.exchange_type,
            from_initiator: message.initiator,
            response: message.response,
            message_id: message.message_id,
            initiator_spi: message.initiator_spi,
            responder_spi: message.responder_spi,
            payloads: message.payloads,
            protected: false,
        }
    }

    /// Swap the outer payloads for the opened inner chain
    pub fn unseal(&mut self, inner: Vec<Payload>) {
        self.payloads = inner;
        self.protected = true;
    }

    /// Whether a payload of the given type is present
    pub fn has(&self, payload_type: PayloadType) -> bool {
        self.payloads
            .iter()
            .any(|p| PayloadType::from(p) == payload_type)
    }

    /// All notifications in payload order
    pub fn notifies(&self) -> impl Iterator<Item = &Notification> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Notify(n) => Some(n),
            _ => None,
        })
    }

    /// The first notification of the given type
    pub fn notify(&self, notify_type: NotifyType) -> Option<&Notification> {
        self.notifies().find(|n| n.notify_type == notify_type)
    }

    /// The SA payload, if any
    pub fn sa(&self) -> Option<&SecurityAssociation> {
        self.payloads.iter().find_map(|p| match p {
            Payload::SecurityAssociation(sa) => Some(sa),
            _ => None,
        })
    }

    /// The KE payload, if any
    pub fn ke(&self) -> Option<&KeyExchange> {
        self.payloads.iter().find_map(|p| match p {
            Payload::KeyExchange(ke) => Some(ke),
            _ => None,
        })
    }

    /// The nonce payload, if any
    pub fn nonce(&self) -> Option<&[u8]> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Nonce(n) => Some(n.as_slice()),
            _ => None,
        })
    }

    /// The initiator identification, if any
    pub fn id_initiator(&self) -> Option<&Identification> {
        self.payloads.iter().find_map(|p| match p {
            Payload::IdentificationInitiator(id) => Some(id),
            _ => None,
        })
    }

    /// The responder identification, if any
    pub fn id_responder(&self) -> Option<&Identification> {
        self.payloads.iter().find_map(|p| match p {
            Payload::IdentificationResponder(id) => Some(id),
            _ => None,
        })
    }

    /// The AUTH payload, if any
    pub fn auth(&self) -> Option<&Authentication> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Authentication(auth) => Some(auth),
            _ => None,
        })
    }

    /// The initiator traffic selectors, if any
    pub fn ts_initiator(&self) -> Option<&Vec<TrafficSelector>> {
        self.payloads.iter().find_map(|p| match p {
            Payload::TrafficSelectorsInitiator(ts) => Some(ts),
            _ => None,
        })
    }

    /// The responder traffic selectors, if any
    pub fn ts_responder(&self) -> Option<&Vec<TrafficSelector>> {
        self.payloads.iter().find_map(|p| match p {
            Payload::TrafficSelectorsResponder(ts) => Some(ts),
            _ => None,
        })
    }

    /// All delete payloads in order
    pub fn deletes(&self) -> impl Iterator<Item = &Delete> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Delete(d) => Some(d),
            _ => None,
        })
    }

    /// The configuration payload, if any
    pub fn configuration(&self) -> Option<&Configuration> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Configuration(cp) => Some(cp),
            _ => None,
        })
    }

    /// All certificate payload bodies in order
    pub fn certificates(&self) -> Vec<Vec<u8>> {
        self.payloads
            .iter()
            .filter_map(|p| match p {
                Payload::Certificate(cert) => Some(cert.data.clone()),
                _ => None,
            })
            .collect()
    }
}
