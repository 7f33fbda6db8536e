use crate::definitions::params::{NotifyType, SecurityProtocol};
use crate::definitions::{Notification, Proposal, Transform};

impl Proposal {
    /// Return the length of the [Proposal] as sum of the number of all its
    /// transforms
    pub fn len(&self) -> usize {
        self.encryption_algorithms.len()
            + self.pseudo_random_functions.len()
            + self.integrity_algorithms.len()
            + self.key_exchange_methods.len()
            + self.sequence_numbers.len()
    }

    /// Check whether the [Proposal] has no transforms at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a number of transforms to the [Proposal], grouping by the correct
    /// transform type
    pub fn add(&mut self, transforms: Vec<Transform>) {
        for transform in transforms {
            match transform {
                Transform::Encryption(a, o) => self.encryption_algorithms.push((a, o)),
                Transform::PseudoRandomFunction(p) => self.pseudo_random_functions.push(p),
                Transform::Integrity(i) => self.integrity_algorithms.push(i),
                Transform::KeyExchange(k) => self.key_exchange_methods.push(k),
                Transform::SequenceNumber(s) => self.sequence_numbers.push(s),
            }
        }
    }

    /// Easily construct a new empty [Proposal] with the supplied number,
    /// protocol and SPI
    pub fn new_empty(number: u8, protocol: SecurityProtocol, spi: Option<Vec<u8>>) -> Self {
        Self {
            number,
            protocol,
            spi: spi.unwrap_or_default(),
            encryption_algorithms: vec![],
            pseudo_random_functions: vec![],
            integrity_algorithms: vec![],
            key_exchange_methods: vec![],
            sequence_numbers: vec![],
        }
    }

    /// Iterate over all transforms of the proposal in canonical group order
    pub fn transforms(&self) -> impl Iterator<Item = Transform> + '_ {
        self.encryption_algorithms
            .iter()
            .map(|(a, o)| Transform::Encryption(*a, *o))
            .chain(
                self.pseudo_random_functions
                    .iter()
                    .map(|p| Transform::PseudoRandomFunction(*p)),
            )
            .chain(self.integrity_algorithms.iter().map(|i| Transform::Integrity(*i)))
            .chain(self.key_exchange_methods.iter().map(|k| Transform::KeyExchange(*k)))
            .chain(self.sequence_numbers.iter().map(|s| Transform::SequenceNumber(*s)))
    }
}

impl Notification {
    /// A notification without SPI and without data, which covers most of the
    /// capability announcements
    pub fn bare(notify_type: NotifyType) -> Self {
        Self {
            protocol: SecurityProtocol::Reserved,
            spi: None,
            notify_type,
            data: vec![],
        }
    }

    /// A notification without SPI carrying type specific data
    pub fn with_data(notify_type: NotifyType, data: Vec<u8>) -> Self {
        Self {
            protocol: SecurityProtocol::Reserved,
            spi: None,
            notify_type,
            data,
        }
    }

    /// A notification concerning a specific Child SA
    pub fn for_child(notify_type: NotifyType, protocol: SecurityProtocol, spi: u32) -> Self {
        Self {
            protocol,
            spi: Some(spi.to_be_bytes().to_vec()),
            notify_type,
            data: vec![],
        }
    }
}

