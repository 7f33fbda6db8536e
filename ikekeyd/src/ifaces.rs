//! Named interfaces to the external collaborators
//!
//! The kernel data-plane, the certificate trust machinery, the PPK store and
//! DNS are deliberately outside this crate; the engine talks to them through
//! these traits. The in-memory implementations back the test suite and the
//! demo daemon.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use ikecrypto::sign::PublicKey;
use ikecrypto::SymKey;
use ikewire::definitions::params::SecurityProtocol;
use ikewire::definitions::{Identification, TrafficSelector};
use thiserror::Error;

use crate::state::ChildAlgorithms;

/// Direction of a kernel SA install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaDirection {
    /// Traffic arriving from the peer
    Inbound,
    /// Traffic leaving towards the peer
    Outbound,
}

/// Everything the kernel needs to install one unidirectional SA
#[derive(Debug, Clone)]
pub struct SaInstall {
    /// Which direction the SA handles
    pub direction: SaDirection,
    /// The SPI on the ESP/AH packets
    pub spi: u32,
    /// Negotiated algorithms
    pub algorithms: ChildAlgorithms,
    /// Keymat for this direction
    pub keymat: SymKey,
    /// Local endpoint of the tunnel
    pub local_addr: SocketAddr,
    /// Peer endpoint of the tunnel
    pub peer_addr: SocketAddr,
    /// Selectors covering our end
    pub local_ts: Vec<TrafficSelector>,
    /// Selectors covering the peer's end
    pub remote_ts: Vec<TrafficSelector>,
    /// Transport instead of tunnel mode
    pub transport_mode: bool,
    /// IPComp CPI when compression was negotiated
    pub ipcomp_cpi: Option<u16>,
}

/// Failures reported by the kernel interface
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum KernelError {
    #[error("The SPI is already installed")]
    SpiInUse,
    #[error("The kernel rejected the SA: {0}")]
    Rejected(String),
}

/// The kernel IPsec SA interface (XFRM or equivalent)
pub trait KernelIpsec: Send {
    /// Install one unidirectional SA
    fn install_sa(&mut self, install: &SaInstall) -> Result<(), KernelError>;
    /// Remove one SA by SPI
    fn delete_sa(&mut self, spi: u32, protocol: SecurityProtocol);
    /// Rewrite the endpoints of all SAs between the two old endpoints
    fn migrate_sa(&mut self, old_peer: SocketAddr, new_peer: SocketAddr);
    /// How long an SA has carried no traffic, if the kernel knows
    fn sa_idle(&self, spi: u32) -> Option<Duration>;
}

/// The verified outcome of certificate chain processing
#[derive(Debug, Clone)]
pub struct PeerCredential {
    /// Identity the chain vouches for
    pub identity: Identification,
    /// Public key to verify AUTH signatures with
    pub public_key: PublicKey,
}

/// Failures of the certificate collaborator
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum CertError {
    #[error("Certificate chain doesn't decode")]
    Malformed,
    #[error("Certificate chain doesn't lead to a trust root")]
    Untrusted,
    #[error("Certificate is expired or revoked")]
    Invalid,
}

/// The certificate decode/verify collaborator; runs on worker threads
pub trait CertAuthority: Send + Sync {
    /// Decode a chain of raw certificate bodies and verify it against the
    /// configured trust roots
    fn decode_and_verify(&self, chain: &[Vec<u8>]) -> Result<PeerCredential, CertError>;
}

/// The PPK store collaborator
pub trait PpkStore: Send {
    /// The secret registered under a PPK_IDENTITY, if any
    fn lookup_by_id(&self, id: &[u8]) -> Option<Vec<u8>>;
}

/// Failures of the DNS/IPSECKEY collaborator
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum DnsError {
    #[error("No IPSECKEY record for the identity")]
    NotFound,
    #[error("Lookup failed or was not DNSSEC secured")]
    LookupFailed,
}

/// The DNS/IPSECKEY collaborator; runs on worker threads so a slow resolver
/// never stalls the state machine
pub trait DnsResolver: Send + Sync {
    /// Fetch the public key published for an identity
    fn fetch_public_key(&self, identity: &Identification) -> Result<PublicKey, DnsError>;
}

/// In-memory kernel for tests and the demo daemon: records installs and
/// deletes instead of touching XFRM
#[derive(Debug, Default)]
pub struct MemoryKernel {
    /// Every SA currently installed, by SPI
    pub installed: HashMap<u32, SaInstall>,
    /// SPIs deleted over the lifetime of the kernel
    pub deleted: Vec<u32>,
    /// Endpoint migrations in call order
    pub migrations: Vec<(SocketAddr, SocketAddr)>,
    /// Idle durations to report per SPI
    pub idle: HashMap<u32, Duration>,
}

impl KernelIpsec for MemoryKernel {
    fn install_sa(&mut self, install: &SaInstall) -> Result<(), KernelError> {
        if self.installed.contains_key(&install.spi) {
            return Err(KernelError::SpiInUse);
        }
        self.installed.insert(install.spi, install.clone());
        Ok(())
    }

    fn delete_sa(&mut self, spi: u32, _protocol: SecurityProtocol) {
        self.installed.remove(&spi);
        self.deleted.push(spi);
    }

    fn migrate_sa(&mut self, old_peer: SocketAddr, new_peer: SocketAddr) {
        for install in self.installed.values_mut() {
            if install.peer_addr == old_peer {
                install.peer_addr = new_peer;
            }
        }
        self.migrations.push((old_peer, new_peer));
    }

    fn sa_idle(&self, spi: u32) -> Option<Duration> {
        self.idle.get(&spi).copied()
    }
}

/// Trust store mapping raw "certificate" bodies to credentials; the demo
/// treats the body itself as the lookup key, real deployments plug in an
/// X.509 implementation
#[derive(Default)]
pub struct MemoryCertAuthority {
    trusted: Mutex<HashMap<Vec<u8>, PeerCredential>>,
}

impl MemoryCertAuthority {
    /// Register a raw body as trusted
    pub fn trust(&self, body: Vec<u8>, credential: PeerCredential) {
        if let Ok(mut trusted) = self.trusted.lock() {
            trusted.insert(body, credential);
        }
    }
}

impl CertAuthority for MemoryCertAuthority {
    fn decode_and_verify(&self, chain: &[Vec<u8>]) -> Result<PeerCredential, CertError> {
        let first = chain.first().ok_or(CertError::Malformed)?;
        let trusted = self.trusted.lock().map_err(|_| CertError::Malformed)?;
        trusted.get(first).cloned().ok_or(CertError::Untrusted)
    }
}

/// Resolver backed by a plain map from identity data to public keys
#[derive(Default)]
pub struct MemoryDnsResolver {
    records: Mutex<HashMap<Vec<u8>, PublicKey>>,
}

impl MemoryDnsResolver {
    /// Publish a key under an identity
    pub fn publish(&self, identity_data: Vec<u8>, key: PublicKey) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(identity_data, key);
        }
    }
}

impl DnsResolver for MemoryDnsResolver {
    fn fetch_public_key(&self, identity: &Identification) -> Result<PublicKey, DnsError> {
        let records = self.records.lock().map_err(|_| DnsError::LookupFailed)?;
        records.get(&identity.data).cloned().ok_or(DnsError::NotFound)
    }
}

/// PPK store backed by a plain map
#[derive(Debug, Default)]
pub struct MemoryPpkStore {
    ppks: HashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryPpkStore {
    /// Register a PPK under its identity
    pub fn insert(&mut self, id: Vec<u8>, secret: Vec<u8>) {
        self.ppks.insert(id, secret);
    }
}

impl PpkStore for MemoryPpkStore {
    fn lookup_by_id(&self, id: &[u8]) -> Option<Vec<u8>> {
        self.ppks.get(id).cloned()
    }
}
