//! Engine and connection configuration
//!
//! Connection descriptions arrive from the outside (a config loader is an
//! external collaborator); these structs are the engine's view of them.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use ikewire::definitions::params::{
    EncryptionAlgorithm, IntegrityAlgorithm, KeyExchangeMethod, PseudorandomFunction,
    SequenceNumbers,
};
use ikewire::definitions::{Identification, TrafficSelector};
use serde::{Deserialize, Serialize};

/// Engine-wide knobs with defaults matching common deployments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Address the engine's socket is bound to, used in NAT detection hashes
    pub local_addr: SocketAddr,
    /// The known connections by name
    pub connections: Vec<ConnectionConfig>,
    /// Number of half-open IKE SAs above which INIT requests are answered
    /// with a cookie challenge instead of state creation
    pub cookie_threshold: usize,
    /// Reap half-open IKE SAs that never authenticated after this long
    pub half_open_timeout: Duration,
    /// Outbound messages above this size are split into SK fragments when
    /// the peer supports it
    pub fragment_threshold: usize,
    /// Drop partial fragment reassembly groups after this long
    pub fragment_timeout: Duration,
    /// First retransmit delay of the exponential ladder
    pub retransmit_delay: Duration,
    /// Upper bound a single retransmit delay may grow to
    pub retransmit_cap: Duration,
    /// Number of sends (first transmission included) before the peer is
    /// declared dead
    pub retransmit_attempts: u32,
    /// Grace window the predecessor SA survives after a successful rekey
    pub expire_old_sa_delay: Duration,
    /// Cap on INVALID_KE_PAYLOAD restarts per IKE SA
    pub invalid_ke_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 500),
            connections: vec![],
            cookie_threshold: 32,
            half_open_timeout: Duration::from_secs(60),
            fragment_threshold: 1280,
            fragment_timeout: Duration::from_secs(10),
            retransmit_delay: Duration::from_millis(500),
            retransmit_cap: Duration::from_secs(32),
            retransmit_attempts: 6,
            expire_old_sa_delay: Duration::from_secs(1),
            invalid_ke_limit: 2,
        }
    }
}

/// How this end proves its identity and checks the peer's
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthConfig {
    /// prf-based proof from a shared secret
    PreSharedKey {
        /// The shared secret
        secret: Vec<u8>,
    },
    /// No authentication at all (RFC 7619); only sane combined with
    /// narrow selectors
    Null,
    /// Classic RSA signature authentication, PKCS#1 v1.5 over SHA-256
    RsaSignature {
        /// PKCS#1 DER encoding of the local private key
        private_der: Vec<u8>,
    },
    /// RFC 7427 Digital Signature authentication
    DigitalSignature {
        /// The local signing key
        key: SignKeyConfig,
    },
}

/// Key material for signature based authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignKeyConfig {
    /// PKCS#1 DER encoding of an RSA private key
    RsaDer(Vec<u8>),
    /// 32 octet Ed25519 seed
    Ed25519Seed([u8; 32]),
}

/// Whether and how hard a connection wants post-quantum preshared keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PpkPolicy {
    /// Never advertise or use a PPK
    #[default]
    Never,
    /// Use a PPK when both sides have one, fall back otherwise
    Allow,
    /// Fail authentication when no matching PPK is available
    Insist,
}

/// Algorithm lists for one protocol, in preference order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    /// Encryption algorithms with their key length attribute
    pub encryption: Vec<(EncryptionAlgorithm, Option<u16>)>,
    /// Pseudorandom functions (IKE only)
    pub prf: Vec<PseudorandomFunction>,
    /// Integrity algorithms; [IntegrityAlgorithm::None] with AEAD ciphers
    pub integrity: Vec<IntegrityAlgorithm>,
    /// Key exchange methods; for a Child SA a non-empty list requests PFS
    pub key_exchange: Vec<KeyExchangeMethod>,
    /// Sequence number modes (Child only)
    pub sequence_numbers: Vec<SequenceNumbers>,
}

impl AlgorithmConfig {
    /// A reasonable IKE default: AES-256-GCM, HMAC-SHA2-256, MODP-2048
    pub fn ike_default() -> Self {
        Self {
            encryption: vec![(EncryptionAlgorithm::AesGcm16, Some(256))],
            prf: vec![PseudorandomFunction::HmacSha2_256],
            integrity: vec![IntegrityAlgorithm::None],
            key_exchange: vec![KeyExchangeMethod::Modp2048],
            sequence_numbers: vec![],
        }
    }

    /// A reasonable ESP default: AES-256-GCM without PFS
    pub fn esp_default() -> Self {
        Self {
            encryption: vec![(EncryptionAlgorithm::AesGcm16, Some(256))],
            prf: vec![],
            integrity: vec![IntegrityAlgorithm::None],
            key_exchange: vec![],
            sequence_numbers: vec![SequenceNumbers::NoExtended],
        }
    }
}

/// Address pool a responder leases virtual IPs from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressPool {
    /// First leasable address
    pub start: Ipv4Addr,
    /// Last leasable address
    pub end: Ipv4Addr,
}

/// Rekey and liveness timing for one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifetimeConfig {
    /// Hard lifetime of the IKE SA
    pub ike_lifetime: Duration,
    /// Hard lifetime of each Child SA
    pub child_lifetime: Duration,
    /// How long before the hard lifetime rekeying starts
    pub rekey_margin: Duration,
    /// Random percentage added to the margin on the initiator
    pub rekey_fuzz_percent: u32,
    /// Probe the peer after this long without inbound traffic; None turns
    /// dead peer detection off
    pub dpd_delay: Option<Duration>,
}

impl Default for LifetimeConfig {
    fn default() -> Self {
        Self {
            ike_lifetime: Duration::from_secs(4 * 3600),
            child_lifetime: Duration::from_secs(3600),
            rekey_margin: Duration::from_secs(540),
            rekey_fuzz_percent: 100,
            dpd_delay: None,
        }
    }
}

/// One connection description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Unique name used in admin operations and logs
    pub name: String,
    /// Address of the peer
    pub peer_addr: SocketAddr,
    /// Identity sent as IDi/IDr
    pub local_id: Identification,
    /// Identity the peer must prove; None accepts whatever the credentials
    /// vouch for
    pub peer_id: Option<Identification>,
    /// How we authenticate ourselves
    pub auth: AuthConfig,
    /// How the peer must authenticate; usually mirrors `auth`
    pub peer_auth: AuthConfig,
    /// IKE algorithm policy
    pub ike: AlgorithmConfig,
    /// ESP algorithm policy
    pub esp: AlgorithmConfig,
    /// Traffic this end wants to protect
    pub local_ts: Vec<TrafficSelector>,
    /// Traffic the peer is expected to cover
    pub remote_ts: Vec<TrafficSelector>,
    /// Timing policy
    pub lifetimes: LifetimeConfig,
    /// Post-quantum preshared key policy
    pub ppk: PpkPolicy,
    /// PPK identity offered to the peer when `ppk` is not `Never`
    pub ppk_id: Option<Vec<u8>>,
    /// Advertise and honor SK fragmentation
    pub fragmentation: bool,
    /// Advertise MOBIKE support
    pub mobike: bool,
    /// Insert an IKE_INTERMEDIATE round with this group before IKE_AUTH
    pub intermediate_ke: Option<KeyExchangeMethod>,
    /// Request transport instead of tunnel mode
    pub transport_mode: bool,
    /// Offer IPComp for the Child SAs
    pub ipcomp: bool,
    /// Follow REDIRECT notifies from this peer
    pub accept_redirects: bool,
    /// Send INITIAL_CONTACT in the first IKE_AUTH
    pub send_initial_contact: bool,
    /// Request a virtual address from the peer
    pub request_virtual_ip: bool,
    /// Lease virtual addresses to the peer from this pool
    pub pool: Option<AddressPool>,
    /// Whether the SAs may be rekeyed at all; when false they expire hard
    pub rekey: bool,
    /// Re-initiate when the peer is declared dead or the SA expires
    pub keep_alive: bool,
    /// Treat the connection as opportunistic: idle children are let go
    /// instead of rekeyed
    pub opportunistic: bool,
}

impl ConnectionConfig {
    /// A minimal PSK connection for tests and examples
    pub fn psk(name: &str, peer_addr: SocketAddr, secret: &[u8]) -> Self {
        Self {
            name: name.to_owned(),
            peer_addr,
            local_id: Identification {
                id_type: ikewire::definitions::params::IdType::Fqdn,
                data: format!("{name}.local").into_bytes(),
            },
            peer_id: None,
            auth: AuthConfig::PreSharedKey {
                secret: secret.to_vec(),
            },
            peer_auth: AuthConfig::PreSharedKey {
                secret: secret.to_vec(),
            },
            ike: AlgorithmConfig::ike_default(),
            esp: AlgorithmConfig::esp_default(),
            local_ts: vec![],
            remote_ts: vec![],
            lifetimes: LifetimeConfig::default(),
            ppk: PpkPolicy::Never,
            ppk_id: None,
            fragmentation: true,
            mobike: false,
            intermediate_ke: None,
            transport_mode: false,
            ipcomp: false,
            accept_redirects: false,
            send_initial_contact: true,
            request_virtual_ip: false,
            pool: None,
            rekey: true,
            keep_alive: false,
            opportunistic: false,
        }
    }
}
