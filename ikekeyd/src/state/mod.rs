//! The IKE and Child SA state objects and their indexed store
//!
//! Cross references between states are serial numbers, never direct
//! references; a serial that no longer resolves means the state was reaped
//! and whatever carried the serial (timer, task completion) becomes a no-op.

mod store;

pub use store::StateStore;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ikecrypto::dh::KeSecret;
use ikecrypto::sign::PublicKey;
use ikewire::definitions::params::{
    EncryptionAlgorithm, IntegrityAlgorithm, KeyExchangeMethod, PseudorandomFunction,
    SecurityProtocol, SequenceNumbers,
};
use ikewire::definitions::{Identification, TrafficSelector};
use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;
use crate::engine::Timestamp;
use crate::keymat::{NoPpkShadow, SkeyMat};
use crate::md::MessageDigest;

/// Monotonic identifier of a state object, unique across IKE and Child SAs
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Serial(pub u64);

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which end of the negotiation this state plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We sent the first IKE_SA_INIT request
    Initiator,
    /// The peer did
    Responder,
}

/// Lifecycle states of an IKE SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeSaState {
    /// Freshly created, nothing sent or accepted yet
    Initial,
    /// Initiator: KE and nonce are being computed for the first request
    InitPreparing,
    /// Initiator: IKE_SA_INIT request is on the wire
    InitSent,
    /// Initiator: an IKE_INTERMEDIATE request is on the wire
    IntermediateSent,
    /// Initiator: IKE_AUTH material is being computed
    AuthPreparing,
    /// Initiator: IKE_AUTH request is on the wire
    AuthSent,
    /// Responder: IKE_SA_INIT answered, waiting for IKE_AUTH (half-open)
    RespondedInit,
    /// Both SAs are up and the first Child SA exists
    Established,
    /// A delete request for this SA is on the wire
    Deleting,
}

impl IkeSaState {
    /// Whether the state counts as half-open for cookie bookkeeping
    pub fn is_half_open(&self) -> bool {
        matches!(self, IkeSaState::RespondedInit)
    }
}

/// Lifecycle states of a Child SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSaState {
    /// Created locally, no keys installed yet
    Larval,
    /// Keys installed in the kernel in both directions
    Established,
    /// A delete for this child is on the wire
    Deleting,
}

/// The negotiated IKE algorithm suite
#[derive(Debug, Clone)]
pub struct IkeAlgorithms {
    /// Encryption with optional key length
    pub encryption: (EncryptionAlgorithm, Option<u16>),
    /// Pseudorandom function of the key schedule
    pub prf: PseudorandomFunction,
    /// Integrity, None for AEAD ciphers
    pub integrity: IntegrityAlgorithm,
    /// Key exchange method of the initial exchange
    pub key_exchange: KeyExchangeMethod,
}

/// The negotiated Child SA algorithm suite
#[derive(Debug, Clone)]
pub struct ChildAlgorithms {
    /// Protocol of the SA pair (ESP or AH)
    pub protocol: SecurityProtocol,
    /// Encryption with optional key length
    pub encryption: (EncryptionAlgorithm, Option<u16>),
    /// Integrity, None for AEAD ciphers
    pub integrity: IntegrityAlgorithm,
    /// Negotiated sequence number mode
    pub sequence_numbers: SequenceNumbers,
}

/// Capabilities the peer advertised during IKE_SA_INIT
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerSupport {
    /// IKEV2_FRAGMENTATION_SUPPORTED seen
    pub fragmentation: bool,
    /// USE_PPK seen
    pub ppk: bool,
    /// INTERMEDIATE_EXCHANGE_SUPPORTED seen
    pub intermediate: bool,
    /// MOBIKE_SUPPORTED seen (IKE_AUTH)
    pub mobike: bool,
    /// REDIRECT_SUPPORTED seen
    pub redirect: bool,
}

/// A request of ours the peer has not answered yet
#[derive(Debug, Clone)]
pub struct OutstandingRequest {
    /// Message ID of the request
    pub message_id: u32,
    /// The encoded datagrams (several when fragmented)
    pub datagrams: Vec<Vec<u8>>,
    /// Sends so far, the initial transmission included
    pub attempts: u32,
    /// Delay before the next retransmit
    pub next_delay: Duration,
}

/// The last response we produced, kept so a retransmitted request can be
/// answered byte for byte without re-running the handler
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Message ID the response answers
    pub message_id: u32,
    /// The encoded datagrams (several when fragmented)
    pub datagrams: Vec<Vec<u8>>,
}

/// What a suspended exchange is waiting for; the variants carry the inbound
/// message being processed where one exists
#[derive(Debug)]
pub(crate) enum Pending {
    /// Initiator: KE and nonce for the first IKE_SA_INIT
    InitKe,
    /// Initiator: shared secret for the accepted IKE_SA_INIT response
    InitShared { md: MessageDigest },
    /// Responder: local KE for the IKE_SA_INIT response
    RespondInitKe { md: MessageDigest },
    /// Responder: shared secret for the IKE_SA_INIT response
    RespondInitShared { md: MessageDigest },
    /// Initiator: KE for an IKE_INTERMEDIATE round
    IntermediateKe,
    /// Initiator: shared secret from the IKE_INTERMEDIATE response
    IntermediateShared { md: MessageDigest },
    /// Responder: local KE for an IKE_INTERMEDIATE response
    RespondIntermediateKe { md: MessageDigest },
    /// Responder: shared secret for an IKE_INTERMEDIATE response
    RespondIntermediateShared { md: MessageDigest },
    /// Initiator: asymmetric signature for the outbound IKE_AUTH
    AuthSign,
    /// Initiator: certificate decoding for the IKE_AUTH response
    AuthRespCerts { md: MessageDigest },
    /// Initiator: signature verification of the IKE_AUTH response
    AuthRespVerify { md: MessageDigest },
    /// Responder: certificate decoding for the IKE_AUTH request
    AuthReqCerts { md: MessageDigest },
    /// Responder: signature verification of the IKE_AUTH request
    AuthReqVerify { md: MessageDigest },
    /// Responder: asymmetric signature for the IKE_AUTH response
    AuthReqSign { md: MessageDigest },
    /// Responder: IPSECKEY lookup for the initiator's public key
    AuthReqDns { md: MessageDigest },
    /// Initiator: IPSECKEY lookup for the responder's public key
    AuthRespDns { md: MessageDigest },
    /// Initiator: KE for an outbound CREATE_CHILD_SA
    ChildKe,
    /// Initiator: shared secret for the CREATE_CHILD_SA response
    ChildShared { md: MessageDigest },
    /// Responder: local KE for a CREATE_CHILD_SA response
    RespondChildKe { md: MessageDigest },
    /// Responder: shared secret for a CREATE_CHILD_SA response, carrying our
    /// public value for the reply
    RespondChildShared {
        md: MessageDigest,
        local_public: Vec<u8>,
    },
}

impl Pending {
    /// The inbound message the suspended work processes, if any
    pub(crate) fn message_id(&self) -> Option<u32> {
        match self {
            Pending::InitKe
            | Pending::IntermediateKe
            | Pending::AuthSign
            | Pending::ChildKe => None,
            Pending::InitShared { md }
            | Pending::RespondInitKe { md }
            | Pending::RespondInitShared { md }
            | Pending::IntermediateShared { md }
            | Pending::RespondIntermediateKe { md }
            | Pending::RespondIntermediateShared { md }
            | Pending::AuthRespCerts { md }
            | Pending::AuthRespVerify { md }
            | Pending::AuthReqCerts { md }
            | Pending::AuthReqVerify { md }
            | Pending::AuthReqSign { md }
            | Pending::AuthReqDns { md }
            | Pending::AuthRespDns { md }
            | Pending::ChildShared { md }
            | Pending::RespondChildKe { md }
            | Pending::RespondChildShared { md, .. } => Some(md.message_id),
        }
    }
}

/// Why an outbound CREATE_CHILD_SA exchange was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildIntent {
    /// Negotiate an additional Child SA
    New {
        /// The larval child
        child: Serial,
    },
    /// Replace an existing Child SA
    RekeyChild {
        /// The child being replaced
        old: Serial,
        /// The larval replacement
        new: Serial,
    },
    /// Replace the IKE SA itself
    RekeyIke {
        /// The larval replacement IKE SA
        new: Serial,
    },
}

/// Book-keeping for an outbound CREATE_CHILD_SA in flight
#[derive(Debug)]
pub(crate) struct ChildExchange {
    /// What the exchange is supposed to achieve
    pub intent: ChildIntent,
    /// Our nonce
    pub local_nonce: Vec<u8>,
    /// The optional PFS or rekey group
    pub group: Option<KeyExchangeMethod>,
    /// Our KE secret when a group is in use
    pub ke_secret: Option<KeSecret>,
    /// Our KE public value when a group is in use
    pub local_public: Vec<u8>,
    /// Set when the exchange lost a simultaneous-rekey tie break and its
    /// result must be discarded
    pub aborted: bool,
}

/// One IKE SA
#[derive(Debug)]
pub struct IkeSa {
    /// Unique serial of this state
    pub serial: Serial,
    /// Which end we play
    pub role: Role,
    /// Current lifecycle state
    pub state: IkeSaState,
    /// The connection this SA belongs to
    pub conn: Arc<ConnectionConfig>,
    /// SPI chosen by the initiator
    pub initiator_spi: u64,
    /// SPI chosen by the responder, zero until known
    pub responder_spi: u64,
    /// Peer endpoint (rebound by MOBIKE)
    pub peer_addr: SocketAddr,
    /// Local endpoint
    pub local_addr: SocketAddr,
    /// Negotiated suite, set once the proposal is accepted
    pub algorithms: Option<IkeAlgorithms>,
    /// Derived key material, set after the DH completes
    pub keys: Option<SkeyMat>,
    /// Shadow keys kept for NO_PPK_AUTH while PPK keys are live
    pub no_ppk_keys: Option<NoPpkShadow>,
    /// Whether a PPK was mixed into the live keys
    pub ppk_used: bool,
    /// Our nonce of the initial exchange
    pub local_nonce: Vec<u8>,
    /// The peer's nonce of the initial exchange
    pub peer_nonce: Vec<u8>,
    /// Group of the initial key exchange
    pub dh_group: Option<KeyExchangeMethod>,
    /// Our KE secret while the exchange is in flight
    pub(crate) ke_secret: Option<KeSecret>,
    /// Our KE public value of the initial exchange
    pub local_ke_public: Vec<u8>,
    /// The peer's KE public value of the initial exchange
    pub peer_ke_public: Vec<u8>,
    /// Encoded bytes of our IKE_SA_INIT message, signed into AUTH
    pub first_packet_local: Vec<u8>,
    /// Encoded bytes of the peer's IKE_SA_INIT message
    pub first_packet_peer: Vec<u8>,
    /// The peer identity, once proven
    pub peer_id: Option<Identification>,
    /// The peer's verified public key when signature auth is in use
    pub peer_key: Option<PublicKey>,
    /// Children of this SA
    pub children: Vec<Serial>,
    /// Message ID of our next request
    pub next_request_id: u32,
    /// Message ID the peer's next request must carry
    pub expected_request_id: u32,
    /// Our one request in flight, if any
    pub outstanding: Option<OutstandingRequest>,
    /// Our reply to the peer's previous request
    pub last_response: Option<CachedResponse>,
    /// Async work this SA waits on
    pub(crate) pending: Option<Pending>,
    /// Outbound CREATE_CHILD_SA book-keeping
    pub(crate) child_exchange: Option<ChildExchange>,
    /// Capabilities the peer advertised
    pub peer_support: PeerSupport,
    /// Whether NAT was detected between the endpoints
    pub nat_detected: bool,
    /// Cookie the responder asked us to echo
    pub cookie: Option<Vec<u8>>,
    /// COOKIE2 value of an in-flight MOBIKE address update
    pub mobike_cookie2: Option<Vec<u8>>,
    /// INVALID_KE_PAYLOAD restarts so far
    pub invalid_ke_count: u32,
    /// Completed IKE_INTERMEDIATE rounds
    pub intermediate_rounds: u32,
    /// Serial of the IKE SA this one replaced, when rekeyed
    pub predecessor: Option<Serial>,
    /// When the last authenticated inbound message arrived
    pub last_inbound: Timestamp,
    /// Whether a liveness probe is currently unanswered
    pub liveness_probe_sent: bool,
    /// When the SA reached [IkeSaState::Established]
    pub established_at: Option<Timestamp>,
    /// Whether this SA may own new children (cleared once superseded)
    pub viable_parent: bool,
    /// Invalidates stale timer events for this SA
    pub(crate) timer_generation: u64,
}

/// One Child SA (a pair of kernel SAs, inbound and outbound)
#[derive(Debug)]
pub struct ChildSa {
    /// Unique serial of this state
    pub serial: Serial,
    /// The owning IKE SA
    pub parent: Serial,
    /// Which end initiated the exchange that created this child
    pub role: Role,
    /// Current lifecycle state
    pub state: ChildSaState,
    /// Negotiated suite
    pub algorithms: Option<ChildAlgorithms>,
    /// SPI the peer uses when sending to us
    pub inbound_spi: u32,
    /// SPI we use when sending to the peer
    pub outbound_spi: u32,
    /// PFS group, when the exchange carried one
    pub pfs_group: Option<KeyExchangeMethod>,
    /// Selectors covering our end
    pub local_ts: Vec<TrafficSelector>,
    /// Selectors covering the peer's end
    pub remote_ts: Vec<TrafficSelector>,
    /// Transport instead of tunnel mode
    pub transport_mode: bool,
    /// Whether IPComp was negotiated, with the peer's CPI
    pub ipcomp_cpi: Option<u16>,
    /// Virtual address leased to or by us through a configuration payload
    pub virtual_ip: Option<std::net::IpAddr>,
    /// Serial of the Child SA this one replaced, when rekeyed
    pub predecessor: Option<Serial>,
    /// When the child was installed in the kernel
    pub established_at: Option<Timestamp>,
    /// Invalidates stale timer events for this SA
    pub(crate) timer_generation: u64,
}

impl IkeSa {
    /// Whether this SA may still negotiate for its connection
    pub fn is_viable(&self) -> bool {
        self.viable_parent && matches!(self.state, IkeSaState::Established)
    }

    /// The SPI pair as used for store lookups
    pub fn spi_pair(&self) -> (u64, u64) {
        (self.initiator_spi, self.responder_spi)
    }
}
