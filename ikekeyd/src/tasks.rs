//! The async task runner contract
//!
//! The engine posts [TaskRequest]s into an outbox; whoever drives the engine
//! (the tokio daemon or a test harness) executes them with [run] — possibly
//! on worker threads, possibly inline — and feeds the [TaskDone] back into
//! [Engine::complete_task](crate::engine::Engine::complete_task). A
//! completion whose serial no longer resolves is silently discarded there,
//! which is the whole cancellation story.

use std::fmt;
use std::sync::Arc;

use ikecrypto::dh::KeSecret;
use ikecrypto::sign::{PrivateKey, PublicKey};
use ikecrypto::{CryptoError, SymKey};
use ikewire::definitions::params::{KeyExchangeMethod, SignatureHashAlgorithm};
use ikewire::definitions::Identification;

use crate::ifaces::{CertAuthority, CertError, DnsError, DnsResolver, PeerCredential};
use crate::state::Serial;

/// A unit of crypto work to run off the main thread
pub struct TaskRequest {
    /// The state awaiting the result
    pub serial: Serial,
    /// What to compute
    pub kind: TaskKind,
}

/// The kinds of work the engine offloads
pub enum TaskKind {
    /// Draw a key exchange secret and compute its public value
    KeGen {
        /// Group to work in
        group: KeyExchangeMethod,
    },
    /// Combine our secret with the peer's public value
    KeShared {
        /// Group to work in
        group: KeyExchangeMethod,
        /// Our secret
        secret: KeSecret,
        /// The peer's public value
        peer_public: Vec<u8>,
    },
    /// Produce an asymmetric signature over prf-hashed AUTH octets
    Sign {
        /// The local private key
        key: PrivateKey,
        /// Hash feeding the signature scheme
        hash: SignatureHashAlgorithm,
        /// The octets to sign
        octets: Vec<u8>,
    },
    /// Check an asymmetric signature over prf-hashed AUTH octets
    VerifySig {
        /// The peer's public key
        key: PublicKey,
        /// Hash feeding the signature scheme
        hash: SignatureHashAlgorithm,
        /// The octets that were signed
        octets: Vec<u8>,
        /// The claimed signature
        signature: Vec<u8>,
    },
    /// Decode and verify a certificate chain via the collaborator
    DecodeCerts {
        /// The raw certificate payload bodies
        chain: Vec<Vec<u8>>,
        /// The trust collaborator
        authority: Arc<dyn CertAuthority>,
    },
    /// Fetch a peer's published public key via the DNS collaborator
    FetchIpseckey {
        /// The identity to look up
        identity: Identification,
        /// The resolver collaborator
        resolver: Arc<dyn DnsResolver>,
    },
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::KeGen { group } => write!(f, "KeGen({group:?})"),
            TaskKind::KeShared { group, .. } => write!(f, "KeShared({group:?})"),
            TaskKind::Sign { hash, .. } => write!(f, "Sign({hash:?})"),
            TaskKind::VerifySig { hash, .. } => write!(f, "VerifySig({hash:?})"),
            TaskKind::DecodeCerts { chain, .. } => write!(f, "DecodeCerts({} certs)", chain.len()),
            TaskKind::FetchIpseckey { identity, .. } => {
                write!(f, "FetchIpseckey({:?})", identity.id_type)
            }
        }
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskRequest({} {:?})", self.serial, self.kind)
    }
}

/// The result of one finished task
#[derive(Debug)]
pub enum TaskOutput {
    /// Result of [TaskKind::KeGen]
    KeGen {
        /// The public value to put on the wire
        public: Vec<u8>,
        /// The secret to keep
        secret: KeSecret,
    },
    /// Result of [TaskKind::KeShared]
    KeShared {
        /// The shared secret
        shared: SymKey,
    },
    /// Result of [TaskKind::Sign]
    Sign {
        /// The raw signature value
        signature: Vec<u8>,
    },
    /// Result of [TaskKind::VerifySig]; failure is reported through the
    /// error side of [TaskDone]
    SigOk,
    /// Result of [TaskKind::DecodeCerts]
    Certs {
        /// The verified credential, or why the chain was refused
        result: Result<PeerCredential, CertError>,
    },
    /// Result of [TaskKind::FetchIpseckey]
    Ipseckey {
        /// The published key, or why the lookup failed
        result: Result<PublicKey, DnsError>,
    },
}

/// A finished task on its way back to the engine
#[derive(Debug)]
pub struct TaskDone {
    /// The state that asked for the work
    pub serial: Serial,
    /// What came out
    pub result: Result<TaskOutput, CryptoError>,
}

/// Execute one task; pure apart from randomness
pub fn run(request: TaskRequest) -> TaskDone {
    let result = match request.kind {
        TaskKind::KeGen { group } => ikecrypto::dh::generate_local(group)
            .map(|(public, secret)| TaskOutput::KeGen { public, secret }),
        TaskKind::KeShared {
            group,
            secret,
            peer_public,
        } => ikecrypto::dh::compute_shared(group, &secret, &peer_public)
            .map(|shared| TaskOutput::KeShared { shared }),
        TaskKind::Sign { key, hash, octets } => {
            ikecrypto::sign::sign(&key, hash, &octets).map(|signature| TaskOutput::Sign { signature })
        }
        TaskKind::VerifySig {
            key,
            hash,
            octets,
            signature,
        } => ikecrypto::sign::verify(&key, hash, &octets, &signature).map(|()| TaskOutput::SigOk),
        TaskKind::DecodeCerts { chain, authority } => Ok(TaskOutput::Certs {
            result: authority.decode_and_verify(&chain),
        }),
        TaskKind::FetchIpseckey { identity, resolver } => Ok(TaskOutput::Ipseckey {
            result: resolver.fetch_public_key(&identity),
        }),
    };
    TaskDone {
        serial: request.serial,
        result,
    }
}
