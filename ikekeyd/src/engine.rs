//! The negotiation engine: a synchronous state machine over explicit inboxes
//! and outboxes
//!
//! One thread owns the engine and with it every piece of SA state. Crypto
//! runs elsewhere: handlers post [TaskRequest]s and return `Suspend`, the
//! driver executes them and feeds the completions back in. Timers work the
//! same way, driven by [Engine::tick] with a caller-supplied clock, so tests
//! control time explicitly.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ikecrypto::aead::AeadKey;
use ikecrypto::CryptoError;
use ikewire::definitions::params::{ExchangeType, NotifyType};
use ikewire::definitions::{Message, Notification, Payload};
use ikewire::parser::{ParserError, RawHeader};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::{ConnectionConfig, EngineConfig};
use crate::handlers::{create_child_sa, ike_auth, ike_intermediate, ike_sa_init, informational};
use crate::ifaces::{CertAuthority, DnsResolver, KernelIpsec, PpkStore};
use crate::impair::Impair;
use crate::md::MessageDigest;
use crate::sk::{self, FragmentStore};
use crate::state::{
    ChildSaState, IkeSaState, OutstandingRequest, Pending, Role, Serial, StateStore,
};
use crate::tasks::{TaskDone, TaskKind, TaskOutput, TaskRequest};
use crate::timers::{LifecycleKind, TimerEvent, TimerWheel};
use crate::transitions::{self, HandlerId, Outcome};

/// Milliseconds-resolution engine clock, relative to engine start
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// Build from elapsed time since engine start
    pub fn from_elapsed(elapsed: Duration) -> Self {
        Self(elapsed)
    }

    /// A timestamp this much later
    pub fn add(self, delta: Duration) -> Self {
        Self(self.0 + delta)
    }

    /// Time passed since an earlier timestamp, zero if it lies ahead
    pub fn since(self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    /// The raw offset since engine start
    pub fn elapsed(self) -> Duration {
        self.0
    }
}

/// One UDP datagram on its way out
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Destination endpoint
    pub to: SocketAddr,
    /// Encoded message bytes
    pub bytes: Vec<u8>,
}

/// Failures of the engine's admin surface
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum EngineError {
    #[error("No connection named {0:?} is configured")]
    UnknownConnection(String),
    #[error("State {0} does not exist")]
    UnknownState(Serial),
    #[error("State {0} is not established")]
    NotEstablished(Serial),
    #[error("No viable IKE SA exists for connection {0:?}")]
    NoViableParent(String),
    #[error("Connection is misconfigured: {0}")]
    Misconfigured(String),
    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

/// The IKEv2 negotiation engine
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) impair: Impair,
    pub(crate) store: StateStore,
    pub(crate) timers: TimerWheel,
    pub(crate) fragments: FragmentStore,
    pub(crate) kernel: Box<dyn KernelIpsec>,
    pub(crate) certs: Arc<dyn CertAuthority>,
    pub(crate) ppks: Box<dyn PpkStore>,
    pub(crate) dns: Arc<dyn DnsResolver>,
    pub(crate) cookie_secret: [u8; 32],
    pool_next: std::collections::HashMap<String, u32>,
    now: Timestamp,
    outbox: VecDeque<Datagram>,
    task_outbox: VecDeque<TaskRequest>,
}

impl Engine {
    /// Build an engine over its collaborators
    pub fn new(
        config: EngineConfig,
        impair: Impair,
        kernel: Box<dyn KernelIpsec>,
        certs: Arc<dyn CertAuthority>,
        ppks: Box<dyn PpkStore>,
        dns: Arc<dyn DnsResolver>,
    ) -> Self {
        if impair.any_active() {
            warn!("Impair hooks are active, this build deviates from the protocol");
        }
        let mut cookie_secret = [0u8; 32];
        ikecrypto::nonce::fill_random(&mut cookie_secret);
        let mut engine = Self {
            config,
            impair,
            store: StateStore::default(),
            timers: TimerWheel::default(),
            fragments: FragmentStore::default(),
            kernel,
            certs,
            ppks,
            dns,
            cookie_secret,
            pool_next: std::collections::HashMap::new(),
            now: Timestamp::default(),
            outbox: VecDeque::new(),
            task_outbox: VecDeque::new(),
        };
        engine
            .timers
            .schedule(engine.now.add(engine.config.fragment_timeout), TimerEvent::FragmentReap);
        engine
    }

    /// The engine's current clock
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// The address the engine expects its socket to be bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.config.local_addr
    }

    /// Read access to the state store, mainly for inspection and tests
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Mutable access to the kernel collaborator, for tests poking idle times
    pub fn kernel_mut(&mut self) -> &mut dyn KernelIpsec {
        self.kernel.as_mut()
    }

    /// Drain the outbound datagrams accumulated since the last call
    pub fn take_datagrams(&mut self) -> Vec<Datagram> {
        self.outbox.drain(..).collect()
    }

    /// Drain the crypto work accumulated since the last call
    pub fn take_tasks(&mut self) -> Vec<TaskRequest> {
        self.task_outbox.drain(..).collect()
    }

    /// The next instant [Engine::tick] wants to run, for the driver's sleep
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.next_deadline()
    }

    /// Advance the clock and fire every due timer
    pub fn tick(&mut self, now: Timestamp) {
        self.now = self.now.max(now);
        for event in self.timers.pop_due(self.now) {
            self.handle_timer(event);
        }
    }

    // ------------------------------------------------------------------
    // admin surface
    // ------------------------------------------------------------------

    /// Start an IKE SA (and with it the first Child SA) for a connection
    pub fn initiate(&mut self, conn_name: &str) -> Result<Serial, EngineError> {
        let conn = self.connection(conn_name)?;
        ike_sa_init::start_initiator(self, conn)
    }

    /// Start an IKE SA for a connection toward an explicit gateway (REDIRECT)
    pub fn initiate_toward(
        &mut self,
        conn_name: &str,
        gateway: SocketAddr,
    ) -> Result<Serial, EngineError> {
        let conn = self.connection(conn_name)?;
        let mut redirected = (*conn).clone();
        redirected.peer_addr = gateway;
        ike_sa_init::start_initiator(self, Arc::new(redirected))
    }

    /// Negotiate an additional Child SA on an established IKE SA
    pub fn initiate_child(&mut self, conn_name: &str) -> Result<Serial, EngineError> {
        create_child_sa::start_new_child(self, conn_name)
    }

    /// Start rekeying a Child SA
    pub fn rekey_child(&mut self, child: Serial) -> Result<(), EngineError> {
        create_child_sa::start_rekey_child(self, child)
    }

    /// Start rekeying an IKE SA
    pub fn rekey_ike(&mut self, ike: Serial) -> Result<(), EngineError> {
        create_child_sa::start_rekey_ike(self, ike)
    }

    /// Tear down an IKE SA and its children via a Delete exchange
    pub fn delete_ike(&mut self, ike: Serial) -> Result<(), EngineError> {
        informational::send_delete_ike(self, ike)
    }

    /// Tear down a single Child SA via a Delete exchange
    pub fn delete_child(&mut self, child: Serial) -> Result<(), EngineError> {
        informational::send_delete_child(self, child)
    }

    /// Send a liveness probe right away (normally timer driven)
    pub fn probe_liveness(&mut self, ike: Serial) -> Result<(), EngineError> {
        informational::send_liveness_probe(self, ike)
    }

    /// Tell the engine its local address changed (MOBIKE)
    pub fn update_local_address(&mut self, ike: Serial, new_addr: SocketAddr) -> Result<(), EngineError> {
        informational::send_update_sa_addresses(self, ike, new_addr)
    }

    pub(crate) fn connection(&self, name: &str) -> Result<Arc<ConnectionConfig>, EngineError> {
        self.config
            .connections
            .iter()
            .find(|conn| conn.name == name)
            .map(|conn| Arc::new(conn.clone()))
            .ok_or_else(|| EngineError::UnknownConnection(name.to_owned()))
    }

    /// The connection description matching an inbound first contact: the one
    /// whose peer address matches the sender, falling back to the first one
    pub(crate) fn connection_for_sender(&self, sender: SocketAddr) -> Option<Arc<ConnectionConfig>> {
        self.config
            .connections
            .iter()
            .find(|conn| conn.peer_addr.ip() == sender.ip())
            .or_else(|| self.config.connections.first())
            .map(|conn| Arc::new(conn.clone()))
    }

    /// Lease the next free address of a connection's virtual IP pool
    pub(crate) fn lease_virtual_ip(&mut self, conn: &ConnectionConfig) -> Option<std::net::Ipv4Addr> {
        let pool = conn.pool.as_ref()?;
        let start = u32::from(pool.start);
        let end = u32::from(pool.end);
        let offset = self.pool_next.entry(conn.name.clone()).or_insert(0);
        if start + *offset > end {
            return None;
        }
        let leased = std::net::Ipv4Addr::from(start + *offset);
        *offset += 1;
        Some(leased)
    }

    // ------------------------------------------------------------------
    // inbound datagrams
    // ------------------------------------------------------------------

    /// Process one received datagram
    pub fn handle_datagram(&mut self, now: Timestamp, from: SocketAddr, bytes: Vec<u8>) {
        self.tick(now);
        let header = match RawHeader::try_parse(&bytes) {
            Ok(header) => header,
            Err(error) => {
                trace!("Dropping undecodable datagram from {from}: {error}");
                return;
            }
        };

        // IKE_SA_INIT requests address no existing SA
        if header.exchange_type == ExchangeType::IkeSaInit as u8
            && !header.response
            && header.responder_spi == 0
        {
            self.handle_init_request(from, bytes, &header);
            return;
        }

        let Some(serial) = self
            .store
            .ike_by_spis(header.initiator_spi, header.responder_spi)
        else {
            trace!("No IKE SA for SPIs {:#x}/{:#x}, dropping", header.initiator_spi, header.responder_spi);
            return;
        };

        if !self.validate_message_id(serial, from, &header) {
            return;
        }

        let message = match Message::try_parse(&bytes) {
            Ok(message) => message,
            Err(error) => {
                debug!("Dropping unparseable message for {serial}: {error}");
                return;
            }
        };
        let mut md = MessageDigest::new(from, bytes, message);

        if !self.unseal_in_place(serial, &mut md) {
            return;
        }
        // only a response that survived the integrity check consumes the
        // outstanding request; a corrupted one must keep the ladder alive
        if let Some(sa) = self.store.ike_mut(serial) {
            if md.response {
                sa.outstanding = None;
            }
            if md.protected {
                sa.last_inbound = self.now;
                sa.liveness_probe_sent = false;
            }
        }
        self.dispatch(serial, md);
    }

    /// First contact: stateless gates, then a fresh responder SA
    fn handle_init_request(&mut self, from: SocketAddr, bytes: Vec<u8>, header: &RawHeader) {
        // retransmitted INIT request for an SA we already answered
        if let Some(serial) = self.store.ike_by_initiator_spi(header.initiator_spi) {
            if let Some(sa) = self.store.ike(serial) {
                if sa.role == Role::Responder {
                    if let Some(cached) = sa.last_response.clone() {
                        if cached.message_id == header.message_id {
                            debug!("Replaying cached IKE_SA_INIT response of {serial}");
                            for datagram in cached.datagrams {
                                self.send_raw(from, datagram);
                            }
                        }
                    }
                    return;
                }
            }
        }

        let message = match Message::try_parse(&bytes) {
            Ok(message) => message,
            Err(ParserError::UnsupportedCriticalPayload(payload_type)) => {
                self.send_init_reject(
                    from,
                    header,
                    Notification::with_data(
                        NotifyType::UnsupportedCriticalPayload,
                        vec![payload_type],
                    ),
                );
                return;
            }
            Err(error) => {
                trace!("Dropping unparseable IKE_SA_INIT request: {error}");
                return;
            }
        };
        let md = MessageDigest::new(from, bytes, message);
        ike_sa_init::handle_first_contact(self, md);
    }

    /// Answer an IKE_SA_INIT request without creating state
    pub(crate) fn send_init_reject(
        &mut self,
        to: SocketAddr,
        header: &RawHeader,
        notification: Notification,
    ) {
        let reply = Message {
            initiator_spi: header.initiator_spi,
            responder_spi: 0,
            exchange_type: ExchangeType::IkeSaInit,
            initiator: false,
            response: true,
            message_id: header.message_id,
            payloads: vec![Payload::Notify(notification)],
        };
        match reply.try_build() {
            Ok(bytes) => self.send_raw(to, bytes),
            Err(error) => warn!("Failed to build IKE_SA_INIT reject: {error}"),
        }
    }

    /// Message-ID window checks; true means keep processing
    fn validate_message_id(&mut self, serial: Serial, from: SocketAddr, header: &RawHeader) -> bool {
        let Some(sa) = self.store.ike(serial) else {
            return false;
        };
        if header.response {
            match &sa.outstanding {
                Some(outstanding) if outstanding.message_id == header.message_id => true,
                _ => {
                    trace!("Dropping response with unexpected message ID {}", header.message_id);
                    false
                }
            }
        } else {
            if let Some(pending_id) = sa.pending.as_ref().and_then(|p| p.message_id()) {
                if pending_id == header.message_id {
                    trace!("Duplicate of request {} we are already processing", pending_id);
                    return false;
                }
            }
            if header.message_id == sa.expected_request_id {
                return true;
            }
            if sa.expected_request_id > 0 && header.message_id == sa.expected_request_id - 1 {
                if let Some(cached) = sa.last_response.clone() {
                    debug!("Replaying cached response {} of {serial}", cached.message_id);
                    for datagram in cached.datagrams {
                        self.send_raw(from, datagram);
                    }
                }
                return false;
            }
            trace!(
                "Dropping request with message ID {} (expected {})",
                header.message_id,
                sa.expected_request_id
            );
            false
        }
    }

    /// Open an SK or SKF payload in place; false aborts processing (silent
    /// drop or reassembly still incomplete)
    fn unseal_in_place(&mut self, serial: Serial, md: &mut MessageDigest) -> bool {
        let encrypted = md.payloads.iter().find_map(|p| match p {
            Payload::Encrypted(encrypted) => Some(encrypted.clone()),
            _ => None,
        });
        let fragment = md.payloads.iter().find_map(|p| match p {
            Payload::EncryptedFragment(fragment) => Some(fragment.clone()),
            _ => None,
        });
        if encrypted.is_none() && fragment.is_none() {
            return true;
        }

        let Some(key) = self.inbound_key(serial) else {
            debug!("Protected message for {serial} before keys exist, dropping");
            return false;
        };

        if let Some(encrypted) = encrypted {
            match sk::open(&key, &md.raw, &encrypted) {
                Ok(inner) => {
                    md.unseal(inner);
                    true
                }
                Err(error) => {
                    if self.impair.bypass_integrity {
                        warn!("IMPAIR: integrity failure on {serial} would be dropped: {error}");
                    } else {
                        debug!("Integrity failure on {serial}, dropping: {error}");
                    }
                    false
                }
            }
        } else if let Some(fragment) = fragment {
            let chunk = match sk::open_fragment(&key, &md.raw, &fragment) {
                Ok(chunk) => chunk,
                Err(error) => {
                    debug!("Fragment integrity failure on {serial}, dropping: {error}");
                    return false;
                }
            };
            match self.fragments.add(
                self.now,
                (serial, md.message_id),
                md.sender,
                &fragment,
                chunk,
            ) {
                Ok(Some(inner)) => {
                    md.unseal(inner);
                    true
                }
                Ok(None) => false,
                Err(error) => {
                    debug!("Fragment reassembly of {serial} failed: {error}");
                    false
                }
            }
        } else {
            true
        }
    }

    /// The AEAD key protecting peer-to-us traffic
    pub(crate) fn inbound_key(&self, serial: Serial) -> Option<AeadKey> {
        let sa = self.store.ike(serial)?;
        let algorithms = sa.algorithms.as_ref()?;
        let keys = sa.keys.as_ref()?;
        let keymat = match sa.role {
            Role::Initiator => keys.sk_er.clone(),
            Role::Responder => keys.sk_ei.clone(),
        };
        AeadKey::new(algorithms.encryption.0, keymat).ok()
    }

    /// The AEAD key protecting us-to-peer traffic
    pub(crate) fn outbound_key(&self, serial: Serial) -> Option<AeadKey> {
        let sa = self.store.ike(serial)?;
        let algorithms = sa.algorithms.as_ref()?;
        let keys = sa.keys.as_ref()?;
        let keymat = match sa.role {
            Role::Initiator => keys.sk_ei.clone(),
            Role::Responder => keys.sk_er.clone(),
        };
        AeadKey::new(algorithms.encryption.0, keymat).ok()
    }

    /// Route a decoded message to its handler and apply the outcome
    fn dispatch(&mut self, serial: Serial, md: MessageDigest) {
        let Some(sa) = self.store.ike(serial) else {
            return;
        };
        let Some(transition) = transitions::select(sa.state, &md) else {
            if !md.response && md.protected {
                debug!("No transition for message on {serial}, answering INVALID_SYNTAX");
                self.send_notify_response(
                    serial,
                    md.exchange_type,
                    md.message_id,
                    NotifyType::InvalidSyntax,
                );
            } else {
                debug!("No transition for message on {serial}, dropping");
            }
            return;
        };

        let handler = transition.handler;
        trace!("Dispatching {:?} on {serial}", handler);
        let message_id = md.message_id;
        let exchange = md.exchange_type;
        let protected_request = md.protected && !md.response;
        let outcome = match handler {
            HandlerId::InitRequest => ike_sa_init::process_init_request(self, serial, md),
            HandlerId::InitCookie => ike_sa_init::process_init_cookie(self, serial, md),
            HandlerId::InitInvalidKe => ike_sa_init::process_init_invalid_ke(self, serial, md),
            HandlerId::InitRedirect => ike_sa_init::process_init_redirect(self, serial, md),
            HandlerId::InitResponse => ike_sa_init::process_init_response(self, serial, md),
            HandlerId::IntermediateRequest => {
                ike_intermediate::process_intermediate_request(self, serial, md)
            }
            HandlerId::IntermediateResponse => {
                ike_intermediate::process_intermediate_response(self, serial, md)
            }
            HandlerId::AuthRequest => ike_auth::process_auth_request(self, serial, md),
            HandlerId::AuthResponse => ike_auth::process_auth_response(self, serial, md),
            HandlerId::CreateChildRequest => {
                create_child_sa::process_create_child_request(self, serial, md)
            }
            HandlerId::CreateChildResponse => {
                create_child_sa::process_create_child_response(self, serial, md)
            }
            HandlerId::InfoRequest => informational::process_informational_request(self, serial, md),
            HandlerId::InfoResponse => {
                informational::process_informational_response(self, serial, md)
            }
        };
        self.apply_outcome(serial, outcome, protected_request, exchange, message_id);
    }

    pub(crate) fn apply_outcome(
        &mut self,
        serial: Serial,
        outcome: Outcome,
        protected_request: bool,
        exchange: ExchangeType,
        message_id: u32,
    ) {
        match outcome {
            Outcome::Ok | Outcome::Suspend | Outcome::Ignore => {}
            Outcome::Fail(notify_type) => {
                info!("Rejecting exchange on {serial} with {notify_type:?}");
                if protected_request {
                    self.send_notify_response(serial, exchange, message_id, notify_type);
                }
                self.teardown_ike(serial, true);
            }
            Outcome::Fatal => {
                info!("Fatal failure on {serial}, deleting state");
                self.teardown_ike(serial, true);
            }
        }
    }

    /// Build and send an encrypted response carrying a single notify
    pub(crate) fn send_notify_response(
        &mut self,
        serial: Serial,
        exchange: ExchangeType,
        message_id: u32,
        notify_type: NotifyType,
    ) {
        let payloads = vec![Payload::Notify(Notification::bare(notify_type))];
        if let Err(error) = self.seal_and_respond(serial, exchange, message_id, &payloads) {
            debug!("Failed to send notify response on {serial}: {error}");
        }
    }

    // ------------------------------------------------------------------
    // task completions
    // ------------------------------------------------------------------

    /// Post a crypto task; the pending record must already be set
    pub(crate) fn submit(&mut self, serial: Serial, kind: TaskKind) {
        self.task_outbox.push_back(TaskRequest { serial, kind });
    }

    /// Deliver a finished crypto task back into the state machine
    pub fn complete_task(&mut self, now: Timestamp, done: TaskDone) {
        self.tick(now);
        let serial = done.serial;
        let Some(sa) = self.store.ike_mut(serial) else {
            trace!("Task completion for reaped state {serial}, discarding");
            return;
        };
        let Some(pending) = sa.pending.take() else {
            trace!("Task completion for {serial} without pending work, discarding");
            return;
        };

        let output = match done.result {
            Ok(output) => output,
            Err(error) => {
                warn!("Crypto worker failed for {serial}: {error}");
                self.crypto_failure(serial, pending);
                return;
            }
        };

        match (pending, output) {
            (Pending::InitKe, TaskOutput::KeGen { public, secret }) => {
                ike_sa_init::init_ke_done(self, serial, public, secret);
            }
            (Pending::InitShared { md }, TaskOutput::KeShared { shared }) => {
                ike_sa_init::init_shared_done(self, serial, md, shared);
            }
            (Pending::RespondInitKe { md }, TaskOutput::KeGen { public, secret }) => {
                ike_sa_init::respond_init_ke_done(self, serial, md, public, secret);
            }
            (Pending::RespondInitShared { md }, TaskOutput::KeShared { shared }) => {
                ike_sa_init::respond_init_shared_done(self, serial, md, shared);
            }
            (Pending::IntermediateKe, TaskOutput::KeGen { public, secret }) => {
                ike_intermediate::intermediate_ke_done(self, serial, public, secret);
            }
            (Pending::IntermediateShared { md }, TaskOutput::KeShared { shared }) => {
                ike_intermediate::intermediate_shared_done(self, serial, md, shared);
            }
            (Pending::RespondIntermediateKe { md }, TaskOutput::KeGen { public, secret }) => {
                ike_intermediate::respond_intermediate_ke_done(self, serial, md, public, secret);
            }
            (Pending::RespondIntermediateShared { md }, TaskOutput::KeShared { shared }) => {
                ike_intermediate::respond_intermediate_shared_done(self, serial, md, shared);
            }
            (Pending::AuthSign, TaskOutput::Sign { signature }) => {
                ike_auth::auth_sign_done(self, serial, signature);
            }
            (Pending::AuthRespCerts { md }, TaskOutput::Certs { result }) => {
                ike_auth::auth_resp_certs_done(self, serial, md, result);
            }
            (Pending::AuthRespVerify { md }, TaskOutput::SigOk) => {
                ike_auth::auth_resp_verify_done(self, serial, md);
            }
            (Pending::AuthReqCerts { md }, TaskOutput::Certs { result }) => {
                ike_auth::auth_req_certs_done(self, serial, md, result);
            }
            (Pending::AuthReqVerify { md }, TaskOutput::SigOk) => {
                ike_auth::auth_req_verify_done(self, serial, md);
            }
            (Pending::AuthReqSign { md }, TaskOutput::Sign { signature }) => {
                ike_auth::auth_req_sign_done(self, serial, md, signature);
            }
            (Pending::AuthReqDns { md }, TaskOutput::Ipseckey { result }) => {
                ike_auth::auth_req_dns_done(self, serial, md, result);
            }
            (Pending::AuthRespDns { md }, TaskOutput::Ipseckey { result }) => {
                ike_auth::auth_resp_dns_done(self, serial, md, result);
            }
            (Pending::ChildKe, TaskOutput::KeGen { public, secret }) => {
                create_child_sa::child_ke_done(self, serial, public, secret);
            }
            (Pending::ChildShared { md }, TaskOutput::KeShared { shared }) => {
                create_child_sa::child_shared_done(self, serial, md, shared);
            }
            (Pending::RespondChildKe { md }, TaskOutput::KeGen { public, secret }) => {
                create_child_sa::respond_child_ke_done(self, serial, md, public, secret);
            }
            (
                Pending::RespondChildShared { md, local_public },
                TaskOutput::KeShared { shared },
            ) => {
                create_child_sa::respond_child_shared_done(self, serial, md, local_public, shared);
            }
            (pending, output) => {
                warn!("Task output {output:?} doesn't match pending work for {serial}");
                self.crypto_failure(serial, pending);
            }
        }
    }

    /// Crypto-worker failure policy: answer a request with a notify when one
    /// is being processed, then tear the SA down
    fn crypto_failure(&mut self, serial: Serial, pending: Pending) {
        let authenticated = self
            .store
            .ike(serial)
            .map(|sa| sa.keys.is_some())
            .unwrap_or(false);
        if let Some(message_id) = pending.message_id() {
            if authenticated {
                let (notify, exchange) = match &pending {
                    Pending::AuthReqCerts { .. }
                    | Pending::AuthReqVerify { .. }
                    | Pending::AuthReqSign { .. } => {
                        (NotifyType::AuthenticationFailed, ExchangeType::IkeAuth)
                    }
                    Pending::RespondChildKe { .. } | Pending::RespondChildShared { .. } => {
                        (NotifyType::InvalidSyntax, ExchangeType::CreateChildSa)
                    }
                    _ => (NotifyType::InvalidSyntax, ExchangeType::IkeIntermediate),
                };
                self.send_notify_response(serial, exchange, message_id, notify);
            }
        }
        self.teardown_ike(serial, true);
    }

    // ------------------------------------------------------------------
    // outbound helpers
    // ------------------------------------------------------------------

    /// Queue one datagram, applying the byte-level impair hooks
    pub(crate) fn send_raw(&mut self, to: SocketAddr, mut bytes: Vec<u8>) {
        if let Some(byte) = self.impair.inject_payload_byte {
            warn!("IMPAIR: appending byte {byte:#04x} to outbound datagram");
            bytes.push(byte);
        }
        if self.impair.replay_duplicates {
            warn!("IMPAIR: replaying outbound datagram");
            self.outbox.push_back(Datagram {
                to,
                bytes: bytes.clone(),
            });
        }
        self.outbox.push_back(Datagram { to, bytes });
    }

    /// Corrupt an SK ciphertext byte when the impair hook asks for it
    fn corrupt_if_impaired(&self, datagrams: &mut [Vec<u8>]) {
        if !self.impair.corrupt_encrypted {
            return;
        }
        for datagram in datagrams.iter_mut() {
            if let Some(byte) = datagram.last_mut() {
                warn!("IMPAIR: corrupting encrypted payload");
                *byte ^= 0xff;
            }
        }
    }

    /// Seal a request, register it as outstanding and send it
    pub(crate) fn seal_and_send_request(
        &mut self,
        serial: Serial,
        exchange: ExchangeType,
        payloads: &[Payload],
    ) -> Result<u32, EngineError> {
        let key = self
            .outbound_key(serial)
            .ok_or(EngineError::NotEstablished(serial))?;
        let (info, fragment_allowed, peer) = {
            let sa = self
                .store
                .ike_mut(serial)
                .ok_or(EngineError::UnknownState(serial))?;
            let message_id = sa.next_request_id;
            sa.next_request_id += 1;
            (
                sk::SkHeader {
                    initiator_spi: sa.initiator_spi,
                    responder_spi: sa.responder_spi,
                    exchange_type: exchange,
                    initiator: sa.role == Role::Initiator,
                    response: false,
                    message_id,
                },
                sa.peer_support.fragmentation && sa.conn.fragmentation,
                sa.peer_addr,
            )
        };

        let mut datagrams = self.seal_datagrams(&key, &info, payloads, fragment_allowed)?;
        self.corrupt_if_impaired(&mut datagrams);
        self.register_outstanding(serial, info.message_id, datagrams.clone());
        for datagram in datagrams {
            self.send_raw(peer, datagram);
        }
        Ok(info.message_id)
    }

    /// Seal a response, cache it for retransmits and send it
    pub(crate) fn seal_and_respond(
        &mut self,
        serial: Serial,
        exchange: ExchangeType,
        message_id: u32,
        payloads: &[Payload],
    ) -> Result<(), EngineError> {
        let key = self
            .outbound_key(serial)
            .ok_or(EngineError::NotEstablished(serial))?;
        let (info, fragment_allowed, peer) = {
            let sa = self
                .store
                .ike(serial)
                .ok_or(EngineError::UnknownState(serial))?;
            (
                sk::SkHeader {
                    initiator_spi: sa.initiator_spi,
                    responder_spi: sa.responder_spi,
                    exchange_type: exchange,
                    initiator: sa.role == Role::Initiator,
                    response: true,
                    message_id,
                },
                sa.peer_support.fragmentation && sa.conn.fragmentation,
                sa.peer_addr,
            )
        };

        let mut datagrams = self.seal_datagrams(&key, &info, payloads, fragment_allowed)?;
        self.corrupt_if_impaired(&mut datagrams);
        self.cache_response(serial, message_id, datagrams.clone());
        for datagram in datagrams {
            self.send_raw(peer, datagram);
        }
        Ok(())
    }

    fn seal_datagrams(
        &self,
        key: &AeadKey,
        info: &sk::SkHeader,
        payloads: &[Payload],
        fragment_allowed: bool,
    ) -> Result<Vec<Vec<u8>>, EngineError> {
        let unknown_critical = self.impair.unknown_payload_critical
            && info.exchange_type == ExchangeType::IkeAuth
            && !info.response;
        if unknown_critical {
            warn!("IMPAIR: adding an unknown critical payload to the IKE_AUTH request");
        }
        let single = sk::seal_with(key, info, payloads, unknown_critical).map_err(seal_to_engine)?;
        if fragment_allowed && single.len() > self.config.fragment_threshold {
            sk::seal_fragmented(key, info, payloads, self.config.fragment_threshold)
                .map_err(seal_to_engine)
        } else {
            Ok(vec![single])
        }
    }

    /// Register a request as outstanding and arm the first retransmit rung
    pub(crate) fn register_outstanding(
        &mut self,
        serial: Serial,
        message_id: u32,
        datagrams: Vec<Vec<u8>>,
    ) {
        let delay = self.config.retransmit_delay;
        let retransmit_at = self.now.add(delay);
        if let Some(sa) = self.store.ike_mut(serial) {
            sa.outstanding = Some(OutstandingRequest {
                message_id,
                datagrams,
                attempts: 1,
                next_delay: delay,
            });
            self.timers.schedule(
                retransmit_at,
                TimerEvent::Retransmit {
                    ike: serial,
                    message_id,
                    attempt: 1,
                },
            );
        }
    }

    /// Cache a response and advance the inbound window
    pub(crate) fn cache_response(
        &mut self,
        serial: Serial,
        message_id: u32,
        datagrams: Vec<Vec<u8>>,
    ) {
        if let Some(sa) = self.store.ike_mut(serial) {
            sa.last_response = Some(crate::state::CachedResponse {
                message_id,
                datagrams,
            });
            sa.expected_request_id = message_id + 1;
        }
    }

    // ------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------

    fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Retransmit {
                ike,
                message_id,
                attempt,
            } => self.retransmit(ike, message_id, attempt),
            TimerEvent::IkeLifecycle {
                ike,
                kind,
                generation,
            } => self.ike_lifecycle(ike, kind, generation),
            TimerEvent::ChildLifecycle {
                child,
                kind,
                generation,
            } => self.child_lifecycle(child, kind, generation),
            TimerEvent::Liveness { ike, generation } => self.liveness_due(ike, generation),
            TimerEvent::HalfOpenReap { ike } => self.reap_half_open(ike),
            TimerEvent::FragmentReap => {
                self.fragments.reap(self.now, self.config.fragment_timeout);
                self.timers.schedule(
                    self.now.add(self.config.fragment_timeout),
                    TimerEvent::FragmentReap,
                );
            }
        }
    }

    fn retransmit(&mut self, serial: Serial, message_id: u32, attempt: u32) {
        let suppress = self.impair.suppress_retransmits;
        let force_timeout = self.impair.timeout_on_retransmit;
        let force_delete = self.impair.delete_on_retransmit;
        let cap = self.config.retransmit_cap;
        let max_attempts = self.config.retransmit_attempts;
        let now = self.now;

        let exhausted = {
            let Some(sa) = self.store.ike(serial) else {
                return;
            };
            let Some(outstanding) = &sa.outstanding else {
                return;
            };
            // answered or superseded in the meantime
            if outstanding.message_id != message_id || outstanding.attempts != attempt {
                return;
            }
            outstanding.attempts >= max_attempts
        };

        if force_delete {
            warn!("IMPAIR: deleting {serial} instead of retransmitting");
            self.teardown_ike(serial, true);
            return;
        }
        if exhausted || force_timeout {
            info!("Retransmit ladder of {serial} exhausted, peer is dead");
            self.peer_dead(serial);
            return;
        }

        let (peer, datagrams, next_attempt, next_delay) = {
            let Some(sa) = self.store.ike_mut(serial) else {
                return;
            };
            let Some(outstanding) = sa.outstanding.as_mut() else {
                return;
            };
            outstanding.attempts += 1;
            // doubling ladder, capped
            outstanding.next_delay = (outstanding.next_delay * 2).min(cap);
            let datagrams = if suppress {
                warn!("IMPAIR: suppressing retransmit of {serial}");
                vec![]
            } else {
                outstanding.datagrams.clone()
            };
            (
                sa.peer_addr,
                datagrams,
                outstanding.attempts,
                outstanding.next_delay,
            )
        };
        self.timers.schedule(
            now.add(next_delay),
            TimerEvent::Retransmit {
                ike: serial,
                message_id,
                attempt: next_attempt,
            },
        );
        for datagram in datagrams {
            self.send_raw(peer, datagram);
        }
    }

    /// Retransmit exhaustion or liveness failure: tear down, maybe revive
    pub(crate) fn peer_dead(&mut self, serial: Serial) {
        let revival = self
            .store
            .ike(serial)
            .map(|sa| (sa.conn.keep_alive, sa.conn.name.clone()));
        self.teardown_ike(serial, false);
        if let Some((true, conn_name)) = revival {
            info!("Reviving connection {conn_name:?} after peer death");
            if let Err(error) = self.initiate(&conn_name) {
                warn!("Revival of {conn_name:?} failed: {error}");
            }
        }
    }

    fn ike_lifecycle(&mut self, serial: Serial, kind: LifecycleKind, generation: u64) {
        let (state, rekey_busy, keep_alive, viable, conn_name) = {
            let Some(sa) = self.store.ike(serial) else {
                return;
            };
            if sa.timer_generation != generation {
                return;
            }
            (
                sa.state,
                sa.child_exchange.is_some(),
                sa.conn.keep_alive,
                sa.viable_parent,
                sa.conn.name.clone(),
            )
        };
        match kind {
            LifecycleKind::Rekey => {
                if state == IkeSaState::Established && !rekey_busy {
                    debug!("Soft lifetime of {serial} reached, rekeying the IKE SA");
                    if let Err(error) = self.rekey_ike(serial) {
                        warn!("IKE rekey of {serial} failed to start: {error}");
                    }
                }
            }
            LifecycleKind::Replace | LifecycleKind::Expire => {
                info!("Hard lifetime of {serial} reached, expiring");
                let revive = kind == LifecycleKind::Replace && keep_alive && viable;
                self.teardown_ike(serial, true);
                if revive {
                    if let Err(error) = self.initiate(&conn_name) {
                        warn!("Replacement of {conn_name:?} failed to start: {error}");
                    }
                }
            }
        }
    }

    fn child_lifecycle(&mut self, serial: Serial, kind: LifecycleKind, generation: u64) {
        let (parent, inbound_spi, child_state) = {
            let Some(child) = self.store.child(serial) else {
                return;
            };
            if child.timer_generation != generation {
                return;
            }
            (child.parent, child.inbound_spi, child.state)
        };
        match kind {
            LifecycleKind::Rekey => {
                // opportunistic connections let an idle child lapse instead
                let (opportunistic, margin) = self
                    .store
                    .ike(parent)
                    .map(|sa| (sa.conn.opportunistic, sa.conn.lifetimes.rekey_margin))
                    .unwrap_or((false, Duration::ZERO));
                let idle_expire = opportunistic
                    && self
                        .kernel
                        .sa_idle(inbound_spi)
                        .map(|idle| idle >= margin)
                        .unwrap_or(false);
                if idle_expire {
                    info!("Idle opportunistic child {serial}, expiring the IKE SA");
                    self.teardown_ike(parent, true);
                    return;
                }
                if child_state == ChildSaState::Established {
                    debug!("Soft lifetime of child {serial} reached, rekeying");
                    if let Err(error) = self.rekey_child(serial) {
                        warn!("Child rekey of {serial} failed to start: {error}");
                    }
                }
            }
            LifecycleKind::Replace | LifecycleKind::Expire => {
                info!("Hard lifetime of child {serial} reached, deleting");
                if let Err(error) = self.delete_child(serial) {
                    debug!("Delete of child {serial} failed: {error}, unwinding locally");
                    self.remove_child(serial, true);
                }
            }
        }
    }

    fn liveness_due(&mut self, serial: Serial, generation: u64) {
        let Some(sa) = self.store.ike(serial) else {
            return;
        };
        if sa.timer_generation != generation || sa.state != IkeSaState::Established {
            return;
        }
        let Some(dpd_delay) = sa.conn.lifetimes.dpd_delay else {
            return;
        };
        let idle = self.now.since(sa.last_inbound);
        if idle >= dpd_delay && sa.outstanding.is_none() {
            debug!("No traffic from peer of {serial} for {idle:?}, probing");
            if let Err(error) = self.probe_liveness(serial) {
                debug!("Liveness probe on {serial} failed: {error}");
            }
        }
        self.schedule_liveness(serial);
    }

    /// Schedule (or reschedule) the liveness check of an established SA
    pub(crate) fn schedule_liveness(&mut self, serial: Serial) {
        let Some(sa) = self.store.ike_mut(serial) else {
            return;
        };
        let Some(dpd_delay) = sa.conn.lifetimes.dpd_delay else {
            return;
        };
        let generation = sa.timer_generation;
        let at = self.now.add(dpd_delay);
        self.timers.schedule(
            at,
            TimerEvent::Liveness {
                ike: serial,
                generation,
            },
        );
    }

    fn reap_half_open(&mut self, serial: Serial) {
        if let Some(sa) = self.store.ike(serial) {
            if sa.state.is_half_open() || sa.established_at.is_none() {
                info!("Reaping half-open IKE SA {serial}");
                self.teardown_ike(serial, false);
            }
        }
    }

    /// Schedule the one lifecycle event of a fresh established IKE SA
    pub(crate) fn schedule_ike_lifetime(&mut self, serial: Serial) {
        let Some(sa) = self.store.ike_mut(serial) else {
            return;
        };
        let lifetimes = sa.conn.lifetimes.clone();
        let rekey_allowed = sa.conn.rekey;
        let role = sa.role;
        sa.timer_generation += 1;
        let generation = sa.timer_generation;

        if !rekey_allowed {
            let at = self.now.add(lifetimes.ike_lifetime);
            self.timers.schedule(
                at,
                TimerEvent::IkeLifecycle {
                    ike: serial,
                    kind: LifecycleKind::Expire,
                    generation,
                },
            );
            return;
        }
        let margin = margin_for(role, &lifetimes);
        let rekey_at = self.now.add(lifetimes.ike_lifetime.saturating_sub(margin));
        self.timers.schedule(
            rekey_at,
            TimerEvent::IkeLifecycle {
                ike: serial,
                kind: LifecycleKind::Rekey,
                generation,
            },
        );
        let replace_at = self.now.add(lifetimes.ike_lifetime);
        self.timers.schedule(
            replace_at,
            TimerEvent::IkeLifecycle {
                ike: serial,
                kind: LifecycleKind::Replace,
                generation,
            },
        );
    }

    /// Schedule the one lifecycle event of a freshly installed Child SA
    pub(crate) fn schedule_child_lifetime(&mut self, serial: Serial) {
        let Some(child) = self.store.child(serial) else {
            return;
        };
        let Some(sa) = self.store.ike(child.parent) else {
            return;
        };
        let lifetimes = sa.conn.lifetimes.clone();
        let rekey_allowed = sa.conn.rekey;
        let role = child.role;
        let Some(child) = self.store.child_mut(serial) else {
            return;
        };
        child.timer_generation += 1;
        let generation = child.timer_generation;

        if !rekey_allowed {
            let at = self.now.add(lifetimes.child_lifetime);
            self.timers.schedule(
                at,
                TimerEvent::ChildLifecycle {
                    child: serial,
                    kind: LifecycleKind::Expire,
                    generation,
                },
            );
            return;
        }
        let margin = margin_for(role, &lifetimes);
        let rekey_at = self
            .now
            .add(lifetimes.child_lifetime.saturating_sub(margin));
        self.timers.schedule(
            rekey_at,
            TimerEvent::ChildLifecycle {
                child: serial,
                kind: LifecycleKind::Rekey,
                generation,
            },
        );
        let expire_at = self.now.add(lifetimes.child_lifetime);
        self.timers.schedule(
            expire_at,
            TimerEvent::ChildLifecycle {
                child: serial,
                kind: LifecycleKind::Expire,
                generation,
            },
        );
    }

    /// Arm the half-open reaper for a fresh responder SA
    pub(crate) fn schedule_half_open_reap(&mut self, serial: Serial) {
        let at = self.now.add(self.config.half_open_timeout);
        self.timers
            .schedule(at, TimerEvent::HalfOpenReap { ike: serial });
    }

    /// Schedule the grace-window expiry of a rekeyed predecessor
    pub(crate) fn expire_predecessor(&mut self, serial: Serial) {
        let delay = self.config.expire_old_sa_delay;
        if let Some(sa) = self.store.ike_mut(serial) {
            sa.viable_parent = false;
            sa.timer_generation += 1;
            let generation = sa.timer_generation;
            let at = self.now.add(delay);
            self.timers.schedule(
                at,
                TimerEvent::IkeLifecycle {
                    ike: serial,
                    kind: LifecycleKind::Expire,
                    generation,
                },
            );
        } else if let Some(child) = self.store.child_mut(serial) {
            child.timer_generation += 1;
            let generation = child.timer_generation;
            let at = self.now.add(delay);
            self.timers.schedule(
                at,
                TimerEvent::ChildLifecycle {
                    child: serial,
                    kind: LifecycleKind::Expire,
                    generation,
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // state teardown
    // ------------------------------------------------------------------

    /// Remove an IKE SA and its children, unwinding kernel state
    pub(crate) fn teardown_ike(&mut self, serial: Serial, kernel_delete: bool) {
        let Some((_sa, children)) = self.store.remove_ike_cascade(serial) else {
            return;
        };
        debug!("Tearing down {serial} with {} children", children.len());
        self.fragments.forget(serial);
        for child in children {
            if kernel_delete || child.state == ChildSaState::Established {
                if let Some(algorithms) = &child.algorithms {
                    self.kernel.delete_sa(child.inbound_spi, algorithms.protocol);
                    self.kernel.delete_sa(child.outbound_spi, algorithms.protocol);
                }
            }
        }
    }

    /// Remove a single Child SA, unwinding kernel state
    pub(crate) fn remove_child(&mut self, serial: Serial, kernel_delete: bool) {
        let Some(child) = self.store.remove_child(serial) else {
            return;
        };
        if kernel_delete {
            if let Some(algorithms) = &child.algorithms {
                self.kernel.delete_sa(child.inbound_spi, algorithms.protocol);
                self.kernel.delete_sa(child.outbound_spi, algorithms.protocol);
            }
        }
    }

}

/// Spec'd margin policy: initiator margin*(1+fuzz·rand), responder margin/2
fn margin_for(role: Role, lifetimes: &crate::config::LifetimeConfig) -> Duration {
    match role {
        Role::Initiator => {
            let fuzz =
                rand::thread_rng().gen_range(0..=lifetimes.rekey_fuzz_percent) as f64 / 100.0;
            lifetimes.rekey_margin.mul_f64(1.0 + fuzz)
        }
        Role::Responder => lifetimes.rekey_margin / 2,
    }
}

fn seal_to_engine(error: sk::SealError) -> EngineError {
    match error {
        sk::SealError::Crypto(crypto) => EngineError::Crypto(crypto),
        sk::SealError::Generator(generator) => {
            warn!("Payload generation failed: {generator}");
            EngineError::Crypto(CryptoError::BadKeyLength)
        }
    }
}
