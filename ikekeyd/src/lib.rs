//! # ikekeyd
//!
//! The IKEv2 parent- and child-SA negotiation engine: message validation,
//! proposal negotiation, key exchange with asynchronous crypto workers, peer
//! authentication, Child SA keying, the INFORMATIONAL exchange and the
//! timer-driven retransmit/rekey machinery.
//!
//! The [engine::Engine] is a synchronous state machine: datagrams, finished
//! crypto tasks and clock ticks go in, datagrams, crypto task requests and
//! kernel SA operations come out. The [daemon] module wires an engine to UDP
//! sockets and a tokio worker pool; tests drive two engines against each
//! other in memory instead.

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod daemon;
pub mod engine;
pub mod ifaces;
pub mod impair;
pub mod md;
pub mod state;
pub mod tasks;

mod handlers;
mod keymat;
mod nat;
mod proposals;
mod sk;
mod timers;
mod transitions;
mod ts;

pub use engine::{Datagram, Engine, EngineError, Timestamp};
pub use state::Serial;
