//! # ikewire
//!
//! The low level payload grammar of IKEv2 (RFC 7296)
//!
//! The crate is split into three parts: [definitions] holding the network
//! level structs and IANA parameters, [parser] converting byte buffers into
//! typed payloads and [generator] doing the reverse. The engine sitting on
//! top of this crate owns all protocol logic; this crate only enforces the
//! structural rules of the wire format (lengths, reserved bits, numbering).

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

pub mod definitions;
pub mod generator;
pub mod parser;

#[cfg(test)]
mod tests;

pub use zerocopy;

/// Constant value for IKEv2 in the version field, as <major>.<minor> in 4 bits
/// each, where the <major> is 2 and the <minor> is zero.
pub const IKE_2_VERSION_VALUE: u8 = 0b00100000;

/// Size in octets of the fixed IKE header
pub const IKE_HEADER_SIZE: usize = 28;
