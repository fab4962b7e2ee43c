//! Common types shared by every attester crate.
//!
//! Value types for hashes and addresses, the inbound attestation request,
//! attestation and verification statuses, round bookkeeping records,
//! submission payloads, the Merkle tree used for round commitments and the
//! events published on the attester event bus.

pub mod attestation;
pub mod common;
pub mod delivery;
pub mod events;
pub mod merkle;
pub mod round;
pub mod verification;

pub use attestation::*;
pub use common::*;
pub use delivery::*;
pub use events::*;
pub use merkle::*;
pub use round::*;
pub use verification::*;
