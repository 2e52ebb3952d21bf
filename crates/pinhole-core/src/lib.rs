//! pinhole-core — wire format, key agreement and peer records.
//! The other pinhole crates depend on this one.

pub mod crypto;
pub mod peer;
pub mod wire;

pub use peer::Peer;
pub use wire::Message;
