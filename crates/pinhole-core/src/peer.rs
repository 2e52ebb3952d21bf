//! Peer identity records.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::wire::WireError;

/// A peer as known to the rendezvous protocol.
///
/// Records received over the wire carry only the id, the public key and
/// the last observed external address. Private keys never appear here —
/// they live in [`crate::crypto::Keypair`] on the owning process only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique identifier chosen by the peer.
    pub id: String,

    /// X25519 public key. Empty until the peer has greeted.
    #[serde(default, with = "crate::wire::base64_bytes")]
    pub public_key: Vec<u8>,

    /// Last observed external address, if any.
    #[serde(default)]
    pub addr: Option<SocketAddr>,
}

impl Peer {
    pub fn new(id: &str, public_key: Vec<u8>) -> Self {
        Self {
            id: id.to_string(),
            public_key,
            addr: None,
        }
    }

    /// Serialise for an establish message body.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }

    /// Decode from an establish message body.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }
}
