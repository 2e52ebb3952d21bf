//! Pinhole wire format — every datagram is one serialised [`Message`].
//!
//! The encoding is self-describing JSON text: it round-trips `path`,
//! `peer_id`, `error`, `headers` and `body` exactly, including empty
//! strings and empty maps. `addr` is derived from the transport and never
//! serialised. Byte fields travel as standard base64 strings.
//!
//! A datagram larger than [`MAX_DATAGRAM`] is truncated by the receive
//! buffer and fails to decode; the dispatcher answers such datagrams with
//! an error reply.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Routes ────────────────────────────────────────────────────────────────────

/// Reserved message paths. A datagram whose path has no registered
/// handler is silently dropped.
pub mod route {
    /// Public-key exchange between a client and the rendezvous server.
    pub const GREETING: &str = "greeting";
    /// Client records its id and observed address with the server.
    pub const REGISTER: &str = "register";
    /// Introduction brokering; bodies carry serialised peer records.
    pub const ESTABLISH: &str = "establish";
    /// Direct peer-to-peer datagram that opens the NAT pinhole.
    pub const CONNECT: &str = "connect";
    /// Peer public-key delivery completing the handshake.
    pub const KEY: &str = "key";
    /// Reserved. Nothing routes here.
    pub const NOT_FOUND: &str = "not-found";
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Receive buffer size in bytes. Larger datagrams are truncated and will
/// fail to decode.
pub const MAX_DATAGRAM: usize = 2048;

/// Outbound queue depth. Producers block when the queue is full.
pub const OUTBOUND_QUEUE_DEPTH: usize = 100;

/// Wall-clock deadline for the connect routine.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval at which the connect datagram is re-sent while waiting for
/// the peer's key.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

// ── Message ───────────────────────────────────────────────────────────────────

/// Routed application-layer unit. One message per datagram.
///
/// A message with non-empty `error` is an error reply; its body content
/// is undefined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Routing key. Analogous to a method name in an RPC layer.
    #[serde(default)]
    pub path: String,

    /// Originator peer id, or empty.
    #[serde(default)]
    pub peer_id: String,

    /// Error text. Non-empty marks this message as an error reply.
    #[serde(default)]
    pub error: String,

    /// Optional string metadata.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Opaque payload. Travels as standard base64 text.
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,

    /// Remote address, stamped by sender/receiver plumbing. Never
    /// serialised.
    #[serde(skip)]
    pub addr: Option<SocketAddr>,
}

impl Message {
    /// An empty message for `path`.
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// An error reply carrying `err` as its error text.
    pub fn error_reply(err: impl fmt::Display) -> Self {
        Self {
            error: err.to_string(),
            ..Default::default()
        }
    }

    /// Whether this message is an error reply.
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// The error text, if this message is an error reply.
    pub fn error_text(&self) -> Option<&str> {
        if self.error.is_empty() {
            None
        } else {
            Some(&self.error)
        }
    }

    /// Look up a header by name.
    pub fn header(&self, name: &str) -> Result<&str, WireError> {
        self.headers
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| WireError::HeaderNotFound(name.to_string()))
    }

    /// Serialise into one datagram payload.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }

    /// Decode a datagram payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }
}

/// Byte fields travel as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        BASE64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when framing or interpreting wire data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("cannot parse incoming message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("cannot serialise message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("header not found: {0}")]
    HeaderNotFound(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
