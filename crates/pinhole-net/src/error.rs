//! Error taxonomy for the dispatcher and protocol roles.
//!
//! Errors returned from a handler never crash the dispatcher — they are
//! surfaced to the remote side as a message with its error text set.
//! Errors from socket open and shutdown are fatal to the role and
//! returned to the embedder.

use thiserror::Error;

use pinhole_core::crypto::CryptoError;
use pinhole_core::wire::WireError;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("key agreement failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("could not resolve connection for peer {0}")]
    PeerConnectionNotFound(String),

    #[error("peer record for {0} carries no address")]
    PeerAddrMissing(String),

    #[error("received {0} message from unknown peer")]
    UnknownPeer(&'static str),

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("peer connection timeout")]
    ConnectTimeout,

    #[error("outbound queue closed")]
    QueueClosed,

    #[error("dispatcher is already running")]
    AlreadyRunning,

    #[error("dispatcher has shut down")]
    Terminated,
}
