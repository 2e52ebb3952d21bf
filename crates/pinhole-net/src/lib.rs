//! pinhole-net — UDP hole punching over a single multiplexed socket.
//!
//! One [`Dispatcher`] turns one UDP socket into a set of addressable
//! [`Connection`]s with path-routed handlers. The [`RendezvousServer`]
//! and [`Client`] roles drive the five-path protocol (greeting, register,
//! establish, connect, key) on top of it; the contract ends when both
//! peers hold a confirmed shared secret bound to a direct connection.

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod registry;
pub mod server;
pub mod tracker;

pub use client::{Client, ClientBuilder};
pub use connection::Connection;
pub use dispatch::Dispatcher;
pub use error::NetError;
pub use handler::{HandlerTable, MessageHandler};
pub use registry::{MemoryRegistry, PeerRegistry};
pub use server::RendezvousServer;
