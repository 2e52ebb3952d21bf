//! X25519 key agreement.
//!
//! Each participant generates a static keypair at startup. The shared
//! secret for a link is X25519(self private, other public) and is stored
//! raw on that link's connection. This module performs agreement only —
//! nothing here authenticates the remote party.
//!
//! Private keys are clamped at generation and zeroized on drop.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of X25519 keys and derived secrets, in bytes.
pub const KEY_LEN: usize = 32;

/// A process's static X25519 keypair.
///
/// The public key travels in greeting and key message bodies. The private
/// key never leaves this struct except through [`Keypair::private_bytes`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private scalar — clamped, zeroized on drop.
    private: Zeroizing<[u8; KEY_LEN]>,
    /// Public key — scalar base multiplication of the private key.
    pub public: [u8; KEY_LEN],
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut private = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut private);
        Self::from_private(private)
    }

    /// Reconstruct a keypair from private key bytes.
    ///
    /// The bytes are clamped (idempotent if already clamped) and the
    /// public key is derived deterministically.
    pub fn from_private(mut private: [u8; KEY_LEN]) -> Self {
        clamp(&mut private);
        let public = PublicKey::from(&StaticSecret::from(private));
        Self {
            private: Zeroizing::new(private),
            public: *public.as_bytes(),
        }
    }

    /// The private key bytes, for storage by the embedder.
    pub fn private_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(*self.private)
    }

    /// Derive the shared secret for the link to `other_public`.
    pub fn shared_secret(&self, other_public: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let public: [u8; KEY_LEN] = other_public
            .try_into()
            .map_err(|_| CryptoError::BadKeyLength(other_public.len()))?;
        let secret = StaticSecret::from(*self.private).diffie_hellman(&PublicKey::from(public));
        Ok(*secret.as_bytes())
    }
}

/// Clamp a private scalar: clear bits 0–2 of byte 0, clear bit 7 and set
/// bit 6 of byte 31.
fn clamp(private: &mut [u8; KEY_LEN]) {
    private[0] &= 248;
    private[31] &= 127;
    private[31] |= 64;
}

/// Encode a key as standard base64 text for a message body.
pub fn encode_key(key: &[u8]) -> String {
    BASE64.encode(key)
}

/// Decode base64 key text from a message body into raw key bytes.
pub fn decode_key(text: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = BASE64.decode(text)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::BadKeyLength(bytes.len()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("bad public key length: {0} bytes (want {KEY_LEN})")]
    BadKeyLength(usize),

    #[error("could not decode key text: {0}")]
    KeyText(#[from] base64::DecodeError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
