//! Chunk codec: XChaCha20-Poly1305 frames keyed by an Argon2id-derived key.
//!
//! Frame format (binary):
//! ```text
//! [24 bytes: nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! Nonces come from a [`NonceSequence`]: a random base with the chunk
//! counter folded into its trailing bytes, so a key never sees the same
//! nonce twice within one container.

pub mod container;

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the derived key and of the key-derivation salt.
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit).
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag.
pub const TAG_SIZE: usize = 16;

/// Maximum plaintext carried by one chunk.
pub const BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Bytes a frame adds on top of its plaintext.
pub const FRAME_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Size of a full frame (every frame but the last one in a container).
pub const FRAME_SIZE: usize = BUFFER_SIZE + FRAME_OVERHEAD;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("chunk authentication failed: wrong key, corrupted or truncated data")]
    AuthenticationFailure,
    #[error("plaintext chunk of {0} bytes exceeds the chunk buffer")]
    ChunkTooLarge(usize),
    #[error("chunk encryption failed")]
    SealFailure,
    #[error("invalid container: {0}")]
    InvalidContainer(String),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// A 256-bit chunk key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChunkKey([u8; KEY_SIZE]);

impl ChunkKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ChunkKey").field(&"[REDACTED]").finish()
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Iterations (default: 3)
    pub time_cost: u32,
    /// Lanes (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Generate a fresh random key-derivation salt.
pub fn generate_salt() -> [u8; KEY_SIZE] {
    let mut salt = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive a chunk key from a passphrase and salt. Same inputs, same key.
pub fn derive_key(
    passphrase: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> CryptoResult<ChunkKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let derived = ChunkKey::from_bytes(key);
    key.zeroize();
    Ok(derived)
}

/// Counter-based nonce generator for one container.
#[derive(Debug, Clone)]
pub struct NonceSequence {
    base: [u8; NONCE_SIZE],
    counter: u64,
}

impl NonceSequence {
    pub fn random() -> Self {
        let mut base = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut base);
        Self::from_base(base)
    }

    pub fn from_base(base: [u8; NONCE_SIZE]) -> Self {
        Self { base, counter: 0 }
    }

    /// Nonce for the next chunk; advances the counter.
    pub fn next_nonce(&mut self) -> [u8; NONCE_SIZE] {
        let mut nonce = self.base;
        let counter = self.counter.to_be_bytes();
        for (byte, c) in nonce[NONCE_SIZE - counter.len()..].iter_mut().zip(counter) {
            *byte ^= c;
        }
        self.counter += 1;
        nonce
    }
}

/// Seal one plaintext chunk into a frame.
///
/// Returns `[nonce][ciphertext][tag]`, i.e. `plaintext.len() + FRAME_OVERHEAD` bytes.
pub fn encrypt_chunk(
    key: &ChunkKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> CryptoResult<Vec<u8>> {
    if plaintext.len() > BUFFER_SIZE {
        return Err(CryptoError::ChunkTooLarge(plaintext.len()));
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let sealed = cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::SealFailure)?;

    let mut frame = Vec::with_capacity(NONCE_SIZE + sealed.len());
    frame.extend_from_slice(nonce);
    frame.extend_from_slice(&sealed);
    Ok(frame)
}

/// Open the frame at the front of `data`.
///
/// At most one full frame is consumed; returns the plaintext and the
/// number of bytes consumed so callers can walk a buffer of frames.
pub fn decrypt_chunk(key: &ChunkKey, data: &[u8]) -> CryptoResult<(Vec<u8>, usize)> {
    let consumed = data.len().min(FRAME_SIZE);
    if consumed < FRAME_OVERHEAD {
        return Err(CryptoError::AuthenticationFailure);
    }

    let (nonce, sealed) = data[..consumed].split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::AuthenticationFailure)?;

    Ok((plaintext, consumed))
}

#[cfg(test)]
pub(crate) fn test_kdf_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}
