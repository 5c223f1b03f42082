//! Layered ("onion") symmetric encryption.
//!
//! Wire format: `[1-byte version][32-byte salt][layer N-1 [layer N-2 [... layer 0]]]`
//! where every layer is `[12-byte nonce][AES-256-GCM ciphertext + tag]`.
//!
//! One random salt is drawn per encryption and shared by all layers. The key
//! for layer `i` is `PBKDF2-HMAC-SHA256(master_key, salt, base_iterations * (i + 1))`,
//! so decryption replays the same derivation while peeling layers in reverse.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::num::NonZeroU32;
use thiserror::Error;

/// Current envelope version. Blobs carrying any other version are rejected.
pub const VERSION: u8 = 1;
/// Salt length in bytes.
pub const SALT_LEN: usize = 32;
/// Derived key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;
/// Number of nested encryption layers.
pub const LAYER_COUNT: usize = 5;
/// PBKDF2 iteration count for layer 0; layer `i` uses `(i + 1)` times this.
pub const BASE_ITERATIONS: u32 = 10_000;

const TAG_LEN: usize = 16;

/// Errors surfaced by [`OnionCipher`]. None of them identify the failing layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("sealed payload truncated")]
    Truncated,

    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("decryption failed")]
    Decryption,

    #[error("encryption failed")]
    Encryption,
}

/// Onion encryption with a fixed layer count and key-derivation cost.
///
/// Holds no mutable state; one instance may be shared across threads.
#[derive(Debug, Clone, Copy)]
pub struct OnionCipher {
    base_iterations: NonZeroU32,
}

impl Default for OnionCipher {
    fn default() -> Self {
        Self::with_iterations(BASE_ITERATIONS)
    }
}

impl OnionCipher {
    /// Build a cipher with a custom base iteration count. Both sides of a
    /// sealed payload must agree on it, like they agree on the master key.
    pub fn with_iterations(base_iterations: u32) -> Self {
        Self {
            base_iterations: NonZeroU32::new(base_iterations).unwrap_or(NonZeroU32::MIN),
        }
    }

    /// Seal `plaintext` under `master_key`.
    pub fn encrypt(&self, plaintext: &[u8], master_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let rng = SystemRandom::new();
        let mut salt = [0u8; SALT_LEN];
        rng.fill(&mut salt).map_err(|_| CryptoError::Encryption)?;

        let mut sealed = plaintext.to_vec();
        for layer in 0..LAYER_COUNT {
            let key = self.layer_key(master_key, &salt, layer)?;
            sealed = seal_layer(&key, &rng, sealed)?;
        }

        let mut out = Vec::with_capacity(1 + SALT_LEN + sealed.len());
        out.push(VERSION);
        out.extend_from_slice(&salt);
        out.extend(sealed);
        Ok(out)
    }

    /// Open a blob produced by [`OnionCipher::encrypt`].
    ///
    /// Length and version are checked before any key is derived. The first
    /// layer whose tag does not verify aborts the whole operation.
    pub fn decrypt(&self, sealed: &[u8], master_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < 1 + SALT_LEN {
            return Err(CryptoError::Truncated);
        }
        if sealed[0] != VERSION {
            return Err(CryptoError::UnsupportedVersion(sealed[0]));
        }

        let salt = &sealed[1..1 + SALT_LEN];
        let mut data = sealed[1 + SALT_LEN..].to_vec();

        for layer in (0..LAYER_COUNT).rev() {
            let key = self.layer_key(master_key, salt, layer)?;
            data = open_layer(&key, data)?;
        }

        Ok(data)
    }

    fn layer_key(
        &self,
        master_key: &[u8],
        salt: &[u8],
        layer: usize,
    ) -> Result<LessSafeKey, CryptoError> {
        let iterations = self
            .base_iterations
            .checked_mul(NonZeroU32::new(layer as u32 + 1).unwrap_or(NonZeroU32::MIN))
            .ok_or(CryptoError::Encryption)?;

        let mut key_bytes = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            master_key,
            &mut key_bytes,
        );

        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes).map_err(|_| CryptoError::Encryption)?;
        Ok(LessSafeKey::new(unbound))
    }
}

fn seal_layer(key: &LessSafeKey, rng: &SystemRandom, plaintext: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Encryption)?;

    let mut in_out = plaintext;
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend(in_out);
    Ok(out)
}

fn open_layer(key: &LessSafeKey, layer: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    if layer.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&layer[..NONCE_LEN]);
    let mut in_out = layer[NONCE_LEN..].to_vec();

    let plaintext_len = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Decryption)?
        .len();

    in_out.truncate(plaintext_len);
    Ok(in_out)
}

/// Seal with the default cipher.
pub fn encrypt(plaintext: &[u8], master_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    OnionCipher::default().encrypt(plaintext, master_key)
}

/// Open with the default cipher.
pub fn decrypt(sealed: &[u8], master_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    OnionCipher::default().decrypt(sealed, master_key)
}

/// Generate a random 32-byte master key.
pub fn generate_key() -> Result<Vec<u8>, CryptoError> {
    let mut key = vec![0u8; KEY_LEN];
    SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| CryptoError::Encryption)?;
    Ok(key)
}
