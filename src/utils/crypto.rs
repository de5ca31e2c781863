//! Symmetric field encryption.
//!
//! Session-key protected arguments are sealed with XChaCha20-Poly1305. Every
//! field gets its own random 24-byte nonce, carried in front of the ciphertext:
//!
//! ```text
//! [nonce (24)] [ciphertext + tag (N + 16)]
//! ```
//!
//! Until the handshake installs a key, connections hold [`SessionCipher::NoKey`],
//! which refuses to encrypt or decrypt rather than passing data through.

use crate::error::{constants, ProtocolError, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::Zeroize;

/// Size of an XChaCha20 nonce
pub const NONCE_LEN: usize = 24;

/// Size of a Poly1305 tag
pub const TAG_LEN: usize = 16;

/// Size of a session key
pub const KEY_LEN: usize = 32;

/// Fill a buffer from the operating system RNG
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::fill(buf).map_err(|_| ProtocolError::Custom(constants::ERR_RNG_FAILED.into()))
}

/// Generate a fresh random session key
pub fn generate_key() -> Result<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    fill_random(&mut key)?;
    Ok(key)
}

/// AEAD wrapper bound to one session key
pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        fill_random(&mut nonce)?;
        Ok(nonce)
    }

    pub fn encrypt(&self, data: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), data)
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    pub fn decrypt(&self, data: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), data)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }

    /// Encrypt under a fresh nonce, returning `nonce || ciphertext`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = Self::generate_nonce()?;
        let ciphertext = self.encrypt(plaintext, &nonce)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        nonce.zeroize();
        Ok(sealed)
    }

    /// Inverse of [`Crypto::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        let plaintext = self.decrypt(ciphertext, &nonce);
        nonce.zeroize();
        plaintext
    }
}

/// Cipher state of one connection
#[derive(Default)]
pub enum SessionCipher {
    /// Handshake not finished yet
    #[default]
    NoKey,
    Keyed(Crypto),
}

impl SessionCipher {
    /// Install a session key, wiping the caller's copy
    pub fn from_key(mut key: [u8; KEY_LEN]) -> Self {
        let crypto = Crypto::new(&key);
        key.zeroize();
        SessionCipher::Keyed(crypto)
    }

    pub fn is_keyed(&self) -> bool {
        matches!(self, SessionCipher::Keyed(_))
    }

    pub fn encrypt_field(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            SessionCipher::NoKey => Err(ProtocolError::NoSessionKey),
            SessionCipher::Keyed(crypto) => crypto.seal(plaintext),
        }
    }

    pub fn decrypt_field(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        match self {
            SessionCipher::NoKey => Err(ProtocolError::NoSessionKey),
            SessionCipher::Keyed(crypto) => crypto.open(sealed),
        }
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionCipher::NoKey => f.write_str("SessionCipher::NoKey"),
            SessionCipher::Keyed(_) => f.write_str("SessionCipher::Keyed(..)"),
        }
    }
}
