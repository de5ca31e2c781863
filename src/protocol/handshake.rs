//! Session key bootstrap using X25519 key pairs and a sealed session key.
//!
//! Every connection generates an X25519 key pair when it is constructed and
//! announces the public half in a `PublicKey` message. The accepting side answers
//! the first public key it receives with a freshly generated 32-byte session key,
//! sealed to that public key, in a `SessionKey` message. The initiating side opens
//! it with its private key. From then on both directions share one symmetric key
//! for argument-level encryption.
//!
//! ```text
//! initiator                                 acceptor
//!   New -> KeyPairGenerated                   New -> KeyPairGenerated
//!   PublicKey{key} ------------------------>  PublicKeySent
//!   PublicKeySent  <------------------------  PublicKey{key}
//!                  <------------------------  SessionKey{sealedKey}   (Secure)
//!   SessionKeyReceived -> Secure
//! ```
//!
//! Sealing uses an ephemeral X25519 key: the ephemeral public key is sent in front
//! of a ChaCha20-Poly1305 ciphertext whose key is SHA-256 over the shared secret
//! and both public keys.
//!
//! State lives in a per-connection [`Handshake`] value. The functions here do no
//! I/O; the connection feeds them received messages and queues what they return.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::MessageInstance;
use crate::protocol::registry::{builtin, TypeRegistry};
use crate::utils::crypto::{generate_key, SessionCipher, KEY_LEN};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

use tracing::{debug, instrument, warn};

/// Length of an X25519 public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Domain separation label for the sealing key derivation
const SEAL_LABEL: &[u8] = b"peerwire-seal-v1";

/// Which end of the connection this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed out; receives the session key
    Initiator,
    /// Accepted the socket; chooses the session key
    Acceptor,
}

/// Handshake progress of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    New,
    KeyPairGenerated,
    PublicKeySent,
    SessionKeyReceived,
    Secure,
}

/// Long-lived key pair of one connection
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let raw: [u8; PUBLIC_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| ProtocolError::HandshakeError(constants::ERR_BAD_PUBLIC_KEY.into()))?;
    Ok(PublicKey::from(raw))
}

fn derive_seal_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SEAL_LABEL);
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

/// Encrypt `plaintext` so only the holder of `recipient`'s secret can read it.
///
/// Output: `[ephemeral public key (32)] [ciphertext + tag]`
pub fn seal_to(recipient: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient = parse_public_key(recipient)?;
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&recipient);
    if !shared.was_contributory() {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_NON_CONTRIBUTORY.into(),
        ));
    }

    let mut key = derive_seal_key(shared.as_bytes(), &ephemeral_public, &recipient);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();

    // the key is single-use, so a fixed nonce is safe
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), plaintext)
        .map_err(|_| ProtocolError::HandshakeError(constants::ERR_SEAL_FAILED.into()))?;

    let mut sealed = Vec::with_capacity(PUBLIC_KEY_LEN + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a payload produced by [`seal_to`] for this key pair
pub fn open_sealed(key_pair: &KeyPair, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < PUBLIC_KEY_LEN + 16 {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_SEALED_KEY_TOO_SHORT.into(),
        ));
    }
    let (ephemeral_bytes, ciphertext) = sealed.split_at(PUBLIC_KEY_LEN);
    let ephemeral = parse_public_key(ephemeral_bytes)?;

    let shared = key_pair.secret.diffie_hellman(&ephemeral);
    if !shared.was_contributory() {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_NON_CONTRIBUTORY.into(),
        ));
    }

    let mut key = derive_seal_key(shared.as_bytes(), &ephemeral, &key_pair.public);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();

    cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), ciphertext)
        .map_err(|_| ProtocolError::HandshakeError(constants::ERR_OPEN_FAILED.into()))
}

/// What the connection must do after feeding a handshake message
#[derive(Debug)]
pub enum HandshakeStep {
    /// Nothing to send, no key yet
    Pending,
    /// Install this cipher; send `reply` first if present
    Established {
        cipher: SessionCipher,
        reply: Option<MessageInstance>,
    },
}

/// Per-connection handshake state
#[derive(Debug)]
pub struct Handshake {
    role: Role,
    state: HandshakeState,
    key_pair: KeyPair,
    peer_public: Option<[u8; PUBLIC_KEY_LEN]>,
}

impl Handshake {
    /// Generate the local key pair
    pub fn new(role: Role) -> Self {
        let key_pair = KeyPair::generate();
        debug!(?role, "Generated handshake key pair");
        Self {
            role,
            state: HandshakeState::KeyPairGenerated,
            key_pair,
            peer_public: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_secure(&self) -> bool {
        self.state == HandshakeState::Secure
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key_pair.public_bytes()
    }

    pub fn peer_public_key(&self) -> Option<&[u8; PUBLIC_KEY_LEN]> {
        self.peer_public.as_ref()
    }

    /// Build the `PublicKey` announcement and mark it as sent
    pub fn public_key_message(&mut self, registry: &TypeRegistry) -> Result<MessageInstance> {
        let message = registry
            .instance(builtin::PUBLIC_KEY)?
            .with(builtin::ARG_KEY, self.public_key().to_vec())?;
        if self.state < HandshakeState::PublicKeySent {
            self.state = HandshakeState::PublicKeySent;
        }
        Ok(message)
    }

    /// Handle the peer's `PublicKey` message
    #[instrument(skip(self, message, registry), fields(role = ?self.role))]
    pub fn on_public_key(
        &mut self,
        message: &MessageInstance,
        registry: &TypeRegistry,
    ) -> Result<HandshakeStep> {
        if self.peer_public.is_some() {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_DUPLICATE_PUBLIC_KEY.into(),
            ));
        }
        let peer = parse_public_key(message.bytes(builtin::ARG_KEY)?)?;
        self.peer_public = Some(peer.to_bytes());

        match self.role {
            Role::Initiator => {
                debug!("Stored acceptor public key");
                Ok(HandshakeStep::Pending)
            }
            Role::Acceptor => {
                let mut session_key = generate_key()?;
                let sealed = seal_to(peer.as_bytes(), &session_key)?;
                let reply = registry
                    .instance(builtin::SESSION_KEY)?
                    .with(builtin::ARG_SEALED_KEY, sealed)?;

                let cipher = SessionCipher::from_key(session_key);
                session_key.zeroize();
                self.state = HandshakeState::Secure;
                debug!("Issued session key");

                Ok(HandshakeStep::Established {
                    cipher,
                    reply: Some(reply),
                })
            }
        }
    }

    /// Handle the acceptor's `SessionKey` message
    #[instrument(skip(self, message), fields(role = ?self.role))]
    pub fn on_session_key(&mut self, message: &MessageInstance) -> Result<HandshakeStep> {
        if self.role != Role::Initiator || self.state != HandshakeState::PublicKeySent {
            warn!(state = ?self.state, "Session key arrived out of turn");
            return Err(ProtocolError::HandshakeError(
                constants::ERR_UNEXPECTED_SESSION_KEY.into(),
            ));
        }

        let mut opened = open_sealed(&self.key_pair, message.bytes(builtin::ARG_SEALED_KEY)?)?;
        let key: Result<[u8; KEY_LEN]> = opened.as_slice().try_into().map_err(|_| {
            ProtocolError::HandshakeError(constants::ERR_SESSION_KEY_LENGTH.into())
        });
        opened.zeroize();
        let key = key?;

        self.state = HandshakeState::SessionKeyReceived;
        let cipher = SessionCipher::from_key(key);
        self.state = HandshakeState::Secure;
        debug!("Installed session key");

        Ok(HandshakeStep::Established {
            cipher,
            reply: None,
        })
    }
}
