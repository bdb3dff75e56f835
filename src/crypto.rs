use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand::Rng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use proto::control::HANDSHAKE_TAG;

/// HKDF salt; must match the host byte-for-byte or every payload fails
/// authentication.
pub const PROTOCOL_SALT: &[u8] = b"MyRemoteHost-v1";

/// AES-GCM nonce prefix length on the wire.
pub const NONCE_SIZE: usize = 12;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    KeyDerivationFailed,
    EncryptFailed,
    DecryptFailed,
    InvalidHandshake,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Curve25519 key agreement for one session.
///
/// The keypair is generated on demand when the host's handshake arrives (or
/// just before the client sends its own); the raw 32-byte public
/// representation is what travels inside the kind-0x09 packet.
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyExchange {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// derive the 32-byte session key from the peer's public key:
    /// `HKDF-SHA256(ikm = ECDH(our_private, peer_public), salt =
    /// PROTOCOL_SALT, info = ∅)`.
    pub fn derive(&self, peer_public: &[u8; 32]) -> Result<[u8; 32], Error> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));

        let hkdf = Hkdf::<Sha256>::new(Some(PROTOCOL_SALT), shared.as_bytes());
        let mut okm = [0u8; 32];
        hkdf.expand(&[], &mut okm)
            .map_err(|_| Error::KeyDerivationFailed)?;

        Ok(okm)
    }

    /// the handshake payload this side sends: tag byte plus raw public key.
    pub fn handshake_payload(&self) -> [u8; 33] {
        let mut payload = [0u8; 33];
        payload[0] = HANDSHAKE_TAG;
        payload[1..].copy_from_slice(&self.public_key());
        payload
    }
}

/// extract the peer public key from a kind-0x09 packet payload.
pub fn parse_handshake(payload: &[u8]) -> Result<[u8; 32], Error> {
    if payload.len() != 33 || payload[0] != HANDSHAKE_TAG {
        return Err(Error::InvalidHandshake);
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&payload[1..]);
    Ok(key)
}

/// AEAD for every payload except the handshake itself.
///
/// Wire form: `nonce(12) ‖ ciphertext ‖ tag`, fresh random nonce per
/// packet. A failed decryption is reported but carries no detail; the
/// caller drops the packet and lets the key-frame request path recover.
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce: [u8; NONCE_SIZE] = rand::thread_rng().r#gen();

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::EncryptFailed)?;

        let mut bytes = Vec::with_capacity(NONCE_SIZE + sealed.len());
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(&sealed);
        Ok(bytes)
    }

    pub fn decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        if bytes.len() < NONCE_SIZE {
            return Err(Error::DecryptFailed);
        }

        let (nonce, sealed) = bytes.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::DecryptFailed)
    }
}
