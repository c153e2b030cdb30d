//! Cryptographic provider for broadcast announcements.
//!
//! Every instance in a deployment holds the same fixed key pair, derived
//! from a shared 32-byte seed. The pair has two halves:
//!   1. X25519 — ECIES encryption of the announcement body (confidentiality)
//!   2. Ed25519 — signature over the encrypted body (tamper evidence)
//!
//! An instance seeded differently can neither read nor forge announcements.
//! Binary outputs are base64 (standard alphabet) because they travel inside
//! a JSON envelope. All secret key material is wiped on drop.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Size of an X25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 nonce.
pub const NONCE_SIZE: usize = 12;

/// Size of the Poly1305 tag.
pub const TAG_SIZE: usize = 16;

/// HKDF info for the per-message symmetric key.
const HKDF_INFO: &[u8] = b"roster-discovery-ecies-v1";

/// BLAKE3 key-derivation contexts. Changing either breaks interop.
const X25519_CONTEXT: &str = "roster discovery 2024 x25519 encryption key";
const ED25519_CONTEXT: &str = "roster discovery 2024 ed25519 signing key";

/// Seed used when the deployment configures none. Anyone with this source
/// can read and forge announcements, so real deployments set their own.
pub const DEFAULT_KEY_SEED: &str =
    "6a3f0e2d9c1b4a5768f7e6d5c4b3a29180f1e2d3c4b5a69788796a5b4c3d2e1f";

// ── Key pair ──────────────────────────────────────────────────────────────────

/// The deployment-wide key pair used to seal broadcast envelopes.
pub struct DiscoveryKeys {
    /// Decrypts envelopes. Zeroized on drop.
    x25519_secret: Zeroizing<[u8; 32]>,
    /// Envelopes are encrypted to this key.
    x25519_public: [u8; 32],
    /// Signs envelopes. ZeroizeOnDrop via ed25519-dalek.
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl DiscoveryKeys {
    /// Derive both halves from a 32-byte seed. Same seed, same keys.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let x_secret = Zeroizing::new(blake3::derive_key(X25519_CONTEXT, seed));
        let ed_seed = Zeroizing::new(blake3::derive_key(ED25519_CONTEXT, seed));

        let static_secret = StaticSecret::from(*x_secret);
        let x25519_public = *PublicKey::from(&static_secret).as_bytes();
        let signing = SigningKey::from_bytes(&ed_seed);
        let verifying = signing.verifying_key();

        Self {
            x25519_secret: x_secret,
            x25519_public,
            signing,
            verifying,
        }
    }

    /// Parse a hex-encoded 32-byte seed.
    pub fn from_hex_seed(hex_seed: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(hex::decode(hex_seed.trim()).map_err(|_| CryptoError::BadSeed)?);
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::BadSeed)?;
        Ok(Self::from_seed(&seed))
    }

    /// Keys from a fresh random seed. Only useful when every peer is given
    /// the same instance, e.g. in tests.
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut seed[..]);
        Self::from_seed(&seed)
    }

    /// Short identifier for logs. Not secret.
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(self.verifying.as_bytes()).as_bytes()[..8])
    }

    /// ECIES-encrypt `plaintext` to this pair's public key.
    ///
    /// Output (before base64): `ephemeral_pub (32) || nonce (12) || ciphertext || tag (16)`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&PublicKey::from(self.x25519_public));

        let cipher = symmetric_cipher(shared.as_bytes())?;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(PUBLIC_KEY_SIZE + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Reverse of [`encrypt`](Self::encrypt). Fails on bad base64, truncation,
    /// or MAC mismatch.
    pub fn decrypt(&self, sealed_b64: &str) -> Result<Vec<u8>, CryptoError> {
        let sealed = BASE64.decode(sealed_b64).map_err(|_| CryptoError::Base64)?;
        if sealed.len() < PUBLIC_KEY_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::TooShort(sealed.len()));
        }

        let (ephemeral, rest) = sealed.split_at(PUBLIC_KEY_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        let ephemeral: [u8; PUBLIC_KEY_SIZE] =
            ephemeral.try_into().map_err(|_| CryptoError::TooShort(sealed.len()))?;

        let secret = StaticSecret::from(*self.x25519_secret);
        let shared = secret.diffie_hellman(&PublicKey::from(ephemeral));

        symmetric_cipher(shared.as_bytes())?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Sign `message`, returning the base64 signature.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing.sign(message).to_bytes())
    }

    /// Verify a base64 signature over `message`.
    pub fn verify(&self, signature_b64: &str, message: &[u8]) -> Result<(), CryptoError> {
        let raw = BASE64
            .decode(signature_b64)
            .map_err(|_| CryptoError::BadSignature)?;
        let signature = Signature::from_slice(&raw).map_err(|_| CryptoError::BadSignature)?;
        self.verifying
            .verify(message, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl std::fmt::Debug for DiscoveryKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryKeys")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// HKDF-SHA256 the DH output into a ChaCha20-Poly1305 key.
fn symmetric_cipher(shared_secret: &[u8; 32]) -> Result<ChaCha20Poly1305, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(HKDF_INFO, &mut key[..])
        .map_err(|_| CryptoError::KeyDerivation)?;
    ChaCha20Poly1305::new_from_slice(&key[..]).map_err(|_| CryptoError::KeyDerivation)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key seed must be 64 hex characters (32 bytes)")]
    BadSeed,

    #[error("HKDF key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed (wrong key or tampered ciphertext)")]
    Decrypt,

    #[error("invalid base64")]
    Base64,

    #[error("sealed payload too short: {0} bytes")]
    TooShort(usize),

    #[error("signature verification failed")]
    BadSignature,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
