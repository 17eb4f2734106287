//! One-shot ECIES envelope for handshake payloads.
//!
//! Each handshake message is encrypted to the peer's static key under a
//! fresh ephemeral key:
//!
//! ```text
//!   R(65) || iv(16) || c || tag(32)
//! ```
//!
//! where `R` is the uncompressed ephemeral public key, `c` is the
//! AES-128-CTR ciphertext, and `tag` authenticates `iv || c` with
//! HMAC-SHA-256. The symmetric keys come from the concat-KDF of the
//! ephemeral ECDH secret: the low 16 bytes encrypt, the SHA-256 of the
//! high 16 becomes the MAC key.
//!
//! Envelopes are not length-prefixed; the fixed handshake plaintext sizes
//! determine how many bytes each side reads from the stream.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr64BE;
use rand::Rng;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use thiserror::Error;

use crate::crypto::{ecdh_x, hmac_sha256, kdf, sha256};

/// Bytes the envelope adds around a plaintext: key, IV, and tag.
pub const OVERHEAD: usize = 65 + 16 + 32;

/// Errors from envelope sealing and opening.
#[derive(Debug, Error)]
pub enum EciesError {
    #[error("encrypted message too small: expected at least {expected}, got {got}")]
    TooSmall { expected: usize, got: usize },

    #[error("ephemeral public key is not a valid curve point: {0}")]
    InvalidEphemeralKey(secp256k1::Error),

    #[error("authentication tag mismatch")]
    TagMismatch,
}

/// Total wire size of an envelope around `plaintext_len` bytes.
pub const fn encrypted_len(plaintext_len: usize) -> usize {
    plaintext_len + OVERHEAD
}

/// Seal `data` to `remote_pubkey` under a fresh ephemeral key.
pub fn encrypt(data: &[u8], remote_pubkey: &PublicKey) -> Vec<u8> {
    let mut rng = rand::thread_rng();

    let ephemeral_secret = SecretKey::new(&mut rng);
    let ephemeral_public = PublicKey::from_secret_key(SECP256K1, &ephemeral_secret);

    let x = ecdh_x(remote_pubkey, &ephemeral_secret);
    let (enc_key, mac_key) = derive_keys(&x);

    let iv: [u8; 16] = rng.gen();
    let mut encrypted = data.to_vec();
    let mut cipher = Ctr64BE::<Aes128>::new((&enc_key).into(), (&iv).into());
    cipher.apply_keystream(&mut encrypted);

    let tag = hmac_sha256(&mac_key, &[&iv, &encrypted]);

    let mut out = Vec::with_capacity(encrypted_len(data.len()));
    out.extend_from_slice(&ephemeral_public.serialize_uncompressed());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&encrypted);
    out.extend_from_slice(&tag);
    out
}

/// Split the concat-KDF output into the cipher key and the MAC key.
fn derive_keys(x: &[u8; 32]) -> ([u8; 16], [u8; 32]) {
    let mut key = [0u8; 32];
    kdf(x, &mut key);

    let mut enc_key = [0u8; 16];
    enc_key.copy_from_slice(&key[..16]);
    let mac_key = sha256(&key[16..]);
    (enc_key, mac_key)
}

/// Parsed view of an incoming envelope.
struct Envelope<'a> {
    public_key: PublicKey,
    iv: [u8; 16],
    encrypted: &'a [u8],
    tag: &'a [u8],
}

impl<'a> Envelope<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, EciesError> {
        if data.len() < OVERHEAD {
            return Err(EciesError::TooSmall {
                expected: OVERHEAD,
                got: data.len(),
            });
        }

        let (pubkey_bytes, rest) = data.split_at(65);
        let public_key =
            PublicKey::from_slice(pubkey_bytes).map_err(EciesError::InvalidEphemeralKey)?;

        let (iv_bytes, rest) = rest.split_at(16);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(iv_bytes);

        let (encrypted, tag) = rest.split_at(rest.len() - 32);

        Ok(Self {
            public_key,
            iv,
            encrypted,
            tag,
        })
    }
}

/// Open an envelope addressed to `secret_key`.
pub fn decrypt(data: &[u8], secret_key: &SecretKey) -> Result<Vec<u8>, EciesError> {
    let envelope = Envelope::parse(data)?;

    let x = ecdh_x(&envelope.public_key, secret_key);
    let (enc_key, mac_key) = derive_keys(&x);

    let tag = hmac_sha256(&mac_key, &[&envelope.iv, envelope.encrypted]);
    if tag.as_slice() != envelope.tag {
        return Err(EciesError::TagMismatch);
    }

    let mut decrypted = envelope.encrypted.to_vec();
    let mut cipher = Ctr64BE::<Aes128>::new((&enc_key).into(), (&envelope.iv).into());
    cipher.apply_keystream(&mut decrypted);
    Ok(decrypted)
}
