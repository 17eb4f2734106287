//! Shared cryptographic primitives.
//!
//! Thin wrappers over the curve and hash crates so the rest of the crate
//! speaks in fixed-size byte arrays. ECDH here is the raw point operation:
//! the x coordinate of the shared secp256k1 point, without the hashing the
//! library's high-level `SharedSecret` would apply.

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

/// X coordinate of `pubkey * seckey` on secp256k1.
///
/// Inputs come from the wire and are only validated by the library's point
/// decoding; that matches the protocol, which signs over this value rather
/// than trusting it directly.
pub fn ecdh_x(pubkey: &PublicKey, seckey: &SecretKey) -> [u8; 32] {
    let point = secp256k1::ecdh::shared_secret_point(pubkey, seckey);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}

/// NIST SP 800-56A concatenation KDF over SHA-256.
///
/// Fills `dest` from `SHA256(be32(1) || secret) || SHA256(be32(2) || ...`,
/// one hash block per 32 bytes of output.
pub fn kdf(secret: &[u8; 32], dest: &mut [u8]) {
    concat_kdf::derive_key_into::<Sha256>(secret, &[], dest)
        .expect("output length below the KDF counter bound");
}

/// Keccak-256 over the concatenation of `parts`.
pub fn keccak256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// HMAC-SHA-256 of the concatenation of `parts` under `key`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Bytewise XOR of two equal-length arrays.
pub fn xor<const N: usize>(a: &[u8; N], b: &[u8; N]) -> [u8; N] {
    let mut out = [0u8; N];
    for i in 0..N {
        out[i] = a[i] ^ b[i];
    }
    out
}
