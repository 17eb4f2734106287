//! Streaming frame MAC.
//!
//! Each direction of an established session carries a Keccak-256 absorber
//! seeded with the session MAC secret. Header and body updates whiten the
//! absorbed bytes with a single AES-256-ECB block keyed by that same
//! secret, chaining every frame to the full transcript before it.
//!
//! `digest()` reads the current state without finalizing: the absorber
//! keeps evolving across calls, which is what ties consecutive frames
//! together. The sponge is never consumed; digests come from a clone.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use sha3::{Digest, Keccak256};

use crate::crypto::xor;

/// Size of a frame MAC tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Keccak-based MAC chain for one direction of a session.
#[derive(Clone)]
pub struct FrameMac {
    secret: [u8; 32],
    hasher: Keccak256,
}

impl FrameMac {
    /// Create a MAC chain seeded with the session MAC secret.
    pub fn new(secret: [u8; 32]) -> Self {
        Self {
            secret,
            hasher: Keccak256::new(),
        }
    }

    /// Absorb raw bytes (used for the nonce/init-message seeding).
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Absorb an encrypted 16-byte frame header.
    pub fn update_header(&mut self, encrypted_header: &[u8; 16]) {
        let whitened = self.encrypt_block(&self.digest());
        self.hasher.update(xor(&whitened, encrypted_header));
    }

    /// Absorb an encrypted frame body.
    pub fn update_body(&mut self, encrypted_body: &[u8]) {
        self.hasher.update(encrypted_body);
        let seed = self.digest();
        let whitened = self.encrypt_block(&seed);
        self.hasher.update(xor(&whitened, &seed));
    }

    /// First 16 bytes of the current state, without finalizing.
    pub fn digest(&self) -> [u8; TAG_SIZE] {
        let full: [u8; 32] = self.hasher.clone().finalize().into();
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&full[..TAG_SIZE]);
        tag
    }

    /// AES-256-ECB of one block under the MAC secret.
    fn encrypt_block(&self, block: &[u8; 16]) -> [u8; 16] {
        let cipher = Aes256::new_from_slice(&self.secret)
            .expect("mac secret is exactly 32 bytes");
        let mut out = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut out);
        out.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_does_not_finalize() {
        let mut mac = FrameMac::new([1u8; 32]);
        mac.update(b"seed material");

        let first = mac.digest();
        let second = mac.digest();
        assert_eq!(first, second);

        // The state keeps evolving after a digest
        mac.update(b"more");
        assert_ne!(mac.digest(), first);
    }

    #[test]
    fn test_mirrored_states_agree() {
        let mut a = FrameMac::new([2u8; 32]);
        let mut b = FrameMac::new([2u8; 32]);

        a.update(b"init");
        b.update(b"init");
        a.update_header(&[3u8; 16]);
        b.update_header(&[3u8; 16]);
        assert_eq!(a.digest(), b.digest());

        a.update_body(&[4u8; 48]);
        b.update_body(&[4u8; 48]);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_different_secret_diverges() {
        let mut a = FrameMac::new([0u8; 32]);
        let mut b = FrameMac::new([1u8; 32]);

        // Same absorbed data, different whitening key
        a.update_header(&[5u8; 16]);
        b.update_header(&[5u8; 16]);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_header_chains_into_body() {
        let mut a = FrameMac::new([6u8; 32]);
        let mut b = FrameMac::new([6u8; 32]);

        a.update_header(&[7u8; 16]);
        b.update_header(&[8u8; 16]);

        // Divergent headers poison every later body tag
        a.update_body(&[9u8; 16]);
        b.update_body(&[9u8; 16]);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_empty_body_still_advances_state() {
        let mut mac = FrameMac::new([10u8; 32]);
        let before = mac.digest();
        mac.update_body(&[]);
        assert_ne!(mac.digest(), before);
    }
}
