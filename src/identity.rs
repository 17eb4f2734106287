//! Node identity.
//!
//! A node is identified by its 64-byte id: the uncompressed secp256k1
//! public key with the leading 0x04 byte stripped. The static secret key
//! behind that id signs discovery packets and authenticates handshakes.

use secp256k1::{PublicKey, SecretKey, SECP256K1};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a node id in bytes.
pub const NODE_ID_SIZE: usize = 64;

/// Errors from identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(secp256k1::Error),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(secp256k1::Error),

    #[error("invalid node id length: expected {NODE_ID_SIZE}, got {0}")]
    InvalidNodeIdLength(usize),

    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A 64-byte node identifier.
///
/// Equal to the uncompressed secp256k1 public key without its 0x04 prefix,
/// so the full public key can always be reconstructed from it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Construct from a byte slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, IdentityError> {
        let bytes: [u8; NODE_ID_SIZE] = slice
            .try_into()
            .map_err(|_| IdentityError::InvalidNodeIdLength(slice.len()))?;
        Ok(Self(bytes))
    }

    /// Derive the id from a public key.
    pub fn from_pubkey(pubkey: &PublicKey) -> Self {
        let uncompressed = pubkey.serialize_uncompressed();
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes.copy_from_slice(&uncompressed[1..]);
        Self(bytes)
    }

    /// Reconstruct the full public key.
    pub fn to_pubkey(&self) -> Result<PublicKey, IdentityError> {
        let mut uncompressed = [0u8; 65];
        uncompressed[0] = 0x04;
        uncompressed[1..].copy_from_slice(&self.0);
        PublicKey::from_slice(&uncompressed).map_err(IdentityError::InvalidPublicKey)
    }

    /// Raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// XOR distance to another id, for closest-peer ordering.
    pub fn distance(&self, other: &NodeId) -> [u8; NODE_ID_SIZE] {
        let mut out = [0u8; NODE_ID_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated form for logs; full form via Debug.
        write!(
            f,
            "{}..{}",
            hex::encode(&self.0[..4]),
            hex::encode(&self.0[60..])
        )
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_slice(&bytes)
    }
}

/// Local node identity: the static secp256k1 keypair and derived id.
pub struct Identity {
    secret_key: SecretKey,
    public_key: PublicKey,
    node_id: NodeId,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        Self::from_secret_key(secret_key)
    }

    /// Build an identity from an existing secret key.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(SECP256K1, &secret_key);
        let node_id = NodeId::from_pubkey(&public_key);
        Self {
            secret_key,
            public_key,
            node_id,
        }
    }

    /// Build an identity from 32 secret-key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, IdentityError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(IdentityError::InvalidSecretKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Build an identity from a hex-encoded secret key.
    pub fn from_secret_str(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        let secret_key = SecretKey::from_slice(&bytes).map_err(IdentityError::InvalidSecretKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// The static secret key.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// The static public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The node id derived from the public key.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_pubkey_roundtrip() {
        let identity = Identity::generate();
        let id = *identity.node_id();

        let pubkey = id.to_pubkey().unwrap();
        assert_eq!(&pubkey, identity.public_key());
        assert_eq!(NodeId::from_pubkey(&pubkey), id);
    }

    #[test]
    fn test_node_id_from_slice_length() {
        assert!(matches!(
            NodeId::from_slice(&[1u8; 63]),
            Err(IdentityError::InvalidNodeIdLength(63))
        ));
        assert!(NodeId::from_slice(&[1u8; 64]).is_ok());
    }

    #[test]
    fn test_node_id_hex_parse() {
        let identity = Identity::generate();
        let hex_str = hex::encode(identity.node_id().as_bytes());

        let parsed: NodeId = hex_str.parse().unwrap();
        assert_eq!(&parsed, identity.node_id());

        let prefixed: NodeId = format!("0x{hex_str}").parse().unwrap();
        assert_eq!(&prefixed, identity.node_id());
    }

    #[test]
    fn test_identity_from_secret_str() {
        let identity = Identity::from_secret_str(
            "0101010101010101010101010101010101010101010101010101010101010101",
        )
        .unwrap();
        let again = Identity::from_secret_bytes(&[1u8; 32]).unwrap();
        assert_eq!(identity.node_id(), again.node_id());
    }

    #[test]
    fn test_identity_rejects_invalid_secret() {
        // Zero is not a valid secp256k1 secret key
        assert!(Identity::from_secret_bytes(&[0u8; 32]).is_err());
        assert!(Identity::from_secret_str("zz").is_err());
    }

    #[test]
    fn test_distance_symmetry() {
        let a = *Identity::generate().node_id();
        let b = *Identity::generate().node_id();

        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; NODE_ID_SIZE]);
    }
}
