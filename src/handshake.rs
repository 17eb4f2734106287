//! Authenticated key-agreement handshake.
//!
//! Two peers exchange a single auth/ack pair of ECIES envelopes over a
//! fresh TCP stream and derive the symmetric state for the frame codec.
//! The initiator knows the responder's static id before dialing; the
//! responder learns the initiator's identity from the auth payload.
//!
//! ## Messages
//!
//! Auth plaintext (initiator -> responder, 194 bytes):
//! ```text
//!   sig(65) || keccak256(ephemeral-id)(32) || static-id(64) || nonce(32) || 0x00
//! ```
//! where `sig` signs `ecdh_x(remote-static, own-static) ^ nonce` with the
//! initiator's *ephemeral* key, letting the responder recover the
//! ephemeral public key without it ever travelling in the clear.
//!
//! Ack plaintext (responder -> initiator, 97 bytes):
//! ```text
//!   ephemeral-id(64) || nonce(32) || 0x00
//! ```
//!
//! Both are sealed with the ECIES envelope against the peer's static key.
//! Envelope sizes are fixed (307 and 210 bytes) since the envelope itself
//! carries no length prefix.
//!
//! Any cryptographic check failing is terminal for the connection: the
//! state machine cannot be reused after an error.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use std::fmt;
use thiserror::Error;

use crate::crypto::{ecdh_x, keccak256, xor};
use crate::ecies::{self, EciesError};
use crate::framing::FrameCodec;
use crate::identity::{IdentityError, NodeId};
use crate::mac::FrameMac;

/// Auth plaintext size: sig + ephemeral hash + id + nonce + trailer.
pub const AUTH_PLAINTEXT_SIZE: usize = 65 + 32 + 64 + 32 + 1;

/// Ack plaintext size: ephemeral id + nonce + trailer.
pub const ACK_PLAINTEXT_SIZE: usize = 64 + 32 + 1;

/// Wire size of the auth envelope.
pub const AUTH_MSG_SIZE: usize = ecies::encrypted_len(AUTH_PLAINTEXT_SIZE);

/// Wire size of the ack envelope.
pub const ACK_MSG_SIZE: usize = ecies::encrypted_len(ACK_PLAINTEXT_SIZE);

/// Errors from handshake processing. All of these are fatal for the
/// connection they occur on.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("wrong handshake state: expected {expected}, got {got}")]
    WrongState { expected: String, got: String },

    #[error("wrong handshake role: expected {expected}, got {got}")]
    WrongRole { expected: Role, got: Role },

    #[error("invalid plaintext length: expected {expected}, got {got}")]
    InvalidPlaintextLength { expected: usize, got: usize },

    #[error("trailing payload byte must be zero, got 0x{0:02x}")]
    InvalidTrailer(u8),

    #[error("ephemeral key hash mismatch")]
    EphemeralHashMismatch,

    #[error("envelope error: {0}")]
    Ecies(#[from] EciesError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("signature error: {0}")]
    Signature(#[from] secp256k1::Error),
}

/// Side of the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// We dialed the connection and send the auth.
    Initiator,
    /// They dialed; we answer with the ack.
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Handshake state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Nothing exchanged yet.
    Idle,
    /// Initiator has sent its auth and awaits the ack.
    AuthSent,
    /// Responder has verified an auth and owes an ack.
    AuthReceived,
    /// Key agreement complete; frame secrets can be derived.
    Established,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Idle => write!(f, "idle"),
            Progress::AuthSent => write!(f, "auth_sent"),
            Progress::AuthReceived => write!(f, "auth_received"),
            Progress::Established => write!(f, "established"),
        }
    }
}

/// Per-connection handshake state.
pub struct Handshake {
    role: Role,
    progress: Progress,
    secret_key: SecretKey,
    public_key: PublicKey,
    remote_public_key: Option<PublicKey>,
    ephemeral_secret_key: SecretKey,
    ephemeral_public_key: PublicKey,
    remote_ephemeral_public_key: Option<PublicKey>,
    nonce: [u8; 32],
    remote_nonce: Option<[u8; 32]>,
    ephemeral_shared_secret: Option<[u8; 32]>,
    // Raw envelopes as sent/received; both seed the frame MACs verbatim.
    init_msg: Option<Vec<u8>>,
    remote_init_msg: Option<Vec<u8>>,
}

impl Handshake {
    /// Create an initiator that will authenticate to `remote_id`.
    pub fn new_initiator(secret_key: SecretKey, remote_id: &NodeId) -> Result<Self, HandshakeError> {
        let mut rng = rand::thread_rng();
        let nonce: [u8; 32] = rand::Rng::gen(&mut rng);
        let ephemeral_secret_key = SecretKey::new(&mut rng);
        Self::initiator_with_keys(secret_key, remote_id, nonce, ephemeral_secret_key)
    }

    /// Create a responder awaiting an auth from an unknown peer.
    pub fn new_responder(secret_key: SecretKey) -> Self {
        let mut rng = rand::thread_rng();
        let nonce: [u8; 32] = rand::Rng::gen(&mut rng);
        let ephemeral_secret_key = SecretKey::new(&mut rng);
        Self::responder_with_keys(secret_key, nonce, ephemeral_secret_key)
    }

    /// Initiator with caller-supplied nonce and ephemeral key.
    ///
    /// Exists so handshakes can be replayed deterministically; production
    /// callers should use [`Handshake::new_initiator`].
    pub fn initiator_with_keys(
        secret_key: SecretKey,
        remote_id: &NodeId,
        nonce: [u8; 32],
        ephemeral_secret_key: SecretKey,
    ) -> Result<Self, HandshakeError> {
        let remote_public_key = remote_id.to_pubkey()?;
        Ok(Self {
            role: Role::Initiator,
            progress: Progress::Idle,
            public_key: PublicKey::from_secret_key(SECP256K1, &secret_key),
            ephemeral_public_key: PublicKey::from_secret_key(SECP256K1, &ephemeral_secret_key),
            secret_key,
            remote_public_key: Some(remote_public_key),
            ephemeral_secret_key,
            remote_ephemeral_public_key: None,
            nonce,
            remote_nonce: None,
            ephemeral_shared_secret: None,
            init_msg: None,
            remote_init_msg: None,
        })
    }

    /// Responder with caller-supplied nonce and ephemeral key.
    pub fn responder_with_keys(
        secret_key: SecretKey,
        nonce: [u8; 32],
        ephemeral_secret_key: SecretKey,
    ) -> Self {
        Self {
            role: Role::Responder,
            progress: Progress::Idle,
            public_key: PublicKey::from_secret_key(SECP256K1, &secret_key),
            ephemeral_public_key: PublicKey::from_secret_key(SECP256K1, &ephemeral_secret_key),
            secret_key,
            remote_public_key: None,
            ephemeral_secret_key,
            remote_ephemeral_public_key: None,
            nonce,
            remote_nonce: None,
            ephemeral_shared_secret: None,
            init_msg: None,
            remote_init_msg: None,
        }
    }

    /// Our side of the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Whether key agreement has completed.
    pub fn is_established(&self) -> bool {
        self.progress == Progress::Established
    }

    /// The remote static id (for the responder, known after the auth).
    pub fn remote_id(&self) -> Option<NodeId> {
        self.remote_public_key.as_ref().map(NodeId::from_pubkey)
    }

    fn expect_role(&self, expected: Role) -> Result<(), HandshakeError> {
        if self.role != expected {
            return Err(HandshakeError::WrongRole {
                expected,
                got: self.role,
            });
        }
        Ok(())
    }

    fn expect_progress(&self, expected: Progress) -> Result<(), HandshakeError> {
        if self.progress != expected {
            return Err(HandshakeError::WrongState {
                expected: expected.to_string(),
                got: self.progress.to_string(),
            });
        }
        Ok(())
    }

    /// Build the auth envelope (initiator only, from idle).
    pub fn create_auth(&mut self) -> Result<Vec<u8>, HandshakeError> {
        self.expect_role(Role::Initiator)?;
        self.expect_progress(Progress::Idle)?;

        let remote_public_key = self
            .remote_public_key
            .expect("initiator always knows the remote static key");

        // Sign x ^ nonce with the ephemeral key; the responder recovers
        // the ephemeral public key from this signature.
        let x = ecdh_x(&remote_public_key, &self.secret_key);
        let digest = xor(&x, &self.nonce);
        let (recovery_id, sig) = SECP256K1
            .sign_ecdsa_recoverable(&Message::from_digest(digest), &self.ephemeral_secret_key)
            .serialize_compact();

        let ephemeral_id = NodeId::from_pubkey(&self.ephemeral_public_key);

        let mut plaintext = [0u8; AUTH_PLAINTEXT_SIZE];
        plaintext[..64].copy_from_slice(&sig);
        plaintext[64] = recovery_id.to_i32() as u8;
        plaintext[65..97].copy_from_slice(&keccak256(&[ephemeral_id.as_bytes()]));
        plaintext[97..161].copy_from_slice(NodeId::from_pubkey(&self.public_key).as_bytes());
        plaintext[161..193].copy_from_slice(&self.nonce);
        // plaintext[193] stays 0x00

        let msg = ecies::encrypt(&plaintext, &remote_public_key);
        self.init_msg = Some(msg.clone());
        self.progress = Progress::AuthSent;
        Ok(msg)
    }

    /// Verify an incoming auth envelope (responder only, from idle).
    pub fn read_auth(&mut self, data: &[u8]) -> Result<(), HandshakeError> {
        self.expect_role(Role::Responder)?;
        self.expect_progress(Progress::Idle)?;

        self.remote_init_msg = Some(data.to_vec());
        let plaintext = ecies::decrypt(data, &self.secret_key)?;

        if plaintext.len() != AUTH_PLAINTEXT_SIZE {
            return Err(HandshakeError::InvalidPlaintextLength {
                expected: AUTH_PLAINTEXT_SIZE,
                got: plaintext.len(),
            });
        }
        let trailer = plaintext[AUTH_PLAINTEXT_SIZE - 1];
        if trailer != 0 {
            return Err(HandshakeError::InvalidTrailer(trailer));
        }

        let signature = RecoverableSignature::from_compact(
            &plaintext[..64],
            RecoveryId::from_i32(plaintext[64] as i32)?,
        )?;
        let ephemeral_hash = &plaintext[65..97];
        let remote_id = NodeId::from_slice(&plaintext[97..161])?;
        let remote_public_key = remote_id.to_pubkey()?;
        let mut remote_nonce = [0u8; 32];
        remote_nonce.copy_from_slice(&plaintext[161..193]);

        // Recover the remote ephemeral key from the signature over
        // x ^ remote_nonce, then check it against the transmitted hash.
        let x = ecdh_x(&remote_public_key, &self.secret_key);
        let digest = xor(&x, &remote_nonce);
        let remote_ephemeral =
            SECP256K1.recover_ecdsa(&Message::from_digest(digest), &signature)?;

        let recovered_hash = keccak256(&[NodeId::from_pubkey(&remote_ephemeral).as_bytes()]);
        if recovered_hash != ephemeral_hash {
            return Err(HandshakeError::EphemeralHashMismatch);
        }

        self.ephemeral_shared_secret =
            Some(ecdh_x(&remote_ephemeral, &self.ephemeral_secret_key));
        self.remote_public_key = Some(remote_public_key);
        self.remote_ephemeral_public_key = Some(remote_ephemeral);
        self.remote_nonce = Some(remote_nonce);
        self.progress = Progress::AuthReceived;
        Ok(())
    }

    /// Build the ack envelope (responder only, after a verified auth).
    ///
    /// Sending the ack completes the responder's side of the handshake.
    pub fn create_ack(&mut self) -> Result<Vec<u8>, HandshakeError> {
        self.expect_role(Role::Responder)?;
        self.expect_progress(Progress::AuthReceived)?;

        let remote_public_key = self
            .remote_public_key
            .expect("remote static key is known after read_auth");

        let mut plaintext = [0u8; ACK_PLAINTEXT_SIZE];
        plaintext[..64].copy_from_slice(NodeId::from_pubkey(&self.ephemeral_public_key).as_bytes());
        plaintext[64..96].copy_from_slice(&self.nonce);
        // plaintext[96] stays 0x00

        let msg = ecies::encrypt(&plaintext, &remote_public_key);
        self.init_msg = Some(msg.clone());
        self.progress = Progress::Established;
        Ok(msg)
    }

    /// Verify an incoming ack envelope (initiator only, after the auth).
    pub fn read_ack(&mut self, data: &[u8]) -> Result<(), HandshakeError> {
        self.expect_role(Role::Initiator)?;
        self.expect_progress(Progress::AuthSent)?;

        self.remote_init_msg = Some(data.to_vec());
        let plaintext = ecies::decrypt(data, &self.secret_key)?;

        if plaintext.len() != ACK_PLAINTEXT_SIZE {
            return Err(HandshakeError::InvalidPlaintextLength {
                expected: ACK_PLAINTEXT_SIZE,
                got: plaintext.len(),
            });
        }
        let trailer = plaintext[ACK_PLAINTEXT_SIZE - 1];
        if trailer != 0 {
            return Err(HandshakeError::InvalidTrailer(trailer));
        }

        let remote_ephemeral = NodeId::from_slice(&plaintext[..64])?.to_pubkey()?;
        let mut remote_nonce = [0u8; 32];
        remote_nonce.copy_from_slice(&plaintext[64..96]);

        self.ephemeral_shared_secret =
            Some(ecdh_x(&remote_ephemeral, &self.ephemeral_secret_key));
        self.remote_ephemeral_public_key = Some(remote_ephemeral);
        self.remote_nonce = Some(remote_nonce);
        self.progress = Progress::Established;
        Ok(())
    }

    /// Derive the per-direction frame state, consuming the handshake.
    ///
    /// The AES and MAC secrets are identical on both sides; direction
    /// asymmetry comes from each MAC being seeded with the *other* side's
    /// nonce and init message.
    pub fn into_framing(self) -> Result<FrameCodec, HandshakeError> {
        if !self.is_established() {
            return Err(HandshakeError::WrongState {
                expected: Progress::Established.to_string(),
                got: self.progress.to_string(),
            });
        }

        let ephemeral_shared = self
            .ephemeral_shared_secret
            .expect("shared secret exists once established");
        let remote_nonce = self.remote_nonce.expect("remote nonce exists once established");
        let init_msg = self.init_msg.expect("own init message exists once established");
        let remote_init_msg = self
            .remote_init_msg
            .expect("remote init message exists once established");

        let h_nonce = match self.role {
            Role::Responder => keccak256(&[&self.nonce, &remote_nonce]),
            Role::Initiator => keccak256(&[&remote_nonce, &self.nonce]),
        };
        let shared_secret = keccak256(&[&ephemeral_shared, &h_nonce]);
        let aes_secret = keccak256(&[&ephemeral_shared, &shared_secret]);
        let mac_secret = keccak256(&[&ephemeral_shared, &aes_secret]);

        let mut ingress_mac = FrameMac::new(mac_secret);
        ingress_mac.update(&xor(&mac_secret, &self.nonce));
        ingress_mac.update(&remote_init_msg);

        let mut egress_mac = FrameMac::new(mac_secret);
        egress_mac.update(&xor(&mac_secret, &remote_nonce));
        egress_mac.update(&init_msg);

        Ok(FrameCodec::new(aes_secret, ingress_mac, egress_mac))
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("progress", &self.progress)
            .field("has_remote_static", &self.remote_public_key.is_some())
            .field("has_remote_ephemeral", &self.remote_ephemeral_public_key.is_some())
            .finish()
    }
}
