//! Post-handshake record layer.
//!
//! Every record is a 16-byte header plus a zero-padded body, each followed
//! by a 16-byte MAC tag:
//!
//! ```text
//!   enc_header(16) || header_mac(16) || enc_body(pad16(N)) || body_mac(16)
//! ```
//!
//! The header carries the body size as a 3-byte big-endian integer and a
//! reserved RLP field. Both directions run one long-lived AES-256-CTR
//! stream (zero IV) whose keystream continues across frames, so records
//! must be produced and consumed strictly in order per direction. MAC
//! checks happen before any decryption; a mismatch is fatal for the
//! session.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr64BE;
use thiserror::Error;

use crate::mac::{FrameMac, TAG_SIZE};

/// Wire size of an encrypted header plus its tag.
pub const HEADER_SIZE: usize = 16 + TAG_SIZE;

/// Largest body a 3-byte length field can describe.
pub const MAX_BODY_SIZE: usize = (1 << 24) - 1;

/// Reserved protocol field after the body size: `rlp([0, 0])`.
const HEADER_RESERVED: [u8; 3] = [0xc2, 0x80, 0x80];

/// Errors from frame encoding and decoding. MAC failures and framing
/// violations are fatal: the session state is out of sync and must be
/// torn down.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("header too short: expected {HEADER_SIZE}, got {0}")]
    HeaderTooShort(usize),

    #[error("header mac mismatch")]
    HeaderMacMismatch,

    #[error("body mac mismatch")]
    BodyMacMismatch,

    #[error("body too large: max {MAX_BODY_SIZE}, got {0}")]
    BodyTooLarge(usize),

    #[error("body received without a preceding header")]
    MissingHeader,

    #[error("body too short: expected {expected}, got {got}")]
    BodyTooShort { expected: usize, got: usize },
}

/// One direction of an established session: a continuous AES-CTR
/// keystream and its MAC chain.
struct FrameDirection {
    aes: Ctr64BE<Aes256>,
    mac: FrameMac,
}

impl FrameDirection {
    fn new(aes_secret: &[u8; 32], mac: FrameMac) -> Self {
        let iv = [0u8; 16];
        Self {
            aes: Ctr64BE::<Aes256>::new(aes_secret.into(), (&iv).into()),
            mac,
        }
    }
}

/// Symmetric frame state for one connection.
///
/// Produced by a completed handshake; owns both directions' cipher and
/// MAC state for the rest of the session.
pub struct FrameCodec {
    ingress: FrameDirection,
    egress: FrameDirection,
    /// Body size parsed from the most recent ingress header.
    body_size: Option<usize>,
}

impl FrameCodec {
    pub(crate) fn new(aes_secret: [u8; 32], ingress_mac: FrameMac, egress_mac: FrameMac) -> Self {
        Self {
            ingress: FrameDirection::new(&aes_secret, ingress_mac),
            egress: FrameDirection::new(&aes_secret, egress_mac),
            body_size: None,
        }
    }

    /// Encode a header announcing a body of `size` bytes.
    pub fn write_header(&mut self, size: usize) -> Result<Vec<u8>, FramingError> {
        if size > MAX_BODY_SIZE {
            return Err(FramingError::BodyTooLarge(size));
        }

        let mut header = [0u8; 16];
        header[0] = (size >> 16) as u8;
        header[1] = (size >> 8) as u8;
        header[2] = size as u8;
        header[3..6].copy_from_slice(&HEADER_RESERVED);

        self.egress.aes.apply_keystream(&mut header);
        self.egress.mac.update_header(&header);
        let tag = self.egress.mac.digest();

        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.extend_from_slice(&header);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verify and decode an incoming header, returning the body size.
    pub fn read_header(&mut self, data: &[u8]) -> Result<usize, FramingError> {
        if data.len() < HEADER_SIZE {
            return Err(FramingError::HeaderTooShort(data.len()));
        }

        let mut header = [0u8; 16];
        header.copy_from_slice(&data[..16]);
        let tag = &data[16..HEADER_SIZE];

        self.ingress.mac.update_header(&header);
        if self.ingress.mac.digest().as_slice() != tag {
            return Err(FramingError::HeaderMacMismatch);
        }

        self.ingress.aes.apply_keystream(&mut header);
        let size = ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;

        self.body_size = Some(size);
        Ok(size)
    }

    /// Encode a body, padding to a 16-byte boundary.
    pub fn write_body(&mut self, data: &[u8]) -> Result<Vec<u8>, FramingError> {
        if data.len() > MAX_BODY_SIZE {
            return Err(FramingError::BodyTooLarge(data.len()));
        }

        let padded_len = padded(data.len());
        let mut out = vec![0u8; padded_len + TAG_SIZE];
        out[..data.len()].copy_from_slice(data);

        let body = &mut out[..padded_len];
        self.egress.aes.apply_keystream(body);
        self.egress.mac.update_body(body);
        let tag = self.egress.mac.digest();

        out[padded_len..].copy_from_slice(&tag);
        Ok(out)
    }

    /// Wire size of the next ingress body (padding plus tag), if a header
    /// has been read.
    pub fn body_len(&self) -> Option<usize> {
        self.body_size.map(|size| padded(size) + TAG_SIZE)
    }

    /// Verify and decode an incoming body, truncated to the size the
    /// preceding header announced.
    pub fn read_body(&mut self, data: &[u8]) -> Result<Vec<u8>, FramingError> {
        let size = self.body_size.ok_or(FramingError::MissingHeader)?;

        let expected = padded(size) + TAG_SIZE;
        if data.len() < expected {
            return Err(FramingError::BodyTooShort {
                expected,
                got: data.len(),
            });
        }

        let (body, tag) = data.split_at(data.len() - TAG_SIZE);
        self.ingress.mac.update_body(body);
        if self.ingress.mac.digest().as_slice() != tag {
            return Err(FramingError::BodyMacMismatch);
        }

        self.body_size = None;
        let mut decrypted = body.to_vec();
        self.ingress.aes.apply_keystream(&mut decrypted);
        decrypted.truncate(size);
        Ok(decrypted)
    }
}

/// Round up to the next 16-byte boundary.
const fn padded(len: usize) -> usize {
    (len + 15) / 16 * 16
}
