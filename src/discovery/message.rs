//! Signed discovery packet codec.
//!
//! Wire layout of every datagram:
//!
//! ```text
//!   hash(32) || signature(65) || packet-type(1) || rlp(payload)
//! ```
//!
//! The signature is a recoverable ECDSA signature over
//! `keccak256(packet-type || payload)`, so decoding yields the sender's
//! public key without any side channel. The hash covers everything after
//! itself and doubles as the message id used for request correlation.
//!
//! Payload integers are minimal big-endian RLP; addresses are raw 4-byte
//! IPv4; absent ports encode as the empty string. Packets carry an
//! `expiration` timestamp which is not enforced on receipt, and a ping
//! whose payload omits it is still accepted.

use alloy_rlp::{BufMut, Decodable, Encodable, Error as RlpError, Header};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, SecretKey, SECP256K1};
use std::net::Ipv4Addr;
use thiserror::Error;

use super::{Endpoint, Peer};
use crate::crypto::keccak256;
use crate::identity::NodeId;

/// Discovery protocol version carried in pings.
pub const PING_VERSION: u8 = 0x04;

/// Bytes before the RLP payload: hash, signature, packet type.
const PACKET_PREFIX_SIZE: usize = 32 + 65 + 1;

/// Errors from packet encoding and decoding.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet too short: expected at least {expected}, got {got}")]
    TooShort { expected: usize, got: usize },

    #[error("packet hash mismatch")]
    HashMismatch,

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("invalid signature: {0}")]
    Signature(#[from] secp256k1::Error),

    #[error("invalid payload: {0}")]
    Rlp(#[from] RlpError),
}

/// Liveness probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ping {
    pub version: u8,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

/// Reply to a ping, echoing the ping's packet hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    pub ping_hash: [u8; 32],
    pub expiration: u64,
}

/// Request for the peers closest to a target id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FindNeighbours {
    pub target: NodeId,
    pub expiration: u64,
}

/// Answer to a findneighbours request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Neighbours {
    pub peers: Vec<Peer>,
    pub expiration: u64,
}

/// The four discovery packet variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Ping(Ping),
    Pong(Pong),
    FindNeighbours(FindNeighbours),
    Neighbours(Neighbours),
}

impl Packet {
    /// Wire type byte.
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Ping(_) => 0x01,
            Packet::Pong(_) => 0x02,
            Packet::FindNeighbours(_) => 0x03,
            Packet::Neighbours(_) => 0x04,
        }
    }

    /// Human-readable type name for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Packet::Ping(_) => "ping",
            Packet::Pong(_) => "pong",
            Packet::FindNeighbours(_) => "findneighbours",
            Packet::Neighbours(_) => "neighbours",
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Packet::Ping(ping) => ping.encode(out),
            Packet::Pong(pong) => pong.encode(out),
            Packet::FindNeighbours(find) => find.encode(out),
            Packet::Neighbours(neighbours) => neighbours.encode(out),
        }
    }

    fn decode_payload(packet_type: u8, mut payload: &[u8]) -> Result<Self, PacketError> {
        let buf = &mut payload;
        match packet_type {
            0x01 => Ok(Packet::Ping(Ping::decode(buf)?)),
            0x02 => Ok(Packet::Pong(Pong::decode(buf)?)),
            0x03 => Ok(Packet::FindNeighbours(FindNeighbours::decode(buf)?)),
            0x04 => Ok(Packet::Neighbours(Neighbours::decode(buf)?)),
            other => Err(PacketError::UnknownPacketType(other)),
        }
    }
}

/// A verified incoming packet.
#[derive(Clone, Debug)]
pub struct DecodedPacket {
    /// The decoded message.
    pub packet: Packet,
    /// Sender's id, recovered from the signature.
    pub node_id: NodeId,
    /// The packet hash; for a ping this is what the pong must echo.
    pub hash: [u8; 32],
}

/// Sign and frame a packet for the wire.
pub fn encode(packet: &Packet, secret_key: &SecretKey) -> Vec<u8> {
    let mut payload = Vec::new();
    packet.encode_payload(&mut payload);
    seal(packet.packet_type(), &payload, secret_key)
}

/// Assemble `hash || signature || type || payload` over an already
/// RLP-encoded payload.
fn seal(packet_type: u8, payload: &[u8], secret_key: &SecretKey) -> Vec<u8> {
    let digest = keccak256(&[&[packet_type], payload]);
    let (recovery_id, sig) = SECP256K1
        .sign_ecdsa_recoverable(&Message::from_digest(digest), secret_key)
        .serialize_compact();

    let mut out = Vec::with_capacity(PACKET_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&sig);
    out.push(recovery_id.to_i32() as u8);
    out.push(packet_type);
    out.extend_from_slice(payload);

    let hash = keccak256(&[&out[32..]]);
    out[..32].copy_from_slice(&hash);
    out
}

/// Verify and decode an incoming datagram.
pub fn decode(data: &[u8]) -> Result<DecodedPacket, PacketError> {
    if data.len() < PACKET_PREFIX_SIZE {
        return Err(PacketError::TooShort {
            expected: PACKET_PREFIX_SIZE,
            got: data.len(),
        });
    }

    let hash = keccak256(&[&data[32..]]);
    if hash != data[..32] {
        return Err(PacketError::HashMismatch);
    }

    let signature = RecoverableSignature::from_compact(
        &data[32..96],
        RecoveryId::from_i32(data[96] as i32)?,
    )?;
    let digest = keccak256(&[&data[97..]]);
    let public_key = SECP256K1.recover_ecdsa(&Message::from_digest(digest), &signature)?;

    let packet_type = data[97];
    let packet = Packet::decode_payload(packet_type, &data[98..])?;

    Ok(DecodedPacket {
        packet,
        node_id: NodeId::from_pubkey(&public_key),
        hash,
    })
}

// --- RLP implementations ---------------------------------------------------

/// Decode a string item, returning its payload bytes.
fn decode_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], RlpError> {
    let header = Header::decode(buf)?;
    if header.list {
        return Err(RlpError::UnexpectedList);
    }
    if buf.len() < header.payload_length {
        return Err(RlpError::InputTooShort);
    }
    let (data, rest) = buf.split_at(header.payload_length);
    *buf = rest;
    Ok(data)
}

/// Decode a list item, returning its payload slice.
fn decode_list<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], RlpError> {
    let header = Header::decode(buf)?;
    if !header.list {
        return Err(RlpError::UnexpectedString);
    }
    if buf.len() < header.payload_length {
        return Err(RlpError::InputTooShort);
    }
    let (data, rest) = buf.split_at(header.payload_length);
    *buf = rest;
    Ok(data)
}

fn decode_ip(buf: &mut &[u8]) -> Result<Ipv4Addr, RlpError> {
    let bytes = decode_bytes(buf)?;
    let octets: [u8; 4] = bytes
        .try_into()
        .map_err(|_| RlpError::Custom("ip address must be 4 bytes"))?;
    Ok(Ipv4Addr::from(octets))
}

/// Ports encode their absence as the empty string, which RLP reads as 0.
fn decode_port(buf: &mut &[u8]) -> Result<Option<u16>, RlpError> {
    let port = u16::decode(buf)?;
    Ok((port != 0).then_some(port))
}

fn decode_node_id(buf: &mut &[u8]) -> Result<NodeId, RlpError> {
    let bytes = decode_bytes(buf)?;
    NodeId::from_slice(bytes).map_err(|_| RlpError::Custom("node id must be 64 bytes"))
}

/// Trailing expiration element; tolerated as absent for old pings.
fn decode_expiration(buf: &mut &[u8]) -> Result<u64, RlpError> {
    if buf.is_empty() {
        return Ok(0);
    }
    u64::decode(buf)
}

fn port_value(port: Option<u16>) -> u16 {
    port.unwrap_or(0)
}

impl Endpoint {
    fn rlp_payload_length(&self) -> usize {
        self.address.octets().as_slice().length()
            + port_value(self.udp_port).length()
            + port_value(self.tcp_port).length()
    }
}

impl Encodable for Endpoint {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.rlp_payload_length(),
        }
        .encode(out);
        self.address.octets().as_slice().encode(out);
        port_value(self.udp_port).encode(out);
        port_value(self.tcp_port).encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.rlp_payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Endpoint {
    fn decode(buf: &mut &[u8]) -> Result<Self, RlpError> {
        let mut payload = decode_list(buf)?;
        let address = decode_ip(&mut payload)?;
        let udp_port = decode_port(&mut payload)?;
        let tcp_port = decode_port(&mut payload)?;
        Ok(Self {
            address,
            udp_port,
            tcp_port,
        })
    }
}

impl Peer {
    /// Neighbours entries are flat `[address, udp, tcp, id]` lists.
    fn rlp_payload_length(&self) -> usize {
        self.endpoint.address.octets().as_slice().length()
            + port_value(self.endpoint.udp_port).length()
            + port_value(self.endpoint.tcp_port).length()
            + self.id.as_bytes().as_slice().length()
    }
}

impl Encodable for Peer {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.rlp_payload_length(),
        }
        .encode(out);
        self.endpoint.address.octets().as_slice().encode(out);
        port_value(self.endpoint.udp_port).encode(out);
        port_value(self.endpoint.tcp_port).encode(out);
        self.id.as_bytes().as_slice().encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.rlp_payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Peer {
    fn decode(buf: &mut &[u8]) -> Result<Self, RlpError> {
        let mut payload = decode_list(buf)?;
        let address = decode_ip(&mut payload)?;
        let udp_port = decode_port(&mut payload)?;
        let tcp_port = decode_port(&mut payload)?;
        let id = decode_node_id(&mut payload)?;
        Ok(Self {
            id,
            endpoint: Endpoint {
                address,
                udp_port,
                tcp_port,
            },
        })
    }
}

impl Encodable for Ping {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.version.length()
            + self.from.length()
            + self.to.length()
            + self.expiration.length();
        Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.version.encode(out);
        self.from.encode(out);
        self.to.encode(out);
        self.expiration.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.version.length()
            + self.from.length()
            + self.to.length()
            + self.expiration.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Ping {
    fn decode(buf: &mut &[u8]) -> Result<Self, RlpError> {
        let mut payload = decode_list(buf)?;
        let version = u8::decode(&mut payload)?;
        let from = Endpoint::decode(&mut payload)?;
        let to = Endpoint::decode(&mut payload)?;
        let expiration = decode_expiration(&mut payload)?;
        Ok(Self {
            version,
            from,
            to,
            expiration,
        })
    }
}

impl Encodable for Pong {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.to.length()
            + self.ping_hash.as_slice().length()
            + self.expiration.length();
        Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.to.encode(out);
        self.ping_hash.as_slice().encode(out);
        self.expiration.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.to.length()
            + self.ping_hash.as_slice().length()
            + self.expiration.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Pong {
    fn decode(buf: &mut &[u8]) -> Result<Self, RlpError> {
        let mut payload = decode_list(buf)?;
        let to = Endpoint::decode(&mut payload)?;
        let hash_bytes = decode_bytes(&mut payload)?;
        let ping_hash: [u8; 32] = hash_bytes
            .try_into()
            .map_err(|_| RlpError::Custom("ping hash must be 32 bytes"))?;
        let expiration = decode_expiration(&mut payload)?;
        Ok(Self {
            to,
            ping_hash,
            expiration,
        })
    }
}

impl Encodable for FindNeighbours {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.target.as_bytes().as_slice().length() + self.expiration.length();
        Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.target.as_bytes().as_slice().encode(out);
        self.expiration.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.target.as_bytes().as_slice().length() + self.expiration.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for FindNeighbours {
    fn decode(buf: &mut &[u8]) -> Result<Self, RlpError> {
        let mut payload = decode_list(buf)?;
        let target = decode_node_id(&mut payload)?;
        let expiration = decode_expiration(&mut payload)?;
        Ok(Self { target, expiration })
    }
}

impl Encodable for Neighbours {
    fn encode(&self, out: &mut dyn BufMut) {
        let payload_length = self.peers.length() + self.expiration.length();
        Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.peers.encode(out);
        self.expiration.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.peers.length() + self.expiration.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Neighbours {
    fn decode(buf: &mut &[u8]) -> Result<Self, RlpError> {
        let mut payload = decode_list(buf)?;
        let peers = Vec::<Peer>::decode(&mut payload)?;
        let expiration = decode_expiration(&mut payload)?;
        Ok(Self { peers, expiration })
    }
}
