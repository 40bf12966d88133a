//! discv4 Packets
//!
//! Wire layout is `hash || signature || type || rlp(body)`. The hash is
//! keccak256 over everything after it; the recoverable signature covers
//! keccak256 of `type || body` and identifies the sender.
//!
//! Decoding is lenient about trailing list items so newer peers that append
//! fields are still understood.

use alloy_primitives::{keccak256, B256};
use alloy_rlp::{Decodable, Encodable, Header};
use discv5::Enr;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::types::{enr_from_rlp, enr_to_rlp, pubkey_from_raw, Node, NodeParseError, RawPublicKey};

/// Largest datagram either side sends
pub const MAX_PACKET_SIZE: usize = 1280;

/// Neighbours entries per packet, keeps a full packet under the size limit
pub const MAX_NEIGHBOURS: usize = 12;

/// Lifetime of the packets we send
pub const EXPIRATION: Duration = Duration::from_secs(20);

const DISCOVERY_VERSION: u64 = 4;
const HASH_LEN: usize = 32;
const SIGNATURE_LEN: usize = 65;
const HEADER_LEN: usize = HASH_LEN + SIGNATURE_LEN;

/// Packet type bytes
pub mod kind {
    pub const PING: u8 = 0x01;
    pub const PONG: u8 = 0x02;
    pub const FIND_NODE: u8 = 0x03;
    pub const NEIGHBOURS: u8 = 0x04;
    pub const ENR_REQUEST: u8 = 0x05;
    pub const ENR_RESPONSE: u8 = 0x06;
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),

    #[error("packet hash mismatch")]
    HashMismatch,

    #[error("invalid signature: {0}")]
    Signature(#[from] secp256k1::Error),

    #[error("unknown packet type {0:#x}")]
    UnknownKind(u8),

    #[error("rlp decode error: {0}")]
    Rlp(#[from] alloy_rlp::Error),

    #[error("packet expired")]
    Expired,

    #[error("invalid record: {0}")]
    InvalidRecord(#[from] NodeParseError),
}

/// Seconds since the epoch at which a packet sent now expires
pub fn expiration() -> u64 {
    unix_now() + EXPIRATION.as_secs()
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

// =============================================================================
// RLP HELPERS
// =============================================================================

fn list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    Header { list: true, payload_length: payload.len() }.encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

/// Split off the payload of the next list item
fn list_payload<'a>(buf: &mut &'a [u8]) -> alloy_rlp::Result<&'a [u8]> {
    let header = Header::decode(buf)?;
    if !header.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    take(buf, header.payload_length)
}

/// Split off the contents of the next byte string
fn byte_string<'a>(buf: &mut &'a [u8]) -> alloy_rlp::Result<&'a [u8]> {
    let header = Header::decode(buf)?;
    if header.list {
        return Err(alloy_rlp::Error::UnexpectedList);
    }
    take(buf, header.payload_length)
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> alloy_rlp::Result<&'a [u8]> {
    if buf.len() < len {
        return Err(alloy_rlp::Error::InputTooShort);
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head)
}

/// Trailing optional integer, ignored when malformed
fn optional_u64(buf: &mut &[u8]) -> Option<u64> {
    if buf.is_empty() {
        None
    } else {
        u64::decode(buf).ok()
    }
}

// =============================================================================
// ENDPOINTS
// =============================================================================

/// Address triple carried in Ping, Pong and Neighbours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, tcp_port: u16) -> Self {
        Self {
            ip: addr.ip(),
            udp_port: addr.port(),
            tcp_port,
        }
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        match self.ip {
            IpAddr::V4(ip) => ip.octets()[..].encode(out),
            IpAddr::V6(ip) => ip.octets()[..].encode(out),
        }
        self.udp_port.encode(out);
        self.tcp_port.encode(out);
    }

    fn decode_fields(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let ip = match byte_string(buf)? {
            raw if raw.len() == 4 => IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
            raw if raw.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(alloy_rlp::Error::Custom("invalid ip length")),
        };
        Ok(Self {
            ip,
            udp_port: u16::decode(buf)?,
            tcp_port: u16::decode(buf)?,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        self.encode_fields(&mut payload);
        list(payload)
    }

    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut payload = list_payload(buf)?;
        Self::decode_fields(&mut payload)
    }
}

/// One entry of a Neighbours reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighbourRecord {
    pub endpoint: Endpoint,
    pub id: RawPublicKey,
}

impl NeighbourRecord {
    pub fn from_node(node: &Node) -> Option<Self> {
        let addr = node.udp_addr()?;
        Some(Self {
            endpoint: Endpoint::new(addr, node.tcp_port.unwrap_or(0)),
            id: crate::types::raw_pubkey(&node.pubkey),
        })
    }

    /// The advertised node, `None` for unusable entries
    pub fn to_node(&self) -> Option<Node> {
        if self.endpoint.ip.is_unspecified() || self.endpoint.udp_port == 0 {
            return None;
        }
        let pubkey = pubkey_from_raw(&self.id).ok()?;
        Some(Node::new(
            pubkey,
            Some(self.endpoint.ip),
            Some(self.endpoint.tcp_port),
            Some(self.endpoint.udp_port),
        ))
    }

    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        self.endpoint.encode_fields(&mut payload);
        self.id.encode(&mut payload);
        list(payload)
    }

    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut payload = list_payload(buf)?;
        Ok(Self {
            endpoint: Endpoint::decode_fields(&mut payload)?,
            id: <[u8; 64]>::decode(&mut payload)?,
        })
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
    pub enr_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    pub ping_hash: B256,
    pub expiration: u64,
    pub enr_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNode {
    pub target: RawPublicKey,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbours {
    pub nodes: Vec<NeighbourRecord>,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrRequest {
    pub expiration: u64,
}

#[derive(Debug, Clone)]
pub struct EnrResponse {
    pub request_hash: B256,
    pub record: Enr,
}

#[derive(Debug, Clone)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbours(Neighbours),
    EnrRequest(EnrRequest),
    EnrResponse(EnrResponse),
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Message::Ping(_) => kind::PING,
            Message::Pong(_) => kind::PONG,
            Message::FindNode(_) => kind::FIND_NODE,
            Message::Neighbours(_) => kind::NEIGHBOURS,
            Message::EnrRequest(_) => kind::ENR_REQUEST,
            Message::EnrResponse(_) => kind::ENR_RESPONSE,
        }
    }

    fn expiration(&self) -> Option<u64> {
        match self {
            Message::Ping(m) => Some(m.expiration),
            Message::Pong(m) => Some(m.expiration),
            Message::FindNode(m) => Some(m.expiration),
            Message::Neighbours(m) => Some(m.expiration),
            Message::EnrRequest(m) => Some(m.expiration),
            Message::EnrResponse(_) => None,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, PacketError> {
        let mut p = Vec::new();
        match self {
            Message::Ping(m) => {
                DISCOVERY_VERSION.encode(&mut p);
                p.extend_from_slice(&m.from.encode());
                p.extend_from_slice(&m.to.encode());
                m.expiration.encode(&mut p);
                if let Some(seq) = m.enr_seq {
                    seq.encode(&mut p);
                }
            }
            Message::Pong(m) => {
                p.extend_from_slice(&m.to.encode());
                m.ping_hash.encode(&mut p);
                m.expiration.encode(&mut p);
                if let Some(seq) = m.enr_seq {
                    seq.encode(&mut p);
                }
            }
            Message::FindNode(m) => {
                m.target.encode(&mut p);
                m.expiration.encode(&mut p);
            }
            Message::Neighbours(m) => {
                let nodes: Vec<u8> = m.nodes.iter().flat_map(|n| n.encode()).collect();
                p.extend_from_slice(&list(nodes));
                m.expiration.encode(&mut p);
            }
            Message::EnrRequest(m) => {
                m.expiration.encode(&mut p);
            }
            Message::EnrResponse(m) => {
                m.request_hash.encode(&mut p);
                p.extend_from_slice(&enr_to_rlp(&m.record)?);
            }
        }
        Ok(list(p))
    }

    fn decode(kind: u8, body: &[u8]) -> Result<Self, PacketError> {
        let mut buf = body;
        let mut p = list_payload(&mut buf)?;

        let message = match kind {
            kind::PING => {
                let _version = u64::decode(&mut p)?;
                Message::Ping(Ping {
                    from: Endpoint::decode(&mut p)?,
                    to: Endpoint::decode(&mut p)?,
                    expiration: u64::decode(&mut p)?,
                    enr_seq: optional_u64(&mut p),
                })
            }
            kind::PONG => Message::Pong(Pong {
                to: Endpoint::decode(&mut p)?,
                ping_hash: B256::decode(&mut p)?,
                expiration: u64::decode(&mut p)?,
                enr_seq: optional_u64(&mut p),
            }),
            kind::FIND_NODE => Message::FindNode(FindNode {
                target: <[u8; 64]>::decode(&mut p)?,
                expiration: u64::decode(&mut p)?,
            }),
            kind::NEIGHBOURS => {
                let mut entries = list_payload(&mut p)?;
                let mut nodes = Vec::new();
                while !entries.is_empty() {
                    nodes.push(NeighbourRecord::decode(&mut entries)?);
                }
                Message::Neighbours(Neighbours {
                    nodes,
                    expiration: u64::decode(&mut p)?,
                })
            }
            kind::ENR_REQUEST => Message::EnrRequest(EnrRequest {
                expiration: u64::decode(&mut p)?,
            }),
            kind::ENR_RESPONSE => {
                let request_hash = B256::decode(&mut p)?;
                let start = p;
                let header = Header::decode(&mut p)?;
                let len = start.len() - p.len() + header.payload_length;
                if start.len() < len {
                    return Err(alloy_rlp::Error::InputTooShort.into());
                }
                Message::EnrResponse(EnrResponse {
                    request_hash,
                    record: enr_from_rlp(&start[..len])?,
                })
            }
            other => return Err(PacketError::UnknownKind(other)),
        };
        Ok(message)
    }
}

// =============================================================================
// PACKETS
// =============================================================================

/// A verified incoming packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub message: Message,
    pub hash: B256,
    pub sender: PublicKey,
}

/// Sign and frame `message`, returning the packet and its hash
pub fn encode_packet(secp: &Secp256k1<All>, key: &SecretKey, message: &Message) -> Result<(Vec<u8>, B256), PacketError> {
    let mut signed = vec![message.kind()];
    signed.extend_from_slice(&message.encode_body()?);

    let digest = keccak256(&signed);
    let sig = secp.sign_ecdsa_recoverable(&secp256k1::Message::from_digest(digest.0), key);
    let (rec_id, compact) = sig.serialize_compact();

    let mut packet = vec![0u8; HASH_LEN];
    packet.extend_from_slice(&compact);
    packet.push(rec_id.to_i32() as u8);
    packet.extend_from_slice(&signed);

    let hash = keccak256(&packet[HASH_LEN..]);
    packet[..HASH_LEN].copy_from_slice(hash.as_slice());
    Ok((packet, hash))
}

/// Check hash, signature and expiry, then decode the body
pub fn decode_packet(secp: &Secp256k1<All>, data: &[u8]) -> Result<Packet, PacketError> {
    if data.len() <= HEADER_LEN {
        return Err(PacketError::TooShort(data.len()));
    }

    let hash = keccak256(&data[HASH_LEN..]);
    if hash.as_slice() != &data[..HASH_LEN] {
        return Err(PacketError::HashMismatch);
    }

    let sig = &data[HASH_LEN..HEADER_LEN];
    let signed = &data[HEADER_LEN..];
    let rec_id = RecoveryId::from_i32(i32::from(sig[64]))?;
    let sig = RecoverableSignature::from_compact(&sig[..64], rec_id)?;
    let sender = secp.recover_ecdsa(&secp256k1::Message::from_digest(keccak256(signed).0), &sig)?;

    let message = Message::decode(signed[0], &signed[1..])?;
    if let Some(expiration) = message.expiration() {
        if expiration < unix_now() {
            return Err(PacketError::Expired);
        }
    }

    Ok(Packet { message, hash, sender })
}
