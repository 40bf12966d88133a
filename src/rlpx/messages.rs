//! devp2p base protocol and eth/68 messages
//!
//! Message ids are absolute: the base protocol owns 0x00..0x10, the eth
//! capability starts at offset 0x10.

use alloy_primitives::{FixedBytes, B256, U256};
use alloy_rlp::{BufMut, Decodable, Encodable, Header, RlpDecodable, RlpEncodable};
use bytes::Bytes;
use std::fmt;

use crate::types::RawPublicKey;

/// Base protocol version we speak (snappy capable)
pub const BASE_PROTOCOL_VERSION: u64 = 5;

/// eth protocol version we advertise
pub const ETH_VERSION: u64 = 68;

/// Message ids
pub mod codes {
    pub const HELLO: u64 = 0x00;
    pub const DISCONNECT: u64 = 0x01;
    pub const PING: u64 = 0x02;
    pub const PONG: u64 = 0x03;

    /// First id of the eth capability
    pub const ETH_OFFSET: u64 = 0x10;

    pub const STATUS: u64 = 0x10;
    pub const NEW_BLOCK_HASHES: u64 = 0x11;
    pub const TRANSACTIONS: u64 = 0x12;
    pub const GET_BLOCK_HEADERS: u64 = 0x13;
    pub const BLOCK_HEADERS: u64 = 0x14;
    pub const GET_BLOCK_BODIES: u64 = 0x15;
    pub const BLOCK_BODIES: u64 = 0x16;
    pub const NEW_BLOCK: u64 = 0x17;
    pub const NEW_POOLED_TRANSACTION_HASHES: u64 = 0x18;
    pub const GET_POOLED_TRANSACTIONS: u64 = 0x19;
    pub const POOLED_TRANSACTIONS: u64 = 0x1a;
}

// =============================================================================
// HELLO
// =============================================================================

/// A capability advertised in Hello, e.g. `eth/68`
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Capability {
    pub name: String,
    pub version: u64,
}

impl Capability {
    pub fn eth() -> Self {
        Self {
            name: "eth".to_string(),
            version: ETH_VERSION,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Protocol handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u64,
    pub client_name: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u64,
    pub id: RawPublicKey,
    /// Trailing list items from newer protocol versions, kept verbatim
    pub rest: Bytes,
}

impl Hello {
    fn payload_length(&self) -> usize {
        self.protocol_version.length()
            + self.client_name.length()
            + self.capabilities.length()
            + self.listen_port.length()
            + self.id.length()
            + self.rest.len()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }
}

impl Encodable for Hello {
    fn encode(&self, out: &mut dyn BufMut) {
        Header { list: true, payload_length: self.payload_length() }.encode(out);
        self.protocol_version.encode(out);
        self.client_name.encode(out);
        self.capabilities.encode(out);
        self.listen_port.encode(out);
        self.id.encode(out);
        out.put_slice(&self.rest);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Hello {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        if buf.len() < header.payload_length {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        let (mut payload, remaining) = buf.split_at(header.payload_length);

        let hello = Self {
            protocol_version: u64::decode(&mut payload)?,
            client_name: String::decode(&mut payload)?,
            capabilities: Vec::<Capability>::decode(&mut payload)?,
            listen_port: u64::decode(&mut payload)?,
            id: <[u8; 64]>::decode(&mut payload)?,
            rest: Bytes::copy_from_slice(payload),
        };

        *buf = remaining;
        Ok(hello)
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// EIP-2124 fork identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ForkId {
    pub hash: FixedBytes<4>,
    pub next: u64,
}

/// eth/68 Status message
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Status {
    pub version: u64,
    pub network_id: u64,
    pub total_difficulty: U256,
    pub head: B256,
    pub genesis: B256,
    pub fork_id: ForkId,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "eth/{} network={} genesis={} head={} fork={}/{}",
            self.version, self.network_id, self.genesis, self.head, self.fork_id.hash, self.fork_id.next
        )
    }
}

// =============================================================================
// DISCONNECT
// =============================================================================

/// Reason carried by a Disconnect message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    DisconnectRequested,
    TcpSubsystemError,
    ProtocolBreach,
    UselessPeer,
    TooManyPeers,
    AlreadyConnected,
    IncompatibleProtocolVersion,
    InvalidIdentity,
    ClientQuitting,
    UnexpectedIdentity,
    ConnectedToSelf,
    PingTimeout,
    SubprotocolError,
    Other(u8),
}

impl From<u8> for DisconnectReason {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::DisconnectRequested,
            0x01 => Self::TcpSubsystemError,
            0x02 => Self::ProtocolBreach,
            0x03 => Self::UselessPeer,
            0x04 => Self::TooManyPeers,
            0x05 => Self::AlreadyConnected,
            0x06 => Self::IncompatibleProtocolVersion,
            0x07 => Self::InvalidIdentity,
            0x08 => Self::ClientQuitting,
            0x09 => Self::UnexpectedIdentity,
            0x0a => Self::ConnectedToSelf,
            0x0b => Self::PingTimeout,
            0x10 => Self::SubprotocolError,
            other => Self::Other(other),
        }
    }
}

impl DisconnectReason {
    pub fn code(&self) -> u8 {
        match self {
            Self::DisconnectRequested => 0x00,
            Self::TcpSubsystemError => 0x01,
            Self::ProtocolBreach => 0x02,
            Self::UselessPeer => 0x03,
            Self::TooManyPeers => 0x04,
            Self::AlreadyConnected => 0x05,
            Self::IncompatibleProtocolVersion => 0x06,
            Self::InvalidIdentity => 0x07,
            Self::ClientQuitting => 0x08,
            Self::UnexpectedIdentity => 0x09,
            Self::ConnectedToSelf => 0x0a,
            Self::PingTimeout => 0x0b,
            Self::SubprotocolError => 0x10,
            Self::Other(code) => *code,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::DisconnectRequested => "disconnect requested",
            Self::TcpSubsystemError => "network error",
            Self::ProtocolBreach => "breach of protocol",
            Self::UselessPeer => "useless peer",
            Self::TooManyPeers => "too many peers",
            Self::AlreadyConnected => "already connected",
            Self::IncompatibleProtocolVersion => "incompatible p2p protocol version",
            Self::InvalidIdentity => "invalid node identity",
            Self::ClientQuitting => "client quitting",
            Self::UnexpectedIdentity => "unexpected identity",
            Self::ConnectedToSelf => "connected to self",
            Self::PingTimeout => "read timeout",
            Self::SubprotocolError => "subprotocol error",
            Self::Other(code) => return write!(f, "unknown disconnect reason {}", code),
        };
        f.write_str(text)
    }
}

/// Decode a Disconnect payload: either a reason list or a bare reason
///
/// Returns the list of reasons; a bare reason yields a list of one.
pub fn decode_disconnect(payload: &[u8]) -> alloy_rlp::Result<Vec<DisconnectReason>> {
    let mut buf = payload;
    let codes = match buf.first() {
        Some(b) if *b >= alloy_rlp::EMPTY_LIST_CODE => Vec::<u8>::decode(&mut buf)?,
        Some(_) => vec![u8::decode(&mut buf)?],
        None => return Err(alloy_rlp::Error::InputTooShort),
    };
    Ok(codes.into_iter().map(DisconnectReason::from).collect())
}

pub fn encode_disconnect(reason: DisconnectReason) -> Vec<u8> {
    alloy_rlp::encode(vec![reason.code()])
}

// =============================================================================
// SMALL PAYLOADS
// =============================================================================

/// Ping and Pong carry an empty list
pub fn empty_list() -> Vec<u8> {
    vec![alloy_rlp::EMPTY_LIST_CODE]
}

/// Request id of an eth/66+ request (`[request_id, ...]`)
pub fn request_id(payload: &[u8]) -> Option<u64> {
    let mut buf = payload;
    let header = Header::decode(&mut buf).ok()?;
    if !header.list {
        return None;
    }
    u64::decode(&mut buf).ok()
}

#[derive(RlpEncodable)]
struct EmptyResponse {
    request_id: u64,
    items: Vec<Bytes>,
}

/// `[request_id, []]`, the answer to a request we cannot serve
pub fn empty_response(request_id: u64) -> Vec<u8> {
    alloy_rlp::encode(EmptyResponse { request_id, items: vec![] })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hello() -> Hello {
        Hello {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_name: "Geth/v1.13.5".to_string(),
            capabilities: vec![Capability::eth(), Capability { name: "snap".to_string(), version: 1 }],
            listen_port: 30303,
            id: [7u8; 64],
            rest: Bytes::new(),
        }
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = test_hello();
        let encoded = alloy_rlp::encode(&hello);
        assert_eq!(encoded.len(), hello.length());

        let decoded = Hello::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, hello);
        assert!(decoded.has_capability("snap"));
    }

    #[test]
    fn test_hello_keeps_trailing_fields() {
        let mut hello = test_hello();
        hello.rest = Bytes::from(alloy_rlp::encode(42u64));

        let encoded = alloy_rlp::encode(&hello);
        let decoded = Hello::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded.rest, hello.rest);
        assert_eq!(alloy_rlp::encode(&decoded), encoded);
    }

    #[test]
    fn test_status_roundtrip() {
        let status = Status {
            version: ETH_VERSION,
            network_id: 137,
            total_difficulty: U256::from(123_456u64),
            head: B256::repeat_byte(0xaa),
            genesis: B256::repeat_byte(0xbb),
            fork_id: ForkId { hash: FixedBytes::new([1, 2, 3, 4]), next: 0 },
        };
        let encoded = alloy_rlp::encode(&status);
        let decoded = Status::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn test_decode_disconnect_forms() {
        let list = encode_disconnect(DisconnectReason::TooManyPeers);
        assert_eq!(decode_disconnect(&list).unwrap(), vec![DisconnectReason::TooManyPeers]);

        let bare = alloy_rlp::encode(0x04u8);
        assert_eq!(decode_disconnect(&bare).unwrap(), vec![DisconnectReason::TooManyPeers]);

        let requested = encode_disconnect(DisconnectReason::DisconnectRequested);
        assert_eq!(decode_disconnect(&requested).unwrap(), vec![DisconnectReason::DisconnectRequested]);

        assert!(decode_disconnect(&[]).is_err());
        assert_eq!(decode_disconnect(&empty_list()).unwrap(), vec![]);
    }

    #[test]
    fn test_disconnect_reason_codes() {
        for code in 0u8..=0x12 {
            assert_eq!(DisconnectReason::from(code).code(), code);
        }
        assert_eq!(DisconnectReason::UselessPeer.to_string(), "useless peer");
    }

    #[test]
    fn test_request_id_and_empty_response() {
        let response = empty_response(9);
        assert_eq!(request_id(&response), Some(9));
        assert_eq!(request_id(&empty_list()), None);
    }
}
