//! Core types for node identity
//!
//! A devp2p node is identified by the keccak256 hash of its 64-byte
//! uncompressed secp256k1 public key. Nodes reach us in three textual
//! forms: `enode://` URLs, `enr:` base64 records and `0x` hex records.

use base64::Engine as _;
use discv5::enr::{CombinedPublicKey, EnrPublicKey};
use discv5::Enr;
use secp256k1::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use url::{Host, Url};

/// Uncompressed public key without the leading 0x04 tag
pub type RawPublicKey = [u8; 64];

// =============================================================================
// NODE ID
// =============================================================================

/// 32-byte node identity (keccak256 of the raw public key)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the identity of a public key
    pub fn from_pubkey(key: &PublicKey) -> Self {
        Self(alloy_primitives::keccak256(raw_pubkey(key)).0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes in hex, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| NodeParseError::InvalidId(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| NodeParseError::InvalidId(format!("expected 32 bytes, got {}", b.len())))?;
        Ok(Self(arr))
    }
}

// Hex string without 0x, usable as a JSON object key
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Strip the 0x04 tag from an uncompressed public key
pub fn raw_pubkey(key: &PublicKey) -> RawPublicKey {
    let full = key.serialize_uncompressed();
    let mut raw = [0u8; 64];
    raw.copy_from_slice(&full[1..]);
    raw
}

/// Rebuild a public key from its 64-byte raw form
pub fn pubkey_from_raw(raw: &[u8]) -> Result<PublicKey, secp256k1::Error> {
    let mut full = [0u8; 65];
    if raw.len() != 64 {
        return Err(secp256k1::Error::InvalidPublicKey);
    }
    full[0] = 0x04;
    full[1..].copy_from_slice(raw);
    PublicKey::from_slice(&full)
}

// =============================================================================
// NODE
// =============================================================================

/// A contactable node: identity, key, endpoints and (optionally) its signed record
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub pubkey: PublicKey,
    pub ip: Option<IpAddr>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub record: Option<Enr>,
}

impl Node {
    pub fn new(pubkey: PublicKey, ip: Option<IpAddr>, tcp_port: Option<u16>, udp_port: Option<u16>) -> Self {
        Self {
            id: NodeId::from_pubkey(&pubkey),
            pubkey,
            ip,
            tcp_port,
            udp_port,
            record: None,
        }
    }

    /// Build a node from a signed record, taking endpoints from its ip/tcp/udp entries
    pub fn from_enr(enr: Enr) -> Result<Self, NodeParseError> {
        let CombinedPublicKey::Secp256k1(key) = enr.public_key() else {
            return Err(NodeParseError::UnsupportedKey);
        };
        let pubkey = PublicKey::from_slice(&key.encode()).map_err(NodeParseError::InvalidKey)?;

        let (ip, tcp_port, udp_port) = if let Some(ip4) = enr.ip4() {
            (Some(IpAddr::V4(ip4)), enr.tcp4(), enr.udp4())
        } else if let Some(ip6) = enr.ip6() {
            (Some(IpAddr::V6(ip6)), enr.tcp6(), enr.udp6())
        } else {
            (None, None, None)
        };

        Ok(Self {
            id: NodeId::from_pubkey(&pubkey),
            pubkey,
            ip,
            tcp_port,
            udp_port,
            record: Some(enr),
        })
    }

    /// Record sequence number, 0 when no record is known
    pub fn seq(&self) -> u64 {
        self.record.as_ref().map(|r| r.seq()).unwrap_or(0)
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match (self.ip, self.tcp_port) {
            (Some(ip), Some(port)) if port != 0 => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        match (self.ip, self.udp_port) {
            (Some(ip), Some(port)) if port != 0 && !ip.is_unspecified() => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    /// `enode://` URL form of this node
    pub fn enode_url(&self) -> String {
        let mut url = format!("enode://{}", hex::encode(raw_pubkey(&self.pubkey)));
        if let Some(ip) = self.ip {
            let tcp = self.tcp_port.unwrap_or(0);
            match ip {
                IpAddr::V4(ip) => url.push_str(&format!("@{}:{}", ip, tcp)),
                IpAddr::V6(ip) => url.push_str(&format!("@[{}]:{}", ip, tcp)),
            }
            if let Some(udp) = self.udp_port.filter(|udp| *udp != tcp) {
                url.push_str(&format!("?discport={}", udp));
            }
        }
        url
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.record {
            Some(enr) => f.write_str(&enr.to_base64()),
            None => f.write_str(&self.enode_url()),
        }
    }
}

impl FromStr for Node {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("enode://") {
            parse_enode(s)
        } else if s.starts_with("enr:") {
            let enr = Enr::from_str(s).map_err(NodeParseError::InvalidRecord)?;
            Node::from_enr(enr)
        } else if let Some(hex_rlp) = s.strip_prefix("0x") {
            let rlp = hex::decode(hex_rlp).map_err(|e| NodeParseError::InvalidRecord(e.to_string()))?;
            Node::from_enr(enr_from_rlp(&rlp)?)
        } else {
            Err(NodeParseError::UnknownFormat)
        }
    }
}

/// Raw RLP form of a record
pub fn enr_to_rlp(enr: &Enr) -> Result<Vec<u8>, NodeParseError> {
    let text = enr.to_base64();
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(text.trim_start_matches("enr:"))
        .map_err(|e| NodeParseError::InvalidRecord(e.to_string()))
}

/// Decode a record from its raw RLP form
pub fn enr_from_rlp(rlp: &[u8]) -> Result<Enr, NodeParseError> {
    let text = format!("enr:{}", base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(rlp));
    Enr::from_str(&text).map_err(NodeParseError::InvalidRecord)
}

fn parse_enode(s: &str) -> Result<Node, NodeParseError> {
    let url = Url::parse(s).map_err(|e| NodeParseError::InvalidUrl(e.to_string()))?;

    let raw = hex::decode(url.username()).map_err(|e| NodeParseError::InvalidId(e.to_string()))?;
    let pubkey = pubkey_from_raw(&raw).map_err(NodeParseError::InvalidKey)?;

    // enode is not a special scheme, so IPv4 hosts arrive as opaque names
    let ip = match url.host() {
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
        Some(Host::Domain(name)) => name
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|_| NodeParseError::InvalidUrl(format!("invalid host: {}", name)))?,
        None => return Err(NodeParseError::InvalidUrl("missing host".to_string())),
    };
    let tcp_port = url
        .port()
        .ok_or_else(|| NodeParseError::InvalidUrl("no port specified".to_string()))?;

    let udp_port = match url.query_pairs().find(|(k, _)| k == "discport") {
        Some((_, port)) => port
            .parse::<u16>()
            .map_err(|e| NodeParseError::InvalidUrl(format!("discport: {}", e)))?,
        None => tcp_port,
    };

    Ok(Node::new(pubkey, Some(ip), Some(tcp_port), Some(udp_port)))
}

/// Parse a comma-separated bootnode list
///
/// Empty entries are skipped. The first malformed entry fails the whole list.
pub fn parse_bootnodes(list: &str) -> Result<Vec<Node>, NodeParseError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Node>().map_err(|e| NodeParseError::InvalidBootnode {
                entry: s.to_string(),
                source: Box::new(e),
            })
        })
        .collect()
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum NodeParseError {
    #[error("invalid node id: {0}")]
    InvalidId(String),

    #[error("invalid public key: {0}")]
    InvalidKey(secp256k1::Error),

    #[error("unsupported record key type")]
    UnsupportedKey,

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid enode url: {0}")]
    InvalidUrl(String),

    #[error("unknown node format (expected enode://, enr: or 0x)")]
    UnknownFormat,

    #[error("invalid bootstrap node: {entry}: {source}")]
    InvalidBootnode {
        entry: String,
        #[source]
        source: Box<NodeParseError>,
    },
}
