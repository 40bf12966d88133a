//! Handshake probe
//!
//! Dial one node, run the encryption handshake and decode the first frame
//! it sends. Nothing is retried and nothing is recorded.

use alloy_rlp::Decodable;
use secp256k1::SecretKey;
use std::time::Duration;
use tracing::debug;

use super::conn::{disconnect_error, Dialer, DialerConfig};
use super::messages::{codes, Hello};
use super::RlpxError;
use crate::types::Node;

/// Decode the first frame a peer sends after the handshake
pub fn decode_probe_frame(code: u64, data: &[u8]) -> Result<Hello, RlpxError> {
    match code {
        codes::HELLO => Ok(Hello::decode(&mut &data[..])?),
        codes::DISCONNECT => Err(disconnect_error(data)),
        other => Err(RlpxError::UnexpectedMessage(other)),
    }
}

/// Handshake with `node` and return its Hello
pub async fn probe(node: &Node, key: SecretKey, config: DialerConfig) -> Result<Hello, RlpxError> {
    let hello_timeout: Duration = config.hello_timeout;
    let dialer = Dialer::new(key, config);

    let mut conn = dialer.connect(node).await?;
    let (code, data) = tokio::time::timeout(hello_timeout, conn.read_msg())
        .await
        .map_err(|_| RlpxError::Timeout("first frame"))??;

    debug!("Probe of {} read frame {:#x} ({} bytes)", node.id.short(), code, data.len());
    decode_probe_frame(code, &data)
}
