//! RLPx connections
//!
//! Dialing, the devp2p Hello and eth Status handshake, and the serve loop
//! for live peers.

use alloy_rlp::Decodable;
use async_trait::async_trait;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::ecies::{ack_body_len, FrameCodec, Handshake, FRAME_HEADER_LEN, MAX_FRAME_SIZE};
use super::messages::{
    codes, decode_disconnect, empty_list, empty_response, encode_disconnect, request_id, Capability,
    DisconnectReason, Hello, Status, BASE_PROTOCOL_VERSION,
};
use super::{Connection, MessageSink, RlpxError, Transport};
use crate::config::CrawlerConfig;
use crate::types::{raw_pubkey, Node, NodeId, RawPublicKey};

/// Time allowed for our parting Disconnect on close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection timeouts and identity
#[derive(Debug, Clone)]
pub struct DialerConfig {
    pub dial_timeout: Duration,
    pub hello_timeout: Duration,
    pub status_timeout: Duration,
    pub read_timeout: Duration,
    pub client_name: String,
}

impl DialerConfig {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            dial_timeout: Duration::from_secs(config.dial_timeout_secs),
            hello_timeout: Duration::from_secs(config.hello_timeout_secs),
            status_timeout: Duration::from_secs(config.status_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            client_name: config.client_name.clone(),
        }
    }
}

/// TCP + RLPx transport authenticated with the local node key
pub struct Dialer {
    key: SecretKey,
    local_id: RawPublicKey,
    config: DialerConfig,
}

impl Dialer {
    pub fn new(key: SecretKey, config: DialerConfig) -> Self {
        let local_id = raw_pubkey(&PublicKey::from_secret_key(&Secp256k1::signing_only(), &key));
        Self { key, local_id, config }
    }

    /// Open a TCP connection and run the encryption handshake
    pub async fn connect(&self, node: &Node) -> Result<RlpxConn, RlpxError> {
        let addr = node.tcp_addr().ok_or(RlpxError::NoEndpoint)?;

        let (stream, codec) = tokio::time::timeout(self.config.dial_timeout, async {
            let mut stream = TcpStream::connect(addr).await?;
            let codec = handshake(&mut stream, self.key, node.pubkey).await?;
            Ok::<_, RlpxError>((stream, codec))
        })
        .await
        .map_err(|_| RlpxError::Timeout("dial"))??;

        trace!("RLPx session established with {} at {}", node.id.short(), addr);

        Ok(RlpxConn {
            stream,
            codec,
            snappy: false,
            node_id: node.id,
            local_id: self.local_id,
            config: self.config.clone(),
        })
    }
}

#[async_trait]
impl Transport for Dialer {
    async fn dial(&self, node: &Node) -> Result<Box<dyn Connection>, RlpxError> {
        Ok(Box::new(self.connect(node).await?))
    }
}

async fn handshake(stream: &mut TcpStream, key: SecretKey, remote: PublicKey) -> Result<FrameCodec, RlpxError> {
    let mut handshake = Handshake::new(key, remote);
    let auth = handshake.auth_message()?;
    stream.write_all(&auth).await?;

    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).await?;
    let mut ack = vec![0u8; 2 + ack_body_len(prefix)];
    ack[..2].copy_from_slice(&prefix);
    stream.read_exact(&mut ack[2..]).await?;

    handshake.finish(&ack)
}

/// Map a Disconnect payload to the error it ends the connection with
pub(super) fn disconnect_error(payload: &[u8]) -> RlpxError {
    match decode_disconnect(payload) {
        Ok(reasons) => match reasons.first() {
            Some(reason) => RlpxError::Disconnected(*reason),
            None => RlpxError::InvalidDisconnect,
        },
        Err(_) => RlpxError::InvalidDisconnect,
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// An established RLPx session
pub struct RlpxConn {
    stream: TcpStream,
    codec: FrameCodec,
    snappy: bool,
    node_id: NodeId,
    local_id: RawPublicKey,
    config: DialerConfig,
}

impl RlpxConn {
    /// Read and decrypt one message
    pub async fn read_msg(&mut self) -> Result<(u64, Vec<u8>), RlpxError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let size = self.codec.decode_header(&header)?;

        let mut body = vec![0u8; FrameCodec::body_len(size)];
        self.stream.read_exact(&mut body).await?;
        let (code, payload) = self.codec.decode_body(&body, size)?;

        if !self.snappy {
            return Ok((code, payload));
        }

        let len = snap::raw::decompress_len(&payload)?;
        if len > MAX_FRAME_SIZE {
            return Err(RlpxError::FrameTooLarge(len));
        }
        let payload = snap::raw::Decoder::new().decompress_vec(&payload)?;
        Ok((code, payload))
    }

    /// Encrypt and send one message
    pub async fn write_msg(&mut self, code: u64, payload: &[u8]) -> Result<(), RlpxError> {
        let frame = if self.snappy {
            let compressed = snap::raw::Encoder::new().compress_vec(payload)?;
            self.codec.encode_frame(code, &compressed)?
        } else {
            self.codec.encode_frame(code, payload)?
        };
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn hello(&mut self) -> Result<Hello, RlpxError> {
        let ours = Hello {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_name: self.config.client_name.clone(),
            capabilities: vec![Capability::eth()],
            listen_port: 0,
            id: self.local_id,
            rest: Default::default(),
        };
        self.write_msg(codes::HELLO, &alloy_rlp::encode(&ours)).await?;

        let (code, payload) = self.read_msg().await?;
        match code {
            codes::HELLO => {
                let hello = Hello::decode(&mut payload.as_slice())?;
                if hello.protocol_version >= BASE_PROTOCOL_VERSION {
                    self.snappy = true;
                }
                if !hello.has_capability("eth") {
                    return Err(RlpxError::NoEthCapability);
                }
                Ok(hello)
            }
            codes::DISCONNECT => Err(disconnect_error(&payload)),
            other => Err(RlpxError::UnexpectedMessage(other)),
        }
    }

    /// Wait for the peer's Status and echo it back
    async fn status_exchange(&mut self) -> Result<Status, RlpxError> {
        loop {
            let (code, payload) = self.read_msg().await?;
            match code {
                codes::STATUS => {
                    let status = Status::decode(&mut payload.as_slice())?;
                    self.write_msg(codes::STATUS, &payload).await?;
                    return Ok(status);
                }
                codes::PING => self.write_msg(codes::PONG, &empty_list()).await?,
                codes::DISCONNECT => return Err(disconnect_error(&payload)),
                other => return Err(RlpxError::UnexpectedMessage(other)),
            }
        }
    }

    async fn answer_request(&mut self, response_code: u64, payload: &[u8]) -> Result<(), RlpxError> {
        match request_id(payload) {
            Some(id) => self.write_msg(response_code, &empty_response(id)).await,
            None => Err(RlpxError::Rlp(alloy_rlp::Error::Custom("request without id"))),
        }
    }
}

#[async_trait]
impl Connection for RlpxConn {
    async fn peer(&mut self) -> Result<(Hello, Status), RlpxError> {
        let hello = tokio::time::timeout(self.config.hello_timeout, self.hello())
            .await
            .map_err(|_| RlpxError::Timeout("hello"))??;

        let status = tokio::time::timeout(self.config.status_timeout, self.status_exchange())
            .await
            .map_err(|_| RlpxError::Timeout("status exchange"))??;

        Ok((hello, status))
    }

    async fn read_and_serve(&mut self, sink: Arc<dyn MessageSink>) -> Result<(), RlpxError> {
        loop {
            // An idle peer is fine; only a stalled frame is fatal
            match tokio::time::timeout(self.config.read_timeout, self.stream.readable()).await {
                Err(_) => {
                    trace!("No message from {} within {:?}", self.node_id.short(), self.config.read_timeout);
                    continue;
                }
                Ok(ready) => ready?,
            }

            let (code, payload) = tokio::time::timeout(self.config.status_timeout, self.read_msg())
                .await
                .map_err(|_| RlpxError::Timeout("frame read"))??;

            match code {
                codes::PING => self.write_msg(codes::PONG, &empty_list()).await?,
                codes::PONG => {}
                codes::DISCONNECT => return Err(disconnect_error(&payload)),
                codes::GET_BLOCK_HEADERS => {
                    sink.record(&self.node_id, code, &payload);
                    self.answer_request(codes::BLOCK_HEADERS, &payload).await?;
                }
                codes::GET_BLOCK_BODIES => {
                    sink.record(&self.node_id, code, &payload);
                    self.answer_request(codes::BLOCK_BODIES, &payload).await?;
                }
                codes::GET_POOLED_TRANSACTIONS => {
                    sink.record(&self.node_id, code, &payload);
                    self.answer_request(codes::POOLED_TRANSACTIONS, &payload).await?;
                }
                code if code >= codes::ETH_OFFSET => sink.record(&self.node_id, code, &payload),
                other => debug!("Ignoring base protocol message {:#x} from {}", other, self.node_id.short()),
            }
        }
    }

    async fn close(&mut self) {
        let goodbye = encode_disconnect(DisconnectReason::ClientQuitting);
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.write_msg(codes::DISCONNECT, &goodbye)).await;
        let _ = self.stream.shutdown().await;
    }
}
