//! RLPx encryption handshake and frame codec
//!
//! Initiator side of the EIP-8 auth/ack exchange, followed by the AES-CTR
//! frame cipher with keccak-based header and body MACs.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use alloy_rlp::{Decodable, Header, RlpEncodable};
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use secp256k1::ecdh::shared_secret_point;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::Sha256;
use sha3::{Digest, Keccak256};

use super::RlpxError;
use crate::types::{pubkey_from_raw, raw_pubkey};

type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr64BE<aes::Aes256>;

/// Uncompressed ephemeral key + IV + HMAC tag
const ECIES_OVERHEAD: usize = 65 + 16 + 32;

/// Upper bound on a frame body
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encrypted frame header plus its MAC
pub const FRAME_HEADER_LEN: usize = 32;

const AUTH_VERSION: u64 = 4;

fn keccak(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// X coordinate of the ECDH point
fn ecdh_x(public: &PublicKey, secret: &SecretKey) -> [u8; 32] {
    let point = shared_secret_point(public, secret);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}

/// NIST SP 800-56 concatenation KDF, one SHA-256 round
fn concat_kdf(shared: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(1u32.to_be_bytes());
    hasher.update(shared);
    hasher.finalize().into()
}

fn ecies_keys(shared: &[u8; 32]) -> ([u8; 16], [u8; 32]) {
    let key = concat_kdf(shared);
    let mut enc_key = [0u8; 16];
    enc_key.copy_from_slice(&key[..16]);
    let mac_key: [u8; 32] = Sha256::digest(&key[16..]).into();
    (enc_key, mac_key)
}

fn ecies_tag(mac_key: &[u8; 32], iv: &[u8], ciphertext: &[u8], auth_data: &[u8]) -> Result<Hmac<Sha256>, RlpxError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(mac_key).map_err(|_| RlpxError::Auth("invalid mac key"))?;
    mac.update(iv);
    mac.update(ciphertext);
    mac.update(auth_data);
    Ok(mac)
}

/// Encrypt `plain` to `remote` (ECIES, AES-128-CTR + HMAC-SHA256)
pub fn ecies_encrypt(
    secp: &Secp256k1<All>,
    remote: &PublicKey,
    plain: &[u8],
    auth_data: &[u8],
) -> Result<Vec<u8>, RlpxError> {
    let mut rng = rand::thread_rng();
    let ephemeral = SecretKey::new(&mut rng);
    let (enc_key, mac_key) = ecies_keys(&ecdh_x(remote, &ephemeral));

    let mut iv = [0u8; 16];
    rng.fill_bytes(&mut iv);

    let mut ciphertext = plain.to_vec();
    Aes128Ctr::new(&enc_key.into(), &iv.into()).apply_keystream(&mut ciphertext);
    let tag = ecies_tag(&mac_key, &iv, &ciphertext, auth_data)?.finalize().into_bytes();

    let mut out = Vec::with_capacity(ECIES_OVERHEAD + plain.len());
    out.extend_from_slice(&PublicKey::from_secret_key(secp, &ephemeral).serialize_uncompressed());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Decrypt an ECIES message addressed to `secret`
pub fn ecies_decrypt(secret: &SecretKey, data: &[u8], auth_data: &[u8]) -> Result<Vec<u8>, RlpxError> {
    if data.len() < ECIES_OVERHEAD {
        return Err(RlpxError::Auth("message too short"));
    }
    let ephemeral = PublicKey::from_slice(&data[..65]).map_err(|_| RlpxError::Auth("invalid ephemeral key"))?;
    let iv = &data[65..81];
    let (ciphertext, tag) = data[81..].split_at(data.len() - 81 - 32);

    let (enc_key, mac_key) = ecies_keys(&ecdh_x(&ephemeral, secret));
    ecies_tag(&mac_key, iv, ciphertext, auth_data)?
        .verify_slice(tag)
        .map_err(|_| RlpxError::Auth("ecies tag mismatch"))?;

    let mut plain = ciphertext.to_vec();
    let mut iv_arr = [0u8; 16];
    iv_arr.copy_from_slice(iv);
    Aes128Ctr::new(&enc_key.into(), &iv_arr.into()).apply_keystream(&mut plain);
    Ok(plain)
}

// =============================================================================
// HANDSHAKE
// =============================================================================

#[derive(RlpEncodable)]
struct AuthBody {
    signature: [u8; 65],
    initiator_id: [u8; 64],
    nonce: [u8; 32],
    version: u64,
}

/// Initiator state between sending auth and receiving ack
pub struct Handshake {
    secp: Secp256k1<All>,
    secret_key: SecretKey,
    remote_pubkey: PublicKey,
    ephemeral_key: SecretKey,
    nonce: [u8; 32],
    auth: Vec<u8>,
}

impl Handshake {
    pub fn new(secret_key: SecretKey, remote_pubkey: PublicKey) -> Self {
        let mut rng = rand::thread_rng();
        let mut nonce = [0u8; 32];
        rng.fill_bytes(&mut nonce);

        Self {
            secp: Secp256k1::new(),
            secret_key,
            remote_pubkey,
            ephemeral_key: SecretKey::new(&mut rng),
            nonce,
            auth: Vec::new(),
        }
    }

    /// Build the size-prefixed EIP-8 auth message
    pub fn auth_message(&mut self) -> Result<Vec<u8>, RlpxError> {
        let static_shared = ecdh_x(&self.remote_pubkey, &self.secret_key);
        let digest = xor32(&static_shared, &self.nonce);
        let sig = self
            .secp
            .sign_ecdsa_recoverable(&Message::from_digest(digest), &self.ephemeral_key);
        let (rec_id, compact) = sig.serialize_compact();

        let mut signature = [0u8; 65];
        signature[..64].copy_from_slice(&compact);
        signature[64] = rec_id.to_i32() as u8;

        let body = AuthBody {
            signature,
            initiator_id: raw_pubkey(&PublicKey::from_secret_key(&self.secp, &self.secret_key)),
            nonce: self.nonce,
            version: AUTH_VERSION,
        };
        let mut plain = alloy_rlp::encode(&body);
        let padding = rand::thread_rng().gen_range(100..200);
        plain.resize(plain.len() + padding, 0);

        let size = u16::try_from(plain.len() + ECIES_OVERHEAD).map_err(|_| RlpxError::Auth("auth too large"))?;
        let prefix = size.to_be_bytes();
        let sealed = ecies_encrypt(&self.secp, &self.remote_pubkey, &plain, &prefix)?;

        let mut auth = Vec::with_capacity(2 + sealed.len());
        auth.extend_from_slice(&prefix);
        auth.extend_from_slice(&sealed);
        self.auth = auth.clone();
        Ok(auth)
    }

    /// Consume the size-prefixed ack and derive the session secrets
    pub fn finish(self, ack: &[u8]) -> Result<FrameCodec, RlpxError> {
        if ack.len() < 2 {
            return Err(RlpxError::Auth("ack too short"));
        }
        let (prefix, sealed) = ack.split_at(2);
        let plain = ecies_decrypt(&self.secret_key, sealed, prefix)?;

        let mut buf = plain.as_slice();
        let header = Header::decode(&mut buf)?;
        if !header.list || buf.len() < header.payload_length {
            return Err(RlpxError::Auth("malformed ack"));
        }
        let mut payload = &buf[..header.payload_length];
        let remote_ephemeral: [u8; 64] = Decodable::decode(&mut payload)?;
        let remote_nonce: [u8; 32] = Decodable::decode(&mut payload)?;

        let remote_ephemeral = pubkey_from_raw(&remote_ephemeral).map_err(|_| RlpxError::Auth("invalid ephemeral key"))?;
        let ephemeral_shared = ecdh_x(&remote_ephemeral, &self.ephemeral_key);

        let nonce_hash = keccak(&[&remote_nonce, &self.nonce]);
        let shared_secret = keccak(&[&ephemeral_shared, &nonce_hash]);
        let aes_secret = keccak(&[&ephemeral_shared, &shared_secret]);
        let mac_secret = keccak(&[&ephemeral_shared, &aes_secret]);

        let mut egress_mac = MacState::new(mac_secret);
        egress_mac.hasher.update(xor32(&mac_secret, &remote_nonce));
        egress_mac.hasher.update(&self.auth);

        let mut ingress_mac = MacState::new(mac_secret);
        ingress_mac.hasher.update(xor32(&mac_secret, &self.nonce));
        ingress_mac.hasher.update(ack);

        Ok(FrameCodec {
            egress_aes: Aes256Ctr::new(&aes_secret.into(), &[0u8; 16].into()),
            ingress_aes: Aes256Ctr::new(&aes_secret.into(), &[0u8; 16].into()),
            egress_mac,
            ingress_mac,
        })
    }
}

/// Size of the ack body announced by its 2-byte prefix
pub fn ack_body_len(prefix: [u8; 2]) -> usize {
    u16::from_be_bytes(prefix) as usize
}

// =============================================================================
// FRAMES
// =============================================================================

/// Running keccak MAC of one direction
struct MacState {
    cipher: aes::Aes256,
    hasher: Keccak256,
}

impl MacState {
    fn new(secret: [u8; 32]) -> Self {
        Self {
            cipher: aes::Aes256::new(&secret.into()),
            hasher: Keccak256::new(),
        }
    }

    fn digest(&self) -> [u8; 16] {
        let full = self.hasher.clone().finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&full[..16]);
        out
    }

    fn seal(&self, seed: [u8; 16]) -> [u8; 16] {
        let mut block = aes::Block::from(self.digest());
        self.cipher.encrypt_block(&mut block);
        let mut out = [0u8; 16];
        for i in 0..16 {
            out[i] = block[i] ^ seed[i];
        }
        out
    }

    fn update_header(&mut self, header_ciphertext: &[u8; 16]) {
        let sealed = self.seal(*header_ciphertext);
        self.hasher.update(sealed);
    }

    fn update_body(&mut self, body_ciphertext: &[u8]) {
        self.hasher.update(body_ciphertext);
        let prev = self.digest();
        let sealed = self.seal(prev);
        self.hasher.update(sealed);
    }
}

/// Session cipher state after a completed handshake
pub struct FrameCodec {
    egress_aes: Aes256Ctr,
    ingress_aes: Aes256Ctr,
    egress_mac: MacState,
    ingress_mac: MacState,
}

impl FrameCodec {
    /// Encrypt one message into a frame
    pub fn encode_frame(&mut self, code: u64, payload: &[u8]) -> Result<Vec<u8>, RlpxError> {
        let mut body = alloy_rlp::encode(code);
        body.extend_from_slice(payload);
        let size = body.len();
        if size > MAX_FRAME_SIZE {
            return Err(RlpxError::FrameTooLarge(size));
        }

        let mut header = [0u8; 16];
        header[..3].copy_from_slice(&(size as u32).to_be_bytes()[1..]);
        header[3..6].copy_from_slice(&[0xc2, 0x80, 0x80]);
        self.egress_aes.apply_keystream(&mut header);
        self.egress_mac.update_header(&header);
        let header_mac = self.egress_mac.digest();

        body.resize(padded(size), 0);
        self.egress_aes.apply_keystream(&mut body);
        self.egress_mac.update_body(&body);
        let frame_mac = self.egress_mac.digest();

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len() + 16);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&header_mac);
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&frame_mac);
        Ok(frame)
    }

    /// Verify and decrypt a frame header; returns the body size
    pub fn decode_header(&mut self, buf: &[u8; FRAME_HEADER_LEN]) -> Result<usize, RlpxError> {
        let mut header = [0u8; 16];
        header.copy_from_slice(&buf[..16]);

        self.ingress_mac.update_header(&header);
        if self.ingress_mac.digest() != buf[16..] {
            return Err(RlpxError::MacMismatch);
        }

        self.ingress_aes.apply_keystream(&mut header);
        let size = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        if size > MAX_FRAME_SIZE {
            return Err(RlpxError::FrameTooLarge(size));
        }
        Ok(size)
    }

    /// Bytes to read after the header for a body of `size`
    pub fn body_len(size: usize) -> usize {
        padded(size) + 16
    }

    /// Verify and decrypt a frame body; returns message code and payload
    pub fn decode_body(&mut self, buf: &[u8], size: usize) -> Result<(u64, Vec<u8>), RlpxError> {
        if buf.len() != Self::body_len(size) {
            return Err(RlpxError::MacMismatch);
        }
        let (ciphertext, mac) = buf.split_at(buf.len() - 16);

        self.ingress_mac.update_body(ciphertext);
        if self.ingress_mac.digest() != mac {
            return Err(RlpxError::MacMismatch);
        }

        let mut body = ciphertext.to_vec();
        self.ingress_aes.apply_keystream(&mut body);
        body.truncate(size);

        let mut rest = body.as_slice();
        let code = u64::decode(&mut rest)?;
        Ok((code, rest.to_vec()))
    }
}

fn padded(size: usize) -> usize {
    size.div_ceil(16) * 16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecies_roundtrip() {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());

        let sealed = ecies_encrypt(&secp, &public, b"hello devp2p", b"ad").unwrap();
        assert_eq!(sealed.len(), ECIES_OVERHEAD + 12);

        let plain = ecies_decrypt(&secret, &sealed, b"ad").unwrap();
        assert_eq!(plain, b"hello devp2p");

        assert!(ecies_decrypt(&secret, &sealed, b"other").is_err());
    }

    #[test]
    fn test_auth_message_decrypts_for_recipient() {
        let secp = Secp256k1::new();
        let (ours, our_pub) = secp.generate_keypair(&mut rand::thread_rng());
        let (theirs, their_pub) = secp.generate_keypair(&mut rand::thread_rng());

        let mut handshake = Handshake::new(ours, their_pub);
        let auth = handshake.auth_message().unwrap();

        let (prefix, sealed) = auth.split_at(2);
        assert_eq!(ack_body_len([prefix[0], prefix[1]]), sealed.len());

        let plain = ecies_decrypt(&theirs, sealed, prefix).unwrap();
        let mut buf = plain.as_slice();
        let header = Header::decode(&mut buf).unwrap();
        assert!(header.list);

        let mut payload = &buf[..header.payload_length];
        let _sig: [u8; 65] = Decodable::decode(&mut payload).unwrap();
        let initiator: [u8; 64] = Decodable::decode(&mut payload).unwrap();
        assert_eq!(initiator, raw_pubkey(&our_pub));
    }

    /// Two codecs sharing secrets, wired egress-to-ingress
    fn codec_pair() -> (FrameCodec, FrameCodec) {
        let aes_secret = [3u8; 32];
        let mac_secret = [5u8; 32];

        let make = |egress_seed: u8, ingress_seed: u8| {
            let mut egress_mac = MacState::new(mac_secret);
            egress_mac.hasher.update([egress_seed; 32]);
            let mut ingress_mac = MacState::new(mac_secret);
            ingress_mac.hasher.update([ingress_seed; 32]);
            FrameCodec {
                egress_aes: Aes256Ctr::new(&aes_secret.into(), &[0u8; 16].into()),
                ingress_aes: Aes256Ctr::new(&aes_secret.into(), &[0u8; 16].into()),
                egress_mac,
                ingress_mac,
            }
        };
        (make(1, 2), make(2, 1))
    }

    #[test]
    fn test_frame_roundtrip() {
        let (mut a, mut b) = codec_pair();

        for (code, payload) in [(0x10u64, vec![0xc0]), (0x02, vec![]), (0x12, vec![9u8; 100])] {
            let frame = a.encode_frame(code, &payload).unwrap();
            let mut header = [0u8; FRAME_HEADER_LEN];
            header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);

            let size = b.decode_header(&header).unwrap();
            let (decoded_code, decoded) = b.decode_body(&frame[FRAME_HEADER_LEN..], size).unwrap();
            assert_eq!(decoded_code, code);
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn test_frame_tamper_detected() {
        let (mut a, mut b) = codec_pair();
        let mut frame = a.encode_frame(0x00, &[1, 2, 3]).unwrap();
        frame[40] ^= 0xff;

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
        let size = b.decode_header(&header).unwrap();
        assert!(matches!(
            b.decode_body(&frame[FRAME_HEADER_LEN..], size),
            Err(RlpxError::MacMismatch)
        ));
    }
}
