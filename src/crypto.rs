//! Node key management
//!
//! The local node identity is a secp256k1 secret key, stored as 64 hex
//! characters. The same key signs our discovery record and authenticates
//! the RLPx handshake.

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::types::NodeId;

/// Default key file name inside the data directory
pub const DEFAULT_KEY_FILE: &str = "nodekey";

// =============================================================================
// KEY MANAGEMENT
// =============================================================================

/// Generate a new secp256k1 node key
pub fn generate_key() -> SecretKey {
    SecretKey::new(&mut rand::thread_rng())
}

/// Load the node key from file or generate a new one
pub async fn load_or_generate_key(
    data_dir: &Path,
    key_file: Option<&PathBuf>,
) -> anyhow::Result<SecretKey> {
    let key_path = key_file
        .cloned()
        .unwrap_or_else(|| data_dir.join(DEFAULT_KEY_FILE));

    if key_path.exists() {
        info!("🔑 Loading node key from {:?}", key_path);
        load_key(&key_path).await
    } else {
        info!("🔑 Generating new node key");
        let key = generate_key();
        save_key(&key, &key_path).await?;
        info!("🔑 Node key saved to {:?}", key_path);
        Ok(key)
    }
}

/// Save the node key as hex (owner read/write only)
pub async fn save_key(key: &SecretKey, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tokio::fs::write(path, hex::encode(key.secret_bytes())).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(path).await?.permissions();
        perms.set_mode(0o600);
        tokio::fs::set_permissions(path, perms).await?;
    }

    Ok(())
}

/// Load a hex-encoded node key
pub async fn load_key(path: &Path) -> anyhow::Result<SecretKey> {
    let content = tokio::fs::read_to_string(path).await?;
    let bytes = hex::decode(content.trim())?;

    if bytes.len() != 32 {
        anyhow::bail!("Invalid key file size: expected 32 bytes, got {}", bytes.len());
    }

    Ok(SecretKey::from_slice(&bytes)?)
}

pub fn public_key(key: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::signing_only(), key)
}

/// Node identity of the local key
pub fn node_id(key: &SecretKey) -> NodeId {
    NodeId::from_pubkey(&public_key(key))
}
