//! Node Set Storage (JSON file)
//!
//! The node set lives in a single JSON object keyed by hex node id.
//! Writes go to a temporary file first and are renamed over the target,
//! so readers never observe a half-written set.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::NodeSet;

/// Indentation used by the node set file
const JSON_INDENT: &[u8] = b"    ";

/// Path meaning "write to stdout"
const STDOUT_PATH: &str = "-";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("node set io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed node set {path:?}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode node set: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Load a node set; a missing file is an empty set
pub async fn load(path: &Path) -> Result<NodeSet, StorageError> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("📦 No node set at {:?}, starting empty", path);
            return Ok(NodeSet::new());
        }
        Err(source) => {
            return Err(StorageError::Io { path: path.to_path_buf(), source });
        }
    };

    let nodes: NodeSet = serde_json::from_slice(&content).map_err(|source| StorageError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;

    info!("📦 Loaded {} nodes from {:?}", nodes.len(), path);
    Ok(nodes)
}

/// Serialize a node set to its on-disk form
///
/// Callers snapshot the set with this while holding the set's lock, then
/// write the bytes with [`write`] after releasing it.
pub fn encode(nodes: &NodeSet) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(JSON_INDENT);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    nodes.serialize(&mut ser)?;
    Ok(out)
}

/// Write an encoded node set, replacing the previous file atomically
pub async fn write(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let io_err = |source| StorageError::Io { path: path.to_path_buf(), source };

    if path.as_os_str() == STDOUT_PATH {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(content).await.map_err(io_err)?;
        stdout.write_all(b"\n").await.map_err(io_err)?;
        stdout.flush().await.map_err(io_err)?;
        return Ok(());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, content).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;

    debug!("Node set written to {:?}", path);
    Ok(())
}

/// Encode and write in one step
pub async fn save(path: &Path, nodes: &NodeSet) -> Result<(), StorageError> {
    let content = encode(nodes)?;
    write(path, &content).await
}
