//! Node Identity
//!
//! Every node owns an Ed25519 key pair persisted in its data directory.
//! The node id used for registration and leader ordering is derived from
//! the public key, so it stays stable across restarts as long as the data
//! directory is preserved.
//!
//! Key file layout (PEM envelope):
//! - block type `ED25519 PRIVATE KEY`
//! - header `Key-ID: ed25519:<base64 of 3 random bytes>`
//! - body: the 32-byte Ed25519 seed

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use ed25519_dalek::{SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File name of the node key inside the data directory
pub const NODE_KEY_FILE: &str = "node_key.pem";

/// Number of public key bytes that make up the node id
pub const NODE_ID_BYTES: usize = 16;

const PEM_TAG: &str = "ED25519 PRIVATE KEY";
const KEY_ID_HEADER: &str = "Key-ID";
const KEY_ID_PREFIX: &str = "ed25519:";
const KEY_ID_BYTES: usize = 3;
const PEM_LINE_WIDTH: usize = 64;

/// Node identifier: hex of the first 16 bytes of the node's public key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an already-derived id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Derive the node id from a public key. Pure.
pub fn derive_node_id(public_key: &[u8; PUBLIC_KEY_LENGTH]) -> NodeId {
    NodeId(hex::encode(&public_key[..NODE_ID_BYTES]))
}

/// Path of the node key inside a data directory
pub fn key_path(data_dir: &Path) -> PathBuf {
    data_dir.join(NODE_KEY_FILE)
}

/// Persistent key pair of this node
#[derive(Clone)]
pub struct NodeIdentity {
    signing_key: SigningKey,
    key_id: String,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("key_id", &self.key_id)
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

impl NodeIdentity {
    /// Generate a new identity from the OS random source
    ///
    /// The first three random bytes become the key id, the remaining
    /// 32 bytes are the Ed25519 seed.
    pub fn generate() -> Self {
        let mut material = [0u8; KEY_ID_BYTES + SECRET_KEY_LENGTH];
        OsRng.fill_bytes(&mut material);

        let key_id = format!(
            "{}{}",
            KEY_ID_PREFIX,
            STANDARD_NO_PAD.encode(&material[..KEY_ID_BYTES])
        );
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        seed.copy_from_slice(&material[KEY_ID_BYTES..]);

        Self {
            signing_key: SigningKey::from_bytes(&seed),
            key_id,
        }
    }

    /// Load an identity from a key file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::IdentityCorrupt {
            path: path.to_path_buf(),
            reason: format!("unreadable: {}", e),
        })?;

        let (key_id, seed) = decode_pem(&content).map_err(|reason| Error::IdentityCorrupt {
            path: path.to_path_buf(),
            reason,
        })?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
            key_id,
        })
    }

    /// Persist the identity with owner-only permissions
    pub fn save(&self, path: &Path) -> Result<()> {
        let persist_err = |source| Error::IdentityPersist {
            path: path.to_path_buf(),
            source,
        };

        let pem = encode_pem(&self.key_id, &self.signing_key.to_bytes());

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(persist_err)?;
        file.write_all(pem.as_bytes()).map_err(persist_err)?;
        file.sync_all().map_err(persist_err)?;
        Ok(())
    }

    /// Short random key id (`ed25519:...`)
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Ed25519 public key
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Ed25519 signing key
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Node id derived from the public key
    pub fn node_id(&self) -> NodeId {
        derive_node_id(self.public_key().as_bytes())
    }
}

/// Load the node identity from `data_dir`, generating and persisting one if absent
///
/// An existing key file is never regenerated; if it cannot be inspected or
/// decoded startup fails with [`Error::IdentityCorrupt`]. Only a missing file
/// leads to generation.
pub fn ensure_identity(data_dir: &Path) -> Result<NodeIdentity> {
    let path = key_path(data_dir);

    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_file() => {
            tracing::debug!("Loading node key from {:?}", path);
            return NodeIdentity::load(&path);
        }
        Ok(_) => {
            return Err(Error::IdentityCorrupt {
                path,
                reason: "not a regular file".to_string(),
            });
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::IdentityCorrupt {
                path,
                reason: format!("cannot inspect key file: {}", e),
            });
        }
    }

    tracing::info!("No node key found in {:?}, generating a new one", data_dir);
    std::fs::create_dir_all(data_dir).map_err(|source| Error::IdentityPersist {
        path: data_dir.to_path_buf(),
        source,
    })?;

    let identity = NodeIdentity::generate();
    identity.save(&path)?;
    tracing::info!("Generated node key {}", identity.key_id());

    Ok(identity)
}

fn encode_pem(key_id: &str, seed: &[u8; SECRET_KEY_LENGTH]) -> String {
    let body = STANDARD.encode(seed);
    let mut out = format!("-----BEGIN {}-----\n{}: {}\n\n", PEM_TAG, KEY_ID_HEADER, key_id);
    for chunk in body.as_bytes().chunks(PEM_LINE_WIDTH) {
        // base64 output is ASCII
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", PEM_TAG));
    out
}

fn decode_pem(text: &str) -> std::result::Result<(String, [u8; SECRET_KEY_LENGTH]), String> {
    let begin = format!("-----BEGIN {}-----", PEM_TAG);
    let end = format!("-----END {}-----", PEM_TAG);
    let mut lines = text.lines().map(str::trim);

    loop {
        match lines.next() {
            Some(line) if line == begin => break,
            Some(line) if line.starts_with("-----BEGIN ") => {
                return Err(format!("unexpected PEM block {:?}", line));
            }
            Some(_) => continue,
            None => return Err("missing PEM begin marker".to_string()),
        }
    }

    let mut key_id = None;
    let mut body = String::new();
    let mut in_headers = true;
    let mut closed = false;

    for line in lines {
        if line == end {
            closed = true;
            break;
        }
        if in_headers {
            if line.is_empty() {
                in_headers = false;
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case(KEY_ID_HEADER) {
                    key_id = Some(value.trim().to_string());
                }
                continue;
            }
            in_headers = false;
        }
        body.push_str(line);
    }

    if !closed {
        return Err("missing PEM end marker".to_string());
    }

    let key_id = match key_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(format!("missing {} header", KEY_ID_HEADER)),
    };

    let bytes = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| format!("invalid base64 body: {}", e))?;
    let seed: [u8; SECRET_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("seed must be {} bytes, got {}", SECRET_KEY_LENGTH, b.len()))?;

    Ok((key_id, seed))
}
