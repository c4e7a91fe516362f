use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FixedIdError {
    #[error("no input provided for id hash")]
    Empty,
    #[error("invalid hex id: {0}")]
    BadHex(String),
}

/// Opaque 16-byte identifier stored as FixedString(16) in the columnar store.
/// Import ids hash the import time in microseconds; file ids hash the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FixedId([u8; 16]);

impl FixedId {
    /// Hash the concatenation of the given parts into a fixed-width id.
    pub fn hash(parts: &[&str]) -> Result<Self, FixedIdError> {
        let joined: String = parts.concat();
        if joined.is_empty() {
            return Err(FixedIdError::Empty);
        }
        let digest = Sha256::digest(joined.as_bytes());
        let mut data = [0u8; 16];
        data.copy_from_slice(&digest[..16]);
        Ok(FixedId(data))
    }

    pub fn from_hex(h: &str) -> Result<Self, FixedIdError> {
        let bytes = hex::decode(h).map_err(|_| FixedIdError::BadHex(h.to_string()))?;
        if bytes.len() != 16 {
            return Err(FixedIdError::BadHex(h.to_string()));
        }
        let mut data = [0u8; 16];
        data.copy_from_slice(&bytes);
        Ok(FixedId(data))
    }

    pub fn hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for FixedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}
