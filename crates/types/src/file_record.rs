use crate::address::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Longest filename accepted anywhere in the network.
pub const MAX_FILENAME_LEN: usize = 255;

/// Staged uploads carry this suffix and are never shared.
pub const STAGING_SUFFIX: &str = ".part";

/// Errors emitted when a filename cannot be used as an index key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilenameError {
    #[error("filename cannot be empty")]
    Empty,
    #[error("filename must be at most {MAX_FILENAME_LEN} bytes, got {0}")]
    TooLong(usize),
    #[error("filename must not contain path separators or NUL")]
    PathSeparator,
    #[error("filename must not be a relative path component")]
    RelativeComponent,
}

/// Check that `name` is a single path component usable as an index key.
///
/// Rejects anything that could resolve outside a shared root when joined to it.
pub fn validate_filename(name: &str) -> Result<(), FilenameError> {
    if name.is_empty() {
        return Err(FilenameError::Empty);
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(FilenameError::TooLong(name.len()));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(FilenameError::PathSeparator);
    }
    if name == "." || name == ".." {
        return Err(FilenameError::RelativeComponent);
    }
    Ok(())
}

/// Whether a valid filename is one a peer shares. Dotfiles, staged uploads
/// and editor backups stay private to the folder.
pub fn is_shareable_name(name: &str) -> bool {
    !name.starts_with('.') && !name.ends_with(STAGING_SUFFIX) && !name.ends_with('~')
}

/// BLAKE3 hash of file content, serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Hash the given data using BLAKE3.
    pub fn from_data(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, String> {
        if hex_str.len() != 64 {
            return Err(format!(
                "content hash hex must be 64 characters, got {}",
                hex_str.len()
            ));
        }
        let mut arr = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut arr).map_err(|e| format!("invalid hex: {e}"))?;
        Ok(Self(arr))
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        ContentHash::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// Metadata for one shared file. Never carries the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Name of the file, unique per owning peer.
    pub filename: String,

    /// Peer that holds the file.
    pub owner: PeerId,

    /// File size in bytes.
    pub size_bytes: u64,

    /// BLAKE3 hash of the content at scan time.
    pub content_hash: ContentHash,

    /// Location relative to the owner's shared root.
    pub path: String,

    /// Filesystem modification time, when the platform reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,

    /// When the owner produced this record.
    pub indexed_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn validate(&self) -> Result<(), FilenameError> {
        validate_filename(&self.filename)
    }

    /// Case-insensitive substring match against the filename.
    ///
    /// `needle` must already be lowercase.
    pub fn matches(&self, needle: &str) -> bool {
        !needle.is_empty() && self.filename.to_lowercase().contains(needle)
    }
}
