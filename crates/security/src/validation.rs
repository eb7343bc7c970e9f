use serde::{Deserialize, Serialize};
use sharenet_types::{is_shareable_name, validate_filename, FilenameError, STAGING_SUFFIX};
use thiserror::Error;

/// Rules applied to files written into a peer's shared root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPolicy {
    /// Lowercase extensions without the leading dot. Empty allows every extension.
    allowed_extensions: Vec<String>,
    /// Largest accepted upload in bytes.
    max_file_size: u64,
}

/// Why an upload was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("invalid filename: {0}")]
    InvalidName(#[from] FilenameError),
    #[error("hidden filenames are not shared")]
    HiddenName,
    #[error("names ending in {STAGING_SUFFIX:?} or '~' are reserved and never shared")]
    ReservedName,
    #[error("extension {0:?} is not allowed")]
    DisallowedExtension(String),
    #[error("file is empty")]
    Empty,
    #[error("file is {size} bytes, limit is {max}")]
    TooLarge { size: u64, max: u64 },
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::new(
            [".txt", ".pdf", ".jpg", ".png", ".mp3", ".mp4", ".zip"],
            50 * 1024 * 1024, // 50MB
        )
    }
}

impl UploadPolicy {
    /// Extensions may be given as `".txt"` or `"txt"`, in any case.
    pub fn new<I, S>(allowed_extensions: I, max_file_size: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed_extensions: Vec<String> = allowed_extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        allowed_extensions.sort();
        allowed_extensions.dedup();
        Self {
            allowed_extensions,
            max_file_size,
        }
    }

    pub fn allow_all(max_file_size: u64) -> Self {
        Self::new(Vec::<String>::new(), max_file_size)
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn allowed_extensions(&self) -> &[String] {
        &self.allowed_extensions
    }

    pub fn check_name(&self, filename: &str) -> Result<(), PolicyViolation> {
        validate_filename(filename)?;
        if filename.starts_with('.') {
            return Err(PolicyViolation::HiddenName);
        }
        // Must agree with what the scanner shares.
        if !is_shareable_name(filename) {
            return Err(PolicyViolation::ReservedName);
        }
        if self.allowed_extensions.is_empty() {
            return Ok(());
        }

        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if self.allowed_extensions.iter().any(|allowed| *allowed == extension) {
            Ok(())
        } else {
            Err(PolicyViolation::DisallowedExtension(extension))
        }
    }

    pub fn check_size(&self, size: u64) -> Result<(), PolicyViolation> {
        if size == 0 {
            return Err(PolicyViolation::Empty);
        }
        if size > self.max_file_size {
            return Err(PolicyViolation::TooLarge {
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }
}
