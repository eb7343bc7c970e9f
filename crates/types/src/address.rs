use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Errors that can occur when parsing peer identifiers and addresses.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("peer id cannot be empty")]
    EmptyPeerId,
    #[error("peer id must be at most {max} characters, got {actual}")]
    PeerIdTooLong { max: usize, actual: usize },
    #[error("peer id contains invalid character {0:?}")]
    InvalidPeerIdChar(char),
    #[error("peer address cannot be empty")]
    EmptyAddress,
    #[error("peer address is not a valid URL: {0}")]
    InvalidUrl(String),
    #[error("peer address must use http or https, got {0}")]
    UnsupportedScheme(String),
}

/// Maximum length of a peer identifier.
pub const MAX_PEER_ID_LEN: usize = 64;

/// Identifier a peer is configured with and logs in as.
///
/// Restricted to ASCII alphanumerics plus `-`, `_` and `.` so it can be used
/// verbatim in URL paths and log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn parse(value: &str) -> Result<Self, AddressError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AddressError::EmptyPeerId);
        }
        if trimmed.len() > MAX_PEER_ID_LEN {
            return Err(AddressError::PeerIdTooLong {
                max: MAX_PEER_ID_LEN,
                actual: trimmed.len(),
            });
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(AddressError::InvalidPeerIdChar(bad));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PeerId::parse(&value)
    }
}

impl std::str::FromStr for PeerId {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerId::parse(s)
    }
}

/// Normalise a peer base address to `scheme://host[:port]` without a trailing slash.
///
/// A bare `host:port` is treated as `http://host:port`.
pub fn normalize_address(address: &str) -> Result<String, AddressError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(AddressError::EmptyAddress);
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let mut url = Url::parse(&candidate).map_err(|e| AddressError::InvalidUrl(e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AddressError::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.host_str().is_none() {
        return Err(AddressError::InvalidUrl(format!("{trimmed} has no host")));
    }
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);
    let mut normalized = url.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }
    Ok(normalized)
}

/// Build the URL a client uses to fetch `filename` from the peer at `address`.
pub fn download_url(address: &str, filename: &str) -> String {
    format!(
        "{}/download/{}",
        address.trim_end_matches('/'),
        encode_path_segment(filename)
    )
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn encode_path_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
