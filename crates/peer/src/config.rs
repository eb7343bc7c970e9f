use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sharenet_rpc::HttpDirectoryClient;
use sharenet_security::{SecurityConfig, UploadPolicy};
use sharenet_types::{normalize_address, PeerId};

/// Everything a peer node needs to start.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Socket address the HTTP surface binds to.
    pub listen: String,
    /// Base URL advertised to the directory. Derived from the bound socket when unset.
    pub public_url: Option<String>,
    pub directory_url: String,
    /// Shared secret the directory holds for this peer id.
    pub directory_secret: String,
    pub peer_id: String,
    pub username: String,
    pub password: String,
    pub shared_dir: PathBuf,
    /// Empty allows every extension.
    pub allowed_extensions: Vec<String>,
    pub max_file_size: u64,
    pub directory_timeout_ms: u64,
    /// Seconds between heartbeats to the directory; 0 disables them.
    pub heartbeat_interval_secs: u64,
    pub security: SecurityConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        let policy = UploadPolicy::default();
        Self {
            listen: "0.0.0.0:8001".to_string(),
            public_url: None,
            directory_url: "http://127.0.0.1:5000".to_string(),
            directory_secret: String::new(),
            peer_id: "peer1".to_string(),
            username: "user1".to_string(),
            password: String::new(),
            shared_dir: PathBuf::from("./shared"),
            allowed_extensions: policy.allowed_extensions().to_vec(),
            max_file_size: policy.max_file_size(),
            directory_timeout_ms: 5_000,
            heartbeat_interval_secs: 60,
            security: SecurityConfig::default(),
        }
    }
}

impl PeerConfig {
    pub fn validate(&self) -> Result<()> {
        if let Err(err) = PeerId::parse(&self.peer_id) {
            bail!("invalid peer_id {:?}: {}", self.peer_id, err);
        }
        if self.username.trim().is_empty() {
            bail!("username cannot be empty");
        }
        if self.password.is_empty() {
            bail!("password cannot be empty");
        }
        if let Err(err) = normalize_address(&self.directory_url) {
            bail!("invalid directory_url {:?}: {}", self.directory_url, err);
        }
        if self.directory_secret.trim().is_empty() {
            bail!("directory_secret cannot be empty");
        }
        if let Some(public_url) = &self.public_url {
            if let Err(err) = normalize_address(public_url) {
                bail!("invalid public_url {:?}: {}", public_url, err);
            }
        }
        if self.shared_dir.as_os_str().is_empty() {
            bail!("shared_dir cannot be empty");
        }
        if self.max_file_size == 0 {
            bail!("max_file_size must be greater than zero");
        }
        Ok(())
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy::new(&self.allowed_extensions, self.max_file_size)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    /// HTTP client for the configured directory, signed with this peer's secret.
    pub fn directory_client(&self) -> Result<HttpDirectoryClient> {
        let peer_id = PeerId::parse(&self.peer_id)
            .with_context(|| format!("invalid peer_id {:?}", self.peer_id))?;
        let client = HttpDirectoryClient::new(&self.directory_url, self.directory_timeout())
            .with_context(|| format!("invalid directory_url {:?}", self.directory_url))?;
        Ok(client.with_credentials(peer_id, self.directory_secret.trim()))
    }
}
