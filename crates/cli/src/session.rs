//! Tokens remembered between CLI invocations, one per peer base URL.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sharenet_types::normalize_address;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    #[serde(default)]
    tokens: BTreeMap<String, String>,
}

pub struct SessionStore {
    path: PathBuf,
    file: SessionFile,
}

impl SessionStore {
    pub fn load(path: &Path) -> Result<Self> {
        let file = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("corrupt session file {}", path.display()))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => SessionFile::default(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read session file {}", path.display()))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn token_for(&self, peer_url: &str) -> Option<&str> {
        let key = normalize_address(peer_url).ok()?;
        self.file.tokens.get(&key).map(String::as_str)
    }

    pub fn set(&mut self, peer_url: &str, token: &str) -> Result<()> {
        let key = normalize_address(peer_url)?;
        self.file.tokens.insert(key, token.to_string());
        self.save()
    }

    pub fn remove(&mut self, peer_url: &str) -> Result<()> {
        let key = normalize_address(peer_url)?;
        if self.file.tokens.remove(&key).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.file)?;
        fs::write(&self.path, json)
            .with_context(|| format!("failed to write session file {}", self.path.display()))
    }
}
