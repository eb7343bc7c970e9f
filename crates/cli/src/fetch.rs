//! Client-side retrieval: download a file directly from the peers that own it.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use reqwest::Client;
use sharenet_types::{ContentHash, SearchResult};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::session::SessionStore;

/// A completed download.
#[derive(Debug)]
pub struct Fetched {
    pub path: PathBuf,
    pub peer_id: String,
    pub size_bytes: u64,
}

/// Try each owner in order and keep the first copy that arrives intact.
pub async fn fetch_from_owners(
    client: &Client,
    owners: &[SearchResult],
    sessions: &SessionStore,
    output_dir: &Path,
) -> Result<Fetched> {
    if owners.is_empty() {
        bail!("no peer shares this file");
    }
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let mut failures = Vec::new();
    for owner in owners {
        let Some(token) = sessions.token_for(&owner.peer_address) else {
            warn!("no session for {}, skipping", owner.peer_address);
            failures.push(format!(
                "{}: not logged in (run `login --peer-url {}`)",
                owner.peer_id, owner.peer_address
            ));
            continue;
        };

        match download(client, owner, token, output_dir).await {
            Ok(fetched) => {
                info!("downloaded {} from {}", owner.filename, owner.peer_id);
                return Ok(fetched);
            }
            Err(err) => {
                warn!("download from {} failed: {:#}", owner.peer_id, err);
                failures.push(format!("{}: {:#}", owner.peer_id, err));
            }
        }
    }
    Err(anyhow!(
        "every owner failed:\n  {}",
        failures.join("\n  ")
    ))
}

async fn download(
    client: &Client,
    owner: &SearchResult,
    token: &str,
    output_dir: &Path,
) -> Result<Fetched> {
    let response = client
        .get(&owner.download_url)
        .bearer_auth(token)
        .send()
        .await
        .context("request failed")?;
    let status = response.status();
    if !status.is_success() {
        bail!("peer answered {status}");
    }

    let target = output_dir.join(&owner.filename);
    let staging = output_dir.join(format!(".{}.download", owner.filename));
    let result = write_body(response, &staging).await;
    let (size_bytes, hash) = match result {
        Ok(written) => written,
        Err(err) => {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err);
        }
    };

    if hash != owner.content_hash {
        let _ = tokio::fs::remove_file(&staging).await;
        bail!(
            "content hash mismatch (expected {}, got {})",
            owner.content_hash.to_hex(),
            hash.to_hex()
        );
    }
    tokio::fs::rename(&staging, &target)
        .await
        .with_context(|| format!("failed to move download to {}", target.display()))?;

    Ok(Fetched {
        path: target,
        peer_id: owner.peer_id.to_string(),
        size_bytes,
    })
}

async fn write_body(response: reqwest::Response, staging: &Path) -> Result<(u64, ContentHash)> {
    let mut file = tokio::fs::File::create(staging)
        .await
        .with_context(|| format!("failed to create {}", staging.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut written = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("transfer interrupted")?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok((written, ContentHash::from(hasher.finalize())))
}
