//! Sharenet command line client.
//!
//! Talks to one peer's HTTP surface. Tokens from `login` are remembered per
//! peer so `fetch` can download straight from whichever peer owns a file.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{multipart, Client, RequestBuilder, Response};
use serde_json::{json, Value};
use sharenet_types::{normalize_address, QueryResponse, SearchResult};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod fetch;
mod session;

use session::SessionStore;

#[derive(Parser)]
#[command(name = "sharenet-cli")]
#[command(about = "Sharenet peer command line client", long_about = None)]
#[command(version)]
struct Cli {
    /// Base URL of the peer to talk to
    #[arg(long, alias = "peer", default_value = "http://localhost:8001")]
    peer_url: String,

    /// Bearer token; defaults to the one saved by `login` for this peer
    #[arg(long)]
    token: Option<String>,

    /// Where login tokens are kept
    #[arg(long, default_value = ".sharenet-sessions.json")]
    session_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Peer liveness and counters
    Health,
    /// Log in to the peer and remember the token
    Login {
        #[arg(long)]
        peer_id: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// End the current session
    Logout,
    /// Search every peer's files through the directory
    Search {
        query: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Find a file and download it from the first owner that serves it
    Fetch {
        filename: String,
        /// Directory to save into
        #[arg(long, short, default_value = ".")]
        output: PathBuf,
    },
    /// Upload a local file into the peer's shared folder
    Upload { path: PathBuf },
    /// Submit the peer's files to the directory
    Index {
        /// Rescan the shared folder first
        #[arg(long)]
        force: bool,
    },
    /// Tell the directory the peer is still up
    Heartbeat,
    /// Rescan the shared folder without submitting
    Scan,
    /// Files the peer currently shares
    Files,
    /// Peers known to the directory
    Network,
}

struct PeerClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl PeerClient {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        match &self.token {
            Some(token) => Ok(request.bearer_auth(token)),
            None => bail!(
                "not logged in to {}; run `sharenet-cli --peer-url {} login ...` first",
                self.base_url,
                self.base_url
            ),
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let request = self.authorized(self.client.get(self.url(path)))?;
        read_json(request.send().await?).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let request = self.authorized(self.client.post(self.url(path)))?;
        read_json(request.json(body).send().await?).await
    }
}

async fn read_json(response: Response) -> Result<Value> {
    let status = response.status();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    if status.is_success() {
        Ok(body)
    } else {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());
        bail!("request failed (status {}): {}", status, message)
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let base_url = normalize_address(&cli.peer_url)
        .with_context(|| format!("invalid peer url {:?}", cli.peer_url))?;
    let mut sessions = SessionStore::load(&cli.session_file)?;
    let token = cli
        .token
        .clone()
        .or_else(|| sessions.token_for(&base_url).map(str::to_string));
    let peer = PeerClient {
        client: Client::new(),
        base_url,
        token,
    };

    match cli.command {
        Commands::Health => {
            let response = peer.client.get(peer.url("/health")).send().await?;
            print_json(&read_json(response).await?)
        }
        Commands::Login {
            peer_id,
            username,
            password,
        } => {
            let response = peer
                .client
                .post(peer.url("/login"))
                .json(&json!({
                    "peer_id": peer_id,
                    "username": username,
                    "password": password,
                }))
                .send()
                .await?;
            let body = read_json(response).await?;
            let token = body
                .get("token")
                .and_then(Value::as_str)
                .context("login response carried no token")?;
            sessions.set(&peer.base_url, token)?;
            println!("Logged in to {}", peer.base_url);
            match body["index"]["status"].as_str() {
                Some("indexed") => println!("Indexed {} files", body["index"]["files_indexed"]),
                _ => println!(
                    "Indexing failed: {}",
                    body["index"]["error"].as_str().unwrap_or("unknown error")
                ),
            }
            Ok(())
        }
        Commands::Logout => {
            let result = peer.post("/logout", &json!({})).await;
            sessions.remove(&peer.base_url)?;
            result?;
            println!("Logged out of {}", peer.base_url);
            Ok(())
        }
        Commands::Search { query, limit } => {
            let body = peer
                .post("/search", &json!({ "query": query, "limit": limit }))
                .await?;
            let response: QueryResponse = serde_json::from_value(body)
                .context("unexpected search response")?;
            print_results(&response.results);
            Ok(())
        }
        Commands::Fetch { filename, output } => {
            fetch_file(&peer, &sessions, &filename, &output).await
        }
        Commands::Upload { path } => upload_file(&peer, &path).await,
        Commands::Index { force } => {
            print_json(&peer.post("/index", &json!({ "force_rescan": force })).await?)
        }
        Commands::Heartbeat => print_json(&peer.post("/heartbeat", &json!({})).await?),
        Commands::Scan => print_json(&peer.post("/scan", &json!({})).await?),
        Commands::Files => print_json(&peer.get("/files").await?),
        Commands::Network => print_json(&peer.get("/network").await?),
    }
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No matches");
        return;
    }
    println!("{} matches", results.len());
    for result in results {
        println!(
            "  {}  {} bytes  peer {}  {}",
            result.filename, result.size_bytes, result.peer_id, result.download_url
        );
    }
}

async fn fetch_file(
    peer: &PeerClient,
    sessions: &SessionStore,
    filename: &str,
    output: &Path,
) -> Result<()> {
    let body = peer
        .post("/search", &json!({ "query": filename }))
        .await?;
    let response: QueryResponse =
        serde_json::from_value(body).context("unexpected search response")?;
    let owners: Vec<SearchResult> = response
        .results
        .into_iter()
        .filter(|result| result.filename == filename)
        .collect();
    if owners.is_empty() {
        bail!("no peer shares a file named {filename:?}");
    }

    let fetched = fetch::fetch_from_owners(&peer.client, &owners, sessions, output).await?;
    println!(
        "Saved {} ({} bytes from {})",
        fetched.path.display(),
        fetched.size_bytes,
        fetched.peer_id
    );
    Ok(())
}

async fn upload_file(peer: &PeerClient, path: &Path) -> Result<()> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?
        .to_string();
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let form = multipart::Form::new().part(
        "file",
        multipart::Part::bytes(content).file_name(filename),
    );
    let request = peer.authorized(peer.client.post(peer.url("/upload")))?;
    let report = read_json(request.multipart(form).send().await?).await?;
    print_json(&report)
}
