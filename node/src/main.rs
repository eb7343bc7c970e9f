use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use sharenet_files::MemoryIndexStore;
use sharenet_peer::PeerServer;
use sharenet_rpc::{bind_listener, serve, DirectoryState};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod settings;
mod version;

use settings::{DirectorySettings, LogSettings, PeerSettings};
use version::{git_commit_hash, SHARENET_VERSION};

fn init_logging(log: &LogSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    let registry = tracing_subscriber::registry().with(filter);
    match log.format.as_str() {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        "compact" => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    }
    .context("failed to initialise logging")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn apply_log_overrides(matches: &ArgMatches, log: &mut LogSettings) {
    if let Some(level) = matches.get_one::<String>("log-level") {
        log.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        log.format = format.clone();
    }
}

async fn run_directory(matches: &ArgMatches) -> Result<()> {
    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut settings = DirectorySettings::load(config_path)?;
    if let Some(listen) = matches.get_one::<String>("listen") {
        settings.listen = listen.clone();
    }
    if let Some(timeout) = matches.get_one::<u64>("peer-timeout") {
        settings.peer_timeout_secs = *timeout;
    }
    apply_log_overrides(matches, &mut settings.log);
    settings.validate()?;
    init_logging(&settings.log)?;

    info!(
        "Starting Sharenet directory {} ({})",
        SHARENET_VERSION,
        git_commit_hash()
    );
    if let Some(path) = &settings.config_path {
        info!("Loaded configuration from {}", path.display());
    }
    info!("Peer activity timeout: {}s", settings.peer_timeout_secs);

    let credentials = settings.credentials()?;
    if credentials.peer_count() == 0 {
        warn!("No peer_secrets configured; every peer request will be refused");
    } else {
        info!("Accepting {} registered peers", credentials.peer_count());
    }
    if !credentials.has_admin() {
        info!("No admin_token configured; peer removal is disabled");
    }

    let index = Arc::new(MemoryIndexStore::new(settings.peer_timeout_secs));
    let listener = bind_listener(&settings.listen).await?;
    let state = DirectoryState::new(index, credentials);
    serve(listener, state, shutdown_signal()).await?;

    info!("Sharenet directory shutdown complete");
    Ok(())
}

async fn run_peer(matches: &ArgMatches) -> Result<()> {
    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut settings = PeerSettings::load(config_path)?;
    let peer = &mut settings.peer;
    if let Some(listen) = matches.get_one::<String>("listen") {
        peer.listen = listen.clone();
    }
    if let Some(url) = matches.get_one::<String>("public-url") {
        peer.public_url = Some(url.clone());
    }
    if let Some(url) = matches.get_one::<String>("directory-url") {
        peer.directory_url = url.clone();
    }
    if let Some(peer_id) = matches.get_one::<String>("peer-id") {
        peer.peer_id = peer_id.clone();
    }
    if let Some(username) = matches.get_one::<String>("username") {
        peer.username = username.clone();
    }
    if let Some(dir) = matches.get_one::<String>("shared-dir") {
        peer.shared_dir = dir.into();
    }
    if let Some(secs) = matches.get_one::<u64>("heartbeat-interval") {
        peer.heartbeat_interval_secs = *secs;
    }
    apply_log_overrides(matches, &mut settings.log);
    settings.validate()?;
    init_logging(&settings.log)?;

    let peer = &settings.peer;
    info!(
        "Starting Sharenet peer {} {} ({})",
        peer.peer_id,
        SHARENET_VERSION,
        git_commit_hash()
    );
    if let Some(path) = &settings.config_path {
        info!("Loaded configuration from {}", path.display());
    }
    info!("Shared folder: {}", peer.shared_dir.display());
    info!("Directory: {}", peer.directory_url);

    let directory = peer
        .directory_client()
        .context("failed to create directory client")?;
    let server = PeerServer::bind(peer, Arc::new(directory)).await?;
    server.serve(shutdown_signal()).await?;

    info!("Sharenet peer shutdown complete");
    Ok(())
}

async fn check_status(url: &str, health_path: &str) -> Result<()> {
    let mut path = health_path.to_string();
    if !path.starts_with('/') {
        path = format!("/{path}");
    }
    let url = format!("{}{}", url.trim_end_matches('/'), path);
    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    let status = response.status();
    let body = response.text().await?;
    println!("GET {url} -> {status}");
    println!("{body}");
    if status.is_success() {
        Ok(())
    } else {
        anyhow::bail!("Health check failed with status {status}")
    }
}

fn cli() -> Command {
    Command::new("sharenet-node")
        .version(SHARENET_VERSION)
        .about("Sharenet directory and peer node")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (defaults to config/<role>.toml when present)")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level filter, overridden by RUST_LOG")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["json", "pretty", "compact"])
                .global(true),
        )
        .subcommand(
            Command::new("directory")
                .about("Run the central directory")
                .arg(
                    Arg::new("listen")
                        .short('l')
                        .long("listen")
                        .value_name("ADDR")
                        .help("Socket address to bind"),
                )
                .arg(
                    Arg::new("peer-timeout")
                        .long("peer-timeout")
                        .value_name("SECS")
                        .value_parser(value_parser!(u64))
                        .help("Seconds without a submission or heartbeat before a peer is reported inactive"),
                ),
        )
        .subcommand(
            Command::new("peer")
                .about("Run a peer sharing a local folder")
                .arg(Arg::new("listen").short('l').long("listen").value_name("ADDR"))
                .arg(
                    Arg::new("public-url")
                        .long("public-url")
                        .value_name("URL")
                        .help("Base URL advertised to the directory"),
                )
                .arg(
                    Arg::new("directory-url")
                        .long("directory-url")
                        .value_name("URL"),
                )
                .arg(Arg::new("peer-id").long("peer-id").value_name("ID"))
                .arg(Arg::new("username").long("username").value_name("NAME"))
                .arg(
                    Arg::new("shared-dir")
                        .long("shared-dir")
                        .value_name("DIR"),
                )
                .arg(
                    Arg::new("heartbeat-interval")
                        .long("heartbeat-interval")
                        .value_name("SECS")
                        .value_parser(value_parser!(u64))
                        .help("Seconds between directory heartbeats, 0 to disable"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Query a running node's health endpoint")
                .arg(
                    Arg::new("url")
                        .long("url")
                        .value_name("URL")
                        .default_value("http://127.0.0.1:5000"),
                )
                .arg(
                    Arg::new("health-path")
                        .long("health-path")
                        .value_name("PATH")
                        .default_value("/health"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("directory", sub)) => run_directory(sub).await,
        Some(("peer", sub)) => run_peer(sub).await,
        Some(("status", sub)) => {
            let url = sub
                .get_one::<String>("url")
                .map(String::as_str)
                .unwrap_or("http://127.0.0.1:5000");
            let health_path = sub
                .get_one::<String>("health-path")
                .map(String::as_str)
                .unwrap_or("/health");
            check_status(url, health_path).await
        }
        _ => anyhow::bail!("a subcommand is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        cli().debug_assert();
    }

    #[test]
    fn global_flags_reach_subcommands() {
        let matches = cli()
            .try_get_matches_from([
                "sharenet-node",
                "--log-format",
                "json",
                "peer",
                "--peer-id",
                "peer-a",
                "--shared-dir",
                "/tmp/share",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "peer");
        assert_eq!(sub.get_one::<String>("log-format").unwrap(), "json");
        assert_eq!(sub.get_one::<String>("peer-id").unwrap(), "peer-a");
    }

    #[test]
    fn heartbeat_interval_flag() {
        let matches = cli()
            .try_get_matches_from(["sharenet-node", "peer", "--heartbeat-interval", "0"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(sub.get_one::<u64>("heartbeat-interval"), Some(&0));
    }

    #[test]
    fn directory_timeout_parses_as_number() {
        let result = cli().try_get_matches_from([
            "sharenet-node",
            "directory",
            "--peer-timeout",
            "soon",
        ]);
        assert!(result.is_err());
    }
}
