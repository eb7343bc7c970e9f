use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File as ConfigFile};
use sharenet_peer::PeerConfig;
use sharenet_rpc::DirectoryCredentials;
use sharenet_types::PeerId;

/// Environment prefix, e.g. `SHARENET_LISTEN`.
pub const ENV_PREFIX: &str = "SHARENET";

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub format: String,
}

impl LogSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            level: get_string_value(config, &["log_level", "log.level"])
                .unwrap_or_else(|| "info".to_string()),
            format: get_string_value(config, &["log_format", "log.format"])
                .unwrap_or_else(|| "pretty".to_string()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.format.as_str() {
            "json" | "pretty" | "compact" => Ok(()),
            other => bail!("log_format must be json, pretty or compact, got {other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectorySettings {
    pub listen: String,
    pub peer_timeout_secs: u64,
    /// Peer id to shared secret; only listed peers may use the directory.
    pub peer_secrets: Vec<(String, String)>,
    /// Bearer token for admin routes. Admin routes are closed when unset.
    pub admin_token: Option<String>,
    pub log: LogSettings,
    pub config_path: Option<PathBuf>,
}

impl DirectorySettings {
    pub fn load(config_path_override: Option<&str>) -> Result<Self> {
        let (config, config_path) = load_layers("directory", config_path_override)?;
        Ok(Self {
            listen: get_string_value(&config, &["listen"])
                .unwrap_or_else(|| "0.0.0.0:5000".to_string()),
            peer_timeout_secs: get_u64_value(&config, &["peer_timeout_secs"], 300)?,
            peer_secrets: get_map_value(&config, "peer_secrets")?,
            admin_token: get_string_value(&config, &["admin_token"]),
            log: LogSettings::from_config(&config),
            config_path,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            bail!("listen must not be empty");
        }
        for (peer_id, secret) in &self.peer_secrets {
            if let Err(err) = PeerId::parse(peer_id) {
                bail!("invalid peer id {:?} in peer_secrets: {}", peer_id, err);
            }
            if secret.is_empty() {
                bail!("secret for peer {peer_id:?} cannot be empty");
            }
        }
        self.log.validate()
    }

    pub fn credentials(&self) -> Result<DirectoryCredentials> {
        let mut credentials = DirectoryCredentials::new();
        for (peer_id, secret) in &self.peer_secrets {
            let peer_id = PeerId::parse(peer_id)
                .with_context(|| format!("invalid peer id {peer_id:?} in peer_secrets"))?;
            credentials.add_peer(peer_id, secret);
        }
        if let Some(token) = &self.admin_token {
            credentials = credentials.with_admin(token);
        }
        Ok(credentials)
    }
}

#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub peer: PeerConfig,
    pub log: LogSettings,
    pub config_path: Option<PathBuf>,
}

impl PeerSettings {
    pub fn load(config_path_override: Option<&str>) -> Result<Self> {
        let (config, config_path) = load_layers("peer", config_path_override)?;
        let defaults = PeerConfig::default();

        let allowed_extensions = match get_list_value(&config, "allowed_extensions") {
            Some(list) => list,
            None => defaults.allowed_extensions.clone(),
        };

        let mut security = defaults.security.clone();
        security.session_ttl_secs =
            get_u64_value(&config, &["session_ttl_secs"], security.session_ttl_secs)?;
        security.max_login_attempts = u32::try_from(get_u64_value(
            &config,
            &["max_login_attempts"],
            u64::from(security.max_login_attempts),
        )?)
        .context("max_login_attempts is out of range")?;
        security.lockout_secs = get_u64_value(&config, &["lockout_secs"], security.lockout_secs)?;

        let peer = PeerConfig {
            listen: get_string_value(&config, &["listen"]).unwrap_or(defaults.listen),
            public_url: get_string_value(&config, &["public_url"]),
            directory_url: get_string_value(&config, &["directory_url"])
                .unwrap_or(defaults.directory_url),
            directory_secret: get_string_value(&config, &["directory_secret"])
                .unwrap_or_default(),
            peer_id: get_string_value(&config, &["peer_id"]).unwrap_or(defaults.peer_id),
            username: get_string_value(&config, &["username"]).unwrap_or(defaults.username),
            password: get_string_value(&config, &["password"]).unwrap_or_default(),
            shared_dir: get_string_value(&config, &["shared_dir"])
                .map(PathBuf::from)
                .unwrap_or(defaults.shared_dir),
            allowed_extensions,
            max_file_size: get_u64_value(&config, &["max_file_size"], defaults.max_file_size)?,
            directory_timeout_ms: get_u64_value(
                &config,
                &["directory_timeout_ms"],
                defaults.directory_timeout_ms,
            )?,
            heartbeat_interval_secs: get_u64_value(
                &config,
                &["heartbeat_interval_secs"],
                defaults.heartbeat_interval_secs,
            )?,
            security,
        };

        Ok(Self {
            peer,
            log: LogSettings::from_config(&config),
            config_path,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.peer.validate()?;
        self.log.validate()
    }
}

/// Optional TOML file (explicit path, else `config/<role>.toml` when present)
/// overlaid with `SHARENET_*` environment variables.
fn load_layers(role: &str, config_path_override: Option<&str>) -> Result<(Config, Option<PathBuf>)> {
    let resolved_path = match config_path_override {
        Some(path) => {
            let path = PathBuf::from(path);
            if !path.exists() {
                bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        }
        None => {
            let path = Path::new("config").join(format!("{role}.toml"));
            path.exists().then_some(path)
        }
    };

    let mut builder = Config::builder();
    if let Some(path) = &resolved_path {
        builder = builder.add_source(ConfigFile::from(path.as_path()));
    }
    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX));

    let config = builder
        .build()
        .context("failed to load configuration")?;
    Ok((config, resolved_path))
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_u64_value(config: &Config, keys: &[&str], default: u64) -> Result<u64> {
    for key in keys {
        if let Ok(value) = config.get_int(key) {
            return u64::try_from(value).with_context(|| format!("{key} must not be negative"));
        }
        if let Some(raw) = get_string_value(config, &[key]) {
            return raw
                .parse::<u64>()
                .with_context(|| format!("{key} must be an unsigned integer, got {raw:?}"));
        }
    }
    Ok(default)
}

/// A TOML array or a comma separated string. An explicitly empty value
/// yields an empty list.
fn get_list_value(config: &Config, key: &str) -> Option<Vec<String>> {
    if let Ok(values) = config.get_array(key) {
        return Some(
            values
                .into_iter()
                .filter_map(|value| value.into_string().ok())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect(),
        );
    }
    config.get_string(key).ok().map(|raw| {
        raw.split(',')
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect()
    })
}

/// A TOML table of strings, or `key=value` pairs separated by commas as
/// environment variables carry them. Sorted by key.
fn get_map_value(config: &Config, key: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    if let Ok(table) = config.get_table(key) {
        for (name, value) in table {
            let value = value
                .into_string()
                .with_context(|| format!("{key}.{name} must be a string"))?;
            pairs.push((name.trim().to_string(), value.trim().to_string()));
        }
    } else if let Some(raw) = get_string_value(config, &[key]) {
        for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (name, value) = entry
                .split_once('=')
                .with_context(|| format!("{key} entries must look like id=secret, got {entry:?}"))?;
            pairs.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    pairs.sort();
    Ok(pairs)
}
