use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use rand::RngCore;
use serde::Deserialize;

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
#[command(name = "live_chat", about = "Real-time chat backend")]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Path to the SQLite database file.
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Keep all data in memory; nothing survives a restart.
    #[arg(long)]
    pub ephemeral: bool,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// Database file, or `None` for an in-memory database.
    pub database_path: Option<PathBuf>,
    /// HS256 signing key for access tokens.
    pub jwt_secret: Vec<u8>,
    /// True when no secret was configured and one was generated.
    pub generated_secret: bool,
    pub token_ttl_hours: i64,
    /// Capacity of each connection's outbound event queue.
    pub outbound_buffer: usize,
    /// Per-frame socket write timeout.
    pub write_timeout_ms: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("logging_enabled", &self.logging_enabled)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"<redacted>")
            .field("token_ttl_hours", &self.token_ttl_hours)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("write_timeout_ms", &self.write_timeout_ms)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: format!("127.0.0.1:{}", default_port()),
            logging_enabled: default_logging(),
            database_path: None,
            jwt_secret: random_secret(),
            generated_secret: true,
            token_ttl_hours: default_ttl_hours(),
            outbound_buffer: default_outbound_buffer(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    database: FileDatabase,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    realtime: FileRealtime,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileDatabase {
    path: Option<PathBuf>,
}

#[derive(Deserialize)]
struct FileAuth {
    jwt_secret: Option<String>,
    #[serde(default = "default_ttl_hours")]
    token_ttl_hours: i64,
}

#[derive(Deserialize)]
struct FileRealtime {
    #[serde(default = "default_outbound_buffer")]
    outbound_buffer: usize,
    #[serde(default = "default_write_timeout_ms")]
    write_timeout_ms: u64,
}

fn default_port() -> u16 {
    8000
}

fn default_logging() -> bool {
    true
}

fn default_ttl_hours() -> i64 {
    24
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_write_timeout_ms() -> u64 {
    5000
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileAuth {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_hours: default_ttl_hours(),
        }
    }
}

impl Default for FileRealtime {
    fn default() -> Self {
        Self {
            outbound_buffer: default_outbound_buffer(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

fn random_secret() -> Vec<u8> {
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

fn decode_secret(raw: &str) -> Result<Vec<u8>> {
    let secret = STANDARD
        .decode(raw.trim())
        .context("jwt secret must be base64")?;
    if secret.is_empty() {
        anyhow::bail!("jwt secret must not be empty");
    }
    Ok(secret)
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("LIVE_CHAT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/live_chat.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };
        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut database = file_cfg.database.path.unwrap_or_else(default_database);
        let mut secret = file_cfg.auth.jwt_secret;

        // environment overrides
        if let Ok(p) = std::env::var("LIVE_CHAT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("LIVE_CHAT_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(d) = std::env::var("LIVE_CHAT_DATABASE") {
            if !d.is_empty() {
                database = PathBuf::from(d);
            }
        }
        if let Ok(s) = std::env::var("JWT_SECRET") {
            if !s.is_empty() {
                secret = Some(s);
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }
        if let Some(d) = &cli.database {
            database = d.clone();
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if file_cfg.auth.token_ttl_hours <= 0 {
            anyhow::bail!("token_ttl_hours must be positive");
        }
        if file_cfg.realtime.outbound_buffer == 0 || file_cfg.realtime.write_timeout_ms == 0 {
            anyhow::bail!("realtime limits must be positive");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let (jwt_secret, generated_secret) = match secret {
            Some(raw) => (decode_secret(&raw)?, false),
            None => (random_secret(), true),
        };

        Ok(Self {
            bind,
            logging_enabled: logging,
            database_path: (!cli.ephemeral).then_some(database),
            jwt_secret,
            generated_secret,
            token_ttl_hours: file_cfg.auth.token_ttl_hours,
            outbound_buffer: file_cfg.realtime.outbound_buffer,
            write_timeout_ms: file_cfg.realtime.write_timeout_ms,
        })
    }

    pub fn token_ttl(&self) -> time::Duration {
        time::Duration::hours(self.token_ttl_hours)
    }

    pub fn write_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.write_timeout_ms)
    }
}

/// Default database location.
pub fn default_database() -> PathBuf {
    PathBuf::from("data/live_chat.db")
}
