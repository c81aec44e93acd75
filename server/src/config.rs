use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// KhanaSathi realtime relay server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(
    name = "khanasathi-server",
    version,
    about = "KhanaSathi order tracking and chat relay"
)]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "KHANASATHI_PORT", default_value = "5000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "KHANASATHI_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./khanasathi.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "KHANASATHI_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, JWT key)
    #[arg(long, env = "KHANASATHI_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Allowed browser origin for CORS; any origin when unset
    #[arg(long, env = "KHANASATHI_CORS_ORIGIN")]
    pub cors_origin: Option<String>,

    /// Socket tuning (loaded from [realtime] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// Heartbeat and chat limits for WebSocket connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Seconds between server pings (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before closing (default: 10)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    /// Maximum chat message length in characters (default: 4000)
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    /// Maximum attachment URLs per message (default: 10)
    #[serde(default = "default_max_attachments")]
    pub max_attachments: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            max_message_length: default_max_message_length(),
            max_attachments: default_max_attachments(),
        }
    }
}

impl RealtimeConfig {
    /// Zero intervals would spin the ping task or close every socket at once.
    pub fn validate(&self) -> Result<(), String> {
        if self.ping_interval_secs == 0 {
            return Err("realtime.ping_interval_secs must be at least 1".into());
        }
        if self.pong_timeout_secs == 0 {
            return Err("realtime.pong_timeout_secs must be at least 1".into());
        }
        if self.max_message_length == 0 {
            return Err("realtime.max_message_length must be at least 1".into());
        }
        Ok(())
    }
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    10
}

fn default_max_message_length() -> usize {
    4000
}

fn default_max_attachments() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            bind_address: "0.0.0.0".to_string(),
            config: "./khanasathi.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            cors_origin: None,
            realtime: RealtimeConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (KHANASATHI_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();
        let config: Config = Self::figment(&config_path, cli).extract()?;
        config.realtime.validate().map_err(figment::Error::from)?;
        Ok(config)
    }

    fn figment(config_path: &str, cli: Config) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("KHANASATHI_").split("__"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# KhanaSathi Relay Server Configuration
# Place this file at ./khanasathi.toml or specify with --config <path>
# All settings can be overridden via environment variables (KHANASATHI_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 5000)
# port = 5000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for SQLite database and JWT signing key
# data_dir = "./data"

# Allowed browser origin for CORS (default: any)
# cors_origin = "https://khanasathi.example"

# ---- Realtime (WebSocket relay) ----
# [realtime]

# Seconds between server pings, and how long to wait for the pong
# ping_interval_secs = 30
# pong_timeout_secs = 10

# Chat limits
# max_message_length = 4000
# max_attachments = 10
"#
    .to_string()
}
