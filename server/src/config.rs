use clap::{parser::ValueSource, CommandFactory, FromArgMatches, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::RetryPolicy;

/// Murmur realtime presence and delivery server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "murmur-server", version, about = "Murmur realtime presence and delivery server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "MURMUR_PORT", default_value = "5000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "MURMUR_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./murmur.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "MURMUR_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, signing key)
    #[arg(long, env = "MURMUR_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Shared HS256 secret used by the token issuer. When unset, a random key
    /// is generated and kept in the data directory.
    #[arg(long, env = "MURMUR_JWT_SECRET", hide_env_values = true)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,

    /// Presence sweep configuration (loaded from [presence] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceConfig>,

    /// Handshake configuration (loaded from [handshake] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeConfig>,

    /// Store retry configuration (loaded from [retry] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

/// Configuration for the stale-presence sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Interval in seconds between sweeps (default: 300 = 5 minutes)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds without activity before an online record is stale (default: 600 = 10 minutes)
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_stale_after() -> u64 {
    600
}

/// Configuration for the socket authentication handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Seconds allowed for credential verification (default: 10)
    #[serde(default = "default_handshake_timeout")]
    pub timeout_secs: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_handshake_timeout(),
        }
    }
}

fn default_handshake_timeout() -> u64 {
    10
}

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds (default: 100)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay in milliseconds (default: 2000)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    2000
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            bind_address: "0.0.0.0".to_string(),
            config: "./murmur.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            jwt_secret: None,
            presence: None,
            handshake: None,
            retry: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (MURMUR_*) < CLI args
    ///
    /// Only flags actually given on the command line take part in the last
    /// layer, so clap's own defaults never mask the TOML file.
    pub fn load() -> Result<Self, figment::Error> {
        let matches = Config::command().get_matches();
        let cli = Config::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
        let explicit = |id: &str| matches.value_source(id) == Some(ValueSource::CommandLine);

        let mut figment = Self::figment(&cli.config)
            .merge(Serialized::default("config", &cli.config))
            .merge(Serialized::default("generate_config", cli.generate_config));
        if explicit("port") {
            figment = figment.merge(Serialized::default("port", cli.port));
        }
        if explicit("bind_address") {
            figment = figment.merge(Serialized::default("bind_address", &cli.bind_address));
        }
        if explicit("json_logs") {
            figment = figment.merge(Serialized::default("json_logs", cli.json_logs));
        }
        if explicit("data_dir") {
            figment = figment.merge(Serialized::default("data_dir", &cli.data_dir));
        }
        if let (true, Some(secret)) = (explicit("jwt_secret"), &cli.jwt_secret) {
            figment = figment.merge(Serialized::default("jwt_secret", secret));
        }
        figment.extract()
    }

    fn figment(config_path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("MURMUR_").split("__"))
    }

    pub fn presence(&self) -> PresenceConfig {
        self.presence.clone().unwrap_or_default()
    }

    /// Period between presence sweeps, at least one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.presence().sweep_interval_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake.clone().unwrap_or_default().timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry.clone().unwrap_or_default())
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Murmur Server Configuration
# Place this file at ./murmur.toml or specify with --config <path>
# All settings can be overridden via environment variables (MURMUR_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 5000)
# port = 5000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and generated signing key
# data_dir = "./data"

# HS256 secret shared with the token issuer.
# Leave unset to generate one in data_dir on first boot.
# jwt_secret = ""

# ---- Presence ----
# [presence]
# sweep_interval_secs = 300   # How often stale online records are swept (min 1)
# stale_after_secs = 600      # Inactivity before a record counts as stale

# ---- Socket Handshake ----
# [handshake]
# timeout_secs = 10           # Credential verification deadline

# ---- Store Retries ----
# [retry]
# max_attempts = 3            # Attempts per store call, including the first
# base_delay_ms = 100         # First backoff delay, doubled per retry
# max_delay_ms = 2000         # Cap on any single backoff delay
"#
    .to_string()
}
