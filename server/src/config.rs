use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// murmur realtime chat server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "murmur-server", version, about = "murmur realtime chat server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "MURMUR_PORT", default_value = "8080")]
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

    /// Data directory for persistent state (message database, keys)
    #[arg(long, env = "MURMUR_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Redis URL for the recency cache, presence and pub/sub.
    /// Without it everything runs in-process on a single node.
    #[arg(long, env = "MURMUR_REDIS_URL")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,

    /// HS256 secret used to verify connection tokens.
    /// Falls back to a key file in the data directory.
    #[arg(long, env = "MURMUR_JWT_SECRET", hide_env_values = true)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,

    /// Per-connection limits (loaded from [session] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    /// Recency cache settings (loaded from [cache] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
}

/// Limits and timers applied to every WebSocket session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Outbound queue capacity; a full queue evicts the session (default: 256)
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Largest accepted inbound frame in bytes (default: 512 KiB)
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Seconds without a pong before the connection is considered dead (default: 60)
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,

    /// Seconds between keepalive pings; must be below pong_wait_secs (default: 54)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Deadline for a single outbound write (default: 10)
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            max_frame_bytes: 512 * 1024,
            pong_wait_secs: 60,
            ping_interval_secs: 54,
            write_wait_secs: 10,
        }
    }
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_max_frame_bytes() -> usize {
    512 * 1024
}

fn default_pong_wait() -> u64 {
    60
}

fn default_ping_interval() -> u64 {
    54
}

fn default_write_wait() -> u64 {
    10
}

/// Configuration for the per-conversation recency cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries kept per conversation, oldest evicted first (default: 100)
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Seconds a conversation stays cached after its last write (default: 86400)
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Messages replayed to a client when it connects (default: 50)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl_secs: 86_400,
            history_limit: 50,
        }
    }
}

fn default_cache_capacity() -> usize {
    100
}

fn default_cache_ttl() -> u64 {
    86_400
}

fn default_history_limit() -> usize {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./murmur.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            redis_url: None,
            jwt_secret: None,
            session: Some(SessionConfig::default()),
            cache: Some(CacheConfig::default()),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (MURMUR_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Self::figment(&config_path)
            .merge(Serialized::defaults(cli))
            .extract()
    }

    fn figment(config_path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("MURMUR_").split("__"))
    }

    pub fn session(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }

    pub fn cache(&self) -> CacheConfig {
        self.cache.clone().unwrap_or_default()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# murmur server configuration
# Place this file at ./murmur.toml or specify with --config <path>
# All settings can be overridden via environment variables (MURMUR_PORT,
# MURMUR_SESSION__OUTBOUND_CAPACITY, etc.) or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite message log and the token key file
# data_dir = "./data"

# Redis for the recency cache, presence flags and cross-node pub/sub.
# Leave unset to run everything in-process on a single node.
# redis_url = "redis://localhost:6379/0"

# HS256 secret shared with the service that issues login tokens.
# Defaults to the key file data_dir/jwt_secret (created on first boot).
# jwt_secret = ""

# ---- Sessions ----
# [session]
# outbound_capacity = 256     # queued payloads before a slow client is evicted
# max_frame_bytes = 524288    # 512 KiB
# pong_wait_secs = 60
# ping_interval_secs = 54
# write_wait_secs = 10

# ---- Recency cache ----
# [cache]
# capacity = 100              # entries per conversation
# ttl_secs = 86400            # 24 hours after the last write
# history_limit = 50          # messages replayed on connect
"#
    .to_string()
}
