use dotenv::dotenv;
use once_cell::sync::Lazy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub jwt_secret: String,
    pub session_ttl_hours: i64,
    pub sse_ping_secs: u64,
    pub subscriber_buffer: usize,
    pub tombstone_horizon_days: i64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("log_level", &self.log_level)
            .field("jwt_secret", &"<redacted>")
            .field("session_ttl_hours", &self.session_ttl_hours)
            .field("sse_ping_secs", &self.sse_ping_secs)
            .field("subscriber_buffer", &self.subscriber_buffer)
            .field("tombstone_horizon_days", &self.tombstone_horizon_days)
            .finish()
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    fn from_env() -> Self {
        dotenv().ok();

        Self {
            port: parsed("PORT", 8050),
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| "secret".to_string()), // Use a secure secret in production
            session_ttl_hours: parsed("SESSION_TTL_HOURS", 24 * 7),
            sse_ping_secs: parsed("SSE_PING_SECS", 30),
            subscriber_buffer: parsed("SUBSCRIBER_BUFFER", 64),
            tombstone_horizon_days: parsed("TOMBSTONE_HORIZON_DAYS", 30),
        }
    }
}

pub static CONFIG: Lazy<Config> = Lazy::new(Config::from_env);
