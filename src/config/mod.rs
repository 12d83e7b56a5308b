use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api_server: ServerConfig,
    pub cache: CacheConfig,
    pub analytics: AnalyticsConfig,
    pub scheduler: SchedulerConfig,
    pub pagination: PaginationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./linkpulse.db".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: u64,
    /// Upper bound on any single cache operation
    pub op_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            op_timeout_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Secret salt for visitor hashing. Random per process when unset.
    pub visitor_salt: Option<String>,
    /// Visitor sets above this size switch to HyperLogLog
    pub exact_visitor_threshold: usize,
    /// Raw events older than this are purged by the cleanup job
    pub retention_days: i64,
    /// How often the server folds newly stored events into visitor counts
    pub visitor_sync_secs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            visitor_salt: None,
            exact_visitor_threshold: 10_000,
            retention_days: 730,
            visitor_sync_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Links processed concurrently within one rollup run
    pub concurrency: usize,
    pub link_timeout_secs: u64,
    /// Run history entries kept in memory
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 4,
            link_timeout_secs: 30,
            history_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PaginationConfig {
    /// HMAC secret for event paging cursors. Random per process when unset.
    pub cursor_hmac_secret: Option<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_defaults = DatabaseConfig::default();
        let database_url = std::env::var("DATABASE_URL").unwrap_or(database_defaults.url);
        let max_connections =
            env_or("DATABASE_MAX_CONNECTIONS", database_defaults.max_connections)?;

        let server_defaults = ServerConfig::default();
        let api_host = std::env::var("API_HOST").unwrap_or(server_defaults.host);
        let api_port = env_or("API_PORT", server_defaults.port)?;

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            enabled: env_flag("CACHE_ENABLED", cache_defaults.enabled),
            max_entries: env_or("CACHE_MAX_ENTRIES", cache_defaults.max_entries)?,
            op_timeout_ms: env_or("CACHE_TIMEOUT_MS", cache_defaults.op_timeout_ms)?,
        };

        let visitor_salt = std::env::var("VISITOR_SALT").ok();
        if visitor_salt.is_none() {
            tracing::warn!(
                "VISITOR_SALT is not set; using a random salt, visitor ids will change on restart"
            );
        }
        let analytics_defaults = AnalyticsConfig::default();
        let analytics = AnalyticsConfig {
            visitor_salt,
            exact_visitor_threshold: env_or(
                "VISITOR_EXACT_THRESHOLD",
                analytics_defaults.exact_visitor_threshold,
            )?,
            retention_days: env_or("EVENT_RETENTION_DAYS", analytics_defaults.retention_days)?,
            visitor_sync_secs: env_or("VISITOR_SYNC_SECS", analytics_defaults.visitor_sync_secs)?
                .max(1),
        };

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            enabled: env_flag("SCHEDULER_ENABLED", scheduler_defaults.enabled),
            concurrency: env_or("SCHEDULER_CONCURRENCY", scheduler_defaults.concurrency)?.max(1),
            link_timeout_secs: env_or(
                "SCHEDULER_LINK_TIMEOUT_SECS",
                scheduler_defaults.link_timeout_secs,
            )?,
            history_limit: env_or("SCHEDULER_HISTORY_LIMIT", scheduler_defaults.history_limit)?,
        };

        Ok(Config {
            database: DatabaseConfig {
                url: database_url,
                max_connections,
            },
            api_server: ServerConfig {
                host: api_host,
                port: api_port,
            },
            cache,
            analytics,
            scheduler,
            pagination: PaginationConfig {
                cursor_hmac_secret: std::env::var("CURSOR_HMAC_SECRET").ok(),
            },
        })
    }
}
