use crate::error::{ServerError, ServerResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How connection descriptors are registered with epoll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// One read or write per readiness event.
    Level,
    /// Every event is drained until the socket would block.
    #[default]
    Edge,
}

impl TriggerMode {
    #[inline]
    pub fn is_edge(self) -> bool {
        self == TriggerMode::Edge
    }
}

impl FromStr for TriggerMode {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "edge" | "et" => Ok(TriggerMode::Edge),
            "level" | "lt" => Ok(TriggerMode::Level),
            other => Err(ServerError::Config(format!("unknown trigger mode `{}`", other))),
        }
    }
}

/// Logging sink configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset (default: info)
    pub level: String,

    /// Write daily rolling files here instead of stdout.
    pub dir: Option<PathBuf>,

    /// Lines buffered for the writer thread before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            queue_capacity: 1024,
        }
    }
}

/// Server configuration, loaded from `WEBSERV_*` environment variables
/// (with `.env` support) and overridable from the command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 9006); 0 picks an ephemeral port.
    pub port: u16,

    pub trigger_mode: TriggerMode,

    /// Idle timeout per connection in milliseconds (default: 60000)
    pub timeout_ms: u64,

    /// Worker threads (default: one per CPU)
    pub workers: usize,

    /// Document root for static resources (default: ./resources)
    pub root_dir: PathBuf,

    /// Linger up to one second on close so queued output is not discarded.
    pub open_linger: bool,

    /// Connections beyond this are told the server is busy and dropped.
    pub max_connections: usize,

    /// Pin each worker thread to a CPU core.
    pub pin_workers: bool,

    /// Handles in the user-store pool (default: 12)
    pub user_pool_size: usize,

    /// Optional JSON file of `{"user": "password"}` seeded into the store.
    pub users_file: Option<PathBuf>,

    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9006,
            trigger_mode: TriggerMode::Edge,
            timeout_ms: 60_000,
            workers: num_cpus::get(),
            root_dir: PathBuf::from("./resources"),
            open_linger: false,
            max_connections: 65_536,
            pin_workers: false,
            user_pool_size: 12,
            users_file: None,
            log: LogConfig::default(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("WEBSERV_{}", key)).ok()
}

fn env_parse<T: FromStr>(key: &str, default: T) -> ServerResult<T> {
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ServerError::Config(format!("WEBSERV_{} has invalid value `{}`", key, raw))),
        None => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env_var(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        None => default,
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> ServerResult<Self> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();

        let d = Self::default();
        let config = Self {
            host: env_var("HOST").unwrap_or(d.host),
            port: env_parse("PORT", d.port)?,
            trigger_mode: match env_var("TRIGGER_MODE") {
                Some(v) => v.parse()?,
                None => d.trigger_mode,
            },
            timeout_ms: env_parse("TIMEOUT_MS", d.timeout_ms)?,
            workers: env_parse("WORKERS", d.workers)?,
            root_dir: env_var("ROOT_DIR").map(PathBuf::from).unwrap_or(d.root_dir),
            open_linger: env_flag("OPEN_LINGER", d.open_linger),
            max_connections: env_parse("MAX_CONNECTIONS", d.max_connections)?,
            pin_workers: env_flag("PIN_WORKERS", d.pin_workers),
            user_pool_size: env_parse("USER_POOL_SIZE", d.user_pool_size)?,
            users_file: env_var("USERS_FILE").map(PathBuf::from).or(d.users_file),
            log: LogConfig {
                level: env_var("LOG_LEVEL").unwrap_or(d.log.level),
                dir: env_var("LOG_DIR").map(PathBuf::from).or(d.log.dir),
                queue_capacity: env_parse("LOG_QUEUE_CAPACITY", d.log.queue_capacity)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.workers == 0 {
            return Err(ServerError::Config("workers must be at least 1".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ServerError::Config("timeout_ms must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be at least 1".into()));
        }
        if self.user_pool_size == 0 {
            return Err(ServerError::Config("user_pool_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Get the full listen address.
    pub fn server_addr(&self) -> ServerResult<SocketAddr> {
        let raw = if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };
        raw.parse()
            .map_err(|_| ServerError::Config(format!("invalid listen address `{}`", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = ServerConfig::default();
        c.validate().unwrap();
        assert_eq!(c.port, 9006);
        assert!(c.trigger_mode.is_edge());
        assert_eq!(c.timeout(), Duration::from_secs(60));
        assert_eq!(c.server_addr().unwrap(), "0.0.0.0:9006".parse().unwrap());
    }

    #[test]
    fn ipv6_host_is_bracketed() {
        let c = ServerConfig {
            host: "::1".into(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(c.server_addr().unwrap(), "[::1]:8080".parse().unwrap());
    }

    #[test]
    fn trigger_mode_parsing() {
        assert_eq!("ET".parse::<TriggerMode>().unwrap(), TriggerMode::Edge);
        assert_eq!("level".parse::<TriggerMode>().unwrap(), TriggerMode::Level);
        assert!("sideways".parse::<TriggerMode>().is_err());
    }

    #[test]
    fn deserializes_partial_json() {
        let c: ServerConfig = serde_json::from_str(
            r#"{"port": 0, "trigger_mode": "level", "log": {"level": "debug"}}"#,
        )
        .unwrap();
        assert_eq!(c.port, 0);
        assert_eq!(c.trigger_mode, TriggerMode::Level);
        assert_eq!(c.log.level, "debug");
        assert_eq!(c.log.queue_capacity, 1024);
        assert_eq!(c.user_pool_size, 12);
    }

    #[test]
    fn zero_workers_rejected() {
        let c = ServerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(ServerError::Config(_))));
    }
}
