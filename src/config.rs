//! Server configuration.
//!
//! Every setting has a default; environment variables (optionally from a
//! `.env` file) override them:
//!
//! | Variable | Default |
//! |---|---|
//! | `BIND_ADDR` | `0.0.0.0` |
//! | `PORT` | `5000` |
//! | `STORAGE_PATH` | unset: in-memory store |
//! | `STORAGE_CACHE_MB` | `256` |
//! | `MAX_PEERS_PER_ROOM` | `50` |
//! | `COMPACTION_UPDATES` | `64` |
//! | `COMPACTION_BYTES` | `262144` |
//! | `SNAPSHOT_INTERVAL_SECS` | `30` |
//! | `SESSION_TIMEOUT_SECS` | `300` |
//! | `CLEANUP_INTERVAL_SECS` | `60` |
//! | `PERSIST_RETRY_BASE_MS` | `100` |
//! | `PERSIST_RETRY_MAX_MS` | `10000` |
//! | `PERSIST_RETRY_ATTEMPTS` | `6` |
//! | `AUTH_SECRET` | unset: everyone may join |
//! | `AUTH_ISSUER` | unset |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::auth::{AccessError, AccessPolicy, JwtAccess, JwtConfig, OpenAccess};
use crate::storage::StorageConfig;
use crate::sync::SyncServerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("Invalid auth configuration: {0}")]
    Auth(#[from] AccessError),
}

/// Everything the binary needs to start
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Sled database path; `None` keeps everything in memory
    pub storage_path: Option<String>,
    /// Sled page cache in bytes
    pub cache_size: u64,
    pub sync: SyncServerConfig,
    /// Token verification; `None` admits everyone anonymously
    pub auth: Option<JwtConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5000),
            storage_path: None,
            cache_size: 256 * 1024 * 1024,
            sync: SyncServerConfig::default(),
            auth: None,
        }
    }
}

impl ServerConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read the configuration through `lookup`, which maps variable names to values
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let ip: IpAddr = parse(&lookup, "BIND_ADDR")?.unwrap_or(config.bind_addr.ip());
        let port: u16 = parse(&lookup, "PORT")?.unwrap_or(config.bind_addr.port());
        config.bind_addr = SocketAddr::new(ip, port);

        config.storage_path = lookup("STORAGE_PATH").filter(|p| !p.trim().is_empty());
        if let Some(mb) = parse::<u64>(&lookup, "STORAGE_CACHE_MB")? {
            config.cache_size = mb * 1024 * 1024;
        }

        let room = &mut config.sync.room;
        if let Some(max) = parse(&lookup, "MAX_PEERS_PER_ROOM")? {
            room.max_peers = max;
        }
        if let Some(n) = parse(&lookup, "COMPACTION_UPDATES")? {
            room.compaction_updates = n;
        }
        if let Some(n) = parse(&lookup, "COMPACTION_BYTES")? {
            room.compaction_bytes = n;
        }
        if let Some(secs) = parse(&lookup, "SNAPSHOT_INTERVAL_SECS")? {
            room.snapshot_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, "PERSIST_RETRY_BASE_MS")? {
            room.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "PERSIST_RETRY_MAX_MS")? {
            room.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse::<u32>(&lookup, "PERSIST_RETRY_ATTEMPTS")? {
            room.retry.max_attempts = attempts.max(1);
        }

        if let Some(secs) = parse(&lookup, "SESSION_TIMEOUT_SECS")? {
            config.sync.session_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "CLEANUP_INTERVAL_SECS")? {
            config.sync.cleanup_interval = Duration::from_secs(secs);
        }

        if let Some(secret) = lookup("AUTH_SECRET").filter(|s| !s.is_empty()) {
            let mut auth = JwtConfig::new(secret);
            if let Some(issuer) = lookup("AUTH_ISSUER") {
                auth = auth.with_issuer(issuer);
            }
            auth.validate()?;
            config.auth = Some(auth);
        }

        Ok(config)
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<String>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn with_sync(mut self, sync: SyncServerConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_auth(mut self, auth: JwtConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Sled settings, if a storage path is configured
    pub fn storage_config(&self) -> Option<StorageConfig> {
        self.storage_path
            .as_ref()
            .map(|path| StorageConfig::new(path.clone()).with_cache_size(self.cache_size))
    }

    /// Access policy for joins
    pub fn access_policy(&self) -> Result<Arc<dyn AccessPolicy>, AccessError> {
        match &self.auth {
            Some(auth) => Ok(Arc::new(JwtAccess::new(auth.clone())?)),
            None => Ok(Arc::new(OpenAccess)),
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
