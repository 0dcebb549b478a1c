//! Node configuration.
//!
//! Loaded from JSON (a file named by `KEYWARD_CONFIG`, or a string), with a
//! few `KEYWARD_*` environment overrides on top.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use keyward_accounts::ServerLimits;
use keyward_auth::TrustConfig;
use keyward_core::{KeyKind, PublicKey, TrustResult};
use keyward_observability::LoggingConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(String),
    #[error("config parse: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Node name; used as the origin of cluster messages.
    pub server_name: String,
    /// Trusted operator public keys.
    pub trusted_operators: Vec<String>,
    /// Self-signed operator JWTs. Their signing keys are trusted as well.
    pub operator_jwts: Vec<String>,
    pub system_account: Option<String>,
    pub limits: ServerLimits,
    pub resolver: ResolverConfig,
    /// Account claims stored into the resolver on start.
    pub resolver_preload: BTreeMap<String, String>,
    pub jetstream: Option<JetStreamConfig>,
    /// Minimum gap between expiry-triggered refetches of one account.
    pub refresh_debounce_ms: u64,
    /// How long an issued connect nonce stays redeemable.
    pub nonce_ttl_ms: u64,
    pub logging: LoggingConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            server_name: format!("keyward-{}", uuid::Uuid::now_v7().simple()),
            trusted_operators: Vec::new(),
            operator_jwts: Vec::new(),
            system_account: None,
            limits: ServerLimits::default(),
            resolver: ResolverConfig::default(),
            resolver_preload: BTreeMap::new(),
            jetstream: None,
            refresh_debounce_ms: 1000,
            nonce_ttl_ms: 60_000,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResolverConfig {
    Memory {
        #[serde(default)]
        preload: BTreeMap<String, String>,
    },
    Url {
        url: String,
        #[serde(default = "default_url_timeout_ms")]
        timeout_ms: u64,
    },
    Directory(DirectoryConfig),
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig::Memory {
            preload: BTreeMap::new(),
        }
    }
}

fn default_url_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryMode {
    #[default]
    Full,
    Cache,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub dir: PathBuf,
    pub mode: DirectoryMode,
    /// Digest exchange period (full mode).
    pub interval_ms: u64,
    /// Entry lifetime (cache mode).
    pub ttl_ms: u64,
    /// Maximum number of stored claims.
    pub limit: usize,
    /// Cluster lookup timeout (cache mode) and digest reply window.
    pub request_timeout_ms: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("jwt"),
            mode: DirectoryMode::Full,
            interval_ms: 120_000,
            ttl_ms: 3_600_000,
            limit: 1000,
            request_timeout_ms: 1000,
        }
    }
}

impl DirectoryConfig {
    pub fn new(dir: impl Into<PathBuf>, mode: DirectoryMode) -> Self {
        Self {
            dir: dir.into(),
            mode,
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = millis(interval);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = millis(ttl);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = millis(timeout);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Server-side JetStream capacity shared by all accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct JetStreamConfig {
    pub max_memory: i64,
    pub max_store: i64,
}

impl Options {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Load from the file named by `KEYWARD_CONFIG` (defaults when unset),
    /// then apply `KEYWARD_SERVER_NAME`, `KEYWARD_RESOLVER_URL` and
    /// `KEYWARD_RESOLVER_DIR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut options = match std::env::var("KEYWARD_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(format!("{path}: {e}")))?;
                Self::from_json_str(&text)?
            }
            Err(_) => Self::default(),
        };
        if let Ok(name) = std::env::var("KEYWARD_SERVER_NAME") {
            options.server_name = name;
        }
        if let Ok(url) = std::env::var("KEYWARD_RESOLVER_URL") {
            options.resolver = ResolverConfig::Url {
                url,
                timeout_ms: default_url_timeout_ms(),
            };
        }
        if let Ok(dir) = std::env::var("KEYWARD_RESOLVER_DIR") {
            options.resolver = ResolverConfig::Directory(DirectoryConfig::new(dir, DirectoryMode::Full));
        }
        options.validate()?;
        Ok(options)
    }

    pub fn with_operator(mut self, operator: &PublicKey) -> Self {
        self.trusted_operators.push(operator.to_string());
        self
    }

    pub fn with_operator_jwt(mut self, jwt: impl Into<String>) -> Self {
        self.operator_jwts.push(jwt.into());
        self
    }

    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_limits(mut self, limits: ServerLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_preload(mut self, account: &PublicKey, jwt: impl Into<String>) -> Self {
        self.resolver_preload.insert(account.to_string(), jwt.into());
        self
    }

    pub fn with_jetstream(mut self, config: JetStreamConfig) -> Self {
        self.jetstream = Some(config);
        self
    }

    pub fn with_refresh_debounce(mut self, debounce: Duration) -> Self {
        self.refresh_debounce_ms = millis(debounce);
        self
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }

    pub fn with_nonce_ttl(mut self, ttl: Duration) -> Self {
        self.nonce_ttl_ms = millis(ttl);
        self
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_millis(self.nonce_ttl_ms)
    }

    /// Preloaded claims from both the top-level map and a memory resolver's own.
    pub fn preload(&self) -> impl Iterator<Item = (&String, &String)> {
        let own = match &self.resolver {
            ResolverConfig::Memory { preload } => Some(preload.iter()),
            _ => None,
        };
        self.resolver_preload.iter().chain(own.into_iter().flatten())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server_name.is_empty() {
            return Err(ConfigError::Invalid("server_name must not be empty".into()));
        }
        match &self.resolver {
            ResolverConfig::Url { url, .. } if !(url.starts_with("http://") || url.starts_with("https://")) => {
                Err(ConfigError::Invalid(format!("resolver url {url:?} is not http(s)")))
            }
            ResolverConfig::Directory(d) if d.limit == 0 => {
                Err(ConfigError::Invalid("directory limit must be positive".into()))
            }
            _ => Ok(()),
        }
    }

    /// Trust roots described by this configuration.
    pub fn trust_config(&self, now: DateTime<Utc>) -> TrustResult<TrustConfig> {
        let mut trust = TrustConfig::from_operator_jwts(&self.operator_jwts, now)?;
        let keys = self
            .trusted_operators
            .iter()
            .map(|s| PublicKey::parse_kind(s, KeyKind::Operator))
            .collect::<TrustResult<Vec<_>>>()?;
        for key in keys {
            trust = trust.with_operator(key);
        }
        if let Some(sys) = &self.system_account {
            trust = trust.with_system_account(PublicKey::parse_kind(sys, KeyKind::Account)?);
        }
        Ok(trust)
    }
}
