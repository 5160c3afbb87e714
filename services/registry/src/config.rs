//! Service configuration, read from a TOML file.
//!
//! ```toml
//! bind = "0.0.0.0:5000"
//!
//! [database]
//! url = "sqlite://registry.db"
//!
//! [storage.local]
//! path = "/var/lib/registry"
//!
//! [registry]
//! default-tag-limit = 100
//!
//! [export.plans]
//! community = 1000
//! enterprise = 100000
//!
//! [[tokens]]
//! token = "s3cret"
//! organization-id = "6f1f0a52-3f0e-4bde-9d57-0b8b2f1f9a11"
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use storage::StorageConfig;
use uuid::Uuid;

use crate::principal::{Principal, TokenAuthenticator};

/// Errors loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid configuration.
    #[error("parsing configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Top level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Address to listen on.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Blob storage backend.
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub export: ExportSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub sentry: SentryConfig,

    /// Static API tokens.
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory
}

impl Config {
    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// An authenticator accepting the configured tokens.
    pub fn authenticator(&self) -> TokenAuthenticator {
        self.tokens
            .iter()
            .fold(TokenAuthenticator::new(), |auth, token| {
                auth.with_token(token.token.clone(), token.principal())
            })
    }
}

/// Database connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
    /// sqlx SQLite URL.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://registry.db".to_owned(),
        }
    }
}

/// Protocol behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistrySettings {
    /// Tags per artifact for tenants without their own limit; `0` is unlimited.
    pub default_tag_limit: i64,

    /// Page size for tag and catalog listings when the client sends no `n`.
    pub page_size: usize,

    /// Largest blob accepted, in bytes, whether monolithic or chunked.
    pub max_blob_size: usize,

    /// Seconds an upload session may sit idle before it is discarded.
    pub upload_timeout_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_tag_limit: 0,
            page_size: 10_000,
            max_blob_size: 1 << 30,
            upload_timeout_secs: 3600,
        }
    }
}

impl RegistrySettings {
    /// How long an idle upload session is kept.
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

/// Pull log export limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ExportSettings {
    /// Rows for plans without an entry in `plans`.
    pub default_rows: i64,

    /// Rows per subscription plan.
    pub plans: HashMap<String, i64>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            default_rows: 10_000,
            plans: HashMap::new(),
        }
    }
}

impl ExportSettings {
    /// The export row cap for a plan.
    pub fn rows_for(&self, plan: &str) -> i64 {
        self.plans.get(plan).copied().unwrap_or(self.default_rows)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            format: LogFormat::Pretty,
        }
    }
}

/// Error reporting. Disabled without a DSN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SentryConfig {
    pub dsn: Option<String>,
    pub environment: Option<String>,
}

/// A static API token and the principal it authenticates as.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TokenConfig {
    pub token: String,
    pub organization_id: Uuid,
    #[serde(default)]
    pub customer_organization_id: Option<Uuid>,
    #[serde(default)]
    pub user_account_id: Option<Uuid>,
}

impl TokenConfig {
    fn principal(&self) -> Principal {
        match self.customer_organization_id {
            Some(customer) => {
                Principal::customer(self.organization_id, customer, self.user_account_id)
            }
            None => Principal::vendor(self.organization_id, self.user_account_id),
        }
    }
}
