//! Process configuration loaded from environment variables.
//!
//! Required variables must be present and valid or startup fails with the
//! variable's name. Everything else has a default.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | required |
//! | `DATABASE_MAX_CONNECTIONS` | 5 |
//! | `BROKER_URL` / `REDIS_URL` | required |
//! | `BROKER_STREAM` | `ledgersync:jobs` |
//! | `BROKER_GROUP` | `ledgersync-workers` |
//! | `BROKER_VISIBILITY_TIMEOUT_SECS` | 3600 |
//! | `BROKER_MAX_DELIVERIES` | 5 |
//! | `POLL_INTERVAL_MS` | 2000 |
//! | `POLL_BATCH_LIMIT` | unbounded |
//! | `WATERMARK_FLOOR` | 0 |
//! | `WATERMARK_COMMIT` | `batch` |
//! | `WATERMARK_START` | `committed` |
//! | `POLLER_NAME` | `audit-log` |
//! | `WORKER_CONCURRENCY` | 3 |
//! | `WORKER_IDLE_BACKOFF_MS` | 500 |
//! | `DEFAULT_ACCOUNT_CODE_ID` | unset |

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use ledgersync_core::{AuditId, EntityKind, SurrogateId};

use crate::cdc::{CommitMode, PollerConfig, StartPosition};
use crate::jobs::WorkerPoolConfig;
use crate::reconcile::SurrogateKeyResolver;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub stream: String,
    pub group: String,
    pub visibility_timeout: Duration,
    pub max_deliveries: u32,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub poller: PollerConfig,
    pub worker: WorkerPoolConfig,
    /// Surrogate id substituted for unknown account codes.
    pub default_account_code: Option<SurrogateId>,
}

/// Reads variables through a lookup function so tests never touch the
/// process environment.
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &str) -> Result<String, ConfigError> {
        self.get(var)
            .ok_or_else(|| ConfigError::MissingVar(var.to_string()))
    }

    fn parsed<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(var)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    var: var.to_string(),
                    message: format!("{raw:?}: {e}"),
                })
            })
            .transpose()
    }

    fn parsed_or<T>(&self, var: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parsed(var)?.unwrap_or(default))
    }

    fn positive<T>(&self, var: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default,
        T::Err: Display,
    {
        let value = self.parsed_or(var, default)?;
        if value <= T::default() {
            return Err(ConfigError::InvalidValue {
                var: var.to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };

        let database = DatabaseConfig {
            url: vars.required("DATABASE_URL")?,
            max_connections: vars.positive("DATABASE_MAX_CONNECTIONS", 5u32)?,
        };

        let broker_url = match vars.get("BROKER_URL") {
            Some(url) => url,
            None => vars
                .get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingVar("BROKER_URL".to_string()))?,
        };
        let broker = BrokerConfig {
            url: broker_url,
            stream: vars
                .get("BROKER_STREAM")
                .unwrap_or_else(|| "ledgersync:jobs".to_string()),
            group: vars
                .get("BROKER_GROUP")
                .unwrap_or_else(|| "ledgersync-workers".to_string()),
            visibility_timeout: Duration::from_secs(
                vars.positive("BROKER_VISIBILITY_TIMEOUT_SECS", 3600u64)?,
            ),
            max_deliveries: vars.positive("BROKER_MAX_DELIVERIES", 5u32)?,
        };

        let floor: i64 = vars.parsed_or("WATERMARK_FLOOR", 0)?;
        if floor < 0 {
            return Err(ConfigError::InvalidValue {
                var: "WATERMARK_FLOOR".to_string(),
                message: "must not be negative".to_string(),
            });
        }
        let poller = PollerConfig {
            name: vars
                .get("POLLER_NAME")
                .unwrap_or_else(|| "audit-log".to_string()),
            interval: Duration::from_millis(vars.positive("POLL_INTERVAL_MS", 2000u64)?),
            batch_limit: match vars.get("POLL_BATCH_LIMIT") {
                Some(_) => Some(vars.positive("POLL_BATCH_LIMIT", 1u32)?),
                None => None,
            },
            floor: AuditId::new(floor),
            commit: vars.parsed_or("WATERMARK_COMMIT", CommitMode::Batch)?,
            start: vars.parsed_or("WATERMARK_START", StartPosition::Committed)?,
        };

        let worker = WorkerPoolConfig::default()
            .with_concurrency(vars.positive("WORKER_CONCURRENCY", 3usize)?)
            .with_idle_backoff(Duration::from_millis(
                vars.positive("WORKER_IDLE_BACKOFF_MS", 500u64)?,
            ));

        Ok(Self {
            database,
            broker,
            poller,
            worker,
            default_account_code: vars.parsed("DEFAULT_ACCOUNT_CODE_ID")?,
        })
    }

    /// Resolver carrying the configured defaults; fails when a soft
    /// dependency has no default.
    pub fn resolver(&self) -> Result<SurrogateKeyResolver, ConfigError> {
        let mut resolver = SurrogateKeyResolver::new();
        if let Some(id) = self.default_account_code {
            resolver = resolver.with_default(EntityKind::AccountCode, id);
        }
        resolver.validate().map_err(|e| ConfigError::InvalidValue {
            var: "DEFAULT_ACCOUNT_CODE_ID".to_string(),
            message: e.to_string(),
        })?;
        Ok(resolver)
    }
}
