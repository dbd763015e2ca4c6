//! Replication configuration models.
//!
//! Fixed at startup: the runtime wraps the loaded config in an `Arc` and never
//! mutates it.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use validator::{Validate, ValidationError};

use super::record::StoreId;

/// Connection settings for one of the two mirrored stores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct StoreConfig {
    /// Store identifier used in routing and logs
    #[validate(length(min = 1, max = 64))]
    pub id: String,
    /// `postgres://…`, `sqlite:<path>` / plain path, or `memory:`
    #[validate(length(min = 1))]
    pub url: String,
    /// Upper bound of pooled connections (PostgreSQL only)
    #[validate(range(min = 1_u32, max = 512_u32))]
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self { id: id.into(), url: url.into(), max_connections: default_max_connections() }
    }

    pub fn store_id(&self) -> StoreId {
        StoreId::new(self.id.clone())
    }

    /// URL with credentials masked, for display.
    pub fn redacted_url(&self) -> String {
        match (self.url.find("://"), self.url.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                format!("{}://***{}", &self.url[..scheme_end], &self.url[at..])
            },
            _ => self.url.clone(),
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct DispatchConfig {
    /// Number of replication workers
    #[validate(range(min = 1_usize, max = 256_usize))]
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pending tasks accepted before dispatch starts rejecting
    #[validate(range(min = 1_usize, max = 1_000_000_usize))]
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { workers: default_workers(), queue_capacity: default_queue_capacity() }
    }
}

/// Retry policy for transient target-store failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[validate(range(min = 1_u32, max = 10_u32))]
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on any single backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Top-level replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[validate(schema(function = "validate_store_pair"))]
pub struct SyncConfig {
    /// Authoritative store; also the fixed home of excluded namespaces
    #[validate(nested)]
    pub primary: StoreConfig,
    /// Mirror store
    #[validate(nested)]
    pub replica: StoreConfig,
    /// Namespaces that are never replicated (session state)
    #[serde(default = "default_excluded_namespaces")]
    pub excluded_namespaces: Vec<String>,
    #[validate(nested)]
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[validate(nested)]
    #[serde(default)]
    pub retry: RetryConfig,
    /// Bound on a single target-store transaction
    #[validate(range(min = 1_u64))]
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    /// Dead-letter database; defaults to the per-user data directory
    #[serde(default)]
    pub dead_letter_path: Option<String>,
}

impl SyncConfig {
    pub fn new(primary: StoreConfig, replica: StoreConfig) -> Self {
        Self {
            primary,
            replica,
            excluded_namespaces: default_excluded_namespaces(),
            dispatch: DispatchConfig::default(),
            retry: RetryConfig::default(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            dead_letter_path: None,
        }
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn is_excluded(&self, namespace: &str) -> bool {
        self.excluded_namespaces.iter().any(|ns| ns == namespace)
    }
}

fn validate_store_pair(config: &SyncConfig) -> Result<(), ValidationError> {
    if config.primary.id == config.replica.id {
        return Err(ValidationError::new("distinct_store_ids")
            .with_message(Cow::Borrowed("primary and replica store ids must differ")));
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return Err(ValidationError::new("retry_delay_order")
            .with_message(Cow::Borrowed("retry.base_delay_ms exceeds retry.max_delay_ms")));
    }
    Ok(())
}

fn default_max_connections() -> u32 {
    10
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_transaction_timeout_ms() -> u64 {
    10_000
}

fn default_excluded_namespaces() -> Vec<String> {
    vec!["sessions".to_string()]
}
