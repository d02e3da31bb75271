use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use shopsync_core::{EngineConfig, RetryPolicy};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct ShopifyConfig {
    pub shop: String,
    pub access_token: String,
    pub api_version: String,
    /// Overrides `https://{shop}`; used for proxies and local fakes
    pub api_base_url: Option<String>,
}

impl fmt::Debug for ShopifyConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ShopifyConfig")
            .field("shop", &self.shop)
            .field("access_token", &"[REDACTED]")
            .field("api_version", &self.api_version)
            .field("api_base_url", &self.api_base_url)
            .finish()
    }
}

/// Which external store the engine talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalBackend {
    Shopify(ShopifyConfig),
    /// In-process store; nothing survives a restart
    Memory,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub backend: ExternalBackend,
    pub external_timeout: Duration,
    pub retry: RetryPolicy,
    /// `None` disables the periodic sweep
    pub sweep_interval: Option<Duration>,
    pub operation_lease: Duration,
    pub operation_retention: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "SHOPSYNC_BIND_ADDR", "127.0.0.1:8080");
        let database_path =
            PathBuf::from(value_or_default(&lookup, "SHOPSYNC_DATABASE_PATH", "shopsync.db"));

        let backend = match value_or_default(&lookup, "EXTERNAL_BACKEND", "shopify")
            .to_ascii_lowercase()
            .as_str()
        {
            "shopify" => ExternalBackend::Shopify(parse_shopify_config(&lookup)?),
            "memory" => ExternalBackend::Memory,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "EXTERNAL_BACKEND must be `shopify` or `memory`, got `{other}`"
                )))
            }
        };

        let external_timeout_secs =
            parse_in_range(&lookup, "EXTERNAL_TIMEOUT_SECS", "10", 1..=120)?;

        let max_attempts = parse_in_range(&lookup, "RETRY_MAX_ATTEMPTS", "5", 1..=20)?;
        let base_delay_ms = parse_in_range(&lookup, "RETRY_BASE_DELAY_MS", "200", 0..=60_000)?;
        let max_delay_ms = parse_in_range(&lookup, "RETRY_MAX_DELAY_MS", "5000", 0..=300_000)?;
        if max_delay_ms < base_delay_ms {
            return Err(ConfigError::Invalid(
                "RETRY_MAX_DELAY_MS must be >= RETRY_BASE_DELAY_MS".to_string(),
            ));
        }

        let sweep_interval_secs = value_or_default(&lookup, "SWEEP_INTERVAL_SECS", "300")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "SWEEP_INTERVAL_SECS must be 0 or an integer in [10, 86400]".to_string(),
                )
            })?;
        let sweep_interval = match sweep_interval_secs {
            0 => None,
            10..=86_400 => Some(Duration::from_secs(sweep_interval_secs)),
            _ => {
                return Err(ConfigError::Invalid(
                    "SWEEP_INTERVAL_SECS must be 0 or in [10, 86400]".to_string(),
                ))
            }
        };

        let operation_lease_secs =
            parse_in_range(&lookup, "OPERATION_LEASE_SECS", "60", 5..=3_600)?;
        let operation_retention_hours =
            parse_in_range(&lookup, "OPERATION_RETENTION_HOURS", "168", 1..=8_760)?;

        Ok(Self {
            bind_addr,
            database_path,
            backend,
            external_timeout: Duration::from_secs(external_timeout_secs),
            retry: RetryPolicy {
                max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
            },
            sweep_interval,
            operation_lease: Duration::from_secs(operation_lease_secs),
            operation_retention: Duration::from_secs(operation_retention_hours * 3_600),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: self.retry.clone(),
            external_timeout: self.external_timeout,
            operation_lease: self.operation_lease,
            operation_retention: self.operation_retention,
            ..EngineConfig::default()
        }
    }
}

fn parse_shopify_config(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ShopifyConfig, ConfigError> {
    let shop = required_trimmed(&lookup, "SHOPIFY_SHOP")?;
    if shop.contains("://") || shop.contains('/') {
        return Err(ConfigError::Invalid(
            "SHOPIFY_SHOP must be a bare host such as my-store.myshopify.com".to_string(),
        ));
    }
    let access_token = required_trimmed(&lookup, "SHOPIFY_ACCESS_TOKEN")?;
    let api_version = value_or_default(&lookup, "SHOPIFY_API_VERSION", "2024-01");

    let api_base_url = optional_trimmed(&lookup, "SHOPIFY_API_BASE_URL")
        .map(|value| trim_trailing(&value).to_string());
    if let Some(base) = api_base_url.as_deref() {
        let parsed = url::Url::parse(base).map_err(|_| {
            ConfigError::Invalid("SHOPIFY_API_BASE_URL must be an absolute URL".to_string())
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(
                "SHOPIFY_API_BASE_URL must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(ShopifyConfig {
        shop,
        access_token,
        api_version,
        api_base_url,
    })
}

fn parse_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
    range: RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let out_of_range = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = value_or_default(lookup, name, default)
        .parse::<u64>()
        .map_err(|_| out_of_range())?;
    if !range.contains(&value) {
        return Err(out_of_range());
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn trim_trailing(value: &str) -> &str {
    value.trim_end_matches('/')
}
