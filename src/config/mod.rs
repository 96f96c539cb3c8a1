//! Service configuration.
//!
//! ```rust,no_run
//! use billing_agent::config::BillingConfig;
//! use rust_decimal_macros::dec;
//!
//! # fn example() -> Result<(), billing_agent::config::ConfigError> {
//! let config = BillingConfig::builder()
//!     .endpoint("wss://billing.example.com/agent")
//!     .credential("agent-token")
//!     .allowed_origin("*.example.com")
//!     .price("search", dec!(5))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::env;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use url::Url;

use crate::billing::{PricingTable, PricingTableBuilder};
use crate::channel::{ChannelConfig, DEFAULT_RECONNECT_DELAY};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(5);

const ENV_ENDPOINT: &str = "BILLING_SERVER_URL";
const ENV_CREDENTIAL: &str = "BILLING_TOKEN";
const ENV_ALLOWED_ORIGINS: &str = "BILLING_ALLOWED_ORIGINS";
const ENV_SYNC_INTERVAL: &str = "BILLING_SYNC_INTERVAL_SECS";
const ENV_PRICING: &str = "BILLING_PRICING";

const ENDPOINT_SCHEMES: &[&str] = &["ws", "wss", "http", "https"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {key}")]
    Missing { key: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug)]
pub struct BillingConfig {
    pub endpoint: Url,
    pub credential: SecretString,
    pub allowed_origins: Vec<String>,
    pub pricing: PricingTable,
    pub sync_interval: Duration,
    pub reconnect_delay: Duration,
}

impl BillingConfig {
    pub fn builder() -> BillingConfigBuilder {
        BillingConfigBuilder::new()
    }

    /// Reads `BILLING_SERVER_URL`, `BILLING_TOKEN`, `BILLING_ALLOWED_ORIGINS`,
    /// `BILLING_SYNC_INTERVAL_SECS` and `BILLING_PRICING`.
    pub fn from_env() -> ConfigResult<Self> {
        BillingConfigBuilder::new().with_env()?.build()
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig::new(self.endpoint.clone(), self.credential.clone())
            .reconnect_delay(self.reconnect_delay)
    }
}

#[derive(Debug, Default)]
pub struct BillingConfigBuilder {
    endpoint: Option<String>,
    credential: Option<SecretString>,
    allowed_origins: Vec<String>,
    pricing: PricingTableBuilder,
    sync_interval: Option<Duration>,
    reconnect_delay: Option<Duration>,
}

impl BillingConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    pub fn credential(mut self, token: impl Into<String>) -> Self {
        self.credential = Some(SecretString::from(token.into()));
        self
    }

    pub fn allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    pub fn allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins
            .extend(origins.into_iter().map(Into::into));
        self
    }

    pub fn price(mut self, category: impl Into<String>, credits: Decimal) -> Self {
        self.pricing = self.pricing.price(category, credits);
        self
    }

    pub fn pricing(mut self, pricing: PricingTableBuilder) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    /// Fills unset fields from the environment.
    pub fn with_env(mut self) -> ConfigResult<Self> {
        if self.endpoint.is_none() {
            self.endpoint = env::var(ENV_ENDPOINT).ok();
        }
        if self.credential.is_none() {
            self.credential = env::var(ENV_CREDENTIAL).ok().map(SecretString::from);
        }
        if let Ok(origins) = env::var(ENV_ALLOWED_ORIGINS) {
            self.allowed_origins.extend(
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            );
        }
        if self.sync_interval.is_none()
            && let Ok(raw) = env::var(ENV_SYNC_INTERVAL)
        {
            let secs = raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: ENV_SYNC_INTERVAL.into(),
                message: e.to_string(),
            })?;
            self.sync_interval = Some(Duration::from_secs(secs));
        }
        if let Ok(raw) = env::var(ENV_PRICING) {
            self.pricing = self.pricing.from_json(&raw)?;
        }
        Ok(self)
    }

    pub fn build(self) -> ConfigResult<BillingConfig> {
        let raw_endpoint = self.endpoint.ok_or_else(|| ConfigError::Missing {
            key: "endpoint".into(),
        })?;
        let endpoint = Url::parse(&raw_endpoint).map_err(|e| ConfigError::InvalidValue {
            key: "endpoint".into(),
            message: e.to_string(),
        })?;
        if !ENDPOINT_SCHEMES.contains(&endpoint.scheme()) {
            return Err(ConfigError::InvalidValue {
                key: "endpoint".into(),
                message: format!("unsupported scheme '{}'", endpoint.scheme()),
            });
        }

        let credential = self
            .credential
            .filter(|c| !c.expose_secret().trim().is_empty())
            .ok_or_else(|| ConfigError::Missing {
                key: "credential".into(),
            })?;

        let sync_interval = self.sync_interval.unwrap_or(DEFAULT_SYNC_INTERVAL);
        if sync_interval < MIN_SYNC_INTERVAL {
            return Err(ConfigError::InvalidValue {
                key: "sync_interval".into(),
                message: format!(
                    "{:?} is below the {:?} minimum",
                    sync_interval, MIN_SYNC_INTERVAL
                ),
            });
        }

        let pricing = self.pricing.build()?;
        if pricing.is_empty() {
            tracing::warn!("No pricing categories configured; every charge will be denied");
        }

        Ok(BillingConfig {
            endpoint,
            credential,
            allowed_origins: self.allowed_origins,
            pricing,
            sync_interval,
            reconnect_delay: self.reconnect_delay.unwrap_or(DEFAULT_RECONNECT_DELAY),
        })
    }
}
