use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use exists_verifier_notify::{BrokerSettings, Exchange};
use serde::{Deserialize, Serialize};

const DEFAULT_BROKER_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SettleUnits {
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl SettleUnits {
    #[must_use]
    pub fn micros_per_unit(self) -> i64 {
        match self {
            Self::Microseconds => 1,
            Self::Milliseconds => 1_000,
            Self::Seconds => 1_000_000,
            Self::Minutes => 60_000_000,
            Self::Hours => 3_600_000_000,
            Self::Days => 86_400_000_000,
            Self::Weeks => 604_800_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RabbitConfig {
    #[serde(default)]
    pub durable_queue: bool,
    pub host: String,
    pub port: u16,
    pub userid: String,
    pub password: String,
    pub virtual_host: String,
    pub exchange_name: String,
    #[serde(default)]
    pub routing_keys: Option<Vec<String>>,
    #[serde(default = "default_broker_timeout_ms")]
    pub timeout_ms: u64,
}

impl RabbitConfig {
    #[must_use]
    pub fn exchange(&self) -> Exchange {
        Exchange::topic(&self.exchange_name, self.durable_queue)
    }

    #[must_use]
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            host: self.host.clone(),
            port: self.port,
            userid: self.userid.clone(),
            password: self.password.clone(),
            virtual_host: self.virtual_host.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

fn default_broker_timeout_ms() -> u64 {
    DEFAULT_BROKER_TIMEOUT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifierConfig {
    /// Seconds between ticks.
    pub tick_time: u64,
    pub settle_time: u64,
    pub settle_units: SettleUnits,
    pub pool_size: usize,
    #[serde(default)]
    pub enable_notifications: bool,
    #[serde(default)]
    pub rabbit: Option<RabbitConfig>,
}

impl VerifierConfig {
    /// Load a JSON or YAML (by `.yaml`/`.yml` extension) configuration file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
        let config: Self = if is_yaml {
            serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse YAML config {}", path.display()))?
        } else {
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse JSON config {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.tick_time == 0 {
            return Err(anyhow!("tick_time must be at least 1 second"));
        }
        if self.pool_size == 0 {
            return Err(anyhow!("pool_size must be at least 1"));
        }
        if self.enable_notifications && self.rabbit.is_none() {
            return Err(anyhow!("enable_notifications requires a rabbit block"));
        }
        self.settle_duration()?;
        Ok(())
    }

    /// Grace period before an exists record becomes eligible.
    ///
    /// # Errors
    /// Returns an error when `settle_time` overflows in the configured unit.
    pub fn settle_duration(&self) -> Result<time::Duration> {
        let amount = i64::try_from(self.settle_time).context("settle_time is too large")?;
        let micros = amount
            .checked_mul(self.settle_units.micros_per_unit())
            .ok_or_else(|| anyhow!("settle_time overflows in {:?}", self.settle_units))?;
        Ok(time::Duration::microseconds(micros))
    }

    #[must_use]
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_time)
    }

    /// Broker settings when notifications are enabled.
    #[must_use]
    pub fn notifications(&self) -> Option<&RabbitConfig> {
        if self.enable_notifications {
            self.rabbit.as_ref()
        } else {
            None
        }
    }
}
