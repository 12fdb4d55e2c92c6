//! Layered configuration: compiled defaults, then `tutor-cadence.toml` (or an
//! explicit path), then `TUTOR_CADENCE_*` environment variables.

use std::path::Path;

use chrono::Duration;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::deficit::DecayPolicy;
use crate::error::{CadenceError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "tutor-cadence.toml";
const ENV_PREFIX: &str = "TUTOR_CADENCE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    /// Dispatch attempts before a job becomes terminally failed.
    pub max_attempts: u32,
    /// Delay before retry N is taken from entry N-1; the last entry repeats.
    pub backoff_secs: Vec<u64>,
    pub dispatch_timeout_secs: u64,
    /// A job left in `due` this long is picked up again by the next sweep.
    pub due_lease_secs: u64,
    pub progress_card_delay_hours: i64,
    pub sweep_interval_secs: u64,
    /// Jobs dispatched in parallel within one sweep.
    pub sweep_concurrency: usize,
    /// Used when the directory has no offset for a tutor.
    pub default_tutor_offset_minutes: i32,
    pub decay: DecayPolicy,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_secs: vec![60, 300, 1800],
            dispatch_timeout_secs: 30,
            due_lease_secs: 300,
            progress_card_delay_hours: 72,
            sweep_interval_secs: 60,
            sweep_concurrency: 8,
            default_tutor_offset_minutes: 0,
            decay: DecayPolicy::Manual,
        }
    }
}

impl CadenceConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(file))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::string(content)),
        )
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CadenceError::Config("max_attempts must be at least 1".into()));
        }
        if self.backoff_secs.is_empty() {
            return Err(CadenceError::Config("backoff_secs must not be empty".into()));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(CadenceError::Config(
                "dispatch_timeout_secs must be positive".into(),
            ));
        }
        if self.due_lease_secs <= self.dispatch_timeout_secs {
            return Err(CadenceError::Config(
                "due_lease_secs must exceed dispatch_timeout_secs".into(),
            ));
        }
        if self.progress_card_delay_hours < 0 {
            return Err(CadenceError::Config(
                "progress_card_delay_hours must not be negative".into(),
            ));
        }
        if self.sweep_concurrency == 0 {
            return Err(CadenceError::Config("sweep_concurrency must be at least 1".into()));
        }
        if let DecayPolicy::QuietWeeks { weeks: 0 } = self.decay {
            return Err(CadenceError::Config("decay weeks must be at least 1".into()));
        }
        Ok(())
    }

    /// Wait before the retry that follows failed attempt number `attempt`.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.backoff_secs.len() - 1);
        Duration::seconds(self.backoff_secs[index] as i64)
    }

    pub fn dispatch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn due_lease(&self) -> Duration {
        Duration::seconds(self.due_lease_secs as i64)
    }

    pub fn progress_card_delay(&self) -> Duration {
        Duration::hours(self.progress_card_delay_hours)
    }
}
