//! Engine configuration
//!
//! Read once at startup from `config/moderation.yaml`. Every field has a
//! default, so a missing file or a partial file is fine.

use crate::moderation::filter::normalize::DEFAULT_REPEAT_THRESHOLD;
use crate::moderation::{ConfigError, POLICY_DIR, SignalSettings};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default location of the engine configuration
pub const CONFIG_FILE: &str = "config/moderation.yaml";

/// Process-wide settings of the moderation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline of one classifier call
    pub signal_timeout_ms: u64,
    pub signal_retries: u32,
    pub signal_backoff_ms: u64,
    /// Ceiling on one signal including every retry
    pub signal_deadline_ms: u64,
    /// Used when a guild sets no threshold of its own
    pub toxicity_threshold: f32,
    pub nsfw_threshold: f32,
    pub repeat_threshold: usize,
    /// How long an action on one target suppresses the same action
    pub bucket_window_secs: u64,
    pub audit_queue_capacity: usize,
    /// How often expired bucket slots and idle escalation states are dropped
    pub janitor_interval_secs: u64,
    /// Escalation states without a violation for this long are dropped
    pub escalation_idle_secs: u64,
    pub policy_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signal_timeout_ms: 1500,
            signal_retries: 2,
            signal_backoff_ms: 100,
            signal_deadline_ms: 2500,
            toxicity_threshold: 0.8,
            nsfw_threshold: 0.7,
            repeat_threshold: DEFAULT_REPEAT_THRESHOLD,
            bucket_window_secs: 10,
            audit_queue_capacity: 1024,
            janitor_interval_secs: 60,
            escalation_idle_secs: 7 * 24 * 60 * 60,
            policy_dir: POLICY_DIR.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load the configuration, falling back to defaults if the file is missing
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read, parsed or validated
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await? {
            info!(path = %path.display(), "No engine config found, using defaults");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signal_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "signal timeout must be positive".to_string(),
            ));
        }
        if self.signal_deadline_ms < self.signal_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "signal deadline {}ms is shorter than the signal timeout {}ms",
                self.signal_deadline_ms, self.signal_timeout_ms
            )));
        }
        for (name, value) in [
            ("toxicity", self.toxicity_threshold),
            ("nsfw", self.nsfw_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} threshold {value} is outside 0..=1"
                )));
            }
        }
        if self.repeat_threshold < 2 {
            return Err(ConfigError::Invalid(
                "repeat threshold must be at least 2".to_string(),
            ));
        }
        if self.bucket_window_secs == 0 || self.janitor_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "bucket window and janitor interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn signal_settings(&self) -> SignalSettings {
        SignalSettings {
            timeout: Duration::from_millis(self.signal_timeout_ms),
            retries: self.signal_retries,
            backoff: Duration::from_millis(self.signal_backoff_ms),
            deadline: Duration::from_millis(self.signal_deadline_ms),
            toxicity_threshold: self.toxicity_threshold,
            nsfw_threshold: self.nsfw_threshold,
        }
    }

    #[must_use]
    pub fn bucket_window(&self) -> Duration {
        Duration::from_secs(self.bucket_window_secs)
    }

    #[must_use]
    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    #[must_use]
    pub fn escalation_idle(&self) -> chrono::Duration {
        i64::try_from(self.escalation_idle_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}
