//! Error types for the moderation system
//!
//! Most of these are recoverable per event and end up in the event's outcome.
//! Only [`ModerationError::CorruptState`] is surfaced to the caller as fatal.

use thiserror::Error;

/// Failures of an external classifier call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    /// The classifier did not answer before its deadline
    #[error("Signal timed out")]
    Timeout,

    /// The classifier could not be reached
    #[error("Signal unavailable: {0}")]
    Unavailable(String),

    /// A failure worth retrying
    #[error("Transient signal failure: {0}")]
    Transient(String),
}

impl SignalError {
    /// Whether another attempt may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient(_))
    }
}

/// Errors that can occur while enforcing an action
#[derive(Debug, Error)]
pub enum EnforcementError {
    /// The target vanished before the action could run
    #[error("Target no longer exists: {0}")]
    TargetGone(String),

    /// Discord API error
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<poise::serenity_prelude::Error>),

    /// Action validation failed
    #[error("Action validation failed: {0}")]
    ValidationFailed(String),

    /// Generic error
    #[error("Enforcement error: {0}")]
    Other(String),
}

impl From<poise::serenity_prelude::Error> for EnforcementError {
    fn from(error: poise::serenity_prelude::Error) -> Self {
        Self::DiscordApi(Box::new(error))
    }
}

impl From<String> for EnforcementError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A policy or the engine config failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Reading or writing a configuration file failed
    #[error("Configuration I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A glob pattern for policy discovery was malformed
    #[error("Invalid policy path pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Errors that escape the moderation pipeline
#[derive(Debug, Error)]
pub enum ModerationError {
    /// Internal state is inconsistent; this is a defect, not a per-event condition
    #[error("Corrupt moderation state: {0}")]
    CorruptState(String),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Enforcement error
    #[error(transparent)]
    Enforcement(#[from] EnforcementError),
}

/// Result type for enforcement operations
pub type EnforcementResult<T> = Result<T, EnforcementError>;

/// Result type for moderation operations
pub type ModerationResult<T> = Result<T, ModerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SignalError::Timeout;
        assert_eq!(error.to_string(), "Signal timed out");

        let error = EnforcementError::TargetGone("message 42".to_string());
        assert_eq!(error.to_string(), "Target no longer exists: message 42");

        let error = EnforcementError::from("Something went wrong".to_string());
        assert_eq!(error.to_string(), "Enforcement error: Something went wrong");

        let error = ModerationError::from(ConfigError::Invalid("bad thresholds".to_string()));
        assert_eq!(error.to_string(), "Invalid configuration: bad thresholds");

        let error = ModerationError::from(EnforcementError::TargetGone("member 7".to_string()));
        assert_eq!(error.to_string(), "Target no longer exists: member 7");
    }

    #[test]
    fn test_signal_retryable() {
        assert!(SignalError::Timeout.is_retryable());
        assert!(SignalError::Transient("503".to_string()).is_retryable());
        assert!(!SignalError::Unavailable("connection refused".to_string()).is_retryable());
    }
}
