//! Per-guild moderation policy
//!
//! A [`TenantPolicy`] is validated when it is written and read as an immutable
//! snapshot for the whole processing of one event.

use crate::moderation::ConfigError;
use bitflags::bitflags;
use derive_more::Display;
use poise::serenity_prelude::{ChannelId, GuildId, RoleId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Longest timeout Discord accepts, in seconds (28 days)
pub const MAX_TIMEOUT_SECS: u32 = 28 * 24 * 60 * 60;

bitflags! {
    /// Signal categories a guild has switched on.
    ///
    /// The bit values are stored in guild configuration and must not change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CensorMethods: u32 {
        const MESSAGES = 1 << 0;
        const NAMES = 1 << 1;
        const REACTIONS = 1 << 2;
        const IMAGES = 1 << 3;
        const TOXICITY = 1 << 4;
        const PHISHING = 1 << 5;
        const OCR = 1 << 6;
    }
}

impl Serialize for CensorMethods {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for CensorMethods {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Ok(Self::from_bits_truncate(bits))
    }
}

/// Which signals an exception applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ExceptionScope {
    /// Every signal
    #[display("All Signals")]
    AllSignals,
    /// Matches against the guild's own term list
    #[display("Server Filter")]
    TextFilterOnly,
    /// Matches against the built-in term lists
    #[display("Pre-Built Filter")]
    PrebuiltFilterOnly,
}

/// An exemption rule, optionally narrowed to a role and/or a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    pub scope: ExceptionScope,
    #[serde(default)]
    pub role: Option<RoleId>,
    #[serde(default)]
    pub channel: Option<ChannelId>,
}

impl Exception {
    /// Exception covering a scope everywhere for everyone
    #[must_use]
    pub fn everywhere(scope: ExceptionScope) -> Self {
        Self {
            scope,
            role: None,
            channel: None,
        }
    }

    /// Narrow this exception to members holding `role`
    #[must_use]
    pub fn for_role(mut self, role: RoleId) -> Self {
        self.role = Some(role);
        self
    }

    /// Narrow this exception to one channel
    #[must_use]
    pub fn in_channel(mut self, channel: ChannelId) -> Self {
        self.channel = Some(channel);
        self
    }
}

/// Punishment applied once a user reaches a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum PunishmentKind {
    #[display("Timeout")]
    Timeout,
    #[display("Kick")]
    Kick,
    #[display("Ban")]
    Ban,
}

/// Escalation tiers, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, Default,
)]
pub enum Tier {
    #[default]
    #[display("Clean")]
    Clean,
    #[display("Warned")]
    Warned,
    #[display("Restricted")]
    Restricted,
    #[display("Removed")]
    Removed,
}

/// Escalation thresholds and the actions bound to each tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PunishmentPolicy {
    /// Violation count at which a user is warned (None disables the tier)
    pub warn_at: Option<u32>,
    /// Violation count at which the restrict action applies
    pub restrict_at: Option<u32>,
    /// Violation count at which the remove action applies
    pub remove_at: Option<u32>,
    pub restrict_action: PunishmentKind,
    pub remove_action: PunishmentKind,
    /// Length of timeouts in seconds
    pub timeout_secs: u32,
    /// Quiet period after which the count decays to zero
    pub cooldown_secs: u64,
    /// Message posted with a warning
    pub warn_message: String,
}

impl Default for PunishmentPolicy {
    fn default() -> Self {
        Self {
            warn_at: Some(1),
            restrict_at: Some(3),
            remove_at: Some(5),
            restrict_action: PunishmentKind::Timeout,
            remove_action: PunishmentKind::Kick,
            timeout_secs: 600,
            cooldown_secs: 3600,
            warn_message: "watch your language.".to_string(),
        }
    }
}

impl PunishmentPolicy {
    /// Map a violation count to a tier
    ///
    /// The highest tier whose threshold is at or below `count` wins.
    #[must_use]
    pub fn tier_for(&self, count: u32) -> Tier {
        let reached = |threshold: Option<u32>| threshold.is_some_and(|t| count >= t);

        if reached(self.remove_at) {
            Tier::Removed
        } else if reached(self.restrict_at) {
            Tier::Restricted
        } else if reached(self.warn_at) {
            Tier::Warned
        } else {
            Tier::Clean
        }
    }

    /// The cooldown as a chrono duration
    #[must_use]
    pub fn cooldown(&self) -> chrono::Duration {
        i64::try_from(self.cooldown_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = [self.warn_at, self.restrict_at, self.remove_at];
        if thresholds.iter().flatten().any(|t| *t == 0) {
            return Err(ConfigError::Invalid(
                "punishment thresholds must be at least 1".to_string(),
            ));
        }
        let enabled: Vec<u32> = thresholds.into_iter().flatten().collect();
        if enabled.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::Invalid(format!(
                "punishment thresholds must not decrease (warn {:?}, restrict {:?}, remove {:?})",
                self.warn_at, self.restrict_at, self.remove_at
            )));
        }
        if self.cooldown_secs == 0 {
            return Err(ConfigError::Invalid(
                "punishment cooldown must be positive".to_string(),
            ));
        }
        if self.timeout_secs == 0 || self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "timeout must be between 1 and {MAX_TIMEOUT_SECS} seconds"
            )));
        }
        Ok(())
    }
}

/// Guild moderation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantPolicy {
    pub guild_id: GuildId,
    /// Bumped by the policy store on every accepted update
    pub revision: u64,
    pub censor: CensorMethods,
    /// Guild-specific banned terms, in the order they were added
    pub custom_terms: Vec<String>,
    /// Built-in term lists switched on for this guild
    pub prebuilt_filters: Vec<String>,
    /// Words that never count as a match even when they contain a banned term
    pub allowed_terms: Vec<String>,
    pub exceptions: Vec<Exception>,
    pub punishments: PunishmentPolicy,
    /// Roles whose members are never renamed
    pub ignored_roles: Vec<RoleId>,
    /// Prefix names that sort above everyone else with an invisible character
    pub anti_hoist: bool,
    /// Delete offending messages, reactions and names
    pub remove_content: bool,
    pub toxicity_threshold: Option<f32>,
    pub nsfw_threshold: Option<f32>,
    /// Minimum run length collapsed by normalization
    pub repeat_threshold: Option<usize>,
    /// Where audit records are delivered
    pub log_channel: Option<ChannelId>,
}

impl Default for TenantPolicy {
    fn default() -> Self {
        Self {
            guild_id: GuildId::new(1),
            revision: 0,
            censor: CensorMethods::MESSAGES | CensorMethods::NAMES | CensorMethods::REACTIONS,
            custom_terms: Vec::new(),
            prebuilt_filters: vec!["en".to_string()],
            allowed_terms: Vec::new(),
            exceptions: Vec::new(),
            punishments: PunishmentPolicy::default(),
            ignored_roles: Vec::new(),
            anti_hoist: false,
            remove_content: true,
            toxicity_threshold: None,
            nsfw_threshold: None,
            repeat_threshold: None,
            log_channel: None,
        }
    }
}

impl TenantPolicy {
    /// Create the default policy for a guild
    #[must_use]
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            ..Default::default()
        }
    }

    /// Check the policy before it is accepted by the store
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.punishments.validate()?;

        for (name, threshold) in [
            ("toxicity", self.toxicity_threshold),
            ("nsfw", self.nsfw_threshold),
        ] {
            if let Some(value) = threshold {
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConfigError::Invalid(format!(
                        "{name} threshold {value} is outside 0..=1"
                    )));
                }
            }
        }

        if self.repeat_threshold.is_some_and(|t| t < 2) {
            return Err(ConfigError::Invalid(
                "repeat threshold must be at least 2".to_string(),
            ));
        }

        if let Some(term) = self.custom_terms.iter().find(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "custom term {term:?} is empty"
            )));
        }

        if let Some(unknown) = self
            .prebuilt_filters
            .iter()
            .find(|id| !crate::moderation::filter::prebuilt::is_known(id))
        {
            return Err(ConfigError::Invalid(format!(
                "unknown pre-built filter {unknown:?}"
            )));
        }

        Ok(())
    }

    /// Whether any of the given censor methods is switched on
    #[must_use]
    pub fn censors(&self, methods: CensorMethods) -> bool {
        self.censor.intersects(methods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_censor_bits_are_stable() {
        assert_eq!(CensorMethods::MESSAGES.bits(), 1);
        assert_eq!(CensorMethods::NAMES.bits(), 2);
        assert_eq!(CensorMethods::REACTIONS.bits(), 4);
        assert_eq!(CensorMethods::IMAGES.bits(), 8);
        assert_eq!(CensorMethods::TOXICITY.bits(), 16);
        assert_eq!(CensorMethods::PHISHING.bits(), 32);
        assert_eq!(CensorMethods::OCR.bits(), 64);
    }

    #[test]
    fn test_censor_methods_serialize_as_integer() {
        let methods = CensorMethods::MESSAGES | CensorMethods::IMAGES;
        let yaml = serde_yaml::to_string(&methods).expect("Failed to serialize");
        assert_eq!(yaml.trim(), "9");

        let parsed: CensorMethods = serde_yaml::from_str("5").expect("Failed to deserialize");
        assert_eq!(parsed, CensorMethods::MESSAGES | CensorMethods::REACTIONS);
    }

    #[test]
    fn test_tier_for_thresholds() {
        let punishments = PunishmentPolicy::default();
        assert_eq!(punishments.tier_for(0), Tier::Clean);
        assert_eq!(punishments.tier_for(1), Tier::Warned);
        assert_eq!(punishments.tier_for(2), Tier::Warned);
        assert_eq!(punishments.tier_for(3), Tier::Restricted);
        assert_eq!(punishments.tier_for(5), Tier::Removed);
        assert_eq!(punishments.tier_for(500), Tier::Removed);
    }

    #[test]
    fn test_tier_is_monotonic_in_count() {
        let punishments = PunishmentPolicy {
            warn_at: Some(2),
            restrict_at: Some(2),
            remove_at: Some(7),
            ..Default::default()
        };
        let mut previous = Tier::Clean;
        for count in 0..20 {
            let tier = punishments.tier_for(count);
            assert!(tier >= previous, "tier dropped at count {count}");
            previous = tier;
        }
        // Equal thresholds resolve to the higher tier
        assert_eq!(punishments.tier_for(2), Tier::Restricted);
    }

    #[test]
    fn test_disabled_tier_is_skipped() {
        let punishments = PunishmentPolicy {
            warn_at: None,
            restrict_at: None,
            remove_at: Some(2),
            ..Default::default()
        };
        assert_eq!(punishments.tier_for(1), Tier::Clean);
        assert_eq!(punishments.tier_for(2), Tier::Removed);
    }

    #[test]
    fn test_validate_rejects_decreasing_thresholds() {
        let mut policy = TenantPolicy::new(GuildId::new(10));
        policy.punishments.restrict_at = Some(8);
        policy.punishments.remove_at = Some(4);
        assert!(matches!(policy.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_scores_and_terms() {
        let mut policy = TenantPolicy::new(GuildId::new(10));
        policy.toxicity_threshold = Some(1.5);
        assert!(policy.validate().is_err());

        let mut policy = TenantPolicy::new(GuildId::new(10));
        policy.custom_terms.push("   ".to_string());
        assert!(policy.validate().is_err());

        let mut policy = TenantPolicy::new(GuildId::new(10));
        policy.prebuilt_filters.push("klingon".to_string());
        assert!(policy.validate().is_err());

        let mut policy = TenantPolicy::new(GuildId::new(10));
        policy.punishments.timeout_secs = MAX_TIMEOUT_SECS + 1;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_default_policy_is_valid() {
        assert!(TenantPolicy::new(GuildId::new(10)).validate().is_ok());
    }

    #[test]
    fn test_policy_yaml_roundtrip() {
        let mut policy = TenantPolicy::new(GuildId::new(12345));
        policy.custom_terms = vec!["hello".to_string()];
        policy.exceptions = vec![
            Exception::everywhere(ExceptionScope::TextFilterOnly).for_role(RoleId::new(77)),
        ];
        policy.log_channel = Some(ChannelId::new(54321));

        let yaml = serde_yaml::to_string(&policy).expect("Failed to serialize");
        assert!(yaml.contains("censor: 7"));
        assert!(yaml.contains("TextFilterOnly"));

        let parsed: TenantPolicy = serde_yaml::from_str(&yaml).expect("Failed to deserialize");
        assert_eq!(parsed, policy);
    }
}
