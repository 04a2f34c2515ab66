//! Punishment escalation
//!
//! Each (guild, user) pair has an [`EscalationState`] behind its own async
//! mutex. The pipeline holds that lock from the increment until the
//! punishment for the new tier has been applied, so concurrent violations by
//! one user are counted one at a time.

use crate::moderation::{ModerationError, ModerationResult, PunishmentPolicy, Tier};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use poise::serenity_prelude::{GuildId, UserId};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Violation history of one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationState {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub violation_count: u32,
    pub last_violation_at: Option<DateTime<Utc>>,
    pub current_tier: Tier,
}

/// Result of counting one violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationStep {
    pub violation_count: u32,
    pub previous_tier: Tier,
    pub tier: Tier,
    /// The count decayed to zero before this violation
    pub decayed: bool,
}

impl EscalationStep {
    /// Whether this violation moved the member into a higher tier
    #[must_use]
    pub fn reached_new_tier(&self) -> bool {
        self.tier > self.previous_tier
    }
}

impl EscalationState {
    #[must_use]
    pub fn new(guild_id: GuildId, user_id: UserId) -> Self {
        Self {
            guild_id,
            user_id,
            violation_count: 0,
            last_violation_at: None,
            current_tier: Tier::Clean,
        }
    }

    /// Whether the quiet period since the last violation exceeds the cooldown
    fn is_decayed(&self, policy: &PunishmentPolicy, now: DateTime<Utc>) -> bool {
        self.last_violation_at
            .is_some_and(|last| now - last > policy.cooldown())
    }

    /// The count as it stands at `now`, with decay applied
    #[must_use]
    pub fn effective_count(&self, policy: &PunishmentPolicy, now: DateTime<Utc>) -> u32 {
        if self.is_decayed(policy, now) {
            0
        } else {
            self.violation_count
        }
    }

    /// Count one violation at `now` and compute the resulting tier
    ///
    /// # Errors
    /// Returns `ModerationError::CorruptState` if the count cannot be incremented
    pub fn record_violation(
        &mut self,
        policy: &PunishmentPolicy,
        now: DateTime<Utc>,
    ) -> ModerationResult<EscalationStep> {
        let decayed = self.is_decayed(policy, now);
        if decayed {
            debug!(
                guild_id = %self.guild_id,
                user_id = %self.user_id,
                previous = self.violation_count,
                "Violation count decayed"
            );
            self.violation_count = 0;
            self.current_tier = Tier::Clean;
        }

        let previous_tier = self.current_tier;
        self.violation_count = self.violation_count.checked_add(1).ok_or_else(|| {
            ModerationError::CorruptState(format!(
                "violation count overflow for user {} in guild {}",
                self.user_id, self.guild_id
            ))
        })?;
        self.last_violation_at = Some(now);
        // Tiers never move backwards without decay, even if thresholds were raised
        let tier = policy.tier_for(self.violation_count).max(previous_tier);
        self.current_tier = tier;

        Ok(EscalationStep {
            violation_count: self.violation_count,
            previous_tier,
            tier,
            decayed,
        })
    }
}

type StateKey = (GuildId, UserId);

/// Per-member escalation states with one lock per member
#[derive(Debug, Default)]
pub struct Escalator {
    states: DashMap<StateKey, Arc<Mutex<EscalationState>>>,
}

impl Escalator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the state of one member, creating it on first use
    ///
    /// # Errors
    /// Returns `ModerationError::CorruptState` if the stored state belongs to another member
    pub async fn lock(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> ModerationResult<OwnedMutexGuard<EscalationState>> {
        let state = Arc::clone(
            self.states
                .entry((guild_id, user_id))
                .or_insert_with(|| Arc::new(Mutex::new(EscalationState::new(guild_id, user_id))))
                .value(),
        );
        let guard = state.lock_owned().await;
        if guard.guild_id != guild_id || guard.user_id != user_id {
            return Err(ModerationError::CorruptState(format!(
                "escalation state for user {user_id} in guild {guild_id} belongs to user {} in guild {}",
                guard.user_id, guard.guild_id
            )));
        }
        Ok(guard)
    }

    /// Copy of a member's state, if they have one
    pub async fn get(&self, guild_id: GuildId, user_id: UserId) -> Option<EscalationState> {
        let state = self
            .states
            .get(&(guild_id, user_id))
            .map(|entry| Arc::clone(entry.value()))?;
        let snapshot = state.lock().await.clone();
        Some(snapshot)
    }

    /// Forget a member's history
    pub fn clear(&self, guild_id: GuildId, user_id: UserId) -> bool {
        let removed = self.states.remove(&(guild_id, user_id)).is_some();
        if removed {
            info!(guild_id = %guild_id, user_id = %user_id, "Escalation state cleared");
        }
        removed
    }

    /// Forget every member of a guild
    pub fn clear_guild(&self, guild_id: GuildId) {
        self.states.retain(|(guild, _), _| *guild != guild_id);
    }

    /// Guilds that have at least one tracked member
    #[must_use]
    pub fn guild_ids(&self) -> HashSet<GuildId> {
        self.states.iter().map(|entry| entry.key().0).collect()
    }

    /// Drop states whose last violation is older than their guild's idle window
    ///
    /// States that are currently locked are kept.
    pub fn purge_idle(
        &self,
        now: DateTime<Utc>,
        idle: impl Fn(GuildId) -> chrono::Duration,
    ) -> usize {
        let before = self.states.len();
        self.states.retain(|(guild_id, _), state| match state.try_lock() {
            Ok(state) => state
                .last_violation_at
                .is_none_or(|last| now - last <= idle(*guild_id)),
            Err(_) => true,
        });
        before.saturating_sub(self.states.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::PunishmentKind;

    fn policy() -> PunishmentPolicy {
        PunishmentPolicy {
            warn_at: Some(1),
            restrict_at: Some(3),
            remove_at: Some(5),
            restrict_action: PunishmentKind::Timeout,
            cooldown_secs: 600,
            ..Default::default()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_warned_to_restricted() {
        let policy = policy();
        let mut state = EscalationState::new(GuildId::new(1), UserId::new(2));
        state.record_violation(&policy, at(0)).unwrap();
        state.record_violation(&policy, at(10)).unwrap();
        assert_eq!(state.violation_count, 2);
        assert_eq!(state.current_tier, Tier::Warned);

        let step = state.record_violation(&policy, at(20)).unwrap();
        assert_eq!(step.violation_count, 3);
        assert_eq!(step.previous_tier, Tier::Warned);
        assert_eq!(step.tier, Tier::Restricted);
        assert!(step.reached_new_tier());
    }

    #[test]
    fn test_staying_in_tier_is_not_a_new_tier() {
        let policy = policy();
        let mut state = EscalationState::new(GuildId::new(1), UserId::new(2));
        assert!(state.record_violation(&policy, at(0)).unwrap().reached_new_tier());
        assert!(!state.record_violation(&policy, at(1)).unwrap().reached_new_tier());
    }

    #[test]
    fn test_decay_resets_to_one() {
        let policy = policy();
        let mut state = EscalationState::new(GuildId::new(1), UserId::new(2));
        for i in 0..4 {
            state.record_violation(&policy, at(i)).unwrap();
        }
        assert_eq!(state.current_tier, Tier::Restricted);

        // Exactly at the cooldown edge nothing decays
        let step = state.record_violation(&policy, at(3 + 600)).unwrap();
        assert_eq!(step.violation_count, 5);
        assert!(!step.decayed);

        let step = state.record_violation(&policy, at(603 + 601)).unwrap();
        assert!(step.decayed);
        assert_eq!(step.violation_count, 1);
        assert_eq!(step.previous_tier, Tier::Clean);
        assert_eq!(step.tier, Tier::Warned);
    }

    #[test]
    fn test_effective_count_reads_decay_lazily() {
        let policy = policy();
        let mut state = EscalationState::new(GuildId::new(1), UserId::new(2));
        state.record_violation(&policy, at(0)).unwrap();
        state.record_violation(&policy, at(1)).unwrap();
        assert_eq!(state.effective_count(&policy, at(100)), 2);
        assert_eq!(state.effective_count(&policy, at(1000)), 0);
        // Reading does not mutate
        assert_eq!(state.violation_count, 2);
    }

    #[test]
    fn test_overflow_is_corrupt_state() {
        let policy = policy();
        let mut state = EscalationState::new(GuildId::new(1), UserId::new(2));
        state.violation_count = u32::MAX;
        state.last_violation_at = Some(at(0));
        let result = state.record_violation(&policy, at(1));
        assert!(matches!(result, Err(ModerationError::CorruptState(_))));
    }

    #[tokio::test]
    async fn test_concurrent_violations_are_serialized() {
        let policy = policy();
        let escalator = Arc::new(Escalator::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let escalator = Arc::clone(&escalator);
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                let mut state = escalator.lock(GuildId::new(1), UserId::new(2)).await.unwrap();
                tokio::task::yield_now().await;
                state.record_violation(&policy, Utc::now()).unwrap()
            }));
        }

        let mut counts = Vec::new();
        let mut new_tiers = Vec::new();
        for handle in handles {
            let step = handle.await.unwrap();
            counts.push(step.violation_count);
            if step.reached_new_tier() {
                new_tiers.push(step.tier);
            }
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=20).collect::<Vec<_>>());
        new_tiers.sort();
        assert_eq!(new_tiers, vec![Tier::Warned, Tier::Restricted, Tier::Removed]);
    }

    #[tokio::test]
    async fn test_clear_and_get() {
        let escalator = Escalator::new();
        let (guild, user) = (GuildId::new(1), UserId::new(2));
        assert!(escalator.get(guild, user).await.is_none());

        {
            let mut state = escalator.lock(guild, user).await.unwrap();
            state.record_violation(&policy(), Utc::now()).unwrap();
        }
        assert_eq!(escalator.get(guild, user).await.unwrap().violation_count, 1);

        assert!(escalator.clear(guild, user));
        assert!(!escalator.clear(guild, user));
        assert!(escalator.get(guild, user).await.is_none());
    }

    #[tokio::test]
    async fn test_purge_idle() {
        let escalator = Escalator::new();
        for user in 1..=3 {
            let mut state = escalator.lock(GuildId::new(1), UserId::new(user)).await.unwrap();
            state.record_violation(&policy(), at(i64::try_from(user).unwrap() * 100)).unwrap();
        }
        let purged = escalator.purge_idle(at(350), |_| chrono::Duration::seconds(100));
        assert_eq!(purged, 2);
        assert_eq!(escalator.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_idle_per_guild() {
        let escalator = Escalator::new();
        for guild in 1..=2 {
            let mut state = escalator.lock(GuildId::new(guild), UserId::new(7)).await.unwrap();
            state.record_violation(&policy(), at(100)).unwrap();
        }
        assert_eq!(escalator.guild_ids().len(), 2);

        let purged = escalator.purge_idle(at(400), |guild_id| {
            if guild_id == GuildId::new(2) {
                chrono::Duration::seconds(1000)
            } else {
                chrono::Duration::seconds(100)
            }
        });
        assert_eq!(purged, 1);
        assert_eq!(escalator.guild_ids(), HashSet::from([GuildId::new(2)]));
    }
}
