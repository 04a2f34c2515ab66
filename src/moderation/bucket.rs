//! Action bucket
//!
//! A short-lived ledger keyed by (guild, target, action kind), plus the
//! offending content where one target can be fixed for different reasons.
//! Acquiring a key that was acquired less than one window ago fails, which
//! suppresses duplicate enforcement when a burst of events hits the same
//! target.

use crate::moderation::{ActionKind, Target};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use poise::serenity_prelude::GuildId;
use std::time::{Duration, Instant};
use tracing::debug;

/// Key of one bucket slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub guild_id: GuildId,
    pub target: Target,
    pub kind: ActionKind,
    pub content: Option<String>,
}

impl BucketKey {
    #[must_use]
    pub fn new(guild_id: GuildId, target: Target, kind: ActionKind) -> Self {
        Self {
            guild_id,
            target,
            kind,
            content: None,
        }
    }

    /// Only suppress repeats for the same offending content
    #[must_use]
    pub fn with_content(mut self, content: Option<&str>) -> Self {
        self.content = content.map(ToString::to_string);
        self
    }
}

/// Cooldown ledger for enforcement actions
#[derive(Debug)]
pub struct ActionBucket {
    window: Duration,
    slots: DashMap<BucketKey, Instant>,
}

impl ActionBucket {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: DashMap::new(),
        }
    }

    /// Try to take the slot for `key` now
    pub fn try_acquire(&self, key: BucketKey) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    /// Try to take the slot for `key` at `now`
    ///
    /// Returns false without touching the slot if it was taken within the window.
    pub fn try_acquire_at(&self, key: BucketKey, now: Instant) -> bool {
        match self.slots.entry(key) {
            Entry::Occupied(mut slot) => {
                if now.saturating_duration_since(*slot.get()) < self.window {
                    debug!(key = ?slot.key(), "Action suppressed by bucket");
                    false
                } else {
                    slot.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Drop slots whose window has passed
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, taken| now.saturating_duration_since(*taken) < self.window);
        before.saturating_sub(self.slots.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
