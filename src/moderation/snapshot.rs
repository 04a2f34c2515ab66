//! Capability snapshots read from the serenity cache

use crate::moderation::{CapabilitySnapshot, SnapshotProvider};
use async_trait::async_trait;
use poise::serenity_prelude::{Cache, GuildId, UserId};
use std::sync::Arc;
use tracing::debug;

/// Builds snapshots from the gateway cache
pub struct CacheSnapshotProvider {
    cache: Arc<Cache>,
    bot_id: UserId,
}

impl CacheSnapshotProvider {
    #[must_use]
    pub fn new(cache: Arc<Cache>, bot_id: UserId) -> Self {
        Self { cache, bot_id }
    }
}

#[async_trait]
impl SnapshotProvider for CacheSnapshotProvider {
    async fn snapshot(&self, guild_id: GuildId) -> Option<CapabilitySnapshot> {
        let Some(guild) = self.cache.guild(guild_id) else {
            debug!(guild_id = %guild_id, "Guild not cached");
            return None;
        };
        let Some(bot) = guild.members.get(&self.bot_id) else {
            debug!(guild_id = %guild_id, "Bot member not cached");
            return None;
        };

        let role_positions = guild
            .roles
            .iter()
            .map(|(id, role)| (*id, role.position))
            .collect();
        let agent_top_role = bot
            .roles
            .iter()
            .filter_map(|id| guild.roles.get(id))
            .map(|role| role.position)
            .max();

        #[allow(deprecated)]
        let agent_permissions = guild.member_permissions(bot);

        Some(CapabilitySnapshot {
            owner_id: guild.owner_id,
            agent_permissions,
            agent_top_role,
            role_positions,
        })
    }
}
