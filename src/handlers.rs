use crate::moderation::{
    Attachment, Decision, MessageEvent, Moderatable, ModerationEvent, ModerationOutcome,
    NameEvent, ReactionEvent,
};
use crate::{Data, ERROR_TARGET, EVENT_TARGET};
use poise::serenity_prelude::{
    self as serenity, Context, EventHandler, GuildId, GuildMemberUpdateEvent, Member, Message,
    MessageUpdateEvent, Reaction, Ready, RoleId, UnavailableGuild, User, UserId,
};
use tracing::{debug, error, info, warn};

pub struct Handler;

/// The bot's data, once setup has stored it
async fn data(ctx: &Context) -> Option<Data> {
    let data = ctx.data.read().await.get::<Data>().cloned();
    if data.is_none() {
        debug!(target: EVENT_TARGET, "Event before setup finished, skipping");
    }
    data
}

/// A member's roles from the cache
fn cached_roles(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Vec<RoleId> {
    ctx.cache
        .guild(guild_id)
        .and_then(|guild| guild.members.get(&user_id).map(|m| m.roles.clone()))
        .unwrap_or_default()
}

fn attachments(attachments: &[serenity::Attachment]) -> Vec<Attachment> {
    attachments
        .iter()
        .map(|a| Attachment {
            url: a.url.clone(),
            filename: a.filename.clone(),
            content_type: a.content_type.clone(),
        })
        .collect()
}

/// The name shown when a member has no nickname
fn account_name(user: &User) -> String {
    user.global_name.clone().unwrap_or_else(|| user.name.clone())
}

/// Whether a member update touched anything the name filter looks at
fn name_changed(old: Option<&Member>, new_nick: Option<&str>, new_name: &str) -> bool {
    old.is_none_or(|old| old.nick.as_deref() != new_nick || account_name(&old.user) != new_name)
}

async fn moderate(ctx: &Context, event: ModerationEvent) {
    let Some(data) = data(ctx).await else {
        return;
    };
    match data.engine.process(&event).await {
        Ok(outcome) => log_outcome(&event, &outcome),
        Err(e) => {
            error!(
                target: ERROR_TARGET,
                guild_id = %event.guild_id(),
                error = %e,
                "Moderation pipeline failed"
            );
        }
    }
}

fn log_outcome(event: &ModerationEvent, outcome: &ModerationOutcome) {
    if matches!(outcome.decision, Decision::Ignored | Decision::Clean) && outcome.actions.is_empty() {
        return;
    }
    info!(
        target: EVENT_TARGET,
        guild_id = %event.guild_id(),
        user_id = %event.subject(),
        event = %event.kind(),
        decision = %outcome.decision,
        actions = ?outcome.actions,
        "Event moderated"
    );
}

#[serenity::async_trait]
impl EventHandler for Handler {
    /// Called when the bot is ready, but the cache may not be fully populated yet.
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        info!("Connected as {user_name}, shard {shard_id}");
    }

    /// Called when the cache is fully populated.
    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let guild_count_cache = ctx.cache.guild_count();
        let guild_count = guilds.len();
        if guild_count != guild_count_cache {
            warn!(
                "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
            );
        }
        info!("Cache ready! The bot is in {guild_count} guild(s)");
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let Some(guild_id) = msg.guild_id else {
            return;
        };
        if msg.author.bot {
            return;
        }
        let roles = msg
            .member
            .as_ref()
            .map(|m| m.roles.clone())
            .unwrap_or_else(|| cached_roles(&ctx, guild_id, msg.author.id));

        let event = ModerationEvent::Message(MessageEvent {
            guild_id,
            channel_id: msg.channel_id,
            message_id: msg.id,
            author_id: msg.author.id,
            author_roles: roles,
            content: msg.content.clone(),
            attachments: attachments(&msg.attachments),
            edited: false,
        });
        moderate(&ctx, event).await;
    }

    async fn message_update(
        &self,
        ctx: Context,
        _old_if_available: Option<Message>,
        _new: Option<Message>,
        event: MessageUpdateEvent,
    ) {
        let (Some(guild_id), Some(author), Some(content)) =
            (event.guild_id, event.author.as_ref(), event.content.as_ref())
        else {
            // Embed-only updates carry no new content
            return;
        };
        if author.bot {
            return;
        }

        let event = ModerationEvent::Message(MessageEvent {
            guild_id,
            channel_id: event.channel_id,
            message_id: event.id,
            author_id: author.id,
            author_roles: cached_roles(&ctx, guild_id, author.id),
            content: content.clone(),
            attachments: event
                .attachments
                .as_deref()
                .map(attachments)
                .unwrap_or_default(),
            edited: true,
        });
        moderate(&ctx, event).await;
    }

    async fn guild_member_addition(&self, ctx: Context, new_member: Member) {
        if new_member.user.bot {
            return;
        }
        let event = ModerationEvent::Name(NameEvent {
            guild_id: new_member.guild_id,
            user_id: new_member.user.id,
            roles: new_member.roles.clone(),
            nick: new_member.nick.clone(),
            username: account_name(&new_member.user),
        });
        moderate(&ctx, event).await;
    }

    async fn guild_member_update(
        &self,
        ctx: Context,
        old_if_available: Option<Member>,
        _new: Option<Member>,
        event: GuildMemberUpdateEvent,
    ) {
        if event.user.bot {
            return;
        }
        let username = account_name(&event.user);
        if !name_changed(old_if_available.as_ref(), event.nick.as_deref(), &username) {
            return;
        }
        let event = ModerationEvent::Name(NameEvent {
            guild_id: event.guild_id,
            user_id: event.user.id,
            roles: event.roles.clone(),
            nick: event.nick.clone(),
            username,
        });
        moderate(&ctx, event).await;
    }

    async fn reaction_add(&self, ctx: Context, reaction: Reaction) {
        let (Some(guild_id), Some(user_id)) = (reaction.guild_id, reaction.user_id) else {
            return;
        };
        if reaction.member.as_ref().is_some_and(|m| m.user.bot) {
            return;
        }
        let roles = reaction
            .member
            .as_ref()
            .map(|m| m.roles.clone())
            .unwrap_or_else(|| cached_roles(&ctx, guild_id, user_id));

        let event = ModerationEvent::Reaction(ReactionEvent {
            guild_id,
            channel_id: reaction.channel_id,
            message_id: reaction.message_id,
            user_id,
            roles,
            emoji: reaction.emoji.clone(),
        });
        moderate(&ctx, event).await;
    }

    /// The policy stays on disk in case the bot is invited back
    async fn guild_delete(
        &self,
        ctx: Context,
        incomplete: UnavailableGuild,
        _full: Option<serenity::Guild>,
    ) {
        // An outage, not a removal
        if incomplete.unavailable {
            return;
        }
        if let Some(data) = data(&ctx).await {
            data.engine.forget_guild(incomplete.id);
        }
    }

    /// Members who leave start over if they come back
    async fn guild_member_removal(
        &self,
        ctx: Context,
        guild_id: GuildId,
        user: User,
        _member_data_if_available: Option<Member>,
    ) {
        if let Some(data) = data(&ctx).await {
            data.engine.escalator().clear(guild_id, user.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_implements_event_handler() {
        fn assert_impl<T: EventHandler>() {}
        assert_impl::<Handler>();
    }

    #[test]
    fn test_unknown_previous_member_counts_as_changed() {
        assert!(name_changed(None, Some("nick"), "user"));
        assert!(name_changed(None, None, "user"));
    }
}
