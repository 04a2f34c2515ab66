//! Discord action handlers
//!
//! One handler per [`ActionKind`], looked up through a registry. The
//! registry is the production [`EnforcementSink`].

use crate::moderation::{
    ActionKind, ActionParams, EnforcementAction, EnforcementError, EnforcementResult,
    EnforcementSink, Target,
};
use async_trait::async_trait;
use poise::serenity_prelude::{EditMember, Http, Timestamp};
use serenity::http::HttpError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Whether a Discord error means the target does not exist
fn is_not_found(error: &serenity::Error) -> bool {
    matches!(
        error,
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response))
            if response.status_code.as_u16() == 404
    )
}

/// Map a Discord error, turning 404s into `TargetGone`
fn map_discord_error(error: serenity::Error, target: &Target) -> EnforcementError {
    if is_not_found(&error) {
        EnforcementError::TargetGone(format!("{target:?}"))
    } else {
        EnforcementError::from(error)
    }
}

fn params_mismatch(action: &EnforcementAction) -> EnforcementError {
    EnforcementError::ValidationFailed(format!(
        "{} action has parameters {:?}",
        action.kind, action.params
    ))
}

/// Executes one kind of action
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, http: &Http, action: &EnforcementAction) -> EnforcementResult<()>;
}

/// Deletes a message
struct RemoveContentHandler;

#[async_trait]
impl ActionHandler for RemoveContentHandler {
    async fn execute(&self, http: &Http, action: &EnforcementAction) -> EnforcementResult<()> {
        let Target::Message {
            channel_id,
            message_id,
        } = &action.target
        else {
            return Err(params_mismatch(action));
        };
        channel_id
            .delete_message(http, *message_id)
            .await
            .map_err(|e| map_discord_error(e, &action.target))?;
        info!("Deleted message {message_id} in channel {channel_id}");
        Ok(())
    }
}

/// Removes one member's reaction from a message
struct RemoveReactionHandler;

#[async_trait]
impl ActionHandler for RemoveReactionHandler {
    async fn execute(&self, http: &Http, action: &EnforcementAction) -> EnforcementResult<()> {
        let (
            Target::Reaction {
                channel_id,
                message_id,
                user_id,
                ..
            },
            ActionParams::Emoji(emoji),
        ) = (&action.target, &action.params)
        else {
            return Err(params_mismatch(action));
        };
        channel_id
            .delete_reaction(http, *message_id, Some(*user_id), emoji.clone())
            .await
            .map_err(|e| map_discord_error(e, &action.target))?;
        info!("Removed reaction {emoji} by user {user_id} on message {message_id}");
        Ok(())
    }
}

/// Sets or clears a member's nickname
struct ResetNameHandler;

#[async_trait]
impl ActionHandler for ResetNameHandler {
    async fn execute(&self, http: &Http, action: &EnforcementAction) -> EnforcementResult<()> {
        let ActionParams::Nickname(nickname) = &action.params else {
            return Err(params_mismatch(action));
        };
        let builder = EditMember::new()
            .nickname(nickname.clone().unwrap_or_default())
            .audit_log_reason(&action.reason);
        action
            .guild_id
            .edit_member(http, action.subject, builder)
            .await
            .map_err(|e| map_discord_error(e, &action.target))?;
        info!(
            "Reset name of user {} in guild {} to {:?}",
            action.subject, action.guild_id, nickname
        );
        Ok(())
    }
}

/// Posts a warning mentioning the member
struct WarnHandler;

#[async_trait]
impl ActionHandler for WarnHandler {
    async fn execute(&self, http: &Http, action: &EnforcementAction) -> EnforcementResult<()> {
        let ActionParams::Warn {
            channel_id,
            message,
        } = &action.params
        else {
            return Err(params_mismatch(action));
        };
        channel_id
            .say(http, format!("<@{}> {message}", action.subject))
            .await
            .map_err(|e| map_discord_error(e, &action.target))?;
        info!("Warned user {} in channel {channel_id}", action.subject);
        Ok(())
    }
}

/// Times a member out
struct TimeoutHandler;

#[async_trait]
impl ActionHandler for TimeoutHandler {
    async fn execute(&self, http: &Http, action: &EnforcementAction) -> EnforcementResult<()> {
        let ActionParams::Timeout { duration_secs } = &action.params else {
            return Err(params_mismatch(action));
        };
        let until = chrono::Utc::now() + chrono::Duration::seconds(i64::from(*duration_secs));
        let builder = EditMember::new()
            .disable_communication_until_datetime(Timestamp::from(until))
            .audit_log_reason(&action.reason);
        action
            .guild_id
            .edit_member(http, action.subject, builder)
            .await
            .map_err(|e| map_discord_error(e, &action.target))?;
        info!("Timed out user {} until {until}", action.subject);
        Ok(())
    }
}

/// Kicks a member
struct KickHandler;

#[async_trait]
impl ActionHandler for KickHandler {
    async fn execute(&self, http: &Http, action: &EnforcementAction) -> EnforcementResult<()> {
        action
            .guild_id
            .kick_with_reason(http, action.subject, &action.reason)
            .await
            .map_err(|e| map_discord_error(e, &action.target))?;
        info!("Kicked user {} from guild {}", action.subject, action.guild_id);
        Ok(())
    }
}

/// Bans a member
struct BanHandler;

#[async_trait]
impl ActionHandler for BanHandler {
    async fn execute(&self, http: &Http, action: &EnforcementAction) -> EnforcementResult<()> {
        let ActionParams::Ban {
            delete_message_days,
        } = &action.params
        else {
            return Err(params_mismatch(action));
        };
        action
            .guild_id
            .ban_with_reason(http, action.subject, *delete_message_days, &action.reason)
            .await
            .map_err(|e| map_discord_error(e, &action.target))?;
        info!("Banned user {} from guild {}", action.subject, action.guild_id);
        Ok(())
    }
}

/// Registry of action handlers backed by the Discord HTTP client
pub struct ActionHandlerRegistry {
    http: Arc<Http>,
    handlers: HashMap<ActionKind, Box<dyn ActionHandler>>,
}

impl ActionHandlerRegistry {
    /// Create a registry with every handler registered
    #[must_use]
    pub fn new(http: Arc<Http>) -> Self {
        let mut registry = Self {
            http,
            handlers: HashMap::new(),
        };

        registry.register(ActionKind::RemoveContent, Box::new(RemoveContentHandler));
        registry.register(ActionKind::RemoveReaction, Box::new(RemoveReactionHandler));
        registry.register(ActionKind::ResetName, Box::new(ResetNameHandler));
        registry.register(ActionKind::Warn, Box::new(WarnHandler));
        registry.register(ActionKind::Timeout, Box::new(TimeoutHandler));
        registry.register(ActionKind::Kick, Box::new(KickHandler));
        registry.register(ActionKind::Ban, Box::new(BanHandler));

        registry
    }

    /// Register a handler for an action kind
    pub fn register(&mut self, kind: ActionKind, handler: Box<dyn ActionHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Get the handler for an action kind
    #[must_use]
    pub fn get(&self, kind: ActionKind) -> Option<&dyn ActionHandler> {
        self.handlers.get(&kind).map(AsRef::as_ref)
    }
}

#[async_trait]
impl EnforcementSink for ActionHandlerRegistry {
    async fn execute(&self, action: &EnforcementAction) -> EnforcementResult<()> {
        let Some(handler) = self.get(action.kind) else {
            return Err(EnforcementError::ValidationFailed(format!(
                "No handler registered for action kind: {}",
                action.kind
            )));
        };
        handler.execute(&self.http, action).await
    }

    async fn target_exists(&self, action: &EnforcementAction) -> EnforcementResult<bool> {
        let lookup = match &action.target {
            Target::Message {
                channel_id,
                message_id,
            }
            | Target::Reaction {
                channel_id,
                message_id,
                ..
            } => channel_id
                .message(&*self.http, *message_id)
                .await
                .map(|_| ()),
            Target::Member { user_id } => action
                .guild_id
                .member(&*self.http, *user_id)
                .await
                .map(|_| ()),
        };
        match lookup {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(EnforcementError::from(e)),
        }
    }
}
