//! Enforcement actions
//!
//! An [`EnforcementAction`] can only be built from an [`Authorized`] grant,
//! so every action that reaches a sink has passed the permission guard.

use crate::moderation::{
    Authorized, EnforcementResult, PunishmentKind, Target, ViolationVerdict,
};
use async_trait::async_trait;
use derive_more::Display;
use poise::serenity_prelude::{ChannelId, GuildId, Permissions, ReactionType, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Messages from the last day are removed with a ban
pub const BAN_DELETE_MESSAGE_DAYS: u8 = 1;

/// Kinds of enforcement the engine can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ActionKind {
    #[display("Remove Content")]
    RemoveContent,
    #[display("Reset Name")]
    ResetName,
    #[display("Remove Reaction")]
    RemoveReaction,
    #[display("Warn")]
    Warn,
    #[display("Timeout")]
    Timeout,
    #[display("Kick")]
    Kick,
    #[display("Ban")]
    Ban,
}

impl ActionKind {
    /// Capability the acting bot needs for this kind of action
    #[must_use]
    pub fn required_permissions(self) -> Permissions {
        match self {
            Self::RemoveContent | Self::RemoveReaction => Permissions::MANAGE_MESSAGES,
            Self::ResetName => Permissions::MANAGE_NICKNAMES,
            Self::Warn => Permissions::SEND_MESSAGES,
            Self::Timeout => Permissions::MODERATE_MEMBERS,
            Self::Kick => Permissions::KICK_MEMBERS,
            Self::Ban => Permissions::BAN_MEMBERS,
        }
    }

    /// Whether the role hierarchy and owner immunity apply
    #[must_use]
    pub fn needs_hierarchy(self) -> bool {
        matches!(self, Self::ResetName | Self::Timeout | Self::Kick | Self::Ban)
    }
}

impl From<PunishmentKind> for ActionKind {
    fn from(kind: PunishmentKind) -> Self {
        match kind {
            PunishmentKind::Timeout => Self::Timeout,
            PunishmentKind::Kick => Self::Kick,
            PunishmentKind::Ban => Self::Ban,
        }
    }
}

/// Kind-specific parameters of an action
#[derive(Debug, Clone, PartialEq)]
pub enum ActionParams {
    None,
    /// New nickname, `None` clears it
    Nickname(Option<String>),
    Emoji(ReactionType),
    Timeout { duration_secs: u32 },
    Ban { delete_message_days: u8 },
    Warn { channel_id: ChannelId, message: String },
}

/// An action the pipeline wants to take, before authorization
#[derive(Debug, Clone)]
pub struct Remedy {
    pub kind: ActionKind,
    pub target: Target,
    pub params: ActionParams,
}

/// An authorized enforcement action
#[derive(Debug, Clone)]
pub struct EnforcementAction {
    pub id: String,
    pub guild_id: GuildId,
    pub kind: ActionKind,
    /// The member the action is about
    pub subject: UserId,
    pub target: Target,
    pub params: ActionParams,
    pub reason: String,
    pub verdict: Arc<ViolationVerdict>,
}

impl EnforcementAction {
    /// Build an action from a grant issued by the permission guard
    #[must_use]
    pub fn new(
        grant: Authorized,
        target: Target,
        params: ActionParams,
        reason: impl Into<String>,
        verdict: Arc<ViolationVerdict>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            guild_id: grant.guild_id(),
            kind: grant.kind(),
            subject: grant.subject(),
            target,
            params,
            reason: reason.into(),
            verdict,
        }
    }
}

/// Performs actions on the platform
#[async_trait]
pub trait EnforcementSink: Send + Sync {
    /// Carry out the action
    async fn execute(&self, action: &EnforcementAction) -> EnforcementResult<()>;

    /// Whether the target still exists, checked right before execution
    async fn target_exists(&self, action: &EnforcementAction) -> EnforcementResult<bool>;
}
