//! Inbound events the engine moderates
//!
//! Each event kind is its own struct carrying only the fields it needs.
//! The pipeline works against the [`Moderatable`] trait.

use crate::moderation::{ActionKind, ActionParams, CensorMethods, Remedy, TenantPolicy};
use derive_more::Display;
use poise::serenity_prelude::{ChannelId, GuildId, MessageId, ReactionType, RoleId, UserId};
use serde::Serialize;

/// Name given to members whose own name cannot be cleared
pub const INAPPROPRIATE_NAME: &str = "Inappropriate Name";

/// Prefix that sorts a name below the hoisting range
pub const DEHOIST_PREFIX: char = '\u{0358}';

/// What kind of content an event carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum EventKind {
    #[display("Message")]
    Message,
    #[display("Edited Message")]
    EditedMessage,
    #[display("Nickname")]
    Name,
    #[display("Reaction")]
    Reaction,
}

impl EventKind {
    /// Title of the audit record for this kind of event
    #[must_use]
    pub fn audit_title(self, removed: bool) -> String {
        match (self, removed) {
            (Self::Message, true) => "Deleted Message".to_string(),
            (Self::EditedMessage, true) => "Deleted Edited Message".to_string(),
            (Self::Name, true) => "Removed Nickname".to_string(),
            (Self::Reaction, true) => "Removed Reaction".to_string(),
            (kind, false) => format!("Flagged {kind}"),
        }
    }
}

/// A file attached to a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub content_type: Option<String>,
}

impl Attachment {
    /// Whether the attachment looks like an image
    #[must_use]
    pub fn is_image(&self) -> bool {
        if let Some(content_type) = &self.content_type {
            return content_type.starts_with("image/");
        }
        let filename = self.filename.to_lowercase();
        [".png", ".jpg", ".jpeg", ".gif", ".webp"]
            .iter()
            .any(|ext| filename.ends_with(ext))
    }
}

/// A message was sent or edited
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub author_id: UserId,
    pub author_roles: Vec<RoleId>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub edited: bool,
}

/// A member joined or changed their name
#[derive(Debug, Clone)]
pub struct NameEvent {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub roles: Vec<RoleId>,
    pub nick: Option<String>,
    pub username: String,
}

impl NameEvent {
    /// The name other members see
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.nick.as_deref().unwrap_or(&self.username)
    }

    /// Whether the name sorts above regular names in the member list
    #[must_use]
    pub fn is_hoisting(&self) -> bool {
        self.display_name()
            .chars()
            .next()
            .is_some_and(|c| c < 'A' || ('['..='`').contains(&c))
    }

    /// The name prefixed so it no longer hoists
    #[must_use]
    pub fn dehoisted(&self) -> String {
        format!("{DEHOIST_PREFIX}{}", self.display_name())
    }

    /// Whether the name is one the engine assigned itself
    #[must_use]
    pub fn is_reset_name(&self) -> bool {
        self.nick.as_deref() == Some(INAPPROPRIATE_NAME)
    }
}

/// A reaction was added to a message
#[derive(Debug, Clone)]
pub struct ReactionEvent {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub roles: Vec<RoleId>,
    pub emoji: ReactionType,
}

impl ReactionEvent {
    /// Text the filter sees for the emoji
    #[must_use]
    pub fn emoji_name(&self) -> &str {
        match &self.emoji {
            ReactionType::Unicode(name) => name.as_str(),
            ReactionType::Custom { name, .. } => name.as_deref().unwrap_or_default(),
            _ => "",
        }
    }
}

/// The entity an enforcement action applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Target {
    Message {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    Member {
        user_id: UserId,
    },
    Reaction {
        channel_id: ChannelId,
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
    },
}

/// Common view of an event used by every pipeline stage
pub trait Moderatable: Send + Sync {
    fn kind(&self) -> EventKind;
    fn guild_id(&self) -> GuildId;
    /// The user responsible for the content
    fn subject(&self) -> UserId;
    fn roles(&self) -> &[RoleId];
    fn channel_id(&self) -> Option<ChannelId>;
    /// Censor bit that switches on text filtering for this kind of event
    fn censor_method(&self) -> CensorMethods;
    fn text(&self) -> &str;
    fn attachments(&self) -> &[Attachment] {
        &[]
    }
    /// Action that takes the offending content down
    fn remedy(&self) -> Remedy;
    /// Whether the event must not be moderated at all
    fn is_ignored(&self, _policy: &TenantPolicy) -> bool {
        false
    }
    /// Action to take on content that is clean but still needs fixing
    fn tidy(&self, _policy: &TenantPolicy) -> Option<Remedy> {
        None
    }
    /// Content that tells two fixes of the same target apart
    fn bucket_content(&self) -> Option<&str> {
        None
    }
}

impl Moderatable for MessageEvent {
    fn kind(&self) -> EventKind {
        if self.edited {
            EventKind::EditedMessage
        } else {
            EventKind::Message
        }
    }

    fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    fn subject(&self) -> UserId {
        self.author_id
    }

    fn roles(&self) -> &[RoleId] {
        &self.author_roles
    }

    fn channel_id(&self) -> Option<ChannelId> {
        Some(self.channel_id)
    }

    fn censor_method(&self) -> CensorMethods {
        CensorMethods::MESSAGES
    }

    fn text(&self) -> &str {
        &self.content
    }

    fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    fn remedy(&self) -> Remedy {
        Remedy {
            kind: ActionKind::RemoveContent,
            target: Target::Message {
                channel_id: self.channel_id,
                message_id: self.message_id,
            },
            params: ActionParams::None,
        }
    }
}

impl Moderatable for NameEvent {
    fn kind(&self) -> EventKind {
        EventKind::Name
    }

    fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    fn subject(&self) -> UserId {
        self.user_id
    }

    fn roles(&self) -> &[RoleId] {
        &self.roles
    }

    fn channel_id(&self) -> Option<ChannelId> {
        None
    }

    fn censor_method(&self) -> CensorMethods {
        CensorMethods::NAMES
    }

    fn text(&self) -> &str {
        self.display_name()
    }

    /// Names the engine set itself and members with an ignored role are skipped
    fn is_ignored(&self, policy: &TenantPolicy) -> bool {
        self.is_reset_name() || self.roles.iter().any(|r| policy.ignored_roles.contains(r))
    }

    fn tidy(&self, policy: &TenantPolicy) -> Option<Remedy> {
        (policy.anti_hoist && self.is_hoisting()).then(|| Remedy {
            kind: ActionKind::ResetName,
            target: Target::Member {
                user_id: self.user_id,
            },
            params: ActionParams::Nickname(Some(self.dehoisted())),
        })
    }

    /// Clear a nickname, or replace the username when there is none
    fn remedy(&self) -> Remedy {
        let nickname = if self.nick.is_some() {
            None
        } else {
            Some(INAPPROPRIATE_NAME.to_string())
        };
        Remedy {
            kind: ActionKind::ResetName,
            target: Target::Member {
                user_id: self.user_id,
            },
            params: ActionParams::Nickname(nickname),
        }
    }

    /// A member is renamed again when a different name needs fixing
    fn bucket_content(&self) -> Option<&str> {
        Some(self.display_name())
    }
}

impl Moderatable for ReactionEvent {
    fn kind(&self) -> EventKind {
        EventKind::Reaction
    }

    fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    fn subject(&self) -> UserId {
        self.user_id
    }

    fn roles(&self) -> &[RoleId] {
        &self.roles
    }

    fn channel_id(&self) -> Option<ChannelId> {
        Some(self.channel_id)
    }

    fn censor_method(&self) -> CensorMethods {
        CensorMethods::REACTIONS
    }

    fn text(&self) -> &str {
        self.emoji_name()
    }

    fn remedy(&self) -> Remedy {
        Remedy {
            kind: ActionKind::RemoveReaction,
            target: Target::Reaction {
                channel_id: self.channel_id,
                message_id: self.message_id,
                user_id: self.user_id,
                emoji: self.emoji.to_string(),
            },
            params: ActionParams::Emoji(self.emoji.clone()),
        }
    }
}

/// Every event the engine accepts
#[derive(Debug, Clone)]
pub enum ModerationEvent {
    Message(MessageEvent),
    Name(NameEvent),
    Reaction(ReactionEvent),
}

impl ModerationEvent {
    fn inner(&self) -> &dyn Moderatable {
        match self {
            Self::Message(event) => event,
            Self::Name(event) => event,
            Self::Reaction(event) => event,
        }
    }
}

impl Moderatable for ModerationEvent {
    fn kind(&self) -> EventKind {
        self.inner().kind()
    }

    fn guild_id(&self) -> GuildId {
        self.inner().guild_id()
    }

    fn subject(&self) -> UserId {
        self.inner().subject()
    }

    fn roles(&self) -> &[RoleId] {
        self.inner().roles()
    }

    fn channel_id(&self) -> Option<ChannelId> {
        self.inner().channel_id()
    }

    fn censor_method(&self) -> CensorMethods {
        self.inner().censor_method()
    }

    fn text(&self) -> &str {
        self.inner().text()
    }

    fn attachments(&self) -> &[Attachment] {
        self.inner().attachments()
    }

    fn remedy(&self) -> Remedy {
        self.inner().remedy()
    }

    fn is_ignored(&self, policy: &TenantPolicy) -> bool {
        self.inner().is_ignored(policy)
    }

    fn tidy(&self, policy: &TenantPolicy) -> Option<Remedy> {
        self.inner().tidy(policy)
    }

    fn bucket_content(&self) -> Option<&str> {
        self.inner().bucket_content()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_event(nick: Option<&str>, username: &str) -> NameEvent {
        NameEvent {
            guild_id: GuildId::new(1),
            user_id: UserId::new(2),
            roles: Vec::new(),
            nick: nick.map(ToString::to_string),
            username: username.to_string(),
        }
    }

    #[test]
    fn test_hoisting_names() {
        assert!(name_event(Some("!admin"), "user").is_hoisting());
        assert!(name_event(None, "0cool").is_hoisting());
        assert!(name_event(None, "_under").is_hoisting());
        assert!(!name_event(None, "Alice").is_hoisting());
        assert!(!name_event(None, "bob").is_hoisting());
        assert!(!name_event(None, "").is_hoisting());

        let dehoisted = name_event(None, "!admin").dehoisted();
        assert!(dehoisted.starts_with(DEHOIST_PREFIX));
        assert!(!name_event(Some(&dehoisted), "user").is_hoisting());
    }

    #[test]
    fn test_name_remedy() {
        let with_nick = name_event(Some("rude"), "user");
        assert_eq!(with_nick.text(), "rude");
        assert!(matches!(with_nick.remedy().params, ActionParams::Nickname(None)));

        let without_nick = name_event(None, "rude");
        match without_nick.remedy().params {
            ActionParams::Nickname(Some(name)) => assert_eq!(name, INAPPROPRIATE_NAME),
            other => panic!("Unexpected params: {other:?}"),
        }

        assert!(name_event(Some(INAPPROPRIATE_NAME), "rude").is_reset_name());
    }

    #[test]
    fn test_name_event_skips_and_tidy() {
        let mut policy = TenantPolicy::new(GuildId::new(1));
        assert!(name_event(Some(INAPPROPRIATE_NAME), "x").is_ignored(&policy));
        assert!(name_event(Some("!top"), "x").tidy(&policy).is_none());

        policy.anti_hoist = true;
        let remedy = name_event(Some("!top"), "x").tidy(&policy).expect("Should dehoist");
        assert_eq!(remedy.kind, ActionKind::ResetName);
        assert_eq!(
            remedy.params,
            ActionParams::Nickname(Some(format!("{DEHOIST_PREFIX}!top")))
        );
        assert!(name_event(None, "plain").tidy(&policy).is_none());

        let mut staff = name_event(Some("!top"), "x");
        staff.roles = vec![RoleId::new(50)];
        policy.ignored_roles = vec![RoleId::new(50)];
        assert!(staff.is_ignored(&policy));
    }

    #[test]
    fn test_attachment_image_detection() {
        let attachment = |filename: &str, content_type: Option<&str>| Attachment {
            url: format!("https://cdn.example/{filename}"),
            filename: filename.to_string(),
            content_type: content_type.map(ToString::to_string),
        };
        assert!(attachment("cat.PNG", None).is_image());
        assert!(attachment("blob", Some("image/webp")).is_image());
        assert!(!attachment("notes.txt", None).is_image());
        assert!(!attachment("photo.png", Some("text/plain")).is_image());
    }

    #[test]
    fn test_event_dispatch() {
        let event = ModerationEvent::Message(MessageEvent {
            guild_id: GuildId::new(1),
            channel_id: ChannelId::new(3),
            message_id: MessageId::new(4),
            author_id: UserId::new(5),
            author_roles: vec![RoleId::new(6)],
            content: "hi".to_string(),
            attachments: Vec::new(),
            edited: true,
        });
        assert_eq!(event.kind(), EventKind::EditedMessage);
        assert_eq!(event.subject(), UserId::new(5));
        assert_eq!(event.channel_id(), Some(ChannelId::new(3)));
        assert_eq!(event.remedy().kind, ActionKind::RemoveContent);
        assert_eq!(event.kind().audit_title(true), "Deleted Edited Message");
        assert_eq!(event.kind().audit_title(false), "Flagged Edited Message");
    }
}
