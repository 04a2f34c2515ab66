//! Permission guard
//!
//! Checks that the bot holds the capability an action needs and that the
//! target sits below the bot in the role hierarchy. A successful check
//! yields an [`Authorized`] grant, the only way to build an
//! [`EnforcementAction`](crate::moderation::EnforcementAction).

use crate::moderation::ActionKind;
use async_trait::async_trait;
use derive_more::Display;
use poise::serenity_prelude::{GuildId, Permissions, RoleId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Point-in-time view of the bot's standing in a guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub owner_id: UserId,
    pub agent_permissions: Permissions,
    /// Position of the bot's highest role, `None` when it has no roles
    pub agent_top_role: Option<u16>,
    pub role_positions: HashMap<RoleId, u16>,
}

impl CapabilitySnapshot {
    /// Highest position among `roles`, ignoring roles the snapshot does not know
    #[must_use]
    pub fn top_position(&self, roles: &[RoleId]) -> Option<u16> {
        roles
            .iter()
            .filter_map(|role| self.role_positions.get(role))
            .copied()
            .max()
    }
}

/// Supplies capability snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self, guild_id: GuildId) -> Option<CapabilitySnapshot>;
}

/// Why an action was refused
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Refusal {
    #[display("missing permission {_0:?}")]
    MissingPermission(Permissions),
    #[display("target is the guild owner")]
    TargetIsOwner,
    #[display("target's highest role is not below the bot's")]
    Hierarchy,
    #[display("no capability snapshot for the guild")]
    NoSnapshot,
}

/// Proof that the guard allowed one kind of action on one member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorized {
    guild_id: GuildId,
    kind: ActionKind,
    subject: UserId,
}

impl Authorized {
    #[must_use]
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    #[must_use]
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    #[must_use]
    pub fn subject(&self) -> UserId {
        self.subject
    }
}

/// Decide whether the bot may perform `kind` on `target`
///
/// # Errors
/// Returns the first check that failed
pub fn can_enforce(
    snapshot: &CapabilitySnapshot,
    target: UserId,
    target_roles: &[RoleId],
    kind: ActionKind,
) -> Result<(), Refusal> {
    let required = kind.required_permissions();
    let granted = snapshot.agent_permissions;
    if !granted.contains(Permissions::ADMINISTRATOR) && !granted.contains(required) {
        return Err(Refusal::MissingPermission(required));
    }

    if !kind.needs_hierarchy() {
        return Ok(());
    }
    if target == snapshot.owner_id {
        return Err(Refusal::TargetIsOwner);
    }
    match (snapshot.agent_top_role, snapshot.top_position(target_roles)) {
        (_, None) => Ok(()),
        (Some(agent), Some(target)) if agent > target => Ok(()),
        _ => Err(Refusal::Hierarchy),
    }
}

/// Issues [`Authorized`] grants from capability snapshots
#[derive(Clone)]
pub struct PermissionGuard {
    provider: Arc<dyn SnapshotProvider>,
}

impl PermissionGuard {
    #[must_use]
    pub fn new(provider: Arc<dyn SnapshotProvider>) -> Self {
        Self { provider }
    }

    /// Check an action against a fresh snapshot
    ///
    /// # Errors
    /// Returns a [`Refusal`] when the action must not be attempted
    pub async fn authorize(
        &self,
        guild_id: GuildId,
        kind: ActionKind,
        subject: UserId,
        subject_roles: &[RoleId],
    ) -> Result<Authorized, Refusal> {
        let snapshot = self
            .provider
            .snapshot(guild_id)
            .await
            .ok_or(Refusal::NoSnapshot)?;

        can_enforce(&snapshot, subject, subject_roles, kind).inspect_err(|refusal| {
            debug!(
                guild_id = %guild_id,
                user_id = %subject,
                action = %kind,
                reason = %refusal,
                "Action refused"
            );
        })?;

        Ok(Authorized {
            guild_id,
            kind,
            subject,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODERATOR: RoleId = RoleId::new(10);
    const MEMBER: RoleId = RoleId::new(11);
    const ADMIN: RoleId = RoleId::new(12);

    fn snapshot(permissions: Permissions, agent_top: Option<u16>) -> CapabilitySnapshot {
        CapabilitySnapshot {
            owner_id: UserId::new(1),
            agent_permissions: permissions,
            agent_top_role: agent_top,
            role_positions: HashMap::from([(MEMBER, 1), (MODERATOR, 5), (ADMIN, 9)]),
        }
    }

    #[test]
    fn test_capability_check() {
        let snap = snapshot(Permissions::MANAGE_MESSAGES, Some(5));
        let target = UserId::new(2);
        assert!(can_enforce(&snap, target, &[MEMBER], ActionKind::RemoveContent).is_ok());
        assert_eq!(
            can_enforce(&snap, target, &[MEMBER], ActionKind::ResetName),
            Err(Refusal::MissingPermission(Permissions::MANAGE_NICKNAMES))
        );

        let admin = snapshot(Permissions::ADMINISTRATOR, Some(5));
        assert!(can_enforce(&admin, target, &[MEMBER], ActionKind::Ban).is_ok());
    }

    #[test]
    fn test_hierarchy_is_strict() {
        let snap = snapshot(Permissions::all(), Some(5));
        let target = UserId::new(2);
        assert!(can_enforce(&snap, target, &[MEMBER], ActionKind::Timeout).is_ok());
        assert_eq!(
            can_enforce(&snap, target, &[MODERATOR], ActionKind::Timeout),
            Err(Refusal::Hierarchy)
        );
        assert_eq!(
            can_enforce(&snap, target, &[MEMBER, ADMIN], ActionKind::Kick),
            Err(Refusal::Hierarchy)
        );
        // Deleting content does not depend on the hierarchy
        assert!(can_enforce(&snap, target, &[ADMIN], ActionKind::RemoveContent).is_ok());
    }

    #[test]
    fn test_refused_whenever_target_rank_is_not_lower() {
        let kinds = [
            ActionKind::ResetName,
            ActionKind::Timeout,
            ActionKind::Kick,
            ActionKind::Ban,
        ];
        let target = UserId::new(2);
        for agent in 0..10u16 {
            let snap = snapshot(Permissions::all(), Some(agent));
            for role in [MEMBER, MODERATOR, ADMIN] {
                let target_rank = snap.role_positions[&role];
                for kind in kinds {
                    let allowed = can_enforce(&snap, target, &[role], kind).is_ok();
                    assert_eq!(allowed, agent > target_rank, "agent {agent} target {target_rank}");
                }
            }
        }
    }

    #[test]
    fn test_owner_and_roleless_members() {
        let snap = snapshot(Permissions::all(), Some(5));
        assert_eq!(
            can_enforce(&snap, UserId::new(1), &[], ActionKind::Ban),
            Err(Refusal::TargetIsOwner)
        );
        // A member without roles is always below the bot
        assert!(can_enforce(&snap, UserId::new(2), &[], ActionKind::Ban).is_ok());

        let roleless_bot = snapshot(Permissions::all(), None);
        assert!(can_enforce(&roleless_bot, UserId::new(2), &[], ActionKind::Kick).is_ok());
        assert_eq!(
            can_enforce(&roleless_bot, UserId::new(2), &[MEMBER], ActionKind::Kick),
            Err(Refusal::Hierarchy)
        );
    }

    #[tokio::test]
    async fn test_guard_issues_grants() {
        let mut provider = MockSnapshotProvider::new();
        provider
            .expect_snapshot()
            .returning(|_| Some(snapshot(Permissions::MODERATE_MEMBERS, Some(5))));
        let guard = PermissionGuard::new(Arc::new(provider));

        let grant = guard
            .authorize(GuildId::new(7), ActionKind::Timeout, UserId::new(2), &[MEMBER])
            .await
            .expect("Timeout should be allowed");
        assert_eq!(grant.kind(), ActionKind::Timeout);
        assert_eq!(grant.subject(), UserId::new(2));

        let refused = guard
            .authorize(GuildId::new(7), ActionKind::Ban, UserId::new(2), &[MEMBER])
            .await;
        assert!(matches!(refused, Err(Refusal::MissingPermission(_))));
    }

    #[tokio::test]
    async fn test_guard_without_snapshot() {
        let mut provider = MockSnapshotProvider::new();
        provider.expect_snapshot().returning(|_| None);
        let guard = PermissionGuard::new(Arc::new(provider));

        let refused = guard
            .authorize(GuildId::new(7), ActionKind::Warn, UserId::new(2), &[])
            .await;
        assert_eq!(refused, Err(Refusal::NoSnapshot));
    }
}
