//! Exception rules
//!
//! An exception matches when its scope covers one of the triggered signals
//! and every constraint it sets (role, channel) holds. Any single match
//! exempts the whole event.

use crate::moderation::{Exception, ExceptionScope, SignalKind, TenantPolicy};
use poise::serenity_prelude::{ChannelId, RoleId};
use std::collections::BTreeSet;

/// Who acted and where
#[derive(Debug, Clone, Copy)]
pub struct ActorContext<'a> {
    pub roles: &'a [RoleId],
    pub channel_id: Option<ChannelId>,
}

/// Whether `scope` covers a signal
#[must_use]
pub fn scope_covers(scope: ExceptionScope, signal: SignalKind) -> bool {
    match scope {
        ExceptionScope::AllSignals => true,
        ExceptionScope::TextFilterOnly => signal == SignalKind::CustomFilter,
        ExceptionScope::PrebuiltFilterOnly => signal == SignalKind::PrebuiltFilter,
    }
}

/// Whether one exception applies to the actor for any of `signals`
#[must_use]
pub fn matches(exception: &Exception, signals: &BTreeSet<SignalKind>, actor: ActorContext<'_>) -> bool {
    let covered = signals.iter().any(|signal| scope_covers(exception.scope, *signal));
    let role_ok = exception.role.is_none_or(|role| actor.roles.contains(&role));
    let channel_ok = exception
        .channel
        .is_none_or(|channel| actor.channel_id == Some(channel));
    covered && role_ok && channel_ok
}

/// Decide whether a violation is exempt under the guild's exceptions
#[must_use]
pub fn is_exempt(
    signals: &BTreeSet<SignalKind>,
    policy: &TenantPolicy,
    actor: ActorContext<'_>,
) -> bool {
    policy
        .exceptions
        .iter()
        .any(|exception| matches(exception, signals, actor))
}
