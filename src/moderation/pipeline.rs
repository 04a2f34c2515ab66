//! The moderation pipeline
//!
//! For each event: read the guild policy, evaluate signals, check
//! exceptions, take the content down, count the violation and apply the
//! punishment of a newly reached tier, then hand an audit record to the
//! logger. Only corrupt internal state is returned as an error; everything
//! else ends up in the [`ModerationOutcome`].

use crate::moderation::{
    ActionBucket, ActionKind, ActionOutcome, ActionParams, ActionRecord, ActorContext,
    AuditLogger, AuditRecord, BAN_DELETE_MESSAGE_DAYS, BucketKey, EnforcementAction,
    EnforcementError, EnforcementSink, EscalationState, EscalationStep, Escalator, Moderatable,
    ModerationResult, PermissionGuard, PolicySource, Remedy, SignalAggregator, Target,
    TenantPolicy, Tier, ViolationVerdict, exceptions,
};
use chrono::Utc;
use derive_more::Display;
use poise::serenity_prelude::{GuildId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How the pipeline disposed of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Decision {
    /// The event is out of the engine's hands
    #[display("ignored")]
    Ignored,
    #[display("clean")]
    Clean,
    #[display("exempt")]
    Exempt,
    /// A violation the bot is not allowed to act on
    #[display("log only")]
    LogOnly,
    /// A repeat delivery of a violation that was already handled
    #[display("duplicate")]
    Duplicate,
    #[display("enforced")]
    Enforced,
}

/// Result of processing one event
#[derive(Debug, Clone)]
pub struct ModerationOutcome {
    pub decision: Decision,
    pub verdict: Option<Arc<ViolationVerdict>>,
    pub actions: Vec<ActionRecord>,
    pub escalation: Option<EscalationStep>,
}

impl ModerationOutcome {
    fn new(decision: Decision, verdict: Option<Arc<ViolationVerdict>>) -> Self {
        Self {
            decision,
            verdict,
            actions: Vec::new(),
            escalation: None,
        }
    }

    /// Outcome of the first action of `kind`, if the pipeline attempted one
    #[must_use]
    pub fn action(&self, kind: ActionKind) -> Option<&ActionOutcome> {
        self.actions
            .iter()
            .find(|record| record.kind == kind)
            .map(|record| &record.outcome)
    }
}

/// The moderation decision engine
pub struct ModerationEngine {
    policies: Arc<dyn PolicySource>,
    signals: SignalAggregator,
    guard: PermissionGuard,
    bucket: ActionBucket,
    escalator: Escalator,
    sink: Arc<dyn EnforcementSink>,
    audit: AuditLogger,
}

impl ModerationEngine {
    #[must_use]
    pub fn new(
        policies: Arc<dyn PolicySource>,
        signals: SignalAggregator,
        guard: PermissionGuard,
        sink: Arc<dyn EnforcementSink>,
        audit: AuditLogger,
        bucket_window: Duration,
    ) -> Self {
        Self {
            policies,
            signals,
            guard,
            bucket: ActionBucket::new(bucket_window),
            escalator: Escalator::new(),
            sink,
            audit,
        }
    }

    #[must_use]
    pub fn escalator(&self) -> &Escalator {
        &self.escalator
    }

    #[must_use]
    pub fn bucket(&self) -> &ActionBucket {
        &self.bucket
    }

    /// A member's escalation state with decay applied at read time
    pub async fn strikes(&self, guild_id: GuildId, user_id: UserId) -> Option<EscalationState> {
        let policy = self.policies.policy(guild_id).await;
        let mut state = self.escalator.get(guild_id, user_id).await?;
        let count = state.effective_count(&policy.punishments, Utc::now());
        if count != state.violation_count {
            state.violation_count = count;
            state.current_tier = Tier::Clean;
        }
        Some(state)
    }

    /// Drop expired bucket slots and long idle escalation states
    ///
    /// A guild whose cooldown is longer than `idle` keeps its states until
    /// they would have decayed.
    pub async fn purge(&self, idle: chrono::Duration) {
        let slots = self.bucket.purge_expired(Instant::now());
        let mut windows = HashMap::new();
        for guild_id in self.escalator.guild_ids() {
            let policy = self.policies.policy(guild_id).await;
            windows.insert(guild_id, idle.max(policy.punishments.cooldown()));
        }
        let states = self.escalator.purge_idle(Utc::now(), |guild_id| {
            windows.get(&guild_id).copied().unwrap_or(idle)
        });
        if slots > 0 || states > 0 {
            debug!(slots, states, "Purged moderation state");
        }
    }

    /// Drop every member's state and the compiled terms of a guild the bot left
    pub fn forget_guild(&self, guild_id: GuildId) {
        self.escalator.clear_guild(guild_id);
        self.signals.forget_guild(guild_id);
        info!(guild_id = %guild_id, "Forgot guild state");
    }

    /// Deliver queued audit records and stop the audit task
    pub async fn shutdown(&self) {
        self.audit.shutdown().await;
    }

    /// Run one event through the pipeline
    ///
    /// # Errors
    /// Returns `ModerationError::CorruptState` if escalation state is inconsistent
    pub async fn process<E: Moderatable + ?Sized>(
        &self,
        event: &E,
    ) -> ModerationResult<ModerationOutcome> {
        let guild_id = event.guild_id();
        // Held for the whole event even if the policy changes meanwhile
        let policy = self.policies.policy(guild_id).await;

        if event.is_ignored(&policy) {
            debug!(guild_id = %guild_id, user_id = %event.subject(), "Event ignored");
            return Ok(ModerationOutcome::new(Decision::Ignored, None));
        }

        let verdict = Arc::new(self.signals.evaluate(event, &policy).await);
        if !verdict.is_violation {
            let mut outcome = ModerationOutcome::new(Decision::Clean, Some(Arc::clone(&verdict)));
            if let Some(remedy) = event.tidy(&policy) {
                let kind = remedy.kind;
                let reason = format!("{} tidied", event.kind());
                let result = self
                    .enforce(event, remedy, &reason, verdict, event.bucket_content())
                    .await;
                outcome.actions.push(ActionRecord {
                    kind,
                    outcome: result,
                });
            }
            return Ok(outcome);
        }

        let actor = ActorContext {
            roles: event.roles(),
            channel_id: event.channel_id(),
        };
        if exceptions::is_exempt(&verdict.signals, &policy, actor) {
            debug!(
                guild_id = %guild_id,
                user_id = %event.subject(),
                signals = ?verdict.signals,
                "Violation exempt"
            );
            return Ok(ModerationOutcome::new(Decision::Exempt, Some(verdict)));
        }

        self.handle_violation(event, &policy, verdict).await
    }

    async fn handle_violation<E: Moderatable + ?Sized>(
        &self,
        event: &E,
        policy: &TenantPolicy,
        verdict: Arc<ViolationVerdict>,
    ) -> ModerationResult<ModerationOutcome> {
        let guild_id = event.guild_id();
        let subject = event.subject();
        let mut record = AuditRecord::new(
            guild_id,
            event.kind(),
            subject,
            event.channel_id(),
            event.text(),
            &verdict,
        );
        record.log_channel = policy.log_channel;
        let mut outcome = ModerationOutcome::new(Decision::Enforced, Some(Arc::clone(&verdict)));

        if policy.remove_content {
            let remedy = event.remedy();
            let kind = remedy.kind;
            let signals: Vec<String> = verdict.signals.iter().map(ToString::to_string).collect();
            let reason = format!("{} matched {}", event.kind(), signals.join(", "));
            let result = self
                .enforce(
                    event,
                    remedy,
                    &reason,
                    Arc::clone(&verdict),
                    event.bucket_content(),
                )
                .await;

            // Neither refused nor repeated violations are counted
            let decision = match result {
                ActionOutcome::Refused(_) => Some(Decision::LogOnly),
                ActionOutcome::Suppressed => Some(Decision::Duplicate),
                _ => None,
            };
            if let Some(decision) = decision {
                record.push_action(kind, result);
                outcome.decision = decision;
                outcome.actions.clone_from(&record.actions);
                self.audit.log(record);
                return Ok(outcome);
            }
            if result == ActionOutcome::Applied {
                record.title = event.kind().audit_title(true);
            }
            record.push_action(kind, result);
        }

        // Held until the punishment for this violation has been applied
        let mut state = self.escalator.lock(guild_id, subject).await?;
        let step = state.record_violation(&policy.punishments, Utc::now())?;
        record.tier = Some(step.tier);
        record.violation_count = Some(step.violation_count);
        debug!(
            guild_id = %guild_id,
            user_id = %subject,
            count = step.violation_count,
            tier = %step.tier,
            "Violation counted"
        );

        if step.reached_new_tier() {
            if let Some(remedy) = Self::punishment(step.tier, event, policy) {
                let kind = remedy.kind;
                let reason = format!(
                    "Reached {} after {} violation(s)",
                    step.tier, step.violation_count
                );
                let result = self
                    .enforce(event, remedy, &reason, Arc::clone(&verdict), None)
                    .await;
                if result == ActionOutcome::Applied {
                    info!(
                        guild_id = %guild_id,
                        user_id = %subject,
                        action = %kind,
                        tier = %step.tier,
                        "Punishment applied"
                    );
                }
                record.push_action(kind, result);
            }
        }
        drop(state);

        outcome.escalation = Some(step);
        outcome.actions.clone_from(&record.actions);
        self.audit.log(record);
        Ok(outcome)
    }

    /// The punishment bound to a tier
    fn punishment<E: Moderatable + ?Sized>(
        tier: Tier,
        event: &E,
        policy: &TenantPolicy,
    ) -> Option<Remedy> {
        let punishments = &policy.punishments;
        let target = Target::Member {
            user_id: event.subject(),
        };
        let kind = match tier {
            Tier::Clean => return None,
            Tier::Warned => {
                // Warnings are posted where the violation happened
                let channel_id = event.channel_id()?;
                return Some(Remedy {
                    kind: ActionKind::Warn,
                    target,
                    params: ActionParams::Warn {
                        channel_id,
                        message: punishments.warn_message.clone(),
                    },
                });
            }
            Tier::Restricted => ActionKind::from(punishments.restrict_action),
            Tier::Removed => ActionKind::from(punishments.remove_action),
        };
        let params = match kind {
            ActionKind::Timeout => ActionParams::Timeout {
                duration_secs: punishments.timeout_secs,
            },
            ActionKind::Ban => ActionParams::Ban {
                delete_message_days: BAN_DELETE_MESSAGE_DAYS,
            },
            _ => ActionParams::None,
        };
        Some(Remedy {
            kind,
            target,
            params,
        })
    }

    /// Authorize, de-duplicate and execute one action
    async fn enforce<E: Moderatable + ?Sized>(
        &self,
        event: &E,
        remedy: Remedy,
        reason: &str,
        verdict: Arc<ViolationVerdict>,
        content: Option<&str>,
    ) -> ActionOutcome {
        let guild_id = event.guild_id();
        let subject = event.subject();

        let grant = match self
            .guard
            .authorize(guild_id, remedy.kind, subject, event.roles())
            .await
        {
            Ok(grant) => grant,
            Err(refusal) => {
                warn!(
                    guild_id = %guild_id,
                    user_id = %subject,
                    action = %remedy.kind,
                    reason = %refusal,
                    "Cannot enforce, logging only"
                );
                return ActionOutcome::Refused(refusal.to_string());
            }
        };
        let action = EnforcementAction::new(grant, remedy.target, remedy.params, reason, verdict);

        let key = BucketKey::new(action.guild_id, action.target.clone(), action.kind)
            .with_content(content);
        if !self.bucket.try_acquire(key) {
            return ActionOutcome::Suppressed;
        }

        match self.sink.target_exists(&action).await {
            Ok(true) => {}
            Ok(false) => {
                info!(action = %action.kind, target = ?action.target, "Target gone before enforcement");
                return ActionOutcome::TargetGone;
            }
            Err(e) => {
                warn!(action = %action.kind, error = %e, "Could not verify target, enforcing anyway");
            }
        }

        match self.sink.execute(&action).await {
            Ok(()) => ActionOutcome::Applied,
            Err(EnforcementError::TargetGone(target)) => {
                info!(action = %action.kind, target = %target, "Target gone during enforcement");
                ActionOutcome::TargetGone
            }
            Err(e) => {
                error!(
                    action_id = %action.id,
                    guild_id = %action.guild_id,
                    user_id = %action.subject,
                    action = %action.kind,
                    error = %e,
                    "Enforcement failed"
                );
                ActionOutcome::Failed(e.to_string())
            }
        }
    }
}
