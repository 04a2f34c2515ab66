//! Moderation decision engine
//!
//! Turns guild events into enforcement decisions: pattern matching and
//! classifier signals, exceptions, permission checks, de-duplication of
//! actions, escalating punishments and an audit trail.

mod action;
mod audit;
mod bucket;
mod error;
mod escalation;
mod event;
pub mod exceptions;
pub mod filter;
mod handler;
mod permissions;
mod pipeline;
mod policy;
mod policy_store;
mod signals;
mod snapshot;

pub use action::{
    ActionKind, ActionParams, BAN_DELETE_MESSAGE_DAYS, EnforcementAction, EnforcementSink, Remedy,
};
pub use audit::{
    ActionOutcome, ActionRecord, AuditLogger, AuditRecord, AuditSink, DiscordAuditSink,
    HIGHLIGHT_MARKER,
};
pub use bucket::{ActionBucket, BucketKey};
pub use error::{
    ConfigError, EnforcementError, EnforcementResult, ModerationError, ModerationResult,
    SignalError,
};
pub use escalation::{EscalationState, EscalationStep, Escalator};
pub use event::{
    Attachment, DEHOIST_PREFIX, EventKind, INAPPROPRIATE_NAME, MessageEvent, Moderatable,
    ModerationEvent, NameEvent, ReactionEvent, Target,
};
pub use exceptions::ActorContext;
pub use filter::{FilterId, PatternFilter};
pub use handler::{ActionHandler, ActionHandlerRegistry};
pub use permissions::{Authorized, CapabilitySnapshot, PermissionGuard, Refusal, SnapshotProvider};
pub use pipeline::{Decision, ModerationEngine, ModerationOutcome};
pub use policy::{
    CensorMethods, Exception, ExceptionScope, MAX_TIMEOUT_SECS, PunishmentKind, PunishmentPolicy,
    TenantPolicy, Tier,
};
pub use policy_store::{POLICY_DIR, PolicySource, PolicyStore};
pub use signals::{
    Classifiers, ImageClassifier, ImageScore, PhishingChecker, SignalAggregator, SignalKind,
    SignalSettings, TextExtractor, ToxicityScorer, ViolationVerdict,
};
pub use snapshot::CacheSnapshotProvider;
