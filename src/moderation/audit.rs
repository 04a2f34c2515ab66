//! Audit logging
//!
//! Records are queued on a bounded channel and delivered by a background
//! task, so a slow or failing destination never holds up moderation.

use crate::moderation::filter::{FilterId, PatternFilter};
use crate::moderation::{ActionKind, EnforcementResult, EventKind, SignalKind, Tier, ViolationVerdict};
use crate::MODERATION_TARGET;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use poise::serenity_prelude::{
    ChannelId, CreateEmbed, CreateEmbedFooter, CreateMessage, GuildId, Http, UserId,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Colour of audit embeds
pub const AUDIT_COLOR: u32 = 0xEA5455;

/// Marker wrapped around matched text
pub const HIGHLIGHT_MARKER: &str = "__";

/// What happened to one action the pipeline wanted to take
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Display)]
pub enum ActionOutcome {
    #[display("applied")]
    Applied,
    /// The bucket already held this action for the target
    #[display("suppressed")]
    Suppressed,
    #[display("not authorized: {_0}")]
    Refused(String),
    #[display("target gone")]
    TargetGone,
    #[display("failed: {_0}")]
    Failed(String),
}

/// One action and its outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub outcome: ActionOutcome,
}

/// Structured record of one moderation decision
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub guild_id: GuildId,
    /// Where the record is delivered, if the guild set a destination
    pub log_channel: Option<ChannelId>,
    pub event: EventKind,
    pub title: String,
    pub subject: UserId,
    /// Channel the content appeared in
    pub channel_id: Option<ChannelId>,
    /// Original content with matches highlighted
    pub content: String,
    pub filters: Vec<String>,
    pub signals: Vec<SignalKind>,
    pub actions: Vec<ActionRecord>,
    pub tier: Option<Tier>,
    pub violation_count: Option<u32>,
}

impl AuditRecord {
    /// Start a record for a violation
    #[must_use]
    pub fn new(
        guild_id: GuildId,
        event: EventKind,
        subject: UserId,
        channel_id: Option<ChannelId>,
        text: &str,
        verdict: &ViolationVerdict,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            guild_id,
            log_channel: None,
            event,
            title: event.audit_title(false),
            subject,
            channel_id,
            content: PatternFilter::surround(text, &verdict.matched_ranges, HIGHLIGHT_MARKER),
            filters: verdict
                .matched_filters
                .iter()
                .map(FilterId::display_name)
                .collect(),
            signals: verdict.signals.iter().copied().collect(),
            actions: Vec::new(),
            tier: None,
            violation_count: None,
        }
    }

    /// Note an action and its outcome
    pub fn push_action(&mut self, kind: ActionKind, outcome: ActionOutcome) {
        self.actions.push(ActionRecord { kind, outcome });
    }
}

/// Destination for audit records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn deliver(&self, record: &AuditRecord) -> EnforcementResult<()>;
}

/// Delivers records as embeds in the guild's log channel
pub struct DiscordAuditSink {
    http: Arc<Http>,
}

impl DiscordAuditSink {
    #[must_use]
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    fn embed(record: &AuditRecord) -> CreateEmbed {
        let mut embed = CreateEmbed::new()
            .title(&record.title)
            .color(AUDIT_COLOR)
            .description(format!("<@{}>", record.subject))
            .timestamp(record.timestamp)
            .footer(CreateEmbedFooter::new(format!("User ID: {}", record.subject)));

        if !record.content.is_empty() {
            embed = embed.field("Content", truncate(&record.content, 1024), false);
        }
        if let Some(channel_id) = record.channel_id {
            embed = embed.field("Channel", format!("<#{channel_id}>"), true);
        }
        if !record.filters.is_empty() {
            let name = if record.filters.len() == 1 { "Filter" } else { "Filters" };
            embed = embed.field(name, record.filters.join(", "), true);
        }
        let other_signals: Vec<String> = record
            .signals
            .iter()
            .filter(|s| !matches!(s, SignalKind::CustomFilter | SignalKind::PrebuiltFilter))
            .map(ToString::to_string)
            .collect();
        if !other_signals.is_empty() {
            embed = embed.field("Signals", other_signals.join(", "), true);
        }
        if !record.actions.is_empty() {
            let actions: Vec<String> = record
                .actions
                .iter()
                .map(|a| format!("{}: {}", a.kind, a.outcome))
                .collect();
            embed = embed.field("Actions", actions.join("\n"), false);
        }
        if let (Some(tier), Some(count)) = (record.tier, record.violation_count) {
            embed = embed.field("Strikes", format!("{count} ({tier})"), true);
        }
        embed
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

#[async_trait]
impl AuditSink for DiscordAuditSink {
    async fn deliver(&self, record: &AuditRecord) -> EnforcementResult<()> {
        let Some(channel_id) = record.log_channel else {
            return Ok(());
        };
        channel_id
            .send_message(&*self.http, CreateMessage::new().embed(Self::embed(record)))
            .await?;
        Ok(())
    }
}

enum AuditCommand {
    Record(Box<AuditRecord>),
    Shutdown,
}

/// Queue in front of an [`AuditSink`]
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<AuditCommand>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AuditLogger {
    /// Spawn the delivery task
    #[must_use]
    pub fn start(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(Self::run(sink, rx));
        Self {
            tx,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    async fn run(sink: Arc<dyn AuditSink>, mut rx: mpsc::Receiver<AuditCommand>) {
        info!("Audit logger started");
        while let Some(command) = rx.recv().await {
            match command {
                AuditCommand::Record(record) => {
                    if let Err(e) = sink.deliver(&record).await {
                        warn!(
                            guild_id = %record.guild_id,
                            record_id = %record.id,
                            error = %e,
                            "Failed to deliver audit record"
                        );
                    }
                }
                AuditCommand::Shutdown => break,
            }
        }
        info!("Audit logger shut down");
    }

    /// Queue a record without waiting
    ///
    /// The record is always written to the moderation log; delivery to the
    /// sink is dropped if the queue is full.
    pub fn log(&self, record: AuditRecord) {
        info!(
            target: MODERATION_TARGET,
            record_id = %record.id,
            guild_id = %record.guild_id,
            user_id = %record.subject,
            event = %record.event,
            title = %record.title,
            filters = ?record.filters,
            signals = ?record.signals,
            actions = ?record.actions,
            tier = ?record.tier,
            violation_count = ?record.violation_count,
            "Moderation decision"
        );

        if let Err(e) = self.tx.try_send(AuditCommand::Record(Box::new(record))) {
            match e {
                mpsc::error::TrySendError::Full(_) => warn!("Audit queue full, dropping record"),
                mpsc::error::TrySendError::Closed(_) => {
                    error!("Audit logger is shut down, dropping record");
                }
            }
        }
    }

    /// Deliver everything queued so far and stop the task
    pub async fn shutdown(&self) {
        if self.tx.send(AuditCommand::Shutdown).await.is_err() {
            return;
        }
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Audit logger task failed");
            }
        }
    }
}
