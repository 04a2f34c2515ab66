//! Background upkeep of the moderation engine
//!
//! Periodically drops expired bucket slots and idle escalation states, and
//! writes every accepted policy update back to disk.

use crate::moderation::{ModerationEngine, PolicyStore, TenantPolicy};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Requests accepted by the maintenance task
#[derive(Debug, Clone)]
pub enum MaintenanceRequest {
    /// Purge expired state now
    Purge,
    /// Stop the task
    Shutdown,
}

/// Settings of the maintenance task
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSettings {
    pub interval: Duration,
    pub escalation_idle: chrono::Duration,
}

/// Spawn the maintenance task and return its request channel
pub fn start(
    engine: Arc<ModerationEngine>,
    policies: PolicyStore,
    settings: MaintenanceSettings,
) -> (mpsc::Sender<MaintenanceRequest>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let changes = policies.subscribe();
    let handle = tokio::spawn(run(engine, policies, changes, rx, settings));
    (tx, handle)
}

async fn run(
    engine: Arc<ModerationEngine>,
    policies: PolicyStore,
    mut changes: broadcast::Receiver<Arc<TenantPolicy>>,
    mut rx: mpsc::Receiver<MaintenanceRequest>,
    settings: MaintenanceSettings,
) {
    info!(
        "Starting maintenance task with {}s interval",
        settings.interval.as_secs()
    );
    let mut interval = tokio::time::interval(settings.interval);

    loop {
        tokio::select! {
            request = rx.recv() => {
                match request {
                    Some(MaintenanceRequest::Purge) => {
                        engine.purge(settings.escalation_idle).await;
                    }
                    Some(MaintenanceRequest::Shutdown) | None => {
                        info!("Received shutdown request for maintenance task");
                        break;
                    }
                }
            },

            change = changes.recv() => {
                match change {
                    Ok(policy) => {
                        if let Err(e) = policies.save(policy.guild_id).await {
                            error!(guild_id = %policy.guild_id, error = %e, "Failed to save policy");
                        } else {
                            debug!(guild_id = %policy.guild_id, revision = policy.revision, "Saved policy");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Policy updates lagged, some were not saved");
                    }
                    Err(RecvError::Closed) => {
                        warn!("Policy update channel closed");
                        break;
                    }
                }
            },

            _ = interval.tick() => {
                engine.purge(settings.escalation_idle).await;
            }
        }
    }

    info!("Maintenance task shut down");
}
