use std::{ops::Deref, sync::Arc};

use crate::EngineConfig;
use crate::maintenance::MaintenanceRequest;
use crate::moderation::{ModerationEngine, PolicyStore};
use poise::serenity_prelude::prelude::TypeMapKey;
use tokio::sync::mpsc::Sender;

/// Centralized data structure for the bot
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

// Stored in serenity's data map so the gateway handler can reach the engine
impl TypeMapKey for Data {
    type Value = Data;
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("config", &self.config)
            .field("policies", &self.policies)
            .field("escalation_states", &self.engine.escalator().len())
            .field("bucket_slots", &self.engine.bucket().len())
            .finish_non_exhaustive()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Data {
    #[must_use]
    pub fn new(config: EngineConfig, policies: PolicyStore, engine: Arc<ModerationEngine>) -> Self {
        Self(Arc::new(DataInner {
            config,
            policies,
            engine,
            maintenance_tx: None,
        }))
    }

    /// Attach the sender of the maintenance task
    #[must_use]
    pub fn with_maintenance(self, tx: Sender<MaintenanceRequest>) -> Self {
        let mut inner = Arc::unwrap_or_clone(self.0);
        inner.maintenance_tx = Some(tx);
        Self(Arc::new(inner))
    }

    /// Stop background work and deliver queued audit records
    pub async fn shutdown(&self) {
        if let Some(tx) = &self.maintenance_tx {
            // The task may already be gone
            let _ = tx.send(MaintenanceRequest::Shutdown).await;
        }
        self.engine.shutdown().await;
    }
}

/// Main centralized data structure for the bot
#[derive(Clone)]
pub struct DataInner {
    pub config: EngineConfig,
    /// Guild policies, shared with the engine
    pub policies: PolicyStore,
    pub engine: Arc<ModerationEngine>,
    /// Channel to the maintenance task
    pub maintenance_tx: Option<Sender<MaintenanceRequest>>,
}
