//! Guild policy store
//!
//! Policies are validated before they are stored, so readers only ever see
//! valid snapshots. Each accepted update bumps the revision and is announced
//! on a broadcast channel.

use crate::moderation::{ConfigError, TenantPolicy};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use poise::serenity_prelude::GuildId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Directory policies are loaded from and saved to
pub const POLICY_DIR: &str = "data/policies";

/// Where the pipeline reads policies from
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// The current policy of a guild
    async fn policy(&self, guild_id: GuildId) -> Arc<TenantPolicy>;
}

/// In-memory policies persisted as one YAML file per guild
#[derive(Debug, Clone)]
pub struct PolicyStore {
    policies: Arc<DashMap<GuildId, Arc<TenantPolicy>>>,
    changes: broadcast::Sender<Arc<TenantPolicy>>,
    dir: PathBuf,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(POLICY_DIR)
    }
}

impl PolicyStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            policies: Arc::new(DashMap::new()),
            changes,
            dir: dir.into(),
        }
    }

    /// The policy of a guild, or the default policy if none was stored
    #[must_use]
    pub fn get(&self, guild_id: GuildId) -> Arc<TenantPolicy> {
        self.policies
            .get(&guild_id)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| Arc::new(TenantPolicy::new(guild_id)))
    }

    /// Validate and store a policy
    ///
    /// The stored revision is one above the revision it replaces.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if the policy fails validation
    pub fn update(&self, policy: TenantPolicy) -> Result<Arc<TenantPolicy>, ConfigError> {
        self.store(policy.guild_id, move |_| policy)
    }

    /// Apply a change to the current policy of a guild
    ///
    /// The change runs while the guild's entry is held, so concurrent changes
    /// never overwrite each other. It must not call back into the store.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if the changed policy fails validation
    pub fn modify(
        &self,
        guild_id: GuildId,
        change: impl FnOnce(&mut TenantPolicy),
    ) -> Result<Arc<TenantPolicy>, ConfigError> {
        self.store(guild_id, |current| {
            let mut policy = current.clone();
            change(&mut policy);
            policy.guild_id = guild_id;
            policy
        })
    }

    /// Replace a guild's policy with `build(current)` under the entry lock
    fn store(
        &self,
        guild_id: GuildId,
        build: impl FnOnce(&TenantPolicy) -> TenantPolicy,
    ) -> Result<Arc<TenantPolicy>, ConfigError> {
        let stored = match self.policies.entry(guild_id) {
            Entry::Occupied(mut entry) => {
                let stored = Self::accept(build(entry.get()), entry.get().revision)?;
                *entry.get_mut() = Arc::clone(&stored);
                stored
            }
            Entry::Vacant(entry) => {
                let current = TenantPolicy::new(guild_id);
                let stored = Self::accept(build(&current), current.revision)?;
                entry.insert(Arc::clone(&stored));
                stored
            }
        };

        info!(guild_id = %guild_id, revision = stored.revision, "Policy updated");
        // No subscribers is fine
        let _ = self.changes.send(Arc::clone(&stored));
        Ok(stored)
    }

    fn accept(mut policy: TenantPolicy, previous: u64) -> Result<Arc<TenantPolicy>, ConfigError> {
        policy.validate().inspect_err(|e| {
            warn!(guild_id = %policy.guild_id, error = %e, "Rejected policy update");
        })?;
        policy.revision = previous + 1;
        Ok(Arc::new(policy))
    }

    /// Receive every accepted update
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TenantPolicy>> {
        self.changes.subscribe()
    }

    /// Load every `*.yaml` policy in the store's directory
    ///
    /// Files that fail to parse or validate are skipped with a warning.
    ///
    /// # Errors
    /// Returns an error if the directory pattern is malformed
    pub async fn load(&self) -> Result<usize, ConfigError> {
        let pattern = self.dir.join("*.yaml");
        let pattern = pattern.to_string_lossy();
        let mut loaded = 0;

        for path in glob::glob(&pattern)?.flatten() {
            match Self::read(&path).await {
                Ok(policy) => {
                    self.policies.insert(policy.guild_id, Arc::new(policy));
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping policy file");
                }
            }
        }

        info!(count = loaded, dir = %self.dir.display(), "Loaded guild policies");
        Ok(loaded)
    }

    async fn read(path: &Path) -> Result<TenantPolicy, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let policy: TenantPolicy = serde_yaml::from_str(&content)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Write a guild's policy to disk
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the file cannot be written
    pub async fn save(&self, guild_id: GuildId) -> Result<(), ConfigError> {
        let policy = self.get(guild_id);
        tokio::fs::create_dir_all(&self.dir).await?;
        let yaml = serde_yaml::to_string(policy.as_ref())?;
        tokio::fs::write(self.dir.join(format!("{guild_id}.yaml")), yaml).await?;
        Ok(())
    }
}

#[async_trait]
impl PolicySource for PolicyStore {
    async fn policy(&self, guild_id: GuildId) -> Arc<TenantPolicy> {
        self.get(guild_id)
    }
}
