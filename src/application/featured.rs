//! Featured-set curation: toggle, read-cache, and backfill execution.
//!
//! The persisted id list (`featured:ids`) is the source of truth; the
//! read-cache and the listings metadata's `featured` flags are derived and
//! always reconstructable, so mutations persist the source first and sync
//! the derived caches best-effort afterwards — except the listings patch,
//! whose failure falls back to full invalidation (correctness over
//! efficiency).

use std::sync::Arc;

use metrics::counter;
use rand::seq::SliceRandom;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::application::backfill::BackfillScheduler;
use crate::cache::ListingsCache;
use crate::cache::keys;
use crate::config::{CacheSettings, FeaturedSettings};
use crate::domain::error::GatewayError;
use crate::domain::featured::{BackfillJob, BackfillStatus, FeaturedSet};
use crate::infra::kv::{self, KeyValueStore};

/// What a toggle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleAction {
    Added,
    Removed,
}

/// Result of a toggle, reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToggleOutcome {
    pub featured_ids: Vec<String>,
    pub action: ToggleAction,
    /// Present when the removal dropped the set below the floor and a
    /// replenishment was scheduled.
    pub backfill: Option<BackfillJob>,
}

/// Result of an [`FeaturedSetManager::execute_due_backfill`] run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum BackfillRun {
    /// Nothing pending.
    NoJob,
    /// A job exists but `execute_at` has not passed.
    NotDue { status: BackfillStatus },
    /// The execute-time recheck found the set already at target; the job
    /// was consumed as a no-op.
    AlreadySufficient,
    /// Ids were added. `complete` is false when fewer candidates existed
    /// than needed — reported, not retried.
    Completed { added: Vec<String>, complete: bool },
}

pub struct FeaturedSetManager {
    store: Arc<dyn KeyValueStore>,
    listings: Arc<ListingsCache>,
    scheduler: BackfillScheduler,
    settings: FeaturedSettings,
    cache: CacheSettings,
}

impl FeaturedSetManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        listings: Arc<ListingsCache>,
        settings: FeaturedSettings,
        cache: CacheSettings,
    ) -> Self {
        let scheduler = BackfillScheduler::new(Arc::clone(&store), settings.clone());
        Self {
            store,
            listings,
            scheduler,
            settings,
            cache,
        }
    }

    /// Add or remove one id.
    ///
    /// Removal below the floor schedules a backfill before the list is
    /// persisted; an add at capacity is rejected with the limit in the
    /// message and the set unchanged.
    pub async fn toggle(&self, id: &str) -> Result<ToggleOutcome, GatewayError> {
        let mut set = self.load_set().await?;

        if set.contains(id) {
            set.remove(id);
            // The scheduling decision uses the count after the removal.
            let backfill = if set.below_min() {
                self.scheduler.schedule(set.len()).await
            } else {
                None
            };
            self.persist_and_sync(&set).await?;
            info!(
                target: "vetrina::featured",
                id,
                count = set.len(),
                backfill_scheduled = backfill.is_some(),
                "featured property removed"
            );
            Ok(ToggleOutcome {
                featured_ids: set.into_ids(),
                action: ToggleAction::Removed,
                backfill,
            })
        } else {
            set.add(id)?;
            self.persist_and_sync(&set).await?;
            info!(
                target: "vetrina::featured",
                id,
                count = set.len(),
                "featured property added"
            );
            Ok(ToggleOutcome {
                featured_ids: set.into_ids(),
                action: ToggleAction::Added,
                backfill: None,
            })
        }
    }

    /// The featured id list, via the long-TTL read cache.
    pub async fn get_ids(&self) -> Result<Vec<String>, GatewayError> {
        match kv::get_json::<Vec<String>>(&*self.store, keys::FEATURED_IDS_CACHE).await {
            Ok(Some(ids)) => {
                counter!("vetrina_cache_hit_total").increment(1);
                return Ok(ids);
            }
            Ok(None) => {}
            Err(err) => warn!(
                target: "vetrina::featured",
                error = %err,
                "featured read-cache failed; falling back to source of truth"
            ),
        }
        counter!("vetrina_cache_miss_total").increment(1);

        let ids = self.load_ids().await?;
        if let Err(err) = kv::put_json(
            &*self.store,
            keys::FEATURED_IDS_CACHE,
            &ids,
            Some(self.cache.featured_cache_ttl_secs),
        )
        .await
        {
            warn!(
                target: "vetrina::featured",
                error = %err,
                "failed to repopulate featured read-cache"
            );
        }
        Ok(ids)
    }

    /// Read-only view of the pending backfill job.
    pub async fn backfill_status(&self) -> Result<Option<BackfillStatus>, GatewayError> {
        self.scheduler
            .status()
            .await
            .map_err(|err| GatewayError::inconsistent(format!("backfill job unreadable: {err}")))
    }

    /// Run the pending backfill if it is due.
    ///
    /// Cardinality is rechecked at execution time, so a job made stale by a
    /// re-add completes as a harmless no-op. Replenishment ids are drawn by
    /// uniform sampling without replacement from listings not already
    /// featured, and added through the same persistence path as manual
    /// toggles. On any error the job is left pending for the next check —
    /// at-least-once, idempotent by recheck.
    pub async fn execute_due_backfill(&self) -> Result<BackfillRun, GatewayError> {
        let job = match self
            .scheduler
            .load()
            .await
            .map_err(|err| GatewayError::inconsistent(format!("backfill job unreadable: {err}")))?
        {
            Some(job) => job,
            None => return Ok(BackfillRun::NoJob),
        };

        let now = OffsetDateTime::now_utc();
        if !job.is_due(now) {
            return Ok(BackfillRun::NotDue {
                status: job.status(now),
            });
        }

        let set = self.load_set().await?;
        if set.len() >= job.target_count {
            self.consume_job().await?;
            info!(
                target: "vetrina::backfill",
                count = set.len(),
                target = job.target_count,
                "backfill no longer needed; job consumed"
            );
            return Ok(BackfillRun::AlreadySufficient);
        }
        let needed = job.target_count - set.len();

        let snapshot = self.listings.fetch_all().await?;
        let mut candidates: Vec<String> = snapshot
            .ids()
            .filter(|id| !set.contains(id))
            .map(str::to_string)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(needed);

        if candidates.len() < needed {
            warn!(
                target: "vetrina::backfill",
                needed,
                available = candidates.len(),
                "fewer candidates than needed; completing partially"
            );
        }

        let added = self.add_all(&candidates).await?;
        self.consume_job().await?;
        counter!("vetrina_backfill_executed_total").increment(1);
        info!(
            target: "vetrina::backfill",
            added = added.len(),
            needed,
            "backfill executed"
        );

        let complete = added.len() == needed;
        Ok(BackfillRun::Completed { added, complete })
    }

    async fn consume_job(&self) -> Result<(), GatewayError> {
        self.scheduler.delete().await.map_err(|err| {
            GatewayError::inconsistent(format!("backfill job could not be deleted: {err}"))
        })
    }

    /// Add many ids through the same contract as a manual toggle.
    async fn add_all(&self, ids: &[String]) -> Result<Vec<String>, GatewayError> {
        let mut set = self.load_set().await?;
        let mut added = Vec::with_capacity(ids.len());
        for id in ids {
            match set.add(id) {
                Ok(()) => added.push(id.clone()),
                Err(GatewayError::CapacityExceeded { .. }) => break,
                Err(err) => return Err(err),
            }
        }
        if !added.is_empty() {
            self.persist_and_sync(&set).await?;
        }
        Ok(added)
    }

    async fn load_set(&self) -> Result<FeaturedSet, GatewayError> {
        Ok(FeaturedSet::new(self.load_ids().await?, &self.settings))
    }

    async fn load_ids(&self) -> Result<Vec<String>, GatewayError> {
        kv::get_json::<Vec<String>>(&*self.store, keys::FEATURED_IDS)
            .await
            .map(Option::unwrap_or_default)
            .map_err(|err| {
                GatewayError::inconsistent(format!("featured id list unreadable: {err}"))
            })
    }

    /// Persist the source of truth, then sync the derived caches: drop the
    /// read-cache, and patch the listings metadata in place — or invalidate
    /// it wholesale when there is nothing to patch.
    async fn persist_and_sync(&self, set: &FeaturedSet) -> Result<(), GatewayError> {
        kv::put_json(&*self.store, keys::FEATURED_IDS, &set.ids(), None)
            .await
            .map_err(|err| {
                GatewayError::inconsistent(format!("featured id list could not be persisted: {err}"))
            })?;

        if let Err(err) = self.store.delete(keys::FEATURED_IDS_CACHE).await {
            warn!(
                target: "vetrina::featured",
                error = %err,
                "failed to invalidate featured read-cache; it expires by TTL"
            );
        }

        if !self.listings.patch_featured_flag(set.ids()).await {
            if let Err(err) = self.listings.invalidate_metadata().await {
                warn!(
                    target: "vetrina::featured",
                    error = %err,
                    "failed to invalidate listings metadata after featured change"
                );
            }
        }
        Ok(())
    }
}
