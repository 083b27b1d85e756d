//! Backfill job lifecycle: schedule, inspect, delete.
//!
//! The scheduler owns the single persisted job slot
//! (`featured:backfill-job`). States: Idle (no job) → Pending → Due →
//! Executed (deleted) or Superseded (overwritten by a newer schedule call).
//! The store TTL extends a buffer past `execute_at`, so a job nobody polls
//! expires on its own instead of lingering. Execution semantics live in
//! [`crate::application::featured::FeaturedSetManager`], which embeds this
//! scheduler.

use std::sync::Arc;

use metrics::counter;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::cache::keys;
use crate::config::FeaturedSettings;
use crate::domain::featured::{BackfillJob, BackfillStatus};
use crate::infra::kv::{self, KeyValueStore, KvError};

pub struct BackfillScheduler {
    store: Arc<dyn KeyValueStore>,
    settings: FeaturedSettings,
}

impl BackfillScheduler {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: FeaturedSettings) -> Self {
        Self { store, settings }
    }

    /// Schedule a replenishment toward `min_featured`. No-op when the
    /// shortfall is non-positive; an existing pending job is overwritten.
    /// Best-effort: a failed write is logged, not propagated — the next
    /// removal below the floor schedules again.
    pub async fn schedule(&self, current_count: usize) -> Option<BackfillJob> {
        let job = BackfillJob::plan(
            current_count,
            self.settings.min_featured,
            self.settings.backfill_delay_secs,
            OffsetDateTime::now_utc(),
        )?;

        let ttl = self.settings.backfill_delay_secs + self.settings.backfill_ttl_buffer_secs;
        match kv::put_json(&*self.store, keys::BACKFILL_JOB, &job, Some(ttl)).await {
            Ok(()) => {
                counter!("vetrina_backfill_scheduled_total").increment(1);
                info!(
                    target: "vetrina::backfill",
                    shortfall = job.shortfall,
                    execute_at = job.execute_at,
                    "backfill job scheduled"
                );
                Some(job)
            }
            Err(err) => {
                warn!(
                    target: "vetrina::backfill",
                    error = %err,
                    "failed to write backfill job"
                );
                None
            }
        }
    }

    /// The pending job, if one exists. An undecodable job is treated as
    /// absent (it self-expires) rather than wedging the state machine.
    pub async fn load(&self) -> Result<Option<BackfillJob>, KvError> {
        match kv::get_json::<BackfillJob>(&*self.store, keys::BACKFILL_JOB).await {
            Ok(job) => Ok(job),
            Err(KvError::Codec { message, .. }) => {
                warn!(
                    target: "vetrina::backfill",
                    error = %message,
                    "stored backfill job did not parse; ignoring it"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Read-only projection for pollers; never mutates job state.
    pub async fn status(&self) -> Result<Option<BackfillStatus>, KvError> {
        Ok(self
            .load()
            .await?
            .map(|job| job.status(OffsetDateTime::now_utc())))
    }

    /// Consume the job slot.
    pub async fn delete(&self) -> Result<(), KvError> {
        self.store.delete(keys::BACKFILL_JOB).await
    }
}
