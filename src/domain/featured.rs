//! The curated featured set and its backfill job.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::FeaturedSettings;
use crate::domain::error::GatewayError;

/// Duplicate-free set of featured listing ids with cardinality bounds.
///
/// `len() <= max` is enforced synchronously on add; the set may transiently
/// fall below `min` after a removal, which is the backfill trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeaturedSet {
    ids: Vec<String>,
    min: usize,
    max: usize,
}

impl FeaturedSet {
    /// Wrap a persisted id list, discarding duplicates while preserving
    /// order.
    pub fn new(ids: Vec<String>, bounds: &FeaturedSettings) -> Self {
        let mut seen = Vec::with_capacity(ids.len());
        for id in ids {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        Self {
            ids: seen,
            min: bounds.min_featured,
            max: bounds.max_featured,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|existing| existing == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn into_ids(self) -> Vec<String> {
        self.ids
    }

    /// Add an id, rejecting the mutation (set unchanged) at capacity.
    pub fn add(&mut self, id: &str) -> Result<(), GatewayError> {
        if self.contains(id) {
            return Ok(());
        }
        if self.ids.len() >= self.max {
            return Err(GatewayError::capacity_exceeded(self.max));
        }
        self.ids.push(id.to_string());
        Ok(())
    }

    /// Remove an id, reporting whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.ids.len();
        self.ids.retain(|existing| existing != id);
        self.ids.len() < before
    }

    pub fn below_min(&self) -> bool {
        self.ids.len() < self.min
    }

    /// Ids needed to reach the floor; zero when at or above it.
    pub fn shortfall(&self) -> usize {
        self.min.saturating_sub(self.ids.len())
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// A scheduled featured-set replenishment, persisted in the store.
///
/// At most one job is pending at a time; a newer schedule call overwrites.
/// Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub scheduled_at: i64,
    pub execute_at: i64,
    pub shortfall: usize,
    pub target_count: usize,
    pub current_count_at_schedule: usize,
}

impl BackfillJob {
    /// Build a job for the given shortfall, `None` when nothing is missing.
    pub fn plan(
        current_count: usize,
        target_count: usize,
        delay_secs: u64,
        now: OffsetDateTime,
    ) -> Option<Self> {
        let shortfall = target_count.saturating_sub(current_count);
        if shortfall == 0 {
            return None;
        }
        let scheduled_at = now.unix_timestamp();
        Some(Self {
            scheduled_at,
            execute_at: scheduled_at + delay_secs as i64,
            shortfall,
            target_count,
            current_count_at_schedule: current_count,
        })
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        now.unix_timestamp() >= self.execute_at
    }

    /// Read-only projection for external pollers.
    pub fn status(&self, now: OffsetDateTime) -> BackfillStatus {
        let remaining = self.execute_at - now.unix_timestamp();
        BackfillStatus {
            is_ready: remaining <= 0,
            seconds_remaining: remaining.max(0) as u64,
            shortfall: self.shortfall,
            target_count: self.target_count,
            execute_at: self.execute_at,
        }
    }
}

/// Time-remaining view of a pending job; never mutates job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackfillStatus {
    pub is_ready: bool,
    pub seconds_remaining: u64,
    pub shortfall: usize,
    pub target_count: usize,
    pub execute_at: i64,
}
