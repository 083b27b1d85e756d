//! Key-value store port.
//!
//! The production store is external (an eventually-consistent, TTL-aware
//! worker KV); this module defines the contract the rest of the crate is
//! written against, JSON codec helpers, and an in-memory implementation for
//! tests and local runs. TTLs are expressed in seconds throughout.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("store backend failure: {message}")]
    Backend { message: String },
    #[error("stored value under `{key}` could not be decoded: {message}")]
    Codec { key: String, message: String },
}

impl KvError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn codec(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Codec {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Expiration metadata of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvMetadata {
    /// Unix seconds at which the entry expires, `None` for non-expiring.
    pub expires_at: Option<i64>,
}

impl KvMetadata {
    /// Seconds of lifetime left at `now`, `None` for non-expiring entries.
    pub fn remaining_secs(&self, now: OffsetDateTime) -> Option<u64> {
        self.expires_at
            .map(|at| (at - now.unix_timestamp()).max(0) as u64)
    }
}

/// A stored value together with its expiration metadata.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub value: Bytes,
    pub metadata: KvMetadata,
}

/// The store contract: per-key atomic get/put/delete with optional TTL and
/// expiration introspection. No cross-key transactions.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError>;

    async fn get_with_metadata(&self, key: &str) -> Result<Option<KvEntry>, KvError>;

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        expiration_ttl_secs: Option<u64>,
    ) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

/// Fetch and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, KvError> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| KvError::codec(key, err.to_string())),
        None => Ok(None),
    }
}

/// Encode and store a JSON value with an optional TTL.
pub async fn put_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    expiration_ttl_secs: Option<u64>,
) -> Result<(), KvError> {
    let raw = serde_json::to_vec(value).map_err(|err| KvError::codec(key, err.to_string()))?;
    store.put(key, Bytes::from(raw), expiration_ttl_secs).await
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Option<i64>,
}

impl StoredValue {
    fn expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at
            .is_some_and(|at| at <= now.unix_timestamp())
    }
}

/// In-memory `KeyValueStore` with lazy expiry.
///
/// Expired entries are dropped on access; call [`MemoryStore::sweep`]
/// periodically to bound growth of entries nobody reads again.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.expired(now));
        before - self.entries.len()
    }

    /// Live (non-expired) entry count.
    pub fn len(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        self.entries
            .iter()
            .filter(|entry| !entry.value().expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, key: &str) -> Option<StoredValue> {
        let now = OffsetDateTime::now_utc();
        // The shard guard must be released before the removal below.
        {
            let entry = self.entries.get(key)?;
            if !entry.value().expired(now) {
                return Some(entry.value().clone());
            }
        }
        self.entries.remove(key);
        None
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        Ok(self.read(key).map(|stored| stored.value))
    }

    async fn get_with_metadata(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        Ok(self.read(key).map(|stored| KvEntry {
            value: stored.value,
            metadata: KvMetadata {
                expires_at: stored.expires_at,
            },
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        expiration_ttl_secs: Option<u64>,
    ) -> Result<(), KvError> {
        let expires_at = expiration_ttl_secs
            .map(|ttl| OffsetDateTime::now_utc().unix_timestamp() + ttl as i64);
        self.entries
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }
}
