//! The listings cache: split storage, single-flight refresh, progressive
//! reconstruction.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cache::keys;
use crate::cache::singleflight::Singleflight;
use crate::config::CacheSettings;
use crate::domain::error::GatewayError;
use crate::domain::listings::{ImageReport, ImageSlot, ListingRecord, ListingsSnapshot, MediaItem};
use crate::infra::kv::{self, KeyValueStore, KvError};
use crate::infra::upstream::{ConditionalFetchClient, FetchOutcome};

/// Serves the listings dataset with minimal upstream calls.
///
/// At most one upstream fetch per logical key is in flight at any time; all
/// concurrent cache-miss callers share its outcome.
pub struct ListingsCache {
    store: Arc<dyn KeyValueStore>,
    client: Arc<ConditionalFetchClient>,
    settings: CacheSettings,
    flights: Singleflight<ListingsSnapshot, GatewayError>,
}

impl ListingsCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        client: Arc<ConditionalFetchClient>,
        settings: CacheSettings,
    ) -> Self {
        Self {
            store,
            client,
            settings,
            flights: Singleflight::new(),
        }
    }

    /// The full snapshot: cached metadata reconstructed with images when
    /// fresh, otherwise one deduplicated upstream fetch shared by every
    /// concurrent caller.
    pub async fn fetch_all(&self) -> Result<ListingsSnapshot, GatewayError> {
        if let Some(records) = read_metadata(&*self.store).await {
            counter!("vetrina_cache_hit_total").increment(1);
            return Ok(reconstruct_all(&*self.store, records).await);
        }
        counter!("vetrina_cache_miss_total").increment(1);

        let store = Arc::clone(&self.store);
        let client = Arc::clone(&self.client);
        let settings = self.settings.clone();
        match self
            .flights
            .run(keys::METADATA, move || refresh(store, client, settings))
            .await
        {
            Ok(snapshot) => Ok((*snapshot).clone()),
            Err(err) => Err((*err).clone()),
        }
    }

    /// One listing: per-id entry first, snapshot scan second, full fetch as
    /// last resort. Fallback hits opportunistically populate the per-id
    /// entry for future direct reads.
    pub async fn fetch_one(&self, id: &str) -> Result<ListingRecord, GatewayError> {
        match kv::get_json::<ListingRecord>(&*self.store, &keys::record(id)).await {
            Ok(Some(record)) => {
                counter!("vetrina_cache_hit_total").increment(1);
                return Ok(reconstruct_record(&*self.store, record).await);
            }
            Ok(None) => {}
            Err(err) => warn!(
                target: "vetrina::cache",
                id,
                error = %err,
                "per-id cache read failed; falling back to snapshot"
            ),
        }
        counter!("vetrina_cache_miss_total").increment(1);

        if let Some(records) = read_metadata(&*self.store).await {
            if let Some(record) = records.into_iter().find(|record| record.id == id) {
                self.populate_record_entry(&record).await;
                return Ok(reconstruct_record(&*self.store, record).await);
            }
        }

        let snapshot = self.fetch_all().await?;
        match snapshot.records.into_iter().find(|record| record.id == id) {
            Some(record) => {
                let (metadata, _) = record.clone().split_images();
                self.populate_record_entry(&metadata).await;
                Ok(record)
            }
            None => Err(GatewayError::not_found(id)),
        }
    }

    /// Split-write the snapshot into the store. Partial split failure falls
    /// back to a combined write under the metadata key; only a failing
    /// fallback is reported.
    pub async fn store(&self, snapshot: &ListingsSnapshot) -> Result<(), KvError> {
        store_snapshot(&*self.store, &self.settings, snapshot).await
    }

    /// Restore a record's image slots from the side-table.
    pub async fn reconstruct(&self, record: ListingRecord) -> ListingRecord {
        reconstruct_record(&*self.store, record).await
    }

    /// Flip each cached record's `featured` flag to membership in `ids`,
    /// preserving the entry's remaining TTL. False when there is no cached
    /// metadata to patch — the caller must invalidate instead.
    pub async fn patch_featured_flag(&self, featured_ids: &[String]) -> bool {
        let entry = match self.store.get_with_metadata(keys::METADATA).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(err) => {
                warn!(
                    target: "vetrina::cache",
                    error = %err,
                    "metadata read failed; cannot patch featured flags"
                );
                return false;
            }
        };

        let mut records: Vec<ListingRecord> = match serde_json::from_slice(&entry.value) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    target: "vetrina::cache",
                    error = %err,
                    "cached metadata did not parse; cannot patch featured flags"
                );
                return false;
            }
        };

        for record in &mut records {
            record.featured = featured_ids.iter().any(|id| *id == record.id);
        }

        let ttl = entry
            .metadata
            .remaining_secs(OffsetDateTime::now_utc())
            .map(|secs| self.settings.clamp_put_ttl(secs))
            .unwrap_or(self.settings.metadata_ttl_secs);

        match kv::put_json(&*self.store, keys::METADATA, &records, Some(ttl)).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target: "vetrina::cache",
                    error = %err,
                    "failed to write patched metadata"
                );
                false
            }
        }
    }

    /// Drop the cached metadata entirely; the next read recomputes it.
    pub async fn invalidate_metadata(&self) -> Result<(), KvError> {
        self.store.delete(keys::METADATA).await
    }

    /// The companion media list for one listing, cached under its own key.
    pub async fn media_list(&self, id: &str) -> Result<Vec<MediaItem>, GatewayError> {
        let key = keys::media_list(id);
        match kv::get_json::<Vec<MediaItem>>(&*self.store, &key).await {
            Ok(Some(items)) => {
                counter!("vetrina_cache_hit_total").increment(1);
                return Ok(items);
            }
            Ok(None) => {}
            Err(err) => warn!(
                target: "vetrina::cache",
                id,
                error = %err,
                "media-list cache read failed; fetching upstream"
            ),
        }
        counter!("vetrina_cache_miss_total").increment(1);

        match self.client.fetch_media_list(id).await? {
            FetchOutcome::Fresh(body) => {
                let items: Vec<MediaItem> = serde_json::from_slice(&body).map_err(|err| {
                    GatewayError::upstream(format!("media list payload did not parse: {err}"))
                })?;
                if let Err(err) =
                    kv::put_json(&*self.store, &key, &items, Some(self.settings.metadata_ttl_secs))
                        .await
                {
                    warn!(
                        target: "vetrina::cache",
                        id,
                        error = %err,
                        "caching media list failed; serving uncached result"
                    );
                }
                Ok(items)
            }
            FetchOutcome::NotModified => {
                match kv::get_json::<Vec<MediaItem>>(&*self.store, &key).await {
                    Ok(Some(items)) => Ok(items),
                    _ => Err(GatewayError::inconsistent(format!(
                        "upstream returned 304 for media list `{id}` but no cached copy exists"
                    ))),
                }
            }
        }
    }

    async fn populate_record_entry(&self, metadata: &ListingRecord) {
        if let Err(err) = kv::put_json(
            &*self.store,
            &keys::record(&metadata.id),
            metadata,
            Some(self.settings.record_ttl_secs),
        )
        .await
        {
            warn!(
                target: "vetrina::cache",
                id = %metadata.id,
                error = %err,
                "failed to populate per-id cache entry"
            );
        }
    }
}

async fn refresh(
    store: Arc<dyn KeyValueStore>,
    client: Arc<ConditionalFetchClient>,
    settings: CacheSettings,
) -> Result<ListingsSnapshot, GatewayError> {
    match client.fetch_listings().await? {
        FetchOutcome::Fresh(body) => {
            let mut snapshot: ListingsSnapshot = serde_json::from_slice(&body).map_err(|err| {
                GatewayError::upstream(format!("listings payload did not parse: {err}"))
            })?;
            stamp_featured_flags(&*store, &mut snapshot).await;
            if let Err(err) = store_snapshot(&*store, &settings, &snapshot).await {
                warn!(
                    target: "vetrina::cache",
                    error = %err,
                    "caching listings snapshot failed; serving uncached result"
                );
            }
            info!(
                target: "vetrina::cache",
                count = snapshot.len(),
                "refreshed listings from upstream"
            );
            Ok(snapshot)
        }
        FetchOutcome::NotModified => match read_metadata(&*store).await {
            Some(records) => Ok(reconstruct_all(&*store, records).await),
            None => Err(GatewayError::inconsistent(
                "upstream returned 304 but no cached listings snapshot exists",
            )),
        },
    }
}

/// Stamp `featured` flags from the persisted id list, so a fresh snapshot
/// agrees with the source of truth from the moment it is cached.
async fn stamp_featured_flags(store: &dyn KeyValueStore, snapshot: &mut ListingsSnapshot) {
    match kv::get_json::<Vec<String>>(store, keys::FEATURED_IDS).await {
        Ok(Some(ids)) => {
            for record in &mut snapshot.records {
                record.featured = ids.contains(&record.id);
            }
        }
        Ok(None) => {}
        Err(err) => warn!(
            target: "vetrina::cache",
            error = %err,
            "featured id list unreadable; fresh snapshot keeps default flags"
        ),
    }
}

/// Read the cached metadata collection, swallowing store errors.
async fn read_metadata(store: &dyn KeyValueStore) -> Option<Vec<ListingRecord>> {
    match kv::get_json::<Vec<ListingRecord>>(store, keys::METADATA).await {
        Ok(records) => records,
        Err(err) => {
            warn!(
                target: "vetrina::cache",
                error = %err,
                "metadata cache read failed; treating as miss"
            );
            None
        }
    }
}

async fn reconstruct_all(
    store: &dyn KeyValueStore,
    records: Vec<ListingRecord>,
) -> ListingsSnapshot {
    let records = join_all(
        records
            .into_iter()
            .map(|record| reconstruct_record(store, record)),
    )
    .await;
    ListingsSnapshot::new(records)
}

/// Merge a record's image slots back in: the main photo is fetched and
/// awaited first, every other slot is issued together and joined. Partial
/// loss never fails the reconstruction — it is reported on the record.
async fn reconstruct_record(store: &dyn KeyValueStore, mut record: ListingRecord) -> ListingRecord {
    let manifest = record.manifest_slots();
    if manifest.is_empty() {
        return record;
    }
    let started = Instant::now();

    let mut loaded = 0u32;
    let mut missing = 0u32;
    let main = ImageSlot::main_photo();

    if manifest.contains(&main) {
        if record.images.get(main).is_some() {
            loaded += 1;
        } else {
            match load_slot(store, &record.id, main).await {
                Some(data) => {
                    record.images.set(main, Some(data));
                    loaded += 1;
                }
                None => missing += 1,
            }
        }
    }

    let pending: Vec<ImageSlot> = manifest
        .iter()
        .copied()
        .filter(|slot| *slot != main)
        .filter(|slot| {
            if record.images.get(*slot).is_some() {
                loaded += 1;
                false
            } else {
                true
            }
        })
        .collect();

    let id = record.id.clone();
    let results = join_all(pending.into_iter().map(|slot| {
        let id = id.clone();
        async move { (slot, load_slot(store, &id, slot).await) }
    }))
    .await;

    for (slot, data) in results {
        match data {
            Some(data) => {
                record.images.set(slot, Some(data));
                loaded += 1;
            }
            None => missing += 1,
        }
    }

    if missing > 0 {
        debug!(
            target: "vetrina::cache",
            id = %record.id,
            loaded,
            missing,
            "reconstruction completed with missing image slots"
        );
    }
    record.image_report = Some(ImageReport { loaded, missing });
    histogram!("vetrina_reconstruct_ms").record(started.elapsed().as_secs_f64() * 1000.0);
    record
}

async fn load_slot(store: &dyn KeyValueStore, id: &str, slot: ImageSlot) -> Option<String> {
    match store.get(&keys::image(id, slot)).await {
        Ok(Some(raw)) => String::from_utf8(raw.to_vec()).ok(),
        Ok(None) => None,
        Err(err) => {
            warn!(
                target: "vetrina::cache",
                id,
                slot = %slot,
                error = %err,
                "image slot read failed; treating as missing"
            );
            None
        }
    }
}

async fn store_snapshot(
    store: &dyn KeyValueStore,
    settings: &CacheSettings,
    snapshot: &ListingsSnapshot,
) -> Result<(), KvError> {
    let mut metadata = Vec::with_capacity(snapshot.len());
    let mut blobs: Vec<(String, String)> = Vec::new();
    for record in snapshot.records.clone() {
        let (record, images) = record.split_images();
        for (slot, data) in images {
            blobs.push((keys::image(&record.id, slot), data));
        }
        metadata.push(record);
    }

    let image_ttl = settings.image_ttl_secs;
    let results = join_all(blobs.into_iter().map(|(key, data)| async move {
        store
            .put(&key, Bytes::from(data), Some(image_ttl))
            .await
            .inspect_err(|err| {
                warn!(
                    target: "vetrina::cache",
                    key = %key,
                    error = %err,
                    "image slot write failed"
                );
            })
    }))
    .await;

    let mut degraded = results.iter().any(Result::is_err);
    if !degraded {
        if let Err(err) = kv::put_json(
            store,
            keys::METADATA,
            &metadata,
            Some(settings.metadata_ttl_secs),
        )
        .await
        {
            warn!(
                target: "vetrina::cache",
                error = %err,
                "metadata write failed"
            );
            degraded = true;
        }
    }

    if degraded {
        counter!("vetrina_cache_write_degraded_total").increment(1);
        warn!(
            target: "vetrina::cache",
            "split cache write failed; falling back to combined write"
        );
        kv::put_json(
            store,
            keys::METADATA,
            snapshot,
            Some(settings.metadata_ttl_secs),
        )
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::config::{CacheSettings, UpstreamSettings};
    use crate::domain::listings::ImageSlots;
    use crate::infra::kv::{KvEntry, MemoryStore};

    use super::*;

    fn record_with_images(id: &str) -> ListingRecord {
        let mut record = ListingRecord::new(id);
        record.images = ImageSlots {
            photo1binary: Some("bWFpbg==".to_string()),
            photo2binary: Some("c2Vjb25k".to_string()),
            floorplanbinary: Some("cGxhbg==".to_string()),
            ..ImageSlots::default()
        };
        record
            .extra
            .insert("displayaddress".to_string(), "2 Test Road".into());
        record
    }

    fn cache_over(store: Arc<dyn KeyValueStore>) -> ListingsCache {
        let settings = CacheSettings::default();
        let client = ConditionalFetchClient::new(
            UpstreamSettings {
                base_url: "http://127.0.0.1:9".to_string(),
                ..UpstreamSettings::default()
            },
            settings.clone(),
            Arc::clone(&store),
        )
        .expect("client");
        ListingsCache::new(store, Arc::new(client), settings)
    }

    #[tokio::test]
    async fn store_then_reconstruct_roundtrips_all_slots() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store));

        let snapshot = ListingsSnapshot::new(vec![record_with_images("11")]);
        cache.store(&snapshot).await.expect("split write");

        let cached = read_metadata(&*store).await.expect("metadata present");
        assert!(!cached[0].has_images(), "metadata is stored stripped");

        let rebuilt = cache.reconstruct(cached.into_iter().next().expect("record")).await;
        assert_eq!(rebuilt.images.get(ImageSlot::Photo(1)), Some("bWFpbg=="));
        assert_eq!(rebuilt.images.get(ImageSlot::Photo(2)), Some("c2Vjb25k"));
        assert_eq!(rebuilt.images.get(ImageSlot::FloorPlan), Some("cGxhbg=="));

        let report = rebuilt.image_report.expect("report attached");
        assert_eq!(report.loaded, 3);
        assert_eq!(report.missing, 0);
    }

    #[tokio::test]
    async fn reconstruct_reports_missing_slots() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store));

        let snapshot = ListingsSnapshot::new(vec![record_with_images("12")]);
        cache.store(&snapshot).await.expect("split write");

        store
            .delete(&keys::image("12", ImageSlot::Photo(2)))
            .await
            .expect("drop one slot");

        let cached = read_metadata(&*store).await.expect("metadata present");
        let rebuilt = cache.reconstruct(cached.into_iter().next().expect("record")).await;

        let report = rebuilt.image_report.expect("report attached");
        assert_eq!(report.loaded, 2);
        assert_eq!(report.missing, 1);
        assert!(rebuilt.images.get(ImageSlot::Photo(2)).is_none());
    }

    #[tokio::test]
    async fn patch_featured_flag_rewrites_membership() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store));

        let snapshot =
            ListingsSnapshot::new(vec![record_with_images("1"), record_with_images("2")]);
        cache.store(&snapshot).await.expect("split write");

        let patched = cache.patch_featured_flag(&["2".to_string()]).await;
        assert!(patched);

        let records = read_metadata(&*store).await.expect("metadata present");
        assert!(!records[0].featured);
        assert!(records[1].featured);
    }

    #[tokio::test]
    async fn patch_featured_flag_without_metadata_is_refused() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_over(store);
        assert!(!cache.patch_featured_flag(&["1".to_string()]).await);
    }

    /// Store double whose image-slot writes always fail.
    struct ImageWriteFailStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl KeyValueStore for ImageWriteFailStore {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
            self.inner.get(key).await
        }

        async fn get_with_metadata(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
            self.inner.get_with_metadata(key).await
        }

        async fn put(
            &self,
            key: &str,
            value: Bytes,
            expiration_ttl_secs: Option<u64>,
        ) -> Result<(), KvError> {
            if key.starts_with("listings:image:") {
                return Err(KvError::backend("image writes disabled"));
            }
            self.inner.put(key, value, expiration_ttl_secs).await
        }

        async fn delete(&self, key: &str) -> Result<(), KvError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn partial_split_failure_falls_back_to_combined_write() {
        let store: Arc<dyn KeyValueStore> = Arc::new(ImageWriteFailStore {
            inner: MemoryStore::new(),
        });
        let cache = cache_over(Arc::clone(&store));

        let snapshot = ListingsSnapshot::new(vec![record_with_images("31")]);
        cache
            .store(&snapshot)
            .await
            .expect("combined fallback succeeds");

        // The combined write keeps the images embedded, so nothing is lost.
        let records = read_metadata(&*store).await.expect("metadata present");
        assert_eq!(records[0].images.get(ImageSlot::Photo(1)), Some("bWFpbg=="));
        assert!(records[0].image_manifest.is_empty());
    }

    #[tokio::test]
    async fn fetch_one_prefers_per_id_entry_and_reports_not_found_from_cache() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_over(Arc::clone(&store));

        let snapshot = ListingsSnapshot::new(vec![record_with_images("51")]);
        cache.store(&snapshot).await.expect("split write");

        // Snapshot scan populates the per-id entry.
        let found = cache.fetch_one("51").await.expect("found via snapshot");
        assert_eq!(found.id, "51");
        assert_eq!(found.images.get(ImageSlot::Photo(1)), Some("bWFpbg=="));

        let direct: Option<ListingRecord> = kv::get_json(&*store, &keys::record("51"))
            .await
            .expect("per-id entry readable");
        let direct = direct.expect("per-id entry populated");
        assert!(!direct.has_images(), "per-id entry is metadata-only");

        // Second read comes straight off the per-id entry.
        let again = cache.fetch_one("51").await.expect("found via per-id entry");
        assert_eq!(again.images.get(ImageSlot::FloorPlan), Some("cGxhbg=="));
    }
}
