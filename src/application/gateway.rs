//! The gateway façade.
//!
//! Owns and wires the services, and exposes the operations the (external)
//! routing layer calls: plain data in, taxonomy errors out. Background work
//! runs as detached tasks with their own logging sink — request paths never
//! await it.

use std::future::Future;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::application::featured::{BackfillRun, FeaturedSetManager, ToggleOutcome};
use crate::cache::{ListingsCache, keys};
use crate::config::Settings;
use crate::domain::error::GatewayError;
use crate::domain::featured::BackfillStatus;
use crate::domain::listings::{ImageSlot, ListingRecord, ListingsSnapshot, MediaItem};
use crate::image::{
    FormatRequest, ImageVariantEngine, OutputFormat, Variant, VariantImage, negotiate,
};
use crate::infra::kv::{self, KeyValueStore};
use crate::infra::upstream::{ConditionalFetchClient, UpstreamError};

/// Persisted envelope of a derived variant: the payload plus the attributes
/// a cache hit must reproduce.
#[derive(Debug, Serialize, Deserialize)]
struct StoredVariant {
    content_type: String,
    delivered: String,
    fallback: bool,
    fallback_depth: u8,
    original_size: usize,
    compression_ratio: f64,
    payload: String,
}

impl StoredVariant {
    fn from_variant(image: &VariantImage) -> Self {
        Self {
            content_type: image.content_type.clone(),
            delivered: image.delivered.as_str().to_string(),
            fallback: image.fallback,
            fallback_depth: image.fallback_depth,
            original_size: image.original_size,
            compression_ratio: image.compression_ratio,
            payload: BASE64.encode(&image.bytes),
        }
    }

    fn into_variant(self, variant: Variant, requested: OutputFormat) -> Option<VariantImage> {
        let bytes = Bytes::from(BASE64.decode(self.payload.as_bytes()).ok()?);
        Some(VariantImage {
            optimized_size: bytes.len(),
            bytes,
            content_type: self.content_type,
            variant,
            requested,
            delivered: OutputFormat::parse(&self.delivered).unwrap_or(OutputFormat::Jpeg),
            fallback: self.fallback,
            fallback_depth: self.fallback_depth,
            original_size: self.original_size,
            compression_ratio: self.compression_ratio,
        })
    }
}

pub struct Gateway {
    store: Arc<dyn KeyValueStore>,
    listings: Arc<ListingsCache>,
    featured: Arc<FeaturedSetManager>,
    images: ImageVariantEngine,
}

impl Gateway {
    /// Construct every service against the given store. No hidden state:
    /// the gateway lives as long as its owner keeps it.
    pub fn new(settings: &Settings, store: Arc<dyn KeyValueStore>) -> Result<Self, UpstreamError> {
        let client = Arc::new(ConditionalFetchClient::new(
            settings.upstream.clone(),
            settings.cache.clone(),
            Arc::clone(&store),
        )?);
        let listings = Arc::new(ListingsCache::new(
            Arc::clone(&store),
            client,
            settings.cache.clone(),
        ));
        let featured = Arc::new(FeaturedSetManager::new(
            Arc::clone(&store),
            Arc::clone(&listings),
            settings.featured.clone(),
            settings.cache.clone(),
        ));
        Ok(Self {
            store,
            listings,
            featured,
            images: ImageVariantEngine::new(),
        })
    }

    // ------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------

    pub async fn fetch_all(&self) -> Result<ListingsSnapshot, GatewayError> {
        self.listings.fetch_all().await
    }

    pub async fn fetch_one(&self, id: &str) -> Result<ListingRecord, GatewayError> {
        self.listings.fetch_one(id).await
    }

    pub async fn media_list(&self, id: &str) -> Result<Vec<MediaItem>, GatewayError> {
        self.listings.media_list(id).await
    }

    /// The featured subset of the snapshot, both sides fetched together.
    pub async fn featured_listings(&self) -> Result<ListingsSnapshot, GatewayError> {
        let (snapshot, ids) =
            tokio::try_join!(self.listings.fetch_all(), self.featured.get_ids())?;
        Ok(ListingsSnapshot::new(
            snapshot
                .records
                .into_iter()
                .filter(|record| ids.contains(&record.id))
                .collect(),
        ))
    }

    // ------------------------------------------------------------------
    // Featured set
    // ------------------------------------------------------------------

    pub async fn toggle_featured(&self, id: &str) -> Result<ToggleOutcome, GatewayError> {
        self.featured.toggle(id).await
    }

    pub async fn featured_ids(&self) -> Result<Vec<String>, GatewayError> {
        self.featured.get_ids().await
    }

    pub async fn backfill_status(&self) -> Result<Option<BackfillStatus>, GatewayError> {
        self.featured.backfill_status().await
    }

    pub async fn execute_due_backfill(&self) -> Result<BackfillRun, GatewayError> {
        self.featured.execute_due_backfill().await
    }

    // ------------------------------------------------------------------
    // Image variants
    // ------------------------------------------------------------------

    /// Resolve an `auto` format wish against request headers.
    pub fn negotiate_format(&self, accept: &str, user_agent: &str) -> OutputFormat {
        negotiate::select_format(accept, user_agent)
    }

    /// Pure conversion: derive a rendition from source bytes. Never fails;
    /// inspect `fallback` if format fidelity matters.
    pub fn process_variant(
        &self,
        source: &[u8],
        variant: Variant,
        format: OutputFormat,
    ) -> VariantImage {
        self.images.process(source, variant, format)
    }

    /// The cached variant pipeline for one listing image slot: resolve the
    /// format, serve the cached rendition, or derive and cache it.
    pub async fn listing_variant(
        &self,
        id: &str,
        slot: ImageSlot,
        variant: Variant,
        format: FormatRequest,
        accept: &str,
        user_agent: &str,
    ) -> Result<VariantImage, GatewayError> {
        let resolved = match format {
            FormatRequest::Auto => negotiate::select_format(accept, user_agent),
            FormatRequest::Explicit(concrete) => concrete,
        };
        let key = keys::variant(id, variant, resolved, slot);

        match kv::get_json::<StoredVariant>(&*self.store, &key).await {
            Ok(Some(stored)) => {
                if let Some(image) = stored.into_variant(variant, resolved) {
                    counter!("vetrina_cache_hit_total").increment(1);
                    return Ok(image);
                }
                warn!(
                    target: "vetrina::image",
                    key = %key,
                    "cached variant envelope was corrupt; recomputing"
                );
            }
            Ok(None) => {}
            Err(err) => warn!(
                target: "vetrina::image",
                key = %key,
                error = %err,
                "variant cache read failed; recomputing"
            ),
        }
        counter!("vetrina_cache_miss_total").increment(1);

        let record = self.listings.fetch_one(id).await?;
        let base64_data = record
            .images
            .get(slot)
            .ok_or_else(|| GatewayError::not_found(format!("{id}:{slot}")))?;

        let source = self
            .images
            .decode_base64_image(base64_data, &format!("{}.jpg", slot.key_segment()))
            .map_err(|err| {
                GatewayError::inconsistent(format!(
                    "stored image payload for `{id}:{slot}` is invalid: {err}"
                ))
            })?;

        let image = self.images.process(&source.bytes, variant, resolved);

        if let Err(err) = kv::put_json(
            &*self.store,
            &key,
            &StoredVariant::from_variant(&image),
            Some(variant.cache_ttl_secs()),
        )
        .await
        {
            warn!(
                target: "vetrina::image",
                key = %key,
                error = %err,
                "caching variant failed; serving uncached result"
            );
        }

        Ok(image)
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    /// Warm the listings cache without making anyone wait for it.
    pub fn warm_listings(&self) {
        let listings = Arc::clone(&self.listings);
        spawn_detached("warm_listings", async move {
            let snapshot = listings.fetch_all().await?;
            debug!(
                target: "vetrina::background",
                count = snapshot.len(),
                "listings cache warmed"
            );
            Ok(())
        });
    }

    /// Fire-and-forget backfill check: executes the pending job if due.
    pub fn spawn_backfill_check(&self) {
        let featured = Arc::clone(&self.featured);
        spawn_detached("backfill_check", async move {
            match featured.execute_due_backfill().await? {
                BackfillRun::NoJob => {}
                run => debug!(target: "vetrina::background", run = ?run, "backfill check ran"),
            }
            Ok(())
        });
    }
}

/// Run a background task with its own error sink; callers never await it.
fn spawn_detached<F>(task: &'static str, future: F)
where
    F: Future<Output = Result<(), GatewayError>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = future.await {
            warn!(
                target: "vetrina::background",
                task,
                error = %err,
                "background task failed"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::infra::kv::MemoryStore;

    use super::*;

    fn gateway() -> Gateway {
        let mut settings = Settings::default();
        settings.upstream.base_url = "http://127.0.0.1:9".to_string();
        Gateway::new(&settings, Arc::new(MemoryStore::new())).expect("gateway")
    }

    #[test]
    fn process_variant_is_pure_and_total() {
        let gateway = gateway();
        let result = gateway.process_variant(b"not an image", Variant::Full, OutputFormat::Jpeg);
        assert!(result.fallback);
        assert_eq!(result.content_type, "image/jpeg");
    }

    #[test]
    fn negotiate_format_delegates() {
        let gateway = gateway();
        assert_eq!(
            gateway.negotiate_format("image/webp", "curl/8"),
            OutputFormat::Webp
        );
    }

    #[test]
    fn stored_variant_roundtrips() {
        let image = VariantImage {
            bytes: Bytes::from_static(b"payload"),
            content_type: "image/webp".to_string(),
            variant: Variant::Thumbnail,
            requested: OutputFormat::Avif,
            delivered: OutputFormat::Webp,
            fallback: true,
            fallback_depth: 1,
            original_size: 100,
            optimized_size: 7,
            compression_ratio: 0.07,
        };

        let restored = StoredVariant::from_variant(&image)
            .into_variant(Variant::Thumbnail, OutputFormat::Avif)
            .expect("roundtrip");
        assert_eq!(restored.bytes, image.bytes);
        assert_eq!(restored.content_type, "image/webp");
        assert_eq!(restored.delivered, OutputFormat::Webp);
        assert!(restored.fallback);
        assert_eq!(restored.original_size, 100);
    }
}
