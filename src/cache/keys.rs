//! The persisted key namespace.
//!
//! Every key the crate writes to the store is rendered here, so the layout
//! stays greppable and collision-free. The variant key takes the *resolved*
//! [`OutputFormat`] — the unresolved `auto` token cannot reach a key by
//! construction.

use crate::domain::listings::ImageSlot;
use crate::image::{OutputFormat, Variant};

/// Metadata-only listings snapshot (or the combined fallback write).
pub const METADATA: &str = "listings:metadata";
/// Featured id list — the source of truth.
pub const FEATURED_IDS: &str = "featured:ids";
/// Derived featured-id read cache (long TTL accelerator).
pub const FEATURED_IDS_CACHE: &str = "featured:ids:cache";
/// The single pending backfill job, if any.
pub const BACKFILL_JOB: &str = "featured:backfill-job";

/// One image slot's base64 payload.
pub fn image(id: &str, slot: ImageSlot) -> String {
    format!("listings:image:{id}:{}", slot.key_segment())
}

/// Per-id record entry, longer-lived than the snapshot.
pub fn record(id: &str) -> String {
    format!("listings:record:{id}")
}

/// Cached media-list response for one listing.
pub fn media_list(id: &str) -> String {
    format!("listings:media-list:{id}")
}

/// Stored ETag validating an upstream resource.
pub fn etag(resource: &str) -> String {
    format!("listings:etag:{resource}")
}

/// A derived image rendition.
pub fn variant(id: &str, variant: Variant, format: OutputFormat, slot: ImageSlot) -> String {
    format!(
        "image-variant:{id}:{variant}:{format}:{}",
        slot.key_segment()
    )
}
