//! Vetrina — a caching gateway for property listings.
//!
//! Fronts a third-party listings API with a key-value caching layer:
//!
//! - **Split caching**: listing metadata and per-slot image blobs are cached
//!   under independent keys and TTLs, and recombined on read.
//! - **Conditional refresh**: upstream fetches carry `If-None-Match` and
//!   short-circuit on `304 Not Modified`.
//! - **Single-flight**: concurrent cache misses for the same resource share
//!   one upstream fetch.
//! - **Image variants**: resized/format-converted renditions with an ordered
//!   fallback chain (avif → webp → jpeg → original bytes).
//! - **Featured set**: a curated, bounded subset of listing ids with a
//!   scheduled backfill state machine that replenishes it.
//!
//! The HTTP routing layer is intentionally absent; embed the
//! [`application::gateway::Gateway`] behind whatever surface you run.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod image;
pub mod infra;
pub mod util;
