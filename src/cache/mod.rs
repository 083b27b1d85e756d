//! Vetrina cache system.
//!
//! Listings are cached split: lightweight metadata under one key with a
//! short TTL, heavyweight per-slot image blobs under composite keys with a
//! longer TTL, recombined on read. Cache misses collapse into a single
//! upstream fetch per logical key via [`singleflight`]. Key layout lives in
//! [`keys`] and nowhere else.
//!
//! Store failures on the write side are logged and counted, never
//! propagated: caching is best-effort, and reads must stay correct with a
//! cold or broken store.

pub mod keys;
pub mod listings;
pub mod singleflight;

pub use listings::ListingsCache;
pub use singleflight::Singleflight;
