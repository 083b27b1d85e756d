//! Infrastructure adapters: the store port, the upstream client, telemetry.

pub mod kv;
pub mod telemetry;
pub mod upstream;
