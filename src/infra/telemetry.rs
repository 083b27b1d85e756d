use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use tracing::level_filters::LevelFilter;

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(logging.level).into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "vetrina_cache_hit_total",
            Unit::Count,
            "Total number of store cache hits."
        );
        describe_counter!(
            "vetrina_cache_miss_total",
            Unit::Count,
            "Total number of store cache misses."
        );
        describe_counter!(
            "vetrina_cache_write_degraded_total",
            Unit::Count,
            "Split cache writes that fell back to a combined write."
        );
        describe_counter!(
            "vetrina_upstream_fetch_total",
            Unit::Count,
            "Outbound upstream requests issued."
        );
        describe_counter!(
            "vetrina_upstream_not_modified_total",
            Unit::Count,
            "Upstream 304 responses confirming the cached copy."
        );
        describe_counter!(
            "vetrina_image_fallback_total",
            Unit::Count,
            "Image variant conversions that fell back to another format."
        );
        describe_counter!(
            "vetrina_backfill_scheduled_total",
            Unit::Count,
            "Backfill jobs written by featured-set removals."
        );
        describe_counter!(
            "vetrina_backfill_executed_total",
            Unit::Count,
            "Backfill jobs executed to completion."
        );
        describe_histogram!(
            "vetrina_reconstruct_ms",
            Unit::Milliseconds,
            "Listing image reconstruction latency in milliseconds."
        );
    });
}
