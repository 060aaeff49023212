use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_READ, METRIC_CACHE_WRITE, METRIC_CACHE_WRITE_FAILED, METRIC_MEMORY_STORE_PENDING,
};
use crate::config::{LogFormat, LoggingSettings};
use crate::ingest::{METRIC_CONSUMER_RECONNECTS, METRIC_DECODE_MS, METRIC_MESSAGES};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
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
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_WRITE,
            Unit::Count,
            "Cache writes accepted, by backend."
        );
        describe_counter!(
            METRIC_CACHE_WRITE_FAILED,
            Unit::Count,
            "Cache writes dropped after a backend failure."
        );
        describe_counter!(
            METRIC_CACHE_READ,
            Unit::Count,
            "Cache reads by backend and result (hit, miss, unavailable)."
        );
        describe_gauge!(
            METRIC_MEMORY_STORE_PENDING,
            Unit::Count,
            "Writes enqueued for the in-process store but not yet applied."
        );
        describe_counter!(
            METRIC_MESSAGES,
            Unit::Count,
            "Broker deliveries by queue and outcome (stored, ignored, failed)."
        );
        describe_counter!(
            METRIC_CONSUMER_RECONNECTS,
            Unit::Count,
            "Consumer reconnect attempts by queue."
        );
        describe_histogram!(
            METRIC_DECODE_MS,
            Unit::Milliseconds,
            "Time spent decoding one delivery, by queue."
        );
    });
}
