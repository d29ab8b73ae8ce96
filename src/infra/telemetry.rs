use std::io::{self, IsTerminal};
use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global tracing subscriber.
///
/// Events go to stderr; stdout carries command output only.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_target(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("tracing subscriber already installed: {err}")))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "daybook_cache_hit_total",
            Unit::Count,
            "Total number of queries answered from a fresh cache entry."
        );
        describe_counter!(
            "daybook_cache_miss_total",
            Unit::Count,
            "Total number of queries that started a remote fetch."
        );
        describe_counter!(
            "daybook_cache_fetch_dedup_total",
            Unit::Count,
            "Total number of queries that joined an in-flight fetch."
        );
        describe_counter!(
            "daybook_cache_evict_total",
            Unit::Count,
            "Total number of cache entries evicted, labelled by reason."
        );
        describe_counter!(
            "daybook_cache_invalidate_total",
            Unit::Count,
            "Total number of cache entries marked stale."
        );
        describe_histogram!(
            "daybook_cache_fetch_ms",
            Unit::Milliseconds,
            "Remote fetch latency in milliseconds, labelled by query kind."
        );
        describe_counter!(
            "daybook_mutation_committed_total",
            Unit::Count,
            "Total number of mutations confirmed by the remote store."
        );
        describe_counter!(
            "daybook_mutation_rolled_back_total",
            Unit::Count,
            "Total number of mutations rolled back, labelled by failure kind."
        );
    });
}
