//! Tracing bootstrap and the process-wide Prometheus registry (§4.11).
//!
//! One [`Metrics`] instance is built at process start and threaded through
//! every subsystem that needs to record something; there is no ambient
//! global registry to reach for from arbitrary call sites.

use prometheus::{Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global `tracing` subscriber. Call once, before anything else
/// logs. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("openspc=info,tower_http=info"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false),
    );

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set tracing subscriber: {err}");
    }
}

/// Counters and histograms for the things §4.11 calls out by name: samples
/// processed, rule fire counts, violation lifecycle, buffer flushes, purge
/// activity, broker reconnects, live-subscriber connections, and outbound
/// rate-limit rejections.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub samples_processed_total: IntCounter,
    pub sample_processing_duration_seconds: Histogram,

    pub rule_fires_total: IntCounterVec,

    pub violations_created_total: IntCounter,
    pub violations_acknowledged_total: IntCounter,

    pub buffer_flushes_total: IntCounterVec,

    pub purge_batches_total: IntCounter,
    pub purge_rows_deleted_total: IntCounter,

    pub broker_reconnects_total: IntCounterVec,

    pub live_connections: IntGauge,

    pub outbound_rate_limit_rejections_total: IntCounter,

    pub api_key_verifications_total: IntCounterVec,
    pub rate_limit_events_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let samples_processed_total = IntCounter::with_opts(Opts::new("openspc_samples_processed_total", "Samples processed by the engine").namespace("openspc"))?;

        let sample_processing_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("openspc_sample_processing_duration_seconds", "Time spent processing one sample end to end")
                .namespace("openspc")
                .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )?;

        let rule_fires_total = IntCounterVec::new(
            Opts::new("openspc_rule_fires_total", "Nelson rule fires by rule id and severity").namespace("openspc"),
            &["rule_id", "severity"],
        )?;

        let violations_created_total = IntCounter::with_opts(Opts::new("openspc_violations_created_total", "Violations recorded").namespace("openspc"))?;
        let violations_acknowledged_total =
            IntCounter::with_opts(Opts::new("openspc_violations_acknowledged_total", "Violations acknowledged").namespace("openspc"))?;

        let buffer_flushes_total = IntCounterVec::new(
            Opts::new("openspc_buffer_flushes_total", "Subgroup buffer flushes by trigger strategy").namespace("openspc"),
            &["trigger"],
        )?;

        let purge_batches_total = IntCounter::with_opts(Opts::new("openspc_purge_batches_total", "Retention purge batches run").namespace("openspc"))?;
        let purge_rows_deleted_total = IntCounter::with_opts(Opts::new("openspc_purge_rows_deleted_total", "Rows deleted by the purge engine").namespace("openspc"))?;

        let broker_reconnects_total = IntCounterVec::new(
            Opts::new("openspc_broker_reconnects_total", "Broker/OPC-UA reconnect attempts by data source").namespace("openspc"),
            &["data_source_id", "kind"],
        )?;

        let live_connections = IntGauge::with_opts(Opts::new("openspc_live_connections", "Open live-subscriber WebSocket connections").namespace("openspc"))?;

        let outbound_rate_limit_rejections_total = IntCounter::with_opts(
            Opts::new("openspc_outbound_rate_limit_rejections_total", "Outbound re-publish messages dropped by rate limiting").namespace("openspc"),
        )?;

        let api_key_verifications_total = IntCounterVec::new(
            Opts::new("openspc_api_key_verifications_total", "API key verifications by result").namespace("openspc"),
            &["result"],
        )?;

        let rate_limit_events_total = IntCounterVec::new(
            Opts::new("openspc_rate_limit_events_total", "Inbound rate limit checks by result").namespace("openspc"),
            &["result"],
        )?;

        registry.register(Box::new(samples_processed_total.clone()))?;
        registry.register(Box::new(sample_processing_duration_seconds.clone()))?;
        registry.register(Box::new(rule_fires_total.clone()))?;
        registry.register(Box::new(violations_created_total.clone()))?;
        registry.register(Box::new(violations_acknowledged_total.clone()))?;
        registry.register(Box::new(buffer_flushes_total.clone()))?;
        registry.register(Box::new(purge_batches_total.clone()))?;
        registry.register(Box::new(purge_rows_deleted_total.clone()))?;
        registry.register(Box::new(broker_reconnects_total.clone()))?;
        registry.register(Box::new(live_connections.clone()))?;
        registry.register(Box::new(outbound_rate_limit_rejections_total.clone()))?;
        registry.register(Box::new(api_key_verifications_total.clone()))?;
        registry.register(Box::new(rate_limit_events_total.clone()))?;

        Ok(Metrics {
            registry,
            samples_processed_total,
            sample_processing_duration_seconds,
            rule_fires_total,
            violations_created_total,
            violations_acknowledged_total,
            buffer_flushes_total,
            purge_batches_total,
            purge_rows_deleted_total,
            broker_reconnects_total,
            live_connections,
            outbound_rate_limit_rejections_total,
            api_key_verifications_total,
            rate_limit_events_total,
        })
    }

    /// Encodes the registry in Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_encodes_core_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.samples_processed_total.inc();
        metrics.rule_fires_total.with_label_values(&["1", "CRITICAL"]).inc();
        metrics.live_connections.set(3);

        let output = metrics.encode().unwrap();
        assert!(output.contains("openspc_samples_processed_total"));
        assert!(output.contains("openspc_rule_fires_total"));
        assert!(output.contains("openspc_live_connections"));
    }
}
