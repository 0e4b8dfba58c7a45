//! `OpenTelemetry` metrics for the relay.
//!
//! This module is only compiled when the `metrics` Cargo feature is enabled.
//! It sets up an OTLP metric exporter and exposes the counters the relay
//! records for turns, log entries and attached readers.

use std::sync::OnceLock;

use opentelemetry::metrics::Counter;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;

/// Errors that can occur during metrics pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Keeps the meter provider alive; call [`MetricsGuard::shutdown`] to flush.
pub struct MetricsGuard {
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Initialise the OTLP metrics pipeline.
///
/// * `endpoint` -- OTLP receiver URL, e.g. `"http://localhost:4317"` (gRPC).
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard { meter_provider })
}

struct RelayCounters {
    turns_started: Counter<u64>,
    turns_finished: Counter<u64>,
    entries_appended: Counter<u64>,
    streams_attached: Counter<u64>,
}

fn counters() -> &'static RelayCounters {
    static COUNTERS: OnceLock<RelayCounters> = OnceLock::new();
    COUNTERS.get_or_init(|| {
        let meter = global::meter("chatrelay");
        RelayCounters {
            turns_started: meter.u64_counter("chatrelay.turns.started").build(),
            turns_finished: meter.u64_counter("chatrelay.turns.finished").build(),
            entries_appended: meter.u64_counter("chatrelay.log.entries").build(),
            streams_attached: meter.u64_counter("chatrelay.streams.attached").build(),
        }
    })
}

pub fn record_turn_started() {
    counters().turns_started.add(1, &[]);
}

/// `outcome` is one of `completed`, `failed`, `superseded`.
pub fn record_turn_finished(outcome: &'static str) {
    counters()
        .turns_finished
        .add(1, &[KeyValue::new("outcome", outcome)]);
}

pub fn record_entry_appended(kind: &'static str) {
    counters()
        .entries_appended
        .add(1, &[KeyValue::new("kind", kind)]);
}

pub fn record_stream_attached() {
    counters().streams_attached.add(1, &[]);
}
