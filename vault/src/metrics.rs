//! Metrics for the sealed store and the processing pipeline
//!
//! Counters and histograms live in a private Prometheus registry owned by
//! [`MetricsCollector`]; nothing here carries dataset contents, only
//! counts, durations and failure classifications.

use std::time::{Duration, Instant};

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};

use crate::error::{FailureReason, MetricsError, MetricsResult};

/// Metrics collector for the vault
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Registry,

    /// Registered metrics
    counters: PipelineCounters,

    /// Collector creation time
    start_time: Instant,
}

/// Registered metric handles
#[derive(Clone)]
pub struct PipelineCounters {
    // Dataset outcomes
    pub datasets_done: IntCounter,
    pub datasets_failed: IntCounterVec,

    // Row accounting
    pub rows_read: IntCounter,
    pub rows_quarantined: IntCounter,
    pub records_deduplicated: IntCounter,

    // Sealed storage
    pub datasets_sealed: IntCounter,
    pub authentication_failures: IntCounter,

    // Timing
    pub seal_duration: Histogram,
    pub unseal_duration: Histogram,
    pub dataset_duration: Histogram,
}

/// Snapshot of the pipeline counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    pub datasets_done: u64,
    pub datasets_failed: u64,
    pub datasets_sealed: u64,
    pub rows_read: u64,
    pub rows_quarantined: u64,
    pub records_deduplicated: u64,
    pub authentication_failures: u64,

    /// Average dataset processing time in milliseconds
    pub avg_dataset_time_ms: f64,

    /// Share of datasets that reached Done, as a percentage
    pub success_rate: f64,

    /// Collector uptime in seconds
    pub uptime: u64,
}

impl MetricsCollector {
    /// Create a collector with its own registry
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let counters = PipelineCounters::new(&registry)?;

        Ok(Self {
            registry,
            counters,
            start_time: Instant::now(),
        })
    }

    pub fn counters(&self) -> &PipelineCounters {
        &self.counters
    }

    /// Record a dataset that reached Done
    pub fn record_dataset_done(&self, duration: Duration, rows_read: u64, rows_quarantined: u64, deduplicated: u64) {
        self.counters.datasets_done.inc();
        self.counters.rows_read.inc_by(rows_read);
        self.counters.rows_quarantined.inc_by(rows_quarantined);
        self.counters.records_deduplicated.inc_by(deduplicated);
        self.counters.dataset_duration.observe(duration.as_secs_f64());
    }

    /// Record a dataset that ended Failed
    pub fn record_dataset_failed(&self, reason: &FailureReason, duration: Duration) {
        self.counters.datasets_failed.with_label_values(&[reason.as_str()]).inc();
        self.counters.dataset_duration.observe(duration.as_secs_f64());
        if *reason == FailureReason::AuthenticationFailed {
            self.counters.authentication_failures.inc();
        }
    }

    /// Record a seal and its duration
    pub fn record_seal(&self, duration: Duration) {
        self.counters.datasets_sealed.inc();
        self.counters.seal_duration.observe(duration.as_secs_f64());
    }

    /// Record an unseal attempt duration
    pub fn record_unseal(&self, duration: Duration) {
        self.counters.unseal_duration.observe(duration.as_secs_f64());
    }

    /// Current counter snapshot
    pub fn get_stats(&self) -> PipelineStats {
        let datasets_done = self.counters.datasets_done.get();
        let datasets_failed: u64 = [
            FailureReason::KeyUnavailable,
            FailureReason::KeyFormatInvalid,
            FailureReason::AuthenticationFailed,
            FailureReason::UnsupportedFormatVersion,
            FailureReason::MalformedRecord,
            FailureReason::SchemaInvalid,
            FailureReason::DatasetNotFound,
            FailureReason::Cancelled,
            FailureReason::Storage,
            FailureReason::Internal,
        ]
        .iter()
        .map(|reason| self.counters.datasets_failed.with_label_values(&[reason.as_str()]).get())
        .sum();

        let finished = datasets_done + datasets_failed;
        let success_rate = if finished > 0 {
            datasets_done as f64 / finished as f64 * 100.0
        } else {
            0.0
        };

        let samples = self.counters.dataset_duration.get_sample_count();
        let avg_dataset_time_ms = if samples > 0 {
            self.counters.dataset_duration.get_sample_sum() / samples as f64 * 1000.0
        } else {
            0.0
        };

        PipelineStats {
            datasets_done,
            datasets_failed,
            datasets_sealed: self.counters.datasets_sealed.get(),
            rows_read: self.counters.rows_read.get(),
            rows_quarantined: self.counters.rows_quarantined.get(),
            records_deduplicated: self.counters.records_deduplicated.get(),
            authentication_failures: self.counters.authentication_failures.get(),
            avg_dataset_time_ms,
            success_rate,
            uptime: self.start_time.elapsed().as_secs(),
        }
    }

    /// Export metrics as "prometheus" text or "json"
    pub fn export_metrics(&self, format: &str) -> MetricsResult<String> {
        match format {
            "prometheus" => {
                let encoder = TextEncoder::new();
                let metric_families = self.registry.gather();
                let mut buffer = Vec::new();
                encoder
                    .encode(&metric_families, &mut buffer)
                    .map_err(|e| MetricsError::ExportFailed { reason: e.to_string() })?;
                String::from_utf8(buffer).map_err(|e| MetricsError::ExportFailed { reason: e.to_string() })
            }
            "json" => {
                let combined = serde_json::json!({
                    "pipeline_stats": self.get_stats(),
                    "timestamp": chrono::Utc::now().timestamp()
                });

                serde_json::to_string_pretty(&combined)
                    .map_err(|e| MetricsError::ExportFailed { reason: e.to_string() })
            }
            _ => Err(MetricsError::ExportFailed {
                reason: format!("Unsupported format: {}", format),
            }),
        }
    }
}

impl PipelineCounters {
    fn new(registry: &Registry) -> MetricsResult<Self> {
        let datasets_done = register(registry, IntCounter::new("botica_datasets_done_total", "Datasets processed to completion"))?;
        let datasets_failed = register(
            registry,
            IntCounterVec::new(
                Opts::new("botica_datasets_failed_total", "Datasets that failed, by reason"),
                &["reason"],
            ),
        )?;

        let rows_read = register(registry, IntCounter::new("botica_rows_read_total", "Rows read from unsealed datasets"))?;
        let rows_quarantined = register(registry, IntCounter::new("botica_rows_quarantined_total", "Rows set aside by validation"))?;
        let records_deduplicated = register(registry, IntCounter::new("botica_records_deduplicated_total", "Duplicate rows collapsed"))?;

        let datasets_sealed = register(registry, IntCounter::new("botica_datasets_sealed_total", "Datasets sealed to storage"))?;
        let authentication_failures = register(
            registry,
            IntCounter::new("botica_authentication_failures_total", "Sealed files that failed authentication"),
        )?;

        let seal_duration = register(
            registry,
            Histogram::with_opts(
                HistogramOpts::new("botica_seal_duration_seconds", "Seal and write duration")
                    .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            ),
        )?;
        let unseal_duration = register(
            registry,
            Histogram::with_opts(
                HistogramOpts::new("botica_unseal_duration_seconds", "Read and unseal duration")
                    .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            ),
        )?;
        let dataset_duration = register(
            registry,
            Histogram::with_opts(
                HistogramOpts::new("botica_dataset_duration_seconds", "End-to-end dataset processing duration")
                    .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]),
            ),
        )?;

        Ok(Self {
            datasets_done,
            datasets_failed,
            rows_read,
            rows_quarantined,
            records_deduplicated,
            datasets_sealed,
            authentication_failures,
            seal_duration,
            unseal_duration,
            dataset_duration,
        })
    }
}

/// Build and register one metric
fn register<M>(registry: &Registry, metric: prometheus::Result<M>) -> MetricsResult<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    let metric = metric.map_err(|e| MetricsError::RegistrationFailed { name: e.to_string() })?;
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| MetricsError::RegistrationFailed { name: e.to_string() })?;
    Ok(metric)
}
