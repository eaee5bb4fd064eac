/*!
Observability infrastructure for Keepsake.

- Structured logging setup on top of `tracing-subscriber`
- Prometheus metrics scoped to one orchestrator (feature `metrics`)

Metrics are never process-wide: every [`BackupMetrics`] owns its registry,
so two orchestrators in one process report independently.
*/

use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{KeepsakeError, Result};

#[cfg(feature = "metrics")]
pub use enabled::{BackupMetrics, MetricsTimer};

#[cfg(not(feature = "metrics"))]
pub use disabled::{BackupMetrics, MetricsTimer};

#[cfg(feature = "metrics")]
mod enabled {
    use std::time::Instant;

    use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};

    use crate::{KeepsakeError, Result};

    fn metric_error(name: &str, e: prometheus::Error) -> KeepsakeError {
        KeepsakeError::validation(format!("Failed to set up metric {name}: {e}"))
    }

    fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
        let counter = Counter::new(name, help).map_err(|e| metric_error(name, e))?;
        registry
            .register(Box::new(counter.clone()))
            .map_err(|e| metric_error(name, e))?;
        Ok(counter)
    }

    fn histogram(registry: &Registry, opts: HistogramOpts) -> Result<Histogram> {
        let name = opts.common_opts.name.clone();
        let histogram = Histogram::with_opts(opts).map_err(|e| metric_error(&name, e))?;
        registry
            .register(Box::new(histogram.clone()))
            .map_err(|e| metric_error(&name, e))?;
        Ok(histogram)
    }

    /// Metrics collection for one backup orchestrator
    #[derive(Debug, Clone)]
    pub struct BackupMetrics {
        pub saves_total: Counter,
        pub restores_total: Counter,
        pub aborted_total: Counter,
        pub failures_total: Counter,
        pub fallbacks_total: Counter,
        pub assets_total: Counter,
        pub asset_bytes_total: Counter,
        pub document_bytes: Histogram,
        pub operation_seconds: Histogram,
        registry: Registry,
    }

    impl BackupMetrics {
        pub fn new() -> Result<Self> {
            let registry = Registry::new();

            Ok(Self {
                saves_total: counter(&registry, "keepsake_saves_total", "Completed backup saves")?,
                restores_total: counter(&registry, "keepsake_restores_total", "Completed restores")?,
                aborted_total: counter(&registry, "keepsake_aborted_total", "Operations ended by cancellation")?,
                failures_total: counter(&registry, "keepsake_failures_total", "Operations ended by an error")?,
                fallbacks_total: counter(
                    &registry,
                    "keepsake_streaming_fallbacks_total",
                    "Chunked encodes that fell back to compressed encoding",
                )?,
                assets_total: counter(&registry, "keepsake_assets_total", "Assets archived or restored")?,
                asset_bytes_total: counter(&registry, "keepsake_asset_bytes_total", "Asset bytes transferred")?,
                document_bytes: histogram(
                    &registry,
                    HistogramOpts::new("keepsake_document_payload_bytes", "Encoded document payload size")
                        .buckets(prometheus::exponential_buckets(1024.0, 4.0, 12).map_err(|e| {
                            metric_error("keepsake_document_payload_bytes", e)
                        })?),
                )?,
                operation_seconds: histogram(
                    &registry,
                    HistogramOpts::new("keepsake_operation_seconds", "Duration of save and restore operations"),
                )?,
                registry,
            })
        }

        pub fn record_save(&self) {
            self.saves_total.inc();
        }

        pub fn record_restore(&self) {
            self.restores_total.inc();
        }

        pub fn record_abort(&self) {
            self.aborted_total.inc();
        }

        pub fn record_failure(&self) {
            self.failures_total.inc();
        }

        pub fn record_fallback(&self) {
            self.fallbacks_total.inc();
        }

        pub fn record_asset(&self, bytes: u64) {
            self.assets_total.inc();
            self.asset_bytes_total.inc_by(bytes as f64);
        }

        pub fn record_document_size(&self, bytes: usize) {
            self.document_bytes.observe(bytes as f64);
        }

        pub fn start_timer(&self) -> MetricsTimer {
            MetricsTimer {
                start: Instant::now(),
                histogram: self.operation_seconds.clone(),
            }
        }

        /// Gather metrics in Prometheus text format
        pub fn gather(&self) -> Result<String> {
            let mut buffer = Vec::new();
            TextEncoder::new()
                .encode(&self.registry.gather(), &mut buffer)
                .map_err(|e| KeepsakeError::validation(format!("Failed to encode metrics: {e}")))?;

            String::from_utf8(buffer)
                .map_err(|e| KeepsakeError::validation(format!("Metrics are not UTF-8: {e}")))
        }
    }

    /// Measures one operation into `keepsake_operation_seconds`
    pub struct MetricsTimer {
        start: Instant,
        histogram: Histogram,
    }

    impl MetricsTimer {
        pub fn finish(self) {
            self.histogram.observe(self.start.elapsed().as_secs_f64());
        }
    }
}

#[cfg(not(feature = "metrics"))]
mod disabled {
    use crate::Result;

    /// No-op stand-in used when the `metrics` feature is off
    #[derive(Debug, Clone, Default)]
    pub struct BackupMetrics;

    impl BackupMetrics {
        pub fn new() -> Result<Self> {
            Ok(Self)
        }

        pub fn record_save(&self) {}

        pub fn record_restore(&self) {}

        pub fn record_abort(&self) {}

        pub fn record_failure(&self) {}

        pub fn record_fallback(&self) {}

        pub fn record_asset(&self, _bytes: u64) {}

        pub fn record_document_size(&self, _bytes: usize) {}

        pub fn start_timer(&self) -> MetricsTimer {
            MetricsTimer
        }
    }

    pub struct MetricsTimer;

    impl MetricsTimer {
        pub fn finish(self) {}
    }
}

/// Log filter: `RUST_LOG` when set, otherwise `info`, or `debug` if verbose
fn build_filter(env_directives: Option<String>, verbose: bool) -> EnvFilter {
    match env_directives.filter(|d| !d.trim().is_empty()) {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::new(if verbose { "debug" } else { "info" }),
    }
}

/// Initialize the global logging subscriber
///
/// # Arguments
/// * `json` - Emit one JSON object per event instead of human-readable lines
/// * `verbose` - Default to `debug` instead of `info` when `RUST_LOG` is unset
///
/// # Errors
/// `Validation` if a global subscriber is already installed
pub fn init_observability(json: bool, verbose: bool) -> Result<()> {
    let filter = build_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok(), verbose);

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };

    result.map_err(|e| {
        KeepsakeError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(json, verbose, "Keepsake observability initialized");
    Ok(())
}
