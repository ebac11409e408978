//! Prometheus metrics for observability and monitoring.
//!
//! Metrics are recorded through the `metrics` facade and are no-ops until a
//! recorder is installed. [`MetricsExporter::install`] installs the
//! Prometheus recorder; the HTTP port renders it on `/metrics`.
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let exporter = MetricsExporter::install()?;
//! let body = exporter.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installed Prometheus recorder.
#[derive(Clone)]
pub struct MetricsExporter {
    handle: PrometheusHandle,
}

impl MetricsExporter {
    /// Build the Prometheus recorder and install it as the global recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a global recorder is already
    /// installed. Call this once per process.
    pub fn install() -> Result<Self, MetricsError> {
        register_metrics();

        let handle = builder()?
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tracing::info!("Prometheus metrics recorder installed");
        Ok(Self { handle })
    }

    /// Wrap an existing handle, e.g. one from a recorder built for a test.
    #[must_use]
    pub const fn from_handle(handle: PrometheusHandle) -> Self {
        Self { handle }
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Prometheus builder with the histogram buckets used for handler latency.
///
/// # Errors
///
/// Returns [`MetricsError::Build`] if the bucket configuration is rejected.
pub fn builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Register all metric descriptions.
fn register_metrics() {
    // Router Metrics
    describe_counter!(
        "router_messages_consumed_total",
        "Total number of deliveries taken from a subscription"
    );
    describe_counter!(
        "router_messages_acked_total",
        "Total number of deliveries acknowledged"
    );
    describe_counter!(
        "router_messages_nacked_total",
        "Total number of deliveries returned to the broker for redelivery"
    );
    describe_counter!(
        "router_messages_dead_lettered_total",
        "Total number of messages moved to dead-letter"
    );
    describe_counter!(
        "router_messages_produced_total",
        "Total number of messages published by handlers"
    );
    describe_histogram!(
        "router_handler_duration_seconds",
        "Time taken by the middleware-wrapped handler per delivery"
    );

    // Retry Metrics
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!(
        "retry_successes_total",
        "Total number of operations that succeeded after at least one retry"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that exhausted max retries"
    );
}

/// Router metrics recorder.
pub struct RouterMetrics;

impl RouterMetrics {
    /// Record a delivery taken from a subscription.
    pub fn record_consumed(handler: &str) {
        counter!("router_messages_consumed_total", "handler" => handler.to_string()).increment(1);
    }

    /// Record an acknowledged delivery.
    pub fn record_acked(handler: &str) {
        counter!("router_messages_acked_total", "handler" => handler.to_string()).increment(1);
    }

    /// Record a nacked delivery.
    pub fn record_nacked(handler: &str) {
        counter!("router_messages_nacked_total", "handler" => handler.to_string()).increment(1);
    }

    /// Record a dead-lettered message.
    pub fn record_dead_lettered(handler: &str) {
        counter!("router_messages_dead_lettered_total", "handler" => handler.to_string())
            .increment(1);
    }

    /// Record messages published by a handler.
    pub fn record_produced(handler: &str, count: usize) {
        counter!("router_messages_produced_total", "handler" => handler.to_string())
            .increment(count as u64);
    }

    /// Record how long one handler invocation (middleware included) took.
    pub fn record_duration(handler: &str, duration: Duration) {
        histogram!("router_handler_duration_seconds", "handler" => handler.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn router_metrics_are_rendered_with_handler_label() {
        let recorder = builder().unwrap().build_recorder();
        let exporter = MetricsExporter::from_handle(recorder.handle());

        metrics::with_local_recorder(&recorder, || {
            RouterMetrics::record_consumed("issue-receipt");
            RouterMetrics::record_acked("issue-receipt");
            RouterMetrics::record_duration("issue-receipt", Duration::from_millis(12));
        });

        let rendered = exporter.render();
        assert!(rendered.contains("router_messages_consumed_total{handler=\"issue-receipt\"} 1"));
        assert!(rendered.contains("router_messages_acked_total{handler=\"issue-receipt\"} 1"));
        assert!(rendered.contains("router_handler_duration_seconds_bucket"));
    }

    #[test]
    fn retry_metrics_are_counted() {
        let recorder = builder().unwrap().build_recorder();
        let exporter = MetricsExporter::from_handle(recorder.handle());

        metrics::with_local_recorder(&recorder, || {
            RetryMetrics::record_attempt();
            RetryMetrics::record_attempt();
            RetryMetrics::record_success();
        });

        let rendered = exporter.render();
        assert!(rendered.contains("retry_attempts_total 2"));
        assert!(rendered.contains("retry_successes_total 1"));
    }
}
