//! Prometheus metrics for connections, fan-out and persistence latency.
//!
//! Metric helpers are thin wrappers over the `metrics` facade. When no
//! recorder is installed (tests, metrics disabled) every call is a no-op.
//!
//! ```rust,no_run
//! use parley_core::telemetry::metrics::{DeliveryMetrics, FrameMetrics};
//!
//! FrameMetrics::record_received();
//! DeliveryMetrics::record("user_status", 3, 1);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for store call durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
}

/// Handle to the installed Prometheus recorder.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    ///
    /// Empty when metrics are disabled.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the global Prometheus recorder.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already
/// installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        tracing::info!(service_name = %service_name, "Metrics disabled");
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    // Connection metrics
    describe_counter!(
        "parley_ws_connections_total",
        "Total number of websocket connections accepted"
    );
    describe_counter!(
        "parley_ws_disconnections_total",
        "Total number of websocket connections torn down"
    );
    describe_gauge!(
        "parley_ws_active_connections",
        "Number of currently registered websocket connections"
    );
    describe_gauge!("parley_users_online", "Number of users currently online");

    // Frame metrics
    describe_counter!(
        "parley_frames_received_total",
        "Total number of inbound frames read from clients"
    );
    describe_counter!(
        "parley_frames_dropped_total",
        "Inbound frames dropped without effect, by reason"
    );

    // Fan-out metrics
    describe_counter!(
        "parley_events_delivered_total",
        "Outbound events queued to a connection, by kind"
    );
    describe_counter!(
        "parley_delivery_failures_total",
        "Outbound events that could not be queued, by kind"
    );

    // Persistence metrics
    describe_histogram!(
        "parley_store_duration_seconds",
        "Chat store call duration in seconds"
    );

    describe_counter!("parley_errors_total", "Total number of errors by code");
}

/// Connection lifecycle metrics.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_connected(active: usize) {
        counter!("parley_ws_connections_total").increment(1);
        gauge!("parley_ws_active_connections").set(active as f64);
    }

    pub fn record_disconnected(active: usize) {
        counter!("parley_ws_disconnections_total").increment(1);
        gauge!("parley_ws_active_connections").set(active as f64);
    }

    pub fn set_users_online(online: usize) {
        gauge!("parley_users_online").set(online as f64);
    }
}

/// Inbound frame metrics.
pub struct FrameMetrics;

impl FrameMetrics {
    pub fn record_received() {
        counter!("parley_frames_received_total").increment(1);
    }

    /// Record a frame that produced no effect.
    pub fn record_dropped(reason: &'static str) {
        counter!("parley_frames_dropped_total", "reason" => reason).increment(1);
    }
}

/// Outbound fan-out metrics.
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    /// Record the outcome of one delivery pass.
    pub fn record(kind: &'static str, delivered: usize, failed: usize) {
        if delivered > 0 {
            counter!("parley_events_delivered_total", "kind" => kind).increment(delivered as u64);
        }
        if failed > 0 {
            counter!("parley_delivery_failures_total", "kind" => kind).increment(failed as u64);
        }
    }
}

/// Times a chat store call and records it on `finish`.
pub struct StoreTimer {
    start: Instant,
    operation: &'static str,
}

impl StoreTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self, success: bool) -> Duration {
        let duration = self.start.elapsed();

        histogram!(
            "parley_store_duration_seconds",
            "operation" => self.operation,
            "success" => if success { "true" } else { "false" },
        )
        .record(duration.as_secs_f64());

        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(!config.duration_buckets.is_empty());
        assert!(config.global_labels.is_empty());
    }

    #[test]
    fn test_disabled_registry_renders_empty() {
        let registry = MetricsRegistry::disabled();
        assert!(!registry.is_enabled());
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_helpers_without_recorder() {
        ConnectionMetrics::record_connected(1);
        ConnectionMetrics::record_disconnected(0);
        FrameMetrics::record_received();
        FrameMetrics::record_dropped("invalid_frame");
        DeliveryMetrics::record("new_message", 2, 1);
    }

    #[test]
    fn test_store_timer() {
        let timer = StoreTimer::start("insert_message");
        std::thread::sleep(Duration::from_millis(5));
        let duration = timer.finish(true);
        assert!(duration.as_millis() >= 5);
    }
}
