//! Prometheus metrics for the controller
//!
//! All metrics hang off an explicitly-constructed registry; construction is
//! fallible and nothing is registered globally.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::error::{ObservabilityError, Result};

/// Cirrus controller metrics
pub struct CirrusMetrics {
    registry: Registry,

    // Invocation metrics
    /// Total invocations by function and terminal status
    pub invocations_total: CounterVec,
    /// Invocation duration in seconds by function
    pub invocation_duration_seconds: HistogramVec,
    /// Invocations that required occupying a cold runtime
    pub cold_starts_total: Counter,

    // Scale metrics
    /// Multi-sandbox scale-up operations (merges performed)
    pub scale_up_total: Counter,
    /// Scale-down operations (retrieves performed)
    pub scale_down_total: Counter,

    // Pool metrics
    /// Runtimes currently in each lifecycle state
    pub runtimes_by_state: GaugeVec,
    /// Memory ledger gauges in bytes (capacity/allocatable/marked/used)
    pub memory_bytes: GaugeVec,

    // System metrics
    /// Time since the controller started in seconds
    pub uptime_seconds: Gauge,
}

impl CirrusMetrics {
    /// Create a new metrics collection
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let invocations_total = CounterVec::new(
            Opts::new("cirrus_invocations_total", "Total invocations"),
            &["function", "status"],
        )
        .map_err(|e| ObservabilityError::MetricsInit(e.to_string()))?;

        let invocation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "cirrus_invocation_duration_seconds",
                "Invocation duration in seconds",
            ),
            &["function"],
        )
        .map_err(|e| ObservabilityError::MetricsInit(e.to_string()))?;

        let cold_starts_total = Counter::new(
            "cirrus_cold_starts_total",
            "Invocations that occupied a cold runtime",
        )
        .map_err(|e| ObservabilityError::MetricsInit(e.to_string()))?;

        let scale_up_total = Counter::new(
            "cirrus_scale_up_total",
            "Multi-sandbox scale-up operations performed",
        )
        .map_err(|e| ObservabilityError::MetricsInit(e.to_string()))?;

        let scale_down_total = Counter::new(
            "cirrus_scale_down_total",
            "Scale-down retrieve operations performed",
        )
        .map_err(|e| ObservabilityError::MetricsInit(e.to_string()))?;

        let runtimes_by_state = GaugeVec::new(
            Opts::new(
                "cirrus_runtimes_by_state",
                "Runtimes currently in each lifecycle state",
            ),
            &["state"],
        )
        .map_err(|e| ObservabilityError::MetricsInit(e.to_string()))?;

        let memory_bytes = GaugeVec::new(
            Opts::new("cirrus_memory_bytes", "Memory ledger in bytes"),
            &["kind"],
        )
        .map_err(|e| ObservabilityError::MetricsInit(e.to_string()))?;

        let uptime_seconds = Gauge::new(
            "cirrus_uptime_seconds",
            "Time since the controller started in seconds",
        )
        .map_err(|e| ObservabilityError::MetricsInit(e.to_string()))?;

        for collector in [
            Box::new(invocations_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(invocation_duration_seconds.clone()),
            Box::new(cold_starts_total.clone()),
            Box::new(scale_up_total.clone()),
            Box::new(scale_down_total.clone()),
            Box::new(runtimes_by_state.clone()),
            Box::new(memory_bytes.clone()),
            Box::new(uptime_seconds.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| ObservabilityError::MetricsInit(e.to_string()))?;
        }

        Ok(Self {
            registry,
            invocations_total,
            invocation_duration_seconds,
            cold_starts_total,
            scale_up_total,
            scale_down_total,
            runtimes_by_state,
            memory_bytes,
            uptime_seconds,
        })
    }

    /// Render all metrics in Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&families, &mut buf)
            .map_err(|e| ObservabilityError::MetricsInit(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| ObservabilityError::MetricsInit(e.to_string()))
    }
}
