//! OpenTelemetry metrics instruments for the butler concurrency subsystem.
//!
//! Promotes the eleven metrics documented in
//! `original_source/src/butlers/core/metrics.py` to a typed recorder so
//! call sites cannot typo an instrument name or forget a label. Every
//! instrument carries a `butler` attribute for per-butler drill-down, set
//! once at construction.
//!
//! When no OTLP exporter is configured, `opentelemetry`'s global meter
//! provider defaults to a no-op implementation, so every recording below is
//! a cheap no-op rather than a silent error.

use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
use opentelemetry::KeyValue;

/// Typed recorder for the spawner, buffer, and route metrics named in
/// `spec.md` §4.4, §4.7, and §4.5.
#[derive(Clone)]
pub struct ButlerMetrics {
    butler: KeyValue,

    active_sessions: UpDownCounter<i64>,
    queued_triggers: UpDownCounter<i64>,
    session_duration_ms: Histogram<f64>,

    queue_depth: UpDownCounter<i64>,
    enqueue_hot_total: Counter<u64>,
    enqueue_cold_total: Counter<u64>,
    backpressure_total: Counter<u64>,
    scanner_recovered_total: Counter<u64>,
    process_latency_ms: Histogram<f64>,

    route_accept_latency_ms: Histogram<f64>,
    route_queue_depth: UpDownCounter<i64>,
    route_process_latency_ms: Histogram<f64>,
}

impl ButlerMetrics {
    /// Create the instrument set for one butler. Cheap: instruments are
    /// backed by the global `MeterProvider`, which is a no-op until
    /// `init_metrics` installs an OTLP exporter.
    pub fn new(butler_name: impl Into<String>) -> Self {
        let meter = opentelemetry::global::meter("butlers");
        Self {
            butler: KeyValue::new("butler", butler_name.into()),

            active_sessions: meter
                .i64_up_down_counter("butlers.spawner.active_sessions")
                .with_description("Current concurrent sessions per butler")
                .build(),
            queued_triggers: meter
                .i64_up_down_counter("butlers.spawner.queued_triggers")
                .with_description("Tasks waiting for the concurrency semaphore")
                .build(),
            session_duration_ms: meter
                .f64_histogram("butlers.spawner.session_duration_ms")
                .with_description("End-to-end session duration in milliseconds")
                .build(),

            queue_depth: meter
                .i64_up_down_counter("butlers.buffer.queue_depth")
                .with_description("Current in-memory buffer queue depth")
                .build(),
            enqueue_hot_total: meter
                .u64_counter("butlers.buffer.enqueue_total")
                .with_description("Messages enqueued via the hot path")
                .build(),
            enqueue_cold_total: meter
                .u64_counter("butlers.buffer.enqueue_total")
                .with_description("Messages recovered via the scanner cold path")
                .build(),
            backpressure_total: meter
                .u64_counter("butlers.buffer.backpressure_total")
                .with_description("Queue-full events on the hot path")
                .build(),
            scanner_recovered_total: meter
                .u64_counter("butlers.buffer.scanner_recovered_total")
                .with_description("Messages recovered by the periodic scanner")
                .build(),
            process_latency_ms: meter
                .f64_histogram("butlers.buffer.process_latency_ms")
                .with_description("Queue wait time from enqueue to processing start")
                .build(),

            route_accept_latency_ms: meter
                .f64_histogram("butlers.route.accept_latency_ms")
                .with_description("Time for the target butler to acknowledge a route request")
                .build(),
            route_queue_depth: meter
                .i64_up_down_counter("butlers.route.queue_depth")
                .with_description("Accepted-but-unprocessed route_inbox rows per butler")
                .build(),
            route_process_latency_ms: meter
                .f64_histogram("butlers.route.process_latency_ms")
                .with_description("Time from route acceptance to processing start")
                .build(),
        }
    }

    pub fn spawner_queued_inc(&self) {
        self.queued_triggers.add(1, &[self.butler.clone()]);
    }
    pub fn spawner_queued_dec(&self) {
        self.queued_triggers.add(-1, &[self.butler.clone()]);
    }
    pub fn spawner_active_inc(&self) {
        self.active_sessions.add(1, &[self.butler.clone()]);
    }
    pub fn spawner_active_dec(&self) {
        self.active_sessions.add(-1, &[self.butler.clone()]);
    }
    pub fn record_session_duration(&self, duration_ms: f64) {
        self.session_duration_ms.record(duration_ms, &[self.butler.clone()]);
    }

    pub fn buffer_queue_depth_inc(&self) {
        self.queue_depth.add(1, &[self.butler.clone()]);
    }
    pub fn buffer_queue_depth_dec(&self) {
        self.queue_depth.add(-1, &[self.butler.clone()]);
    }
    pub fn buffer_enqueue_hot(&self) {
        self.enqueue_hot_total.add(1, &[self.butler.clone(), KeyValue::new("path", "hot")]);
    }
    pub fn buffer_enqueue_cold(&self) {
        self.enqueue_cold_total.add(1, &[self.butler.clone(), KeyValue::new("path", "cold")]);
    }
    pub fn buffer_backpressure(&self) {
        self.backpressure_total.add(1, &[self.butler.clone()]);
    }
    pub fn buffer_scanner_recovered(&self) {
        self.scanner_recovered_total.add(1, &[self.butler.clone()]);
    }
    pub fn record_buffer_process_latency(&self, latency_ms: f64) {
        self.process_latency_ms.record(latency_ms, &[self.butler.clone()]);
    }

    pub fn record_route_accept_latency(&self, latency_ms: f64) {
        self.route_accept_latency_ms.record(latency_ms, &[self.butler.clone()]);
    }
    pub fn route_queue_depth_inc(&self) {
        self.route_queue_depth.add(1, &[self.butler.clone()]);
    }
    pub fn route_queue_depth_dec(&self) {
        self.route_queue_depth.add(-1, &[self.butler.clone()]);
    }
    pub fn record_route_process_latency(&self, latency_ms: f64) {
        self.route_process_latency_ms.record(latency_ms, &[self.butler.clone()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Instrument construction and recording must never panic, even without
    /// an OTLP exporter installed (no-op MeterProvider).
    #[test]
    fn metrics_recording_is_infallible_without_exporter() {
        let metrics = ButlerMetrics::new("switchboard");
        metrics.spawner_active_inc();
        metrics.spawner_active_dec();
        metrics.buffer_enqueue_hot();
        metrics.buffer_enqueue_cold();
        metrics.buffer_backpressure();
        metrics.record_buffer_process_latency(12.5);
        metrics.record_route_accept_latency(3.0);
        metrics.route_queue_depth_inc();
        metrics.route_queue_depth_dec();
    }
}
