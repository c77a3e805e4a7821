#![forbid(unsafe_code)]

// Server metrics - lock-free AtomicU64 counters and a Prometheus-compatible latency histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Bucket upper bounds in microseconds
const BUCKET_BOUNDS_US: [u64; 10] = [
    1_000,
    5_000,
    10_000,
    25_000,
    50_000,
    100_000,
    250_000,
    500_000,
    1_000_000,
    5_000_000,
];

const BUCKET_LABELS: [&str; 10] = ["0.001", "0.005", "0.01", "0.025", "0.05", "0.1", "0.25", "0.5", "1", "5"];

/// Cumulative histogram with fixed buckets
pub struct Histogram {
    buckets: [AtomicU64; 10],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, &bound) in self.buckets.iter().zip(BUCKET_BOUNDS_US.iter()) {
            if us <= bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, label) in self.buckets.iter().zip(BUCKET_LABELS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Process-wide counters, cheap to clone
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    sessions_created_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    control_changes_total: AtomicU64,
    control_rejections_total: AtomicU64,

    connections_active: AtomicU64,

    request_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                sessions_created_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                control_changes_total: AtomicU64::new(0),
                control_rejections_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                request_handling: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_sessions_created(&self) {
        self.inner.sessions_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_control_changes(&self) {
        self.inner.control_changes_total.fetch_add(1, Relaxed);
    }

    pub fn inc_control_rejections(&self) {
        self.inner.control_rejections_total.fetch_add(1, Relaxed);
    }

    pub fn sessions_created(&self) -> u64 {
        self.inner.sessions_created_total.load(Relaxed)
    }

    pub fn control_changes(&self) -> u64 {
        self.inner.control_changes_total.load(Relaxed)
    }

    pub fn control_rejections(&self) -> u64 {
        self.inner.control_rejections_total.load(Relaxed)
    }

    // --- Gauge ---

    /// Increments connections_active; the returned guard decrements it on drop
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    // --- Histogram ---

    pub fn observe_request_handling(&self, duration: Duration) {
        self.inner.request_handling.observe(duration);
    }

    // --- Prometheus rendering ---

    /// `sessions_active` and `participants_active` come from the registry at scrape time
    pub fn render_prometheus(&self, sessions_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);
        let i = &self.inner;

        render_counter(&mut out, "huddle_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "huddle_messages_received_total", "Total messages received from clients", i.messages_received_total.load(Relaxed));
        render_counter(&mut out, "huddle_messages_sent_total", "Total messages sent to clients", i.messages_sent_total.load(Relaxed));
        render_counter(&mut out, "huddle_errors_total", "Total error replies", i.errors_total.load(Relaxed));
        render_counter(&mut out, "huddle_sessions_created_total", "Total sessions created", i.sessions_created_total.load(Relaxed));
        render_counter(&mut out, "huddle_joins_total", "Total session joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "huddle_leaves_total", "Total session leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "huddle_producers_created_total", "Total producers created", i.producers_created_total.load(Relaxed));
        render_counter(&mut out, "huddle_consumers_created_total", "Total consumers created", i.consumers_created_total.load(Relaxed));
        render_counter(&mut out, "huddle_control_changes_total", "Total accepted pause/resume transitions", i.control_changes_total.load(Relaxed));
        render_counter(&mut out, "huddle_control_rejections_total", "Total rejected pause/resume requests", i.control_rejections_total.load(Relaxed));

        render_gauge(&mut out, "huddle_connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "huddle_sessions_active", "Currently active sessions", sessions_active as u64);
        render_gauge(&mut out, "huddle_participants_active", "Currently active participants", participants_active as u64);

        i.request_handling.render(
            "huddle_request_handling_seconds",
            "Signaling request handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` on drop
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = ServerMetrics::new();
        metrics.observe_request_handling(Duration::from_millis(3));
        metrics.observe_request_handling(Duration::from_millis(300));

        let out = metrics.render_prometheus(0, 0);
        assert!(out.contains("huddle_request_handling_seconds_bucket{le=\"0.001\"} 0"));
        assert!(out.contains("huddle_request_handling_seconds_bucket{le=\"0.005\"} 1"));
        assert!(out.contains("huddle_request_handling_seconds_bucket{le=\"0.5\"} 2"));
        assert!(out.contains("huddle_request_handling_seconds_count 2"));
        assert!(out.contains("huddle_request_handling_seconds_sum 0.303000"));
    }

    #[test]
    fn gauges_track_guards_and_scrape_values() {
        let metrics = ServerMetrics::new();
        let guard = metrics.connection_active_guard();
        metrics.inc_control_changes();

        let out = metrics.render_prometheus(2, 5);
        assert!(out.contains("huddle_connections_active 1"));
        assert!(out.contains("huddle_sessions_active 2"));
        assert!(out.contains("huddle_participants_active 5"));
        assert!(out.contains("huddle_control_changes_total 1"));

        drop(guard);
        assert!(metrics.render_prometheus(0, 0).contains("huddle_connections_active 0"));
    }
}
