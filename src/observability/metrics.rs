//! Thread-safe metrics collection system
//!
//! Atomic counters for the MQTT connection and the dispatch path, plus a
//! bounded sample of confirmation latencies.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Confirmation latency samples kept for percentile reporting
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // MQTT connection
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    fallback_attempts: AtomicU64,
    connections_lost: AtomicU64,
    connection_start_time: AtomicU64,

    // Transport traffic
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    decode_failures: AtomicU64,

    // Dispatch outcomes
    commands_dispatched: AtomicU64,
    confirmations: AtomicU64,
    pending_outcomes: AtomicU64,
    delivery_failures: AtomicU64,
    not_connected_rejections: AtomicU64,
    confirmation_times: Mutex<Vec<u64>>, // in milliseconds

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            fallback_attempts: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            commands_dispatched: AtomicU64::new(0),
            confirmations: AtomicU64::new(0),
            pending_outcomes: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            not_connected_rejections: AtomicU64::new(0),
            confirmation_times: Mutex::new(Vec::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_fallback_attempt(&self) {
        self.fallback_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state_decode_failed(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Dispatch metrics
    pub fn command_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_confirmed(&self, elapsed: Duration) {
        self.confirmations.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut times) = self.confirmation_times.lock() {
            if times.len() >= MAX_LATENCY_SAMPLES {
                times.remove(0);
            }
            times.push(elapsed.as_millis() as u64);
        }
    }

    pub fn command_pending(&self) {
        self.pending_outcomes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_delivery_failed(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_not_connected(&self) {
        self.not_connected_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all metrics (for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.fallback_attempts,
            &self.connections_lost,
            &self.connection_start_time,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.decode_failures,
            &self.commands_dispatched,
            &self.confirmations,
            &self.pending_outcomes,
            &self.delivery_failures,
            &self.not_connected_rejections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.confirmation_times.lock() {
            times.clear();
        }
    }

    /// Average and p50/p95/p99 of confirmation latency (pure function)
    fn calculate_confirmation_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.confirmation_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;

        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    fn calculate_connection_duration(&self, now: u64) -> u64 {
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if self.mqtt_connected.load(Ordering::Relaxed) && start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_confirmation_ms, p50, p95, p99) = self.calculate_confirmation_statistics();

        MetricsSnapshot {
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                fallback_attempts: self.fallback_attempts.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                decode_failures: self.decode_failures.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            dispatch: DispatchMetrics {
                commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
                confirmed: self.confirmations.load(Ordering::Relaxed),
                pending: self.pending_outcomes.load(Ordering::Relaxed),
                delivery_failed: self.delivery_failures.load(Ordering::Relaxed),
                not_connected: self.not_connected_rejections.load(Ordering::Relaxed),
                avg_confirmation_ms,
                confirmation_p50_ms: p50,
                confirmation_p95_ms: p95,
                confirmation_p99_ms: p99,
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub mqtt: MqttMetrics,
    pub dispatch: DispatchMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub fallback_attempts: u64,
    pub connections_lost: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub decode_failures: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct DispatchMetrics {
    pub commands_dispatched: u64,
    pub confirmed: u64,
    pub pending: u64,
    pub delivery_failed: u64,
    pub not_connected: u64,
    pub avg_confirmation_ms: f64,
    pub confirmation_p50_ms: f64,
    pub confirmation_p95_ms: f64,
    pub confirmation_p99_ms: f64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
