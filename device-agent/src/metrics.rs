//! Counters for one simulated device, rendered in Prometheus text format and
//! logged when the agent exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Total command frames received from the Gateway (counter)
    pub commands_received_total: AtomicU64,
    /// Total commands that changed device state (counter)
    pub commands_applied_total: AtomicU64,
    /// Total commands ignored: other id, unsupported config, bad frame (counter)
    pub commands_ignored_total: AtomicU64,
    /// Total status datagrams sent (counter)
    pub status_sent_total: AtomicU64,
    /// Total status datagrams that could not be sent (counter)
    pub status_send_failures_total: AtomicU64,
    /// Agent start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            commands_received_total: AtomicU64::new(0),
            commands_applied_total: AtomicU64::new(0),
            commands_ignored_total: AtomicU64::new(0),
            status_sent_total: AtomicU64::new(0),
            status_send_failures_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP city_device_commands_received_total Total commands received\n\
             # TYPE city_device_commands_received_total counter\n\
             city_device_commands_received_total {}\n\
             # HELP city_device_commands_applied_total Total commands applied\n\
             # TYPE city_device_commands_applied_total counter\n\
             city_device_commands_applied_total {}\n\
             # HELP city_device_commands_ignored_total Total commands ignored\n\
             # TYPE city_device_commands_ignored_total counter\n\
             city_device_commands_ignored_total {}\n\
             # HELP city_device_status_sent_total Total status reports sent\n\
             # TYPE city_device_status_sent_total counter\n\
             city_device_status_sent_total {}\n\
             # HELP city_device_status_send_failures_total Total failed status reports\n\
             # TYPE city_device_status_send_failures_total counter\n\
             city_device_status_send_failures_total {}\n\
             # HELP city_device_uptime_seconds Agent uptime in seconds\n\
             # TYPE city_device_uptime_seconds gauge\n\
             city_device_uptime_seconds {}\n",
            self.commands_received_total.load(Ordering::Relaxed),
            self.commands_applied_total.load(Ordering::Relaxed),
            self.commands_ignored_total.load(Ordering::Relaxed),
            self.status_sent_total.load(Ordering::Relaxed),
            self.status_send_failures_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
