//! Lightweight Prometheus-compatible metrics for the Gateway.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format, served over HTTP by [`serve_metrics`]
//! when a metrics port is configured and logged once at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tiny_http::{Header, Method, Response, Server};

/// Lightweight Prometheus-compatible metrics for the Gateway.
pub struct Metrics {
    /// Devices currently in the registry (gauge)
    pub registered_devices: AtomicU64,
    /// Total accepted device registrations, re-registrations included (counter)
    pub registrations_total: AtomicU64,
    /// Total device connections closed without a valid registration (counter)
    pub registration_rejections_total: AtomicU64,
    /// Currently connected control clients (gauge)
    pub active_client_connections: AtomicU64,
    /// Total control client connections accepted (counter)
    pub client_connections_total: AtomicU64,
    /// Total list requests served (counter)
    pub list_requests_total: AtomicU64,
    /// Total commands written to a device sink (counter)
    pub commands_routed_total: AtomicU64,
    /// Total commands addressed to unknown devices (counter)
    pub commands_unroutable_total: AtomicU64,
    /// Total commands whose sink write failed (counter)
    pub command_send_failures_total: AtomicU64,
    /// Total status updates applied to the registry (counter)
    pub status_updates_total: AtomicU64,
    /// Total status datagrams dropped: unknown device or wrong payload (counter)
    pub status_dropped_total: AtomicU64,
    /// Total undecodable frames and datagrams (counter)
    pub malformed_messages_total: AtomicU64,
    /// Total discovery announcements sent (counter)
    pub announcements_sent_total: AtomicU64,
    /// Gateway start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            registered_devices: AtomicU64::new(0),
            registrations_total: AtomicU64::new(0),
            registration_rejections_total: AtomicU64::new(0),
            active_client_connections: AtomicU64::new(0),
            client_connections_total: AtomicU64::new(0),
            list_requests_total: AtomicU64::new(0),
            commands_routed_total: AtomicU64::new(0),
            commands_unroutable_total: AtomicU64::new(0),
            command_send_failures_total: AtomicU64::new(0),
            status_updates_total: AtomicU64::new(0),
            status_dropped_total: AtomicU64::new(0),
            malformed_messages_total: AtomicU64::new(0),
            announcements_sent_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP city_registered_devices Devices currently in the registry\n\
             # TYPE city_registered_devices gauge\n\
             city_registered_devices {}\n\
             # HELP city_registrations_total Total accepted device registrations\n\
             # TYPE city_registrations_total counter\n\
             city_registrations_total {}\n\
             # HELP city_registration_rejections_total Total rejected device connections\n\
             # TYPE city_registration_rejections_total counter\n\
             city_registration_rejections_total {}\n\
             # HELP city_active_client_connections Currently connected control clients\n\
             # TYPE city_active_client_connections gauge\n\
             city_active_client_connections {}\n\
             # HELP city_client_connections_total Total control client connections\n\
             # TYPE city_client_connections_total counter\n\
             city_client_connections_total {}\n\
             # HELP city_list_requests_total Total list requests served\n\
             # TYPE city_list_requests_total counter\n\
             city_list_requests_total {}\n\
             # HELP city_commands_routed_total Total commands forwarded to devices\n\
             # TYPE city_commands_routed_total counter\n\
             city_commands_routed_total {}\n\
             # HELP city_commands_unroutable_total Total commands for unknown devices\n\
             # TYPE city_commands_unroutable_total counter\n\
             city_commands_unroutable_total {}\n\
             # HELP city_command_send_failures_total Total failed writes to device connections\n\
             # TYPE city_command_send_failures_total counter\n\
             city_command_send_failures_total {}\n\
             # HELP city_status_updates_total Total status updates applied\n\
             # TYPE city_status_updates_total counter\n\
             city_status_updates_total {}\n\
             # HELP city_status_dropped_total Total status datagrams dropped\n\
             # TYPE city_status_dropped_total counter\n\
             city_status_dropped_total {}\n\
             # HELP city_malformed_messages_total Total undecodable messages\n\
             # TYPE city_malformed_messages_total counter\n\
             city_malformed_messages_total {}\n\
             # HELP city_announcements_sent_total Total discovery announcements sent\n\
             # TYPE city_announcements_sent_total counter\n\
             city_announcements_sent_total {}\n\
             # HELP city_uptime_seconds Gateway uptime in seconds\n\
             # TYPE city_uptime_seconds gauge\n\
             city_uptime_seconds {}\n",
            self.registered_devices.load(Ordering::Relaxed),
            self.registrations_total.load(Ordering::Relaxed),
            self.registration_rejections_total.load(Ordering::Relaxed),
            self.active_client_connections.load(Ordering::Relaxed),
            self.client_connections_total.load(Ordering::Relaxed),
            self.list_requests_total.load(Ordering::Relaxed),
            self.commands_routed_total.load(Ordering::Relaxed),
            self.commands_unroutable_total.load(Ordering::Relaxed),
            self.command_send_failures_total.load(Ordering::Relaxed),
            self.status_updates_total.load(Ordering::Relaxed),
            self.status_dropped_total.load(Ordering::Relaxed),
            self.malformed_messages_total.load(Ordering::Relaxed),
            self.announcements_sent_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HTTP Exposition
// ============================================================================

const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Answer `GET /metrics` on `server` with the current metrics; anything else
/// gets a 404
pub fn serve_metrics(server: Server, metrics: Arc<Metrics>) {
    for request in server.incoming_requests() {
        let response = match (request.method(), request.url()) {
            (Method::Get, "/metrics") => {
                let mut response = Response::from_string(metrics.render());
                if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], CONTENT_TYPE) {
                    response = response.with_header(header);
                }
                response
            }
            (method, url) => {
                log::debug!("Metrics endpoint: no route for {} {}", method, url);
                Response::from_string("not found\n").with_status_code(404)
            }
        };
        if let Err(e) = request.respond(response) {
            log::debug!("Metrics response failed: {}", e);
        }
    }
}
