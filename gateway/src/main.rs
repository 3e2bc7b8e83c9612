//! Smart City Gateway
//!
//! Usage:
//!   city-gateway [--config gateway.json] [--bind 0.0.0.0] [--device-port 10000]
//!                [--client-port 10003] [--status-port 10001] [--metrics-port 9100]
//!                [--advertise 192.168.1.7] [--no-discovery]
//!
//! See `config.rs` for every flag.

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use city_gateway::{Gateway, GatewayConfig};

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let config = GatewayConfig::from_args(&args)?;

    log::info!("Smart City Gateway starting...");
    log::info!("  Bind:      {}", config.bind_address);
    log::info!("  Devices:   {}", config.device_port);
    log::info!("  Clients:   {}", config.client_port);
    log::info!("  Status:    {}", config.status_port);
    log::info!(
        "  Discovery: {}",
        if config.discovery_enabled {
            format!("{}:{}", config.multicast_group, config.multicast_port)
        } else {
            "disabled".to_string()
        }
    );

    // Register before spawning so no worker sees the default disposition
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    let gateway = Gateway::bind(config)?;
    let handle = gateway.spawn()?;
    log::info!("Gateway running with {} workers", handle.worker_count());

    if let Some(signal) = signals.forever().next() {
        log::info!("Received signal {}, shutting down", signal);
    }

    log::info!(
        "Final state: {} devices registered\n{}",
        handle.registry().len(),
        handle.metrics().render()
    );

    // Workers hold no state worth draining
    Ok(())
}
