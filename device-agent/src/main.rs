//! Smart City device agent binary
//!
//! ```text
//! city-device-agent --kind lamp_post
//! city-device-agent --kind temp_sensor --gateway 192.168.1.7:10000 --status-interval 5
//! ```

use std::sync::Arc;
use std::thread;

use ring::rand::SystemRandom;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use city_device_agent::agent::{locate_gateway, register, status_socket};
use city_device_agent::device::generate_id;
use city_device_agent::metrics::Metrics;
use city_device_agent::{AgentConfig, AgentError, DeviceAgent, DeviceState};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let config = AgentConfig::from_args(&args)?;

    let id = match &config.id {
        Some(id) => id.clone(),
        None => generate_id(config.kind, &SystemRandom::new()).map_err(|_| AgentError::Random)?,
    };
    let agent = Arc::new(DeviceAgent::new(
        DeviceState::new(id, config.kind),
        Arc::new(Metrics::new()),
    ));

    log::info!("Smart City device agent starting...");
    log::info!("  Device: {}", agent.state());

    let target = locate_gateway(&config)?;
    let stream = register(target.device_addr, &agent.state())?;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let worker = Arc::clone(&agent);

    if config.kind.reports_status() {
        // Sensors only use TCP to register
        drop(stream);
        let socket = status_socket()?;
        let interval = config.status_interval;
        log::info!(
            "Reporting to {} every {:?}",
            target.status_addr,
            interval
        );
        thread::Builder::new()
            .name("status".to_string())
            .spawn(move || worker.run_status(&socket, target.status_addr, interval))?;
    } else {
        let handle = signals.handle();
        thread::Builder::new()
            .name("commands".to_string())
            .spawn(move || {
                if let Err(e) = worker.run_commands(stream) {
                    log::error!("Command connection failed: {}", e);
                }
                handle.close();
            })?;
        log::info!("Waiting for commands");
    }

    if let Some(signal) = signals.forever().next() {
        log::info!("Received signal {}, shutting down", signal);
    }

    log::info!("Final state: {}\n{}", agent.state(), agent.metrics().render());
    Ok(())
}
