//! Smart City Control Client
//!
//! Lists devices and sends commands through the Gateway.
//!
//! Usage:
//!   city-control-client --list
//!   city-control-client --gateway 192.168.1.7:10003 --toggle lamp_ab12cd
//!   city-control-client --config cam_3f09a1 resolution:4K
//!   city-control-client                      (interactive)

use std::io::{self, BufRead, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use city_protocol::{
    join_discovery_group, wait_for_announcement, ConfigChange, DEFAULT_MULTICAST_GROUP,
    DEFAULT_MULTICAST_PORT,
};

mod client;

use client::{ControlClient, Request, HELP};

/// How long to wait for an announcement before giving up
const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        return Ok(());
    }

    let requests = requests_from_args(&args)?;
    let gateway = locate_gateway(&args)?;
    let mut client = ControlClient::connect(gateway)?;

    if requests.is_empty() {
        return run_interactive(&mut client);
    }

    for request in &requests {
        println!("{}", client.execute(request)?);
    }
    Ok(())
}

/// One-shot requests given as flags, in a fixed order: config, toggle, list
fn requests_from_args(args: &[String]) -> Result<Vec<Request>, Box<dyn std::error::Error>> {
    let mut requests = Vec::new();

    if let Some(i) = args.iter().position(|a| a == "--config") {
        let (id, setting) = match (args.get(i + 1), args.get(i + 2)) {
            (Some(id), Some(setting)) => (id, setting),
            _ => return Err("--config needs <device-id> <key:value>".into()),
        };
        requests.push(Request::Configure(id.clone(), ConfigChange::parse(setting)?));
    }
    if let Some(id) = parse_arg(args, "--toggle") {
        requests.push(Request::Toggle(id));
    }
    if args.iter().any(|a| a == "--list") {
        requests.push(Request::List);
    }

    Ok(requests)
}

/// `--gateway` if given, otherwise the client endpoint from an announcement
fn locate_gateway(args: &[String]) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    if let Some(addr) = parse_arg(args, "--gateway") {
        return addr.parse().map_err(|_| "Invalid gateway address".into());
    }

    let group: Ipv4Addr = match parse_arg(args, "--multicast-group") {
        Some(v) => v.parse().map_err(|_| "Invalid multicast group")?,
        None => DEFAULT_MULTICAST_GROUP,
    };
    let port: u16 = match parse_arg(args, "--multicast-port") {
        Some(v) => v.parse().map_err(|_| "Invalid multicast port")?,
        None => DEFAULT_MULTICAST_PORT,
    };
    let timeout_secs: u64 = parse_arg(args, "--discovery-timeout")
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT_SECS);

    let socket = join_discovery_group(group, port)?;
    log::info!("Waiting for gateway announcement on {}:{}", group, port);
    let (announcement, from) =
        wait_for_announcement(&socket, Some(Duration::from_secs(timeout_secs)))?;
    log::info!("Discovered gateway {} from {}", announcement.address, from);

    Ok(announcement.client_endpoint()?)
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn print_usage() {
    eprintln!("Smart City Control Client");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  city-control-client [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --gateway ADDR           Gateway client endpoint (default: discover)");
    eprintln!("  --list                   Print registered devices");
    eprintln!("  --toggle ID              Switch a device on/off");
    eprintln!("  --config ID KEY:VALUE    Send a configuration change");
    eprintln!("  --multicast-group IP     Discovery group (default: 224.1.1.1)");
    eprintln!("  --multicast-port PORT    Discovery port (default: 5007)");
    eprintln!("  --discovery-timeout SECS Give up discovery after SECS (default: 30)");
    eprintln!();
    eprintln!("Without --list, --toggle or --config the client starts interactively.");
}

// ============================================================================
// Interactive Mode
// ============================================================================

fn run_interactive(client: &mut ControlClient) -> Result<(), Box<dyn std::error::Error>> {
    println!("Connected to {}. Type 'help' for requests.", client.peer());
    println!("{}", client.execute(&Request::List)?);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        if line.trim().is_empty() {
            continue;
        }

        let request = match Request::parse(&line) {
            Ok(request) => request,
            Err(e) => {
                println!("{}\n{}", e, HELP);
                continue;
            }
        };
        if request == Request::Quit {
            break;
        }

        println!("{}", client.execute(&request)?);
    }

    println!("Disconnected from gateway.");
    Ok(())
}
