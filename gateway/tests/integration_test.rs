//! Integration tests for the Gateway
//!
//! Each test runs a Gateway in-process on ephemeral loopback ports and talks
//! to it over real TCP/UDP sockets, the way devices and clients do.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use city_gateway::{Gateway, GatewayConfig, GatewayHandle};
use city_protocol::{
    decode_datagram, encode_message, read_frame, read_message, write_message, Command,
    ConfigChange, DeviceKind, DeviceSummary, Envelope, GatewayAnnouncement, StatusPayload,
    StatusUpdate,
};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> GatewayConfig {
    GatewayConfig {
        bind_address: Ipv4Addr::LOCALHOST.into(),
        device_port: 0,
        client_port: 0,
        status_port: 0,
        discovery_enabled: false,
        ..GatewayConfig::default()
    }
}

fn start_gateway() -> GatewayHandle {
    Gateway::bind(test_config()).unwrap().spawn().unwrap()
}

/// Poll `cond` until it holds or the timeout expires
fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + IO_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn connect(addr: std::net::SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    stream
}

/// Connect to the device port and register; returns the kept connection
fn register_device(gateway: &GatewayHandle, id: &str, kind: DeviceKind) -> TcpStream {
    let mut stream = connect(gateway.device_addr);
    write_message(
        &mut stream,
        &Envelope::DeviceRegistration {
            id: id.to_string(),
            kind,
        },
    )
    .unwrap();
    stream
}

fn list_devices(client: &mut TcpStream) -> Vec<DeviceSummary> {
    write_message(client, &Envelope::ListRequest).unwrap();
    match read_message(client).unwrap() {
        Envelope::ListResponse { devices } => devices,
        other => panic!("Expected ListResponse, got {:?}", other),
    }
}

/// True once the peer has closed the stream
fn is_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 16];
    matches!(stream.read(&mut buf), Ok(0) | Err(_))
}

#[test]
fn test_register_list_and_toggle_end_to_end() {
    let gateway = start_gateway();

    let mut device = register_device(&gateway, "lamp_ab12", DeviceKind::LampPost);
    assert!(wait_until(|| gateway.registry().contains("lamp_ab12")));

    let mut client = connect(gateway.client_addr);
    assert_eq!(
        list_devices(&mut client),
        vec![DeviceSummary {
            id: "lamp_ab12".to_string(),
            kind: DeviceKind::LampPost,
        }]
    );

    let command = encode_message(&Envelope::Command(Command::toggle("lamp_ab12"))).unwrap();
    client.write_all(&command).unwrap();

    let received = read_frame(&mut device).unwrap().unwrap();
    assert_eq!(received, command);
}

#[test]
fn test_config_command_routed_to_camera() {
    let gateway = start_gateway();
    let mut camera = register_device(&gateway, "cam_0001", DeviceKind::Camera);
    assert!(wait_until(|| gateway.registry().contains("cam_0001")));

    let mut client = connect(gateway.client_addr);
    let cmd = Command::set_config("cam_0001", ConfigChange::CameraResolution("4K".into()));
    write_message(&mut client, &Envelope::Command(cmd.clone())).unwrap();

    assert_eq!(read_message(&mut camera).unwrap(), Envelope::Command(cmd));
}

#[test]
fn test_colliding_ids_bind_to_second_connection() {
    let gateway = start_gateway();

    let mut first = register_device(&gateway, "x", DeviceKind::LampPost);
    assert!(wait_until(|| gateway.registry().contains("x")));

    let mut second = register_device(&gateway, "x", DeviceKind::TrafficLight);
    assert!(wait_until(|| {
        gateway
            .registry()
            .snapshot()
            .first()
            .map(|d| d.kind == DeviceKind::TrafficLight)
            .unwrap_or(false)
    }));
    assert_eq!(gateway.registry().len(), 1);

    // The superseded connection is closed by the Gateway
    assert!(is_closed(&mut first));

    let mut client = connect(gateway.client_addr);
    let devices = list_devices(&mut client);
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].kind, DeviceKind::TrafficLight);

    let command = encode_message(&Envelope::Command(Command::toggle("x"))).unwrap();
    client.write_all(&command).unwrap();
    assert_eq!(read_frame(&mut second).unwrap().unwrap(), command);
}

#[test]
fn test_device_connection_is_read_once() {
    let gateway = start_gateway();
    let mut device = register_device(&gateway, "sema_1", DeviceKind::TrafficLight);
    assert!(wait_until(|| gateway.registry().contains("sema_1")));

    // Anything the device sends later is never consumed or acted upon
    write_message(
        &mut device,
        &Envelope::DeviceRegistration {
            id: "impostor".to_string(),
            kind: DeviceKind::Camera,
        },
    )
    .unwrap();
    device.write_all(b"garbage that is not a frame").unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(!gateway.registry().contains("impostor"));

    // Commands are still written to the same connection, repeatedly
    let mut client = connect(gateway.client_addr);
    for _ in 0..3 {
        let command = encode_message(&Envelope::Command(Command::toggle("sema_1"))).unwrap();
        client.write_all(&command).unwrap();
        assert_eq!(read_frame(&mut device).unwrap().unwrap(), command);
    }
}

#[test]
fn test_non_registration_first_message_rejected() {
    let gateway = start_gateway();

    let mut stream = connect(gateway.device_addr);
    write_message(&mut stream, &Envelope::ListRequest).unwrap();

    assert!(is_closed(&mut stream));
    assert!(gateway.registry().is_empty());
    assert!(wait_until(|| {
        gateway
            .metrics()
            .render()
            .contains("city_registration_rejections_total 1")
    }));
}

#[test]
fn test_malformed_registration_rejected() {
    let gateway = start_gateway();

    let mut stream = connect(gateway.device_addr);
    let mut frame = 4u32.to_be_bytes().to_vec();
    frame.extend_from_slice(&[0xEE; 4]);
    stream.write_all(&frame).unwrap();

    assert!(is_closed(&mut stream));
    assert!(gateway.registry().is_empty());
}

#[test]
fn test_unknown_target_dropped_and_session_continues() {
    let gateway = start_gateway();
    let mut device = register_device(&gateway, "lamp_1", DeviceKind::LampPost);
    assert!(wait_until(|| gateway.registry().contains("lamp_1")));

    let mut client = connect(gateway.client_addr);
    write_message(&mut client, &Envelope::Command(Command::toggle("ghost"))).unwrap();

    // Client is still served after the dropped command
    assert_eq!(list_devices(&mut client).len(), 1);

    // And the registered device saw nothing
    device
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut buf = [0u8; 1];
    assert!(device.read(&mut buf).is_err());
}

#[test]
fn test_client_decode_error_closes_connection() {
    let gateway = start_gateway();

    let mut client = connect(gateway.client_addr);
    let mut frame = 2u32.to_be_bytes().to_vec();
    frame.extend_from_slice(&[0xAB, 0xCD]);
    client.write_all(&frame).unwrap();

    assert!(is_closed(&mut client));
}

#[test]
fn test_concurrent_clients_see_same_registry() {
    let gateway = start_gateway();
    let _devices: Vec<TcpStream> = (0..5)
        .map(|i| register_device(&gateway, &format!("temp_{}", i), DeviceKind::TempSensor))
        .collect();
    assert!(wait_until(|| gateway.registry().len() == 5));

    let client_addr = gateway.client_addr;
    let workers: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(move || {
                let mut client = connect(client_addr);
                list_devices(&mut client)
            })
        })
        .collect();

    for worker in workers {
        let devices = worker.join().unwrap();
        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["temp_0", "temp_1", "temp_2", "temp_3", "temp_4"]);
    }
}

#[test]
fn test_status_datagrams_update_registered_devices_only() {
    let gateway = start_gateway();
    let _device = register_device(&gateway, "airq_1", DeviceKind::AirSensor);
    assert!(wait_until(|| gateway.registry().contains("airq_1")));

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let status = |id: &str, text: &str| {
        encode_message(&Envelope::Status(StatusUpdate {
            device_id: id.to_string(),
            payload: StatusPayload::FreeText(text.to_string()),
        }))
        .unwrap()
    };

    sender.send_to(b"not a frame", gateway.status_addr).unwrap();
    sender
        .send_to(&status("ghost", "PPM: 1"), gateway.status_addr)
        .unwrap();
    sender
        .send_to(&status("airq_1", "PPM: 87.5"), gateway.status_addr)
        .unwrap();

    assert!(wait_until(|| {
        gateway
            .registry()
            .status_of("airq_1")
            .map(|(payload, _)| payload == StatusPayload::FreeText("PPM: 87.5".into()))
            .unwrap_or(false)
    }));
    assert!(!gateway.registry().contains("ghost"));
    assert_eq!(gateway.registry().len(), 1);
}

#[test]
fn test_announcements_carry_bound_ports() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver.set_read_timeout(Some(IO_TIMEOUT)).unwrap();

    let config = GatewayConfig {
        discovery_enabled: true,
        advertise_address: Some(Ipv4Addr::LOCALHOST.into()),
        multicast_group: Ipv4Addr::LOCALHOST,
        multicast_port: receiver.local_addr().unwrap().port(),
        announce_interval_ms: 50,
        ..test_config()
    };
    let gateway = Gateway::bind(config).unwrap().spawn().unwrap();

    let mut buf = [0u8; 512];
    for _ in 0..2 {
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(
            decode_datagram(&buf[..len]).unwrap(),
            Envelope::GatewayAnnouncement(GatewayAnnouncement {
                address: "127.0.0.1".to_string(),
                device_port: gateway.device_addr.port(),
                client_port: gateway.client_addr.port(),
            })
        );
    }
}

#[test]
fn test_metrics_endpoint() {
    let config = GatewayConfig {
        metrics_port: Some(0),
        ..test_config()
    };
    let gateway = Gateway::bind(config).unwrap().spawn().unwrap();
    let _device = register_device(&gateway, "lamp_m", DeviceKind::LampPost);
    assert!(wait_until(|| gateway.registry().contains("lamp_m")));

    let mut stream = connect(gateway.metrics_addr.unwrap());
    stream
        .write_all(b"GET /metrics HTTP/1.0\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.contains("city_registrations_total 1"));
    assert!(response.contains("city_registered_devices 1"));
}
