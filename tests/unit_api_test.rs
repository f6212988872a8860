//! Drives a real `ApiServer` over loopback sockets: a blocking client speaks
//! the frame protocol while the test thread ticks the server by hand.

use bytes::BytesMut;
use emberlink::api::ApiServer;
use emberlink::api::codec::{decode_payload, encode_frame};
use emberlink::api::entities::Entity;
use emberlink::api::frame::FrameCodec;
use emberlink::api::message::{ApiMessage, EntityKind, EntityState, LogLevel};
use emberlink::config::Config;
use emberlink::device::{AlwaysUp, FilePreferences, HostDevice};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::codec::Decoder;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_server(password: Option<&str>) -> (ApiServer, u16, TempDir) {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = Config {
        host: "127.0.0.1".to_string(),
        api_port: port,
        password: password.map(str::to_string),
        batch_delay: Duration::ZERO,
        reboot_timeout: Duration::ZERO,
        data_dir: dir.path().to_str().unwrap().to_string(),
        ..Config::default()
    };
    let server = ApiServer::setup(
        &config,
        Arc::new(HostDevice::new()),
        Arc::new(FilePreferences::new(dir.path())),
    )
    .unwrap();
    (server, port, dir)
}

fn pump(server: &mut ApiServer, times: u32) {
    for _ in 0..times {
        server.tick(&AlwaysUp, Instant::now());
        std::thread::sleep(Duration::from_millis(2));
    }
}

struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_nodelay(true).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    fn send(&mut self, msg: &ApiMessage) {
        self.stream
            .write_all(&encode_frame(msg).unwrap())
            .unwrap();
    }

    fn try_recv(&mut self, server: &mut ApiServer, wait: Duration) -> Option<ApiMessage> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(frame) = FrameCodec.decode(&mut self.buf).unwrap() {
                return Some(decode_payload(&frame).unwrap());
            }
            if Instant::now() >= deadline {
                return None;
            }
            server.tick(&AlwaysUp, Instant::now());
            let mut scratch = [0u8; 1024];
            match self.stream.read(&mut scratch) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&scratch[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => panic!("client read failed: {e}"),
            }
        }
    }

    fn recv(&mut self, server: &mut ApiServer) -> ApiMessage {
        self.try_recv(server, Duration::from_secs(2))
            .expect("expected a message, got none")
    }

    fn handshake(&mut self, server: &mut ApiServer) -> ApiMessage {
        self.send(&ApiMessage::Hello {
            client_info: "test client".to_string(),
            api_version_major: 1,
            api_version_minor: 10,
        });
        self.recv(server)
    }
}

#[tokio::test]
async fn test_hello_ping_device_info() {
    let (mut server, port, _dir) = test_server(None);
    let mut client = TestClient::connect(port);

    match client.handshake(&mut server) {
        ApiMessage::HelloResponse {
            api_version_major,
            name,
            ..
        } => {
            assert_eq!(api_version_major, 1);
            assert_eq!(name, "emberlink");
        }
        other => panic!("expected HelloResponse, got {other:?}"),
    }
    assert_eq!(server.client_count(), 1);

    client.send(&ApiMessage::PingRequest);
    assert_eq!(client.recv(&mut server), ApiMessage::PingResponse);

    client.send(&ApiMessage::DeviceInfoRequest);
    match client.recv(&mut server) {
        ApiMessage::DeviceInfoResponse { uses_password, .. } => assert!(!uses_password),
        other => panic!("expected DeviceInfoResponse, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_hello_disconnects() {
    let (mut server, port, _dir) = test_server(None);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);
    client.send(&ApiMessage::Hello {
        client_info: "again".to_string(),
        api_version_major: 1,
        api_version_minor: 10,
    });
    pump(&mut server, 20);
    assert_eq!(server.client_count(), 0);
}

#[tokio::test]
async fn test_subscribe_before_auth_disconnects() {
    let (mut server, port, _dir) = test_server(Some("hunter2"));
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);
    // Authenticated-only message before ConnectRequest.
    client.send(&ApiMessage::SubscribeStatesRequest);
    pump(&mut server, 20);
    assert_eq!(server.client_count(), 0);
}

#[tokio::test]
async fn test_invalid_password_gets_response_then_disconnect() {
    let (mut server, port, _dir) = test_server(Some("hunter2"));
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);
    client.send(&ApiMessage::ConnectRequest {
        password: "wrong".to_string(),
    });
    assert_eq!(
        client.recv(&mut server),
        ApiMessage::ConnectResponse {
            invalid_password: true
        }
    );
    pump(&mut server, 20);
    assert_eq!(server.client_count(), 0);
}

#[tokio::test]
async fn test_correct_password_authenticates() {
    let (mut server, port, _dir) = test_server(Some("hunter2"));
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);
    client.send(&ApiMessage::ConnectRequest {
        password: "hunter2".to_string(),
    });
    assert_eq!(
        client.recv(&mut server),
        ApiMessage::ConnectResponse {
            invalid_password: false
        }
    );
    client.send(&ApiMessage::PingRequest);
    assert_eq!(client.recv(&mut server), ApiMessage::PingResponse);
    assert_eq!(server.client_count(), 1);
}

fn register_entities(server: &mut ApiServer) {
    server.ctx.entities.register(Entity {
        key: 1,
        object_id: "living_room_temp".to_string(),
        name: "Living Room Temperature".to_string(),
        internal: false,
        kind: EntityKind::Sensor,
        state: EntityState::Measurement(20.0),
    });
    server.ctx.entities.register(Entity {
        key: 2,
        object_id: "heap_free".to_string(),
        name: "Heap Free".to_string(),
        internal: true,
        kind: EntityKind::Sensor,
        state: EntityState::Measurement(1024.0),
    });
}

#[tokio::test]
async fn test_list_entities_filters_internal() {
    let (mut server, port, _dir) = test_server(None);
    register_entities(&mut server);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);

    client.send(&ApiMessage::ListEntitiesRequest);
    match client.recv(&mut server) {
        ApiMessage::ListEntitiesEntryResponse { key, .. } => assert_eq!(key, 1),
        other => panic!("expected entity entry, got {other:?}"),
    }
    assert_eq!(client.recv(&mut server), ApiMessage::ListEntitiesDoneResponse);
}

#[tokio::test]
async fn test_state_fanout_skips_internal_entities() {
    let (mut server, port, _dir) = test_server(None);
    register_entities(&mut server);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);

    client.send(&ApiMessage::SubscribeStatesRequest);
    // Initial state dump covers only the external entity.
    match client.recv(&mut server) {
        ApiMessage::EntityStateResponse { key, .. } => assert_eq!(key, 1),
        other => panic!("expected state, got {other:?}"),
    }
    assert!(
        client
            .try_recv(&mut server, Duration::from_millis(200))
            .is_none()
    );

    // An update to the internal entity is recorded but never broadcast.
    server.on_entity_update(2, EntityState::Measurement(2048.0));
    assert!(
        client
            .try_recv(&mut server, Duration::from_millis(200))
            .is_none()
    );

    server.on_entity_update(1, EntityState::Measurement(21.5));
    assert_eq!(
        client.recv(&mut server),
        ApiMessage::EntityStateResponse {
            key: 1,
            state: EntityState::Measurement(21.5)
        }
    );
}

#[tokio::test]
async fn test_states_not_sent_without_subscription() {
    let (mut server, port, _dir) = test_server(None);
    register_entities(&mut server);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);

    server.on_entity_update(1, EntityState::Measurement(25.0));
    assert!(
        client
            .try_recv(&mut server, Duration::from_millis(200))
            .is_none()
    );
}

#[tokio::test]
async fn test_log_fanout_respects_level() {
    let (mut server, port, _dir) = test_server(None);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);

    client.send(&ApiMessage::SubscribeLogsRequest {
        level: LogLevel::Info,
    });
    pump(&mut server, 5);

    // More verbose than the subscription; must be dropped.
    server.try_send_log_message(LogLevel::Debug, "app", "noisy detail");
    assert!(
        client
            .try_recv(&mut server, Duration::from_millis(200))
            .is_none()
    );

    server.try_send_log_message(LogLevel::Warn, "app", "something odd");
    assert_eq!(
        client.recv(&mut server),
        ApiMessage::LogMessageResponse {
            level: LogLevel::Warn,
            tag: "app".to_string(),
            line: "something odd".to_string(),
        }
    );
}

#[tokio::test]
async fn test_keepalive_removes_silent_client() {
    let (mut server, port, _dir) = test_server(None);
    server.ctx.keepalive_interval = Duration::from_millis(30);
    server.ctx.keepalive_timeout = Duration::from_millis(60);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);

    // The server pings on its own once the interval elapses.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match client.try_recv(&mut server, Duration::from_millis(50)) {
            Some(ApiMessage::PingRequest) => break,
            Some(other) => panic!("expected PingRequest, got {other:?}"),
            None => assert!(Instant::now() < deadline, "server never pinged"),
        }
    }

    // Never answer; the pong deadline passes and the connection goes.
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.client_count() > 0 {
        assert!(Instant::now() < deadline, "silent client never removed");
        server.tick(&AlwaysUp, Instant::now());
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[tokio::test]
async fn test_keepalive_pong_keeps_client_connected() {
    let (mut server, port, _dir) = test_server(None);
    server.ctx.keepalive_interval = Duration::from_millis(25);
    server.ctx.keepalive_timeout = Duration::from_millis(100);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);

    // Answer every ping across several interval/timeout periods.
    let until = Instant::now() + Duration::from_millis(500);
    while Instant::now() < until {
        if let Some(msg) = client.try_recv(&mut server, Duration::from_millis(10)) {
            assert_eq!(msg, ApiMessage::PingRequest);
            client.send(&ApiMessage::PingResponse);
        }
    }
    assert_eq!(server.client_count(), 1);
}

#[tokio::test]
async fn test_batch_delay_defers_and_coalesces_messages() {
    let (mut server, port, _dir) = test_server(None);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);
    client.send(&ApiMessage::SubscribeLogsRequest {
        level: LogLevel::Info,
    });
    pump(&mut server, 5);

    server.ctx.batch_delay = Duration::from_millis(300);
    let queued_at = Instant::now();
    server.try_send_log_message(LogLevel::Info, "app", "first");
    server.try_send_log_message(LogLevel::Info, "app", "second");

    // Nothing reaches the wire before the batch delay elapses.
    assert!(
        client
            .try_recv(&mut server, Duration::from_millis(150))
            .is_none()
    );

    match client.recv(&mut server) {
        ApiMessage::LogMessageResponse { line, .. } => assert_eq!(line, "first"),
        other => panic!("expected log message, got {other:?}"),
    }
    assert!(queued_at.elapsed() >= Duration::from_millis(300));

    // The second message rides in the same flush.
    match client.recv(&mut server) {
        ApiMessage::LogMessageResponse { line, .. } => assert_eq!(line, "second"),
        other => panic!("expected log message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_batch_byte_budget_forces_immediate_flush() {
    let (mut server, port, _dir) = test_server(None);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);
    client.send(&ApiMessage::SubscribeLogsRequest {
        level: LogLevel::Info,
    });
    pump(&mut server, 5);

    // A delay long enough that any prompt arrival must come from the byte
    // budget, not the timer.
    server.ctx.batch_delay = Duration::from_secs(2);
    let queued_at = Instant::now();
    let line = "x".repeat(2300);
    for _ in 0..4 {
        server.try_send_log_message(LogLevel::Info, "app", &line);
    }
    for _ in 0..4 {
        match client.recv(&mut server) {
            ApiMessage::LogMessageResponse { line: got, .. } => assert_eq!(got, line),
            other => panic!("expected log message, got {other:?}"),
        }
    }
    assert!(queued_at.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_service_call_roundtrip() {
    use emberlink::api::message::{ServiceArgType, ServiceArgValue};
    use emberlink::api::services::{ServiceArg, ServiceDescriptor};

    let (mut server, port, _dir) = test_server(None);
    server.ctx.services.register(
        ServiceDescriptor {
            key: 9,
            name: "start_wash".to_string(),
            args: vec![ServiceArg {
                name: "cycles".to_string(),
                arg_type: ServiceArgType::Int,
            }],
        },
        Box::new(|_| {}),
    );
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);

    client.send(&ApiMessage::ExecuteServiceRequest {
        key: 9,
        args: vec![ServiceArgValue::Int(3)],
    });
    match client.recv(&mut server) {
        ApiMessage::ExecuteServiceResponse { success, .. } => assert!(success),
        other => panic!("expected service response, got {other:?}"),
    }

    // Bad arity comes back as a typed failure, not a disconnect.
    client.send(&ApiMessage::ExecuteServiceRequest { key: 9, args: vec![] });
    match client.recv(&mut server) {
        ApiMessage::ExecuteServiceResponse { success, error } => {
            assert!(!success);
            assert!(error.contains("start_wash"));
        }
        other => panic!("expected service response, got {other:?}"),
    }
    assert_eq!(server.client_count(), 1);
}

#[tokio::test]
async fn test_disconnect_request_honored() {
    let (mut server, port, _dir) = test_server(None);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);

    client.send(&ApiMessage::DisconnectRequest);
    assert_eq!(client.recv(&mut server), ApiMessage::DisconnectResponse);
    pump(&mut server, 10);
    assert_eq!(server.client_count(), 0);
}

#[tokio::test]
async fn test_shutdown_sends_disconnect_request() {
    let (mut server, port, _dir) = test_server(None);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);

    server.on_shutdown();
    assert_eq!(client.recv(&mut server), ApiMessage::DisconnectRequest);
    client.send(&ApiMessage::DisconnectResponse);
    for _ in 0..50 {
        if server.teardown(&AlwaysUp, Instant::now()) {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(server.client_count(), 0);
}

#[tokio::test]
async fn test_zwave_frames_flow_both_ways() {
    let (mut server, port, _dir) = test_server(None);
    let received = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink_copy = received.clone();
    server.set_zwave_sink(Box::new(move |data| {
        sink_copy.lock().unwrap().push(data);
    }));
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);

    client.send(&ApiMessage::ZWaveProxyFrame {
        data: vec![0x01, 0x02, 0x03],
    });
    pump(&mut server, 10);
    assert_eq!(received.lock().unwrap().as_slice(), &[vec![0x01, 0x02, 0x03]]);

    server.send_zwave_frame(vec![0x0A, 0x0B]);
    assert_eq!(
        client.recv(&mut server),
        ApiMessage::ZWaveProxyFrame {
            data: vec![0x0A, 0x0B]
        }
    );
}

#[tokio::test]
async fn test_garbage_frame_disconnects() {
    let (mut server, port, _dir) = test_server(None);
    let mut client = TestClient::connect(port);
    client.handshake(&mut server);

    // Nonzero indicator byte.
    client.stream.write_all(&[0xFF, 0x00, 0x01]).unwrap();
    pump(&mut server, 20);
    assert_eq!(server.client_count(), 0);
}
