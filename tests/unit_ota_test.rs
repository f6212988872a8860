//! Exercises the OTA wire protocol end to end: a blocking client on its own
//! thread flashes a real `OtaServer` listening on loopback.

use emberlink::config::{AuthCompat, Config, OtaConfig};
use emberlink::device::{DeviceControl, HostDevice};
use emberlink::ota::backend::OtaBackend;
use emberlink::ota::{
    FEATURE_SUPPORTS_SHA256_AUTH, MAGIC_BYTES, OtaResponse, OtaServer,
};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Default)]
struct MockState {
    begun: u32,
    size: usize,
    written: Vec<u8>,
    md5: Option<String>,
    ended: u32,
    aborted: u32,
}

#[derive(Clone)]
struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }
}

impl OtaBackend for MockBackend {
    fn begin(&mut self, size: usize) -> Result<(), OtaResponse> {
        let mut state = self.state.lock().unwrap();
        state.begun += 1;
        state.size = size;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), OtaResponse> {
        self.state.lock().unwrap().written.extend_from_slice(data);
        Ok(())
    }

    fn set_update_md5(&mut self, md5_hex: &str) {
        self.state.lock().unwrap().md5 = Some(md5_hex.to_string());
    }

    fn end(&mut self) -> Result<(), OtaResponse> {
        self.state.lock().unwrap().ended += 1;
        Ok(())
    }

    fn abort(&mut self) {
        self.state.lock().unwrap().aborted += 1;
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_server(
    password: Option<&str>,
    auth_compat: AuthCompat,
) -> (OtaServer, MockBackend, Arc<HostDevice>, u16) {
    let port = free_port();
    let config = Config {
        host: "127.0.0.1".to_string(),
        ota: OtaConfig {
            port,
            password: password.map(str::to_string),
            auth_compat,
            ..OtaConfig::default()
        },
        ..Config::default()
    };
    let backend = MockBackend::new();
    let device = Arc::new(HostDevice::new());
    let server = OtaServer::setup(&config, device.clone(), Box::new(backend.clone())).unwrap();
    (server, backend, device, port)
}

/// Ticks the server until the client thread finishes, then joins it.
async fn drive(server: &mut OtaServer, client: JoinHandle<()>) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !client.is_finished() {
        assert!(Instant::now() < deadline, "test client never finished");
        server.tick(Instant::now()).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for _ in 0..10 {
        server.tick(Instant::now()).await;
    }
    client.join().unwrap();
}

// --- Blocking client helpers ---

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn read_bytes(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn expect_byte(stream: &mut TcpStream, expected: u8) {
    let got = read_bytes(stream, 1)[0];
    assert_eq!(got, expected, "expected 0x{expected:02X}, got 0x{got:02X}");
}

/// Runs the handshake up to (and including) the header acknowledgment.
fn open_session(port: u16, features: u8) -> TcpStream {
    let mut stream = connect(port);
    stream.write_all(&MAGIC_BYTES).unwrap();
    assert_eq!(read_bytes(&mut stream, 2), vec![0x00, 2]);
    stream.write_all(&[features]).unwrap();
    expect_byte(&mut stream, OtaResponse::HeaderOk.as_byte());
    stream
}

/// Sends size and MD5, then streams the image and consumes all block acks.
fn send_image(stream: &mut TcpStream, image: &[u8]) {
    stream
        .write_all(&(image.len() as u32).to_be_bytes())
        .unwrap();
    expect_byte(stream, OtaResponse::UpdatePrepareOk.as_byte());

    let md5_hex = hex::encode(<Md5 as Digest>::digest(image));
    stream.write_all(md5_hex.as_bytes()).unwrap();
    expect_byte(stream, OtaResponse::BinMd5Ok.as_byte());

    for chunk in image.chunks(1000) {
        stream.write_all(chunk).unwrap();
    }
    let acks = image.len().div_ceil(8192);
    for _ in 0..acks {
        expect_byte(stream, OtaResponse::ChunkOk.as_byte());
    }
    expect_byte(stream, OtaResponse::ReceiveOk.as_byte());
    expect_byte(stream, OtaResponse::UpdateEndOk.as_byte());
    stream.write_all(&[OtaResponse::Ok.as_byte()]).unwrap();
}

#[tokio::test]
async fn test_magic_mismatch_gets_error_and_no_backend_calls() {
    let (mut server, backend, _device, port) = test_server(None, AuthCompat::default());
    let client = std::thread::spawn(move || {
        let mut stream = connect(port);
        stream.write_all(&[0x01, 0x02, 0x03, 0x04, 0x05]).unwrap();
        expect_byte(&mut stream, OtaResponse::ErrorMagic.as_byte());
    });
    drive(&mut server, client).await;

    let state = backend.state.lock().unwrap();
    assert_eq!(state.begun, 0);
    assert_eq!(state.aborted, 0);
    assert!(!server.is_busy());
}

#[tokio::test]
async fn test_v2_transfer_happy_path() {
    let (mut server, backend, device, port) = test_server(None, AuthCompat::default());
    let image: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let expected = image.clone();

    let client = std::thread::spawn(move || {
        let mut stream = open_session(port, 0x00);
        send_image(&mut stream, &image);
    });
    drive(&mut server, client).await;

    let state = backend.state.lock().unwrap();
    assert_eq!(state.begun, 1);
    assert_eq!(state.size, 20_000);
    assert_eq!(state.written, expected);
    assert_eq!(
        state.md5.as_deref(),
        Some(hex::encode(<Md5 as Digest>::digest(&expected)).as_str())
    );
    assert_eq!(state.ended, 1);
    assert_eq!(state.aborted, 0);
    assert!(device.reboot_requested());
}

#[tokio::test]
async fn test_disconnect_mid_transfer_aborts_once() {
    let (mut server, backend, device, port) = test_server(None, AuthCompat::default());
    let client = std::thread::spawn(move || {
        let mut stream = open_session(port, 0x00);
        stream.write_all(&20_000u32.to_be_bytes()).unwrap();
        expect_byte(&mut stream, OtaResponse::UpdatePrepareOk.as_byte());
        stream.write_all("0".repeat(32).as_bytes()).unwrap();
        expect_byte(&mut stream, OtaResponse::BinMd5Ok.as_byte());
        // Send a fraction of the image and vanish.
        stream.write_all(&[0xAB; 1000]).unwrap();
        stream.shutdown(std::net::Shutdown::Both).unwrap();
    });
    drive(&mut server, client).await;

    let state = backend.state.lock().unwrap();
    assert_eq!(state.begun, 1);
    assert_eq!(state.written.len(), 1000);
    assert_eq!(state.ended, 0);
    assert_eq!(state.aborted, 1);
    assert!(!device.reboot_requested());
}

fn answer_challenge<D: Digest>(stream: &mut TcpStream, password: &str) {
    let hex_len = <D as Digest>::output_size() * 2;
    let nonce = read_bytes(stream, hex_len);
    let cnonce = "ab".repeat(hex_len / 2);
    stream.write_all(cnonce.as_bytes()).unwrap();

    let mut hasher = D::new();
    hasher.update(password.as_bytes());
    hasher.update(&nonce);
    hasher.update(cnonce.as_bytes());
    stream
        .write_all(hex::encode(hasher.finalize()).as_bytes())
        .unwrap();
}

#[tokio::test]
async fn test_sha256_auth_and_transfer() {
    let (mut server, backend, _device, port) =
        test_server(Some("otapass"), AuthCompat::Sha256Strict);
    let image = vec![0x42u8; 300];

    let client = std::thread::spawn(move || {
        let mut stream = open_session(port, FEATURE_SUPPORTS_SHA256_AUTH);
        expect_byte(&mut stream, OtaResponse::RequestSha256Auth.as_byte());
        answer_challenge::<Sha256>(&mut stream, "otapass");
        expect_byte(&mut stream, OtaResponse::AuthOk.as_byte());
        send_image(&mut stream, &image);
    });
    drive(&mut server, client).await;

    let state = backend.state.lock().unwrap();
    assert_eq!(state.begun, 1);
    assert_eq!(state.ended, 1);
}

#[tokio::test]
async fn test_wrong_password_rejected() {
    let (mut server, backend, _device, port) =
        test_server(Some("otapass"), AuthCompat::Sha256Strict);
    let client = std::thread::spawn(move || {
        let mut stream = open_session(port, FEATURE_SUPPORTS_SHA256_AUTH);
        expect_byte(&mut stream, OtaResponse::RequestSha256Auth.as_byte());
        answer_challenge::<Sha256>(&mut stream, "not the password");
        expect_byte(&mut stream, OtaResponse::ErrorAuthInvalid.as_byte());
    });
    drive(&mut server, client).await;

    let state = backend.state.lock().unwrap();
    assert_eq!(state.begun, 0);
    assert_eq!(state.aborted, 0);
}

#[tokio::test]
async fn test_md5_fallback_when_allowed() {
    let (mut server, _backend, _device, port) =
        test_server(Some("otapass"), AuthCompat::AllowMd5Fallback);
    let client = std::thread::spawn(move || {
        // No SHA-256 feature bit; the receiver falls back to MD5.
        let mut stream = open_session(port, 0x00);
        expect_byte(&mut stream, OtaResponse::RequestAuth.as_byte());
        answer_challenge::<Md5>(&mut stream, "otapass");
        expect_byte(&mut stream, OtaResponse::AuthOk.as_byte());
    });
    drive(&mut server, client).await;
}

#[tokio::test]
async fn test_sha256_preferred_even_when_fallback_allowed() {
    let (mut server, _backend, _device, port) =
        test_server(Some("otapass"), AuthCompat::AllowMd5Fallback);
    let client = std::thread::spawn(move || {
        // A capable client must never be downgraded to MD5.
        let mut stream = open_session(port, FEATURE_SUPPORTS_SHA256_AUTH);
        expect_byte(&mut stream, OtaResponse::RequestSha256Auth.as_byte());
        answer_challenge::<Sha256>(&mut stream, "otapass");
        expect_byte(&mut stream, OtaResponse::AuthOk.as_byte());
    });
    drive(&mut server, client).await;
}

#[tokio::test]
async fn test_legacy_client_refused_under_strict_policy() {
    let (mut server, backend, _device, port) =
        test_server(Some("otapass"), AuthCompat::Sha256Strict);
    let client = std::thread::spawn(move || {
        let mut stream = open_session(port, 0x00);
        expect_byte(&mut stream, OtaResponse::ErrorAuthInvalid.as_byte());
    });
    drive(&mut server, client).await;

    let state = backend.state.lock().unwrap();
    assert_eq!(state.begun, 0);
}
