//! CASTV2 transport: length-prefixed protobuf `CastMessage` frames over TLS,
//! plus the pump thread that keeps a connection alive (heartbeat, receiver
//! status) and hands application messages to the session.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use serde_json::Value;
use shared::types::DiscoveryRecord;
use crate::error::{DirectoryError, Result};
use crate::signal::Signal;

pub const NAMESPACE_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const NAMESPACE_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const NAMESPACE_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";

pub const RECEIVER_ID: &str = "receiver-0";
pub const CAST_PORT: u16 = 8009;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(6);
const READ_TIMEOUT: Duration = Duration::from_millis(180);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1500);
const PUMP_POLL: Duration = Duration::from_millis(100);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastMessage {
    pub source_id: String,
    pub destination_id: String,
    pub namespace: String,
    pub payload: String,
}

impl CastMessage {
    pub fn json(source_id: &str, destination_id: &str, namespace: &str, payload: &Value) -> Self {
        Self {
            source_id: source_id.to_string(),
            destination_id: destination_id.to_string(),
            namespace: namespace.to_string(),
            payload: payload.to_string(),
        }
    }
}

/// One open connection to a cast receiver
pub trait CastConnection: Send {
    fn send(&mut self, message: &CastMessage) -> Result<()>;

    /// Next message, or `None` when nothing arrived within `timeout`
    fn recv(&mut self, timeout: Duration) -> Result<Option<CastMessage>>;
}

/// Application-namespace traffic of a launched receiver app
pub trait AppLink {
    fn send_app(&self, namespace: &str, payload: &Value) -> Result<()>;

    /// Next application message. `Ok(None)` on timeout, error once the
    /// connection is gone.
    fn recv_app(&self, timeout: Duration) -> Result<Option<CastMessage>>;
}

/// Opens connections to cast receivers
pub trait CastTransport: Send + Sync {
    fn connect(&self, record: &DiscoveryRecord) -> Result<Box<dyn CastConnection>>;
}

fn invalid_frame(message: &str) -> DirectoryError {
    DirectoryError::Io(io::Error::new(io::ErrorKind::InvalidData, message.to_string()))
}

pub fn encode_frame(message: &CastMessage) -> Result<Vec<u8>> {
    let mut protobuf = Vec::new();
    write_varint_field(&mut protobuf, 1, 0); // protocol_version CASTV2_1_0
    write_string_field(&mut protobuf, 2, &message.source_id);
    write_string_field(&mut protobuf, 3, &message.destination_id);
    write_string_field(&mut protobuf, 4, &message.namespace);
    write_varint_field(&mut protobuf, 5, 0); // payload_type STRING
    write_string_field(&mut protobuf, 6, &message.payload);

    let len = u32::try_from(protobuf.len()).map_err(|_| invalid_frame("cast frame too large"))?;
    let mut frame = Vec::with_capacity(4 + protobuf.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&protobuf);
    Ok(frame)
}

/// Decode the protobuf body of one frame (without its length prefix)
pub fn decode_frame(bytes: &[u8]) -> Result<CastMessage> {
    let mut cursor = 0usize;
    let mut message = CastMessage {
        source_id: String::new(),
        destination_id: String::new(),
        namespace: String::new(),
        payload: String::new(),
    };

    while cursor < bytes.len() {
        let key = read_varint(bytes, &mut cursor).ok_or_else(|| invalid_frame("invalid protobuf key"))?;
        let field_number = key >> 3;
        match key & 0x07 {
            0 => {
                read_varint(bytes, &mut cursor).ok_or_else(|| invalid_frame("invalid protobuf varint"))?;
            }
            2 => {
                let len = read_varint(bytes, &mut cursor).ok_or_else(|| invalid_frame("invalid protobuf length"))? as usize;
                let end = cursor
                    .checked_add(len)
                    .filter(|end| *end <= bytes.len())
                    .ok_or_else(|| invalid_frame("protobuf field out of bounds"))?;
                let field = &bytes[cursor..end];
                cursor = end;
                let text = || String::from_utf8(field.to_vec()).map_err(|_| invalid_frame("protobuf field is not UTF-8"));
                match field_number {
                    2 => message.source_id = text()?,
                    3 => message.destination_id = text()?,
                    4 => message.namespace = text()?,
                    6 => message.payload = text()?,
                    _ => {} // binary payloads are not used by any namespace we speak
                }
            }
            _ => return Err(invalid_frame("unsupported protobuf wire type")),
        }
    }

    Ok(message)
}

fn write_varint_field(out: &mut Vec<u8>, field_number: u64, value: u64) {
    write_varint(out, field_number << 3);
    write_varint(out, value);
}

fn write_string_field(out: &mut Vec<u8>, field_number: u64, value: &str) {
    write_varint(out, (field_number << 3) | 2);
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(bytes: &[u8], cursor: &mut usize) -> Option<u64> {
    let mut shift = 0u32;
    let mut value = 0u64;
    while *cursor < bytes.len() && shift <= 63 {
        let byte = bytes[*cursor];
        *cursor += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}

/// Pull one complete frame off the front of `buffer`
fn take_frame(buffer: &mut Vec<u8>) -> Result<Option<CastMessage>> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(invalid_frame("cast frame exceeds maximum length"));
    }
    if buffer.len() < 4 + len {
        return Ok(None);
    }
    let message = decode_frame(&buffer[4..4 + len])?;
    buffer.drain(..4 + len);
    Ok(Some(message))
}

/// TLS connection to a real receiver on port 8009
pub struct TlsCastConnection {
    stream: native_tls::TlsStream<TcpStream>,
    buffer: Vec<u8>,
}

impl CastConnection for TlsCastConnection {
    fn send(&mut self, message: &CastMessage) -> Result<()> {
        let frame = encode_frame(message)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<CastMessage>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(message) = take_frame(&mut self.buffer)? {
                return Ok(Some(message));
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct TlsCastTransport;

impl CastTransport for TlsCastTransport {
    fn connect(&self, record: &DiscoveryRecord) -> Result<Box<dyn CastConnection>> {
        let host = record.host_ip_address();
        let port = if record.host_ip_port == 0 { CAST_PORT } else { record.host_ip_port };
        let address: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|e| DirectoryError::InvalidArgument(format!("cast address {}:{}: {}", host, port, e)))?;

        let tcp = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;
        tcp.set_write_timeout(Some(WRITE_TIMEOUT))?;

        // receivers present self-signed certificates
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| DirectoryError::http(address.to_string(), e))?;
        let stream = connector
            .connect(&host, tcp)
            .map_err(|e| DirectoryError::http(address.to_string(), e))?;

        tracing::debug!("Connected to cast receiver at {}", address);
        Ok(Box::new(TlsCastConnection {
            stream,
            buffer: Vec::new(),
        }))
    }
}

/// Where a launched application can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppTransport {
    pub transport_id: String,
    pub session_id: String,
}

type LaunchResult = std::result::Result<AppTransport, String>;

fn sender_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "connect-directoryd".to_string());
    format!("sender-{}", host.split('.').next().unwrap_or("local"))
}

/// An open cast channel for one receiver application.
///
/// Owns the pump thread. Only application-namespace messages reach the
/// caller, through `recv_app`.
pub struct CastChannel {
    device_name: String,
    app_id: String,
    sender_id: String,
    outbound: flume::Sender<CastMessage>,
    inbound: flume::Receiver<CastMessage>,
    launched: Arc<Signal<LaunchResult>>,
    transport: Option<AppTransport>,
    stop: Arc<AtomicBool>,
    pump: Option<thread::JoinHandle<()>>,
    next_request_id: i64,
}

impl CastChannel {
    pub fn open(transport: &dyn CastTransport, record: &DiscoveryRecord, app_id: &str) -> Result<Self> {
        let connection = transport.connect(record)?;
        let (outbound, outbound_rx) = flume::unbounded();
        let (inbound_tx, inbound) = flume::unbounded();
        let launched = Arc::new(Signal::new());
        let stop = Arc::new(AtomicBool::new(false));
        let sender_id = sender_id();

        let pump = Pump {
            connection,
            app_id: app_id.to_string(),
            sender_id: sender_id.clone(),
            outbound: outbound_rx,
            inbound: inbound_tx,
            launched: launched.clone(),
            stop: stop.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("cast-pump {}", record.device_name))
            .spawn(move || pump.run())?;

        Ok(Self {
            device_name: record.device_name.clone(),
            app_id: app_id.to_string(),
            sender_id,
            outbound,
            inbound,
            launched,
            transport: None,
            stop,
            pump: Some(handle),
            next_request_id: 1,
        })
    }

    fn send(&self, destination_id: &str, namespace: &str, payload: &Value) -> Result<()> {
        self.outbound
            .send(CastMessage::json(&self.sender_id, destination_id, namespace, payload))
            .map_err(|_| DirectoryError::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
    }

    /// Connect to the receiver, launch the application and wait until its
    /// transport is reachable
    pub fn launch(&mut self, timeout: Duration) -> Result<AppTransport> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        self.send(RECEIVER_ID, NAMESPACE_CONNECTION, &serde_json::json!({"type": "CONNECT", "origin": {}}))?;
        self.send(
            RECEIVER_ID,
            NAMESPACE_RECEIVER,
            &serde_json::json!({"type": "LAUNCH", "appId": self.app_id, "requestId": request_id}),
        )?;

        let transport = match self.launched.wait(timeout) {
            Some(Ok(transport)) => transport,
            Some(Err(reason)) => {
                return Err(DirectoryError::Launch {
                    device: self.device_name.clone(),
                    message: reason,
                })
            }
            None => return Err(DirectoryError::timeout(format!("launch of cast application {}", self.app_id), timeout)),
        };

        self.send(&transport.transport_id, NAMESPACE_CONNECTION, &serde_json::json!({"type": "CONNECT", "origin": {}}))?;
        self.transport = Some(transport.clone());
        Ok(transport)
    }

    /// Close the virtual connections and stop the pump. The receiver
    /// application keeps running.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            let _ = self.send(&transport.transport_id, NAMESPACE_CONNECTION, &serde_json::json!({"type": "CLOSE"}));
        }
        let _ = self.send(RECEIVER_ID, NAMESPACE_CONNECTION, &serde_json::json!({"type": "CLOSE"}));
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.pump.take() {
            if handle.join().is_err() {
                tracing::error!("Cast pump thread panicked");
            }
        }
    }
}

impl AppLink for CastChannel {
    fn send_app(&self, namespace: &str, payload: &Value) -> Result<()> {
        let transport = self.transport.as_ref().ok_or_else(|| DirectoryError::Launch {
            device: self.device_name.clone(),
            message: "application not launched".to_string(),
        })?;
        self.send(&transport.transport_id, namespace, payload)
    }

    fn recv_app(&self, timeout: Duration) -> Result<Option<CastMessage>> {
        match self.inbound.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(flume::RecvTimeoutError::Timeout) => Ok(None),
            Err(flume::RecvTimeoutError::Disconnected) => {
                Err(DirectoryError::Io(io::Error::from(io::ErrorKind::ConnectionAborted)))
            }
        }
    }
}

impl Drop for CastChannel {
    fn drop(&mut self) {
        self.close();
    }
}

struct Pump {
    connection: Box<dyn CastConnection>,
    app_id: String,
    sender_id: String,
    outbound: flume::Receiver<CastMessage>,
    inbound: flume::Sender<CastMessage>,
    launched: Arc<Signal<LaunchResult>>,
    stop: Arc<AtomicBool>,
}

impl Pump {
    fn run(mut self) {
        if let Err(e) = self.pump() {
            tracing::warn!("Cast connection to {} closed: {}", self.app_id, e);
        }
        if !self.launched.is_set() {
            self.launched.set(Err("connection closed before launch".to_string()));
        }
        // flush the CLOSE messages queued by `CastChannel::close`
        while let Ok(message) = self.outbound.try_recv() {
            if self.connection.send(&message).is_err() {
                break;
            }
        }
    }

    fn pump(&mut self) -> Result<()> {
        let mut last_ping = Instant::now();
        while !self.stop.load(Ordering::SeqCst) {
            while let Ok(message) = self.outbound.try_recv() {
                self.connection.send(&message)?;
            }

            if last_ping.elapsed() >= HEARTBEAT_INTERVAL {
                self.reply(RECEIVER_ID, NAMESPACE_HEARTBEAT, &serde_json::json!({"type": "PING"}))?;
                last_ping = Instant::now();
            }

            if let Some(message) = self.connection.recv(PUMP_POLL)? {
                if !self.route(message)? {
                    break;
                }
            }
        }
        Ok(())
    }

    fn reply(&mut self, destination_id: &str, namespace: &str, payload: &Value) -> Result<()> {
        self.connection
            .send(&CastMessage::json(&self.sender_id, destination_id, namespace, payload))
    }

    /// Returns false once the receiver closed our virtual connection
    fn route(&mut self, message: CastMessage) -> Result<bool> {
        let body: Value = serde_json::from_str(&message.payload).unwrap_or(Value::Null);
        let kind = body.get("type").and_then(Value::as_str).unwrap_or_default();

        match message.namespace.as_str() {
            NAMESPACE_HEARTBEAT => {
                if kind == "PING" {
                    self.reply(&message.source_id, NAMESPACE_HEARTBEAT, &serde_json::json!({"type": "PONG"}))?;
                }
            }
            NAMESPACE_RECEIVER => match kind {
                "RECEIVER_STATUS" => {
                    let applications = body
                        .pointer("/status/applications")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let app = applications
                        .iter()
                        .find(|app| app.get("appId").and_then(Value::as_str) == Some(self.app_id.as_str()));
                    match (app, self.launched.get()) {
                        (Some(app), None) => {
                            let transport_id = app.get("transportId").and_then(Value::as_str);
                            let session_id = app.get("sessionId").and_then(Value::as_str);
                            if let (Some(transport_id), Some(session_id)) = (transport_id, session_id) {
                                self.launched.set(Ok(AppTransport {
                                    transport_id: transport_id.to_string(),
                                    session_id: session_id.to_string(),
                                }));
                            }
                        }
                        (None, Some(Ok(launched))) => {
                            tracing::info!(
                                "Cast application {} (session {}) is no longer running",
                                self.app_id,
                                launched.session_id
                            );
                            return Ok(false);
                        }
                        _ => {}
                    }
                }
                "LAUNCH_ERROR" => {
                    let reason = body.get("reason").and_then(Value::as_str).unwrap_or("unknown").to_string();
                    self.launched.set(Err(reason));
                }
                _ => {}
            },
            NAMESPACE_CONNECTION => {
                if kind == "CLOSE" {
                    tracing::info!("Cast receiver closed connection from {}", message.source_id);
                    return Ok(false);
                }
            }
            _ => {
                if self.inbound.send(message).is_err() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: &str) -> CastMessage {
        CastMessage {
            source_id: "sender-0".to_string(),
            destination_id: RECEIVER_ID.to_string(),
            namespace: NAMESPACE_CONNECTION.to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&message(r#"{"type":"CONNECT"}"#)).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        // field 1 (varint) = 0, then field 2 (length-delimited) "sender-0"
        assert_eq!(&frame[4..8], &[0x08, 0x00, 0x12, 0x08]);
        assert_eq!(&frame[8..16], b"sender-0");
    }

    #[test]
    fn test_decode_long_payload() {
        let payload = format!(r#"{{"type":"getInfo","pad":"{}"}}"#, "x".repeat(300));
        let frame = encode_frame(&message(&payload)).unwrap();
        let decoded = decode_frame(&frame[4..]).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.namespace, NAMESPACE_CONNECTION);
        assert_eq!(decoded.destination_id, RECEIVER_ID);
    }

    #[test]
    fn test_take_frame_waits_for_complete_frame() {
        let frame = encode_frame(&message("{}")).unwrap();
        let mut buffer = frame[..frame.len() - 1].to_vec();
        assert!(take_frame(&mut buffer).unwrap().is_none());

        buffer.push(frame[frame.len() - 1]);
        buffer.extend_from_slice(&frame);
        assert!(take_frame(&mut buffer).unwrap().is_some());
        assert!(take_frame(&mut buffer).unwrap().is_some());
        assert!(buffer.is_empty());
    }

    struct SilentConnection;

    impl CastConnection for SilentConnection {
        fn send(&mut self, _message: &CastMessage) -> Result<()> {
            Ok(())
        }

        fn recv(&mut self, _timeout: Duration) -> Result<Option<CastMessage>> {
            Ok(None)
        }
    }

    fn pump() -> (Pump, Arc<Signal<LaunchResult>>, flume::Receiver<CastMessage>) {
        let (_outbound_tx, outbound) = flume::unbounded();
        let (inbound, inbound_rx) = flume::unbounded();
        let launched = Arc::new(Signal::new());
        let pump = Pump {
            connection: Box::new(SilentConnection),
            app_id: "CC32E753".to_string(),
            sender_id: "sender-0".to_string(),
            outbound,
            inbound,
            launched: launched.clone(),
            stop: Arc::new(AtomicBool::new(false)),
        };
        (pump, launched, inbound_rx)
    }

    fn receiver_status(applications: Value) -> CastMessage {
        CastMessage::json(
            RECEIVER_ID,
            "sender-0",
            NAMESPACE_RECEIVER,
            &serde_json::json!({"type": "RECEIVER_STATUS", "status": {"applications": applications}}),
        )
    }

    #[test]
    fn test_receiver_status_launches_application() {
        let (mut pump, launched, _inbound) = pump();
        assert!(pump.route(receiver_status(serde_json::json!([]))).unwrap());
        assert!(!launched.is_set());

        let running = serde_json::json!([{"appId": "CC32E753", "transportId": "web-5", "sessionId": "session-1"}]);
        assert!(pump.route(receiver_status(running)).unwrap());
        assert_eq!(
            launched.get(),
            Some(Ok(AppTransport {
                transport_id: "web-5".to_string(),
                session_id: "session-1".to_string(),
            }))
        );
    }

    #[test]
    fn test_application_gone_after_launch_ends_pump() {
        let (mut pump, launched, _inbound) = pump();
        launched.set(Ok(AppTransport {
            transport_id: "web-5".to_string(),
            session_id: "session-1".to_string(),
        }));

        let other_app = serde_json::json!([{"appId": "E8C28D3C", "transportId": "web-9", "sessionId": "session-2"}]);
        assert!(!pump.route(receiver_status(other_app)).unwrap());
    }

    #[test]
    fn test_application_messages_are_forwarded() {
        let (mut pump, _launched, inbound) = pump();
        let message = CastMessage::json("web-5", "sender-0", "urn:x-cast:com.spotify.chromecast.secure.v1", &serde_json::json!({"type": "ping"}));
        assert!(pump.route(message.clone()).unwrap());
        assert_eq!(inbound.try_recv().unwrap(), message);
    }

    #[test]
    fn test_decode_rejects_truncated_field() {
        let frame = encode_frame(&message("{}")).unwrap();
        let truncated = &frame[4..frame.len() - 1];
        assert!(decode_frame(truncated).is_err());
    }
}
