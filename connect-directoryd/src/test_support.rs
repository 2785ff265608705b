//! Fakes for the collaborator traits and a one-shot HTTP server.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use serde_json::{json, Value};
use shared::protocol::{
    CAST_APP_NAMESPACE, CAST_APP_SPOTIFY, CAST_PLACEHOLDER_CPATH, CAST_PLACEHOLDER_VERSION,
    CAST_TYPE_AUDIO, GOOGLECAST_SERVICE_TYPE,
};
use shared::types::{DirectoryEntry, DiscoveryRecord, PlaybackState, RemoteDevice, SelfDescription};
use crate::cast::channel::{CastConnection, CastMessage, CastTransport, NAMESPACE_RECEIVER};
use crate::cast::device_id_for;
use crate::error::{DirectoryError, Result};
use crate::webapi::{DeviceAuth, SpeakerFamily, SpeakerInfo, TokenProvider, WebApi};

/// Serve exactly one HTTP request with `status_line` and `body`; the join
/// handle yields the raw request text.
pub fn serve_once(status_line: &'static str, body: &'static str) -> (u16, thread::JoinHandle<String>) {
    let (port, handle) = serve_sequence(vec![(status_line, body)]);
    (port, thread::spawn(move || handle.join().unwrap().remove(0)))
}

/// Serve one HTTP request per `(status_line, body)` pair, in order; the join
/// handle yields the raw requests.
pub fn serve_sequence(responses: Vec<(&'static str, &'static str)>) -> (u16, thread::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut requests = Vec::new();
        for (status_line, body) in responses {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.trim().eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
                request.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).unwrap();
            request.push_str(&String::from_utf8_lossy(&request_body));

            let mut stream = stream;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
            requests.push(request);
        }
        requests
    });
    (port, handle)
}

pub struct StaticTokens(pub String);

impl TokenProvider for StaticTokens {
    fn current_access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }

    fn refresh(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub struct FakeDeviceAuth;

impl DeviceAuth for FakeDeviceAuth {
    fn device_token(&self, access_token: &str, client_id: &str, device_id: &str) -> Result<String> {
        Ok(format!("device-token:{}:{}:{}", access_token, client_id, device_id))
    }
}

/// Player ids playback was transferred to, shared between the fake Web API
/// and the fake receivers that watch for it
#[derive(Default, Clone)]
pub struct TransferLog(Arc<Mutex<Vec<String>>>);

impl TransferLog {
    pub fn push(&self, device_id: &str) {
        self.0.lock().unwrap().push(device_id.to_string());
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.0.lock().unwrap().iter().any(|id| id == device_id)
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeWebApi {
    pub devices: Mutex<Vec<RemoteDevice>>,
    pub playing: Mutex<Option<PlaybackState>>,
    pub transfers: TransferLog,
}

impl FakeWebApi {
    pub fn with_devices(devices: Vec<RemoteDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            ..Default::default()
        }
    }

    pub fn transfers(&self) -> Vec<String> {
        self.transfers.entries()
    }
}

impl WebApi for FakeWebApi {
    fn list_player_devices(&self) -> Result<Vec<RemoteDevice>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn playback_state(&self) -> Result<Option<PlaybackState>> {
        Ok(self.playing.lock().unwrap().clone())
    }

    fn transfer_playback(&self, device_id: &str, _play: bool) -> Result<()> {
        self.transfers.push(device_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSpeakers {
    pub coordinator: Option<String>,
}

impl SpeakerFamily for FakeSpeakers {
    fn speaker_info(&self, ip: &str) -> Result<SpeakerInfo> {
        Ok(SpeakerInfo {
            zone_name: format!("Zone {}", ip),
            model_name: "Sonos One".to_string(),
            uid: format!("RINCON_{}", ip.replace('.', "")),
        })
    }

    fn group_coordinator(&self, _ip: &str) -> Result<Option<String>> {
        Ok(self.coordinator.clone())
    }
}

/// Scripted cast receiver that runs the Spotify application
#[derive(Default, Clone)]
pub struct FakeCastTransport {
    pub unreachable: bool,
    pub launch_error: bool,
    /// Never answer the playback transfer
    pub silent_transfer: bool,
    /// deviceID the receiver reports in getInfoResponse; the directory id
    /// it was asked about when unset
    pub reported_device_id: Option<String>,
    /// Stop the Spotify application right after the login
    pub close_app_after_activation: bool,
    /// Follow the login with an unparsable application message
    pub garbled_after_activation: bool,
    pub transfers: TransferLog,
}

impl FakeCastTransport {
    /// A Web API whose transfers this receiver sees
    pub fn web_api(&self) -> FakeWebApi {
        FakeWebApi {
            transfers: self.transfers.clone(),
            ..Default::default()
        }
    }
}

impl CastTransport for FakeCastTransport {
    fn connect(&self, _record: &DiscoveryRecord) -> Result<Box<dyn CastConnection>> {
        if self.unreachable {
            return Err(DirectoryError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)));
        }
        Ok(Box::new(FakeCastConnection {
            script: self.clone(),
            pending: VecDeque::new(),
            app_peer: None,
            reported: None,
            transfer_answered: false,
        }))
    }
}

const FAKE_TRANSPORT_ID: &str = "web-5";

struct FakeCastConnection {
    script: FakeCastTransport,
    pending: VecDeque<CastMessage>,
    /// The addUser request, answered later with the transfer result
    app_peer: Option<CastMessage>,
    reported: Option<String>,
    transfer_answered: bool,
}

impl FakeCastConnection {
    fn reply(&mut self, to: &CastMessage, namespace: &str, payload: Value) {
        self.pending.push_back(CastMessage::json(&to.destination_id, &to.source_id, namespace, &payload));
    }

    /// transferSuccess once playback was moved to the id this receiver reported
    fn answer_transfer(&mut self) {
        if self.transfer_answered || self.script.silent_transfer {
            return;
        }
        let (Some(peer), Some(reported)) = (self.app_peer.clone(), self.reported.clone()) else {
            return;
        };
        if self.script.transfers.contains(&reported) {
            self.transfer_answered = true;
            self.reply(
                &peer,
                CAST_APP_NAMESPACE,
                json!({"type": "transferSuccess", "payload": {"status": 101, "statusString": "OK"}}),
            );
        }
    }
}

impl CastConnection for FakeCastConnection {
    fn send(&mut self, message: &CastMessage) -> Result<()> {
        let body: Value = serde_json::from_str(&message.payload)?;
        let kind = body["type"].as_str().unwrap_or_default().to_string();
        match (message.namespace.as_str(), kind.as_str()) {
            (NAMESPACE_RECEIVER, "LAUNCH") if self.script.launch_error => {
                self.reply(message, NAMESPACE_RECEIVER, json!({"type": "LAUNCH_ERROR", "reason": "NOT_FOUND"}));
            }
            (NAMESPACE_RECEIVER, "LAUNCH") => {
                self.reply(
                    message,
                    NAMESPACE_RECEIVER,
                    json!({
                        "type": "RECEIVER_STATUS",
                        "requestId": body["requestId"],
                        "status": {"applications": [{
                            "appId": CAST_APP_SPOTIFY,
                            "displayName": "Spotify",
                            "sessionId": "session-1",
                            "transportId": FAKE_TRANSPORT_ID,
                        }]}
                    }),
                );
            }
            (CAST_APP_NAMESPACE, "getInfo") => {
                let device_id = self
                    .script
                    .reported_device_id
                    .clone()
                    .unwrap_or_else(|| body["payload"]["deviceID"].as_str().unwrap_or_default().to_string());
                self.reported = Some(device_id.clone());
                self.reply(
                    message,
                    CAST_APP_NAMESPACE,
                    json!({"type": "getInfoResponse", "payload": {
                        "deviceID": device_id,
                        "remoteName": body["payload"]["remoteName"],
                        "clientID": "cid",
                        "publicKey": "empty",
                        "activeUser": "",
                        "deviceType": "Speaker",
                        "brandDisplayName": "Google",
                    }}),
                );
            }
            (CAST_APP_NAMESPACE, "addUser") => {
                self.reply(
                    message,
                    CAST_APP_NAMESPACE,
                    json!({"type": "addUserResponse", "payload": {
                        "status": 101, "statusString": "OK", "spotifyError": 0,
                        "user": {"id": "user1"}
                    }}),
                );
                if self.script.garbled_after_activation {
                    self.pending.push_back(CastMessage {
                        source_id: message.destination_id.clone(),
                        destination_id: message.source_id.clone(),
                        namespace: CAST_APP_NAMESPACE.to_string(),
                        payload: "{garbled".to_string(),
                    });
                }
                if self.script.close_app_after_activation {
                    self.reply(
                        message,
                        NAMESPACE_RECEIVER,
                        json!({"type": "RECEIVER_STATUS", "status": {"applications": []}}),
                    );
                }
                self.app_peer = Some(message.clone());
            }
            _ => {}
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<CastMessage>> {
        self.answer_transfer();
        match self.pending.pop_front() {
            Some(message) => Ok(Some(message)),
            None => {
                thread::sleep(timeout.min(Duration::from_millis(20)));
                Ok(None)
            }
        }
    }
}

/// A discovered cast audio device as the cast listener would build it
pub fn cast_entry(friendly_name: &str, key: &str) -> DirectoryEntry {
    DirectoryEntry {
        id: device_id_for(friendly_name),
        name: friendly_name.to_string(),
        discovery: DiscoveryRecord {
            device_name: friendly_name.to_string(),
            key: key.to_string(),
            name: format!("Google-Home-{}.{}", key, GOOGLECAST_SERVICE_TYPE),
            server: format!("{}.local.", key),
            host_ip_addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40))],
            host_ip_port: 8009,
            service_type: Some(GOOGLECAST_SERVICE_TYPE.to_string()),
            cpath: CAST_PLACEHOLDER_CPATH.to_string(),
            version: Some(CAST_PLACEHOLDER_VERSION.to_string()),
            is_cast: true,
            cast_type: Some(CAST_TYPE_AUDIO.to_string()),
            model_name: Some("Google Home".to_string()),
            ..Default::default()
        },
        description: SelfDescription {
            device_id: device_id_for(friendly_name),
            remote_name: friendly_name.to_string(),
            device_type: "CastAudio".to_string(),
            brand_display_name: "Google Inc.".to_string(),
            model_display_name: "Google Home".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

