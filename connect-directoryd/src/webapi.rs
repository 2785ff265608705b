//! Collaborators outside the directory: the Web API, account tokens, device
//! token exchange and the speaker-family control library. Each is a trait so
//! the directory task can be driven by fakes; minimal blocking HTTP
//! implementations are provided for the daemon.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use serde::Deserialize;
use shared::protocol::DEVICE_AUTH_REFRESH_URL;
use shared::types::{PlaybackState, RemoteDevice};
use crate::error::{DirectoryError, Result};

pub const WEB_API_BASE_URL: &str = "https://api.spotify.com/v1";
pub const ACCOUNTS_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

pub trait WebApi: Send + Sync {
    /// Players the account currently sees
    fn list_player_devices(&self) -> Result<Vec<RemoteDevice>>;

    /// Current playback state; `None` when nothing is playing anywhere
    fn playback_state(&self) -> Result<Option<PlaybackState>>;

    fn transfer_playback(&self, device_id: &str, play: bool) -> Result<()>;
}

pub trait TokenProvider: Send + Sync {
    fn current_access_token(&self) -> Result<String>;

    /// Force a refresh and return the new token
    fn refresh(&self) -> Result<String>;
}

/// Exchanges an account access token for a token scoped to one device
pub trait DeviceAuth: Send + Sync {
    fn device_token(&self, access_token: &str, client_id: &str, device_id: &str) -> Result<String>;
}

/// What a Sonos speaker reports about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeakerInfo {
    pub zone_name: String,
    pub model_name: String,
    pub uid: String,
}

pub trait SpeakerFamily: Send + Sync {
    fn speaker_info(&self, ip: &str) -> Result<SpeakerInfo>;

    /// Address of the speaker coordinating the group `ip` belongs to;
    /// `None` for an orphaned group
    fn group_coordinator(&self, ip: &str) -> Result<Option<String>>;
}

fn http_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(HTTP_TIMEOUT)
        .timeout_read(HTTP_TIMEOUT)
        .timeout_write(HTTP_TIMEOUT)
        .build()
}

fn web_api_error(url: &str, error: ureq::Error) -> DirectoryError {
    match error {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            DirectoryError::WebApi(format!("{} returned HTTP {}: {}", url, code, body.trim()))
        }
        ureq::Error::Transport(transport) => DirectoryError::http(url, transport),
    }
}

#[derive(Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<RemoteDevice>,
}

/// Web API client limited to the player endpoints the directory needs
pub struct SpotifyWebApi {
    http_client: ureq::Agent,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl SpotifyWebApi {
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_base_url(WEB_API_BASE_URL, tokens)
    }

    pub fn with_base_url(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http_client: http_agent(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Run `call` with the current token, refreshing once on HTTP 401
    fn authorized<T>(&self, url: &str, call: impl Fn(&str) -> std::result::Result<T, ureq::Error>) -> Result<T> {
        let token = self.tokens.current_access_token()?;
        match call(&token) {
            Err(ureq::Error::Status(401, _)) => {
                tracing::debug!("Access token rejected by {}, refreshing", url);
                let token = self.tokens.refresh()?;
                call(&token).map_err(|e| web_api_error(url, e))
            }
            other => other.map_err(|e| web_api_error(url, e)),
        }
    }
}

impl WebApi for SpotifyWebApi {
    fn list_player_devices(&self) -> Result<Vec<RemoteDevice>> {
        let url = format!("{}/me/player/devices", self.base_url);
        let response = self.authorized(&url, |token| {
            self.http_client
                .get(&url)
                .set("Authorization", &format!("Bearer {}", token))
                .call()
        })?;
        let body: DevicesResponse = response.into_json()?;
        Ok(body.devices)
    }

    fn playback_state(&self) -> Result<Option<PlaybackState>> {
        let url = format!("{}/me/player", self.base_url);
        let response = self.authorized(&url, |token| {
            self.http_client
                .get(&url)
                .set("Authorization", &format!("Bearer {}", token))
                .call()
        })?;
        if response.status() == 204 {
            return Ok(None);
        }
        let body = response.into_string()?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&body)?))
    }

    fn transfer_playback(&self, device_id: &str, play: bool) -> Result<()> {
        let url = format!("{}/me/player", self.base_url);
        let payload = serde_json::json!({ "device_ids": [device_id], "play": play });
        self.authorized(&url, |token| {
            self.http_client
                .put(&url)
                .set("Authorization", &format!("Bearer {}", token))
                .send_json(payload.clone())
        })?;
        tracing::info!("Transferred playback to device {}", device_id);
        Ok(())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

struct CachedToken {
    access_token: String,
    refresh_token: String,
    expires_at: Instant,
}

/// Refresh-token grant against the accounts service
pub struct RefreshTokenProvider {
    http_client: ureq::Agent,
    token_url: String,
    client_id: String,
    state: Mutex<CachedToken>,
}

impl RefreshTokenProvider {
    pub fn new(client_id: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self::with_token_url(ACCOUNTS_TOKEN_URL, client_id, refresh_token)
    }

    pub fn with_token_url(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            http_client: http_agent(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            state: Mutex::new(CachedToken {
                access_token: String::new(),
                refresh_token: refresh_token.into(),
                expires_at: Instant::now(),
            }),
        }
    }

    fn refresh_locked(&self, state: &mut CachedToken) -> Result<String> {
        if state.refresh_token.is_empty() {
            return Err(DirectoryError::InvalidArgument("no refresh token configured".to_string()));
        }
        let response = self
            .http_client
            .post(&self.token_url)
            .send_form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", state.refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
            ])
            .map_err(|e| web_api_error(&self.token_url, e))?;
        let token: TokenResponse = response.into_json()?;

        state.access_token = token.access_token;
        state.expires_at = Instant::now() + Duration::from_secs(token.expires_in);
        if let Some(rotated) = token.refresh_token.filter(|t| !t.is_empty()) {
            state.refresh_token = rotated;
        }
        tracing::debug!("Refreshed access token, valid for {}s", token.expires_in);
        Ok(state.access_token.clone())
    }
}

impl TokenProvider for RefreshTokenProvider {
    fn current_access_token(&self) -> Result<String> {
        let mut state = self.state.lock().map_err(|_| DirectoryError::WebApi("token cache poisoned".to_string()))?;
        if !state.access_token.is_empty() && Instant::now() + EXPIRY_MARGIN < state.expires_at {
            return Ok(state.access_token.clone());
        }
        self.refresh_locked(&mut state)
    }

    fn refresh(&self) -> Result<String> {
        let mut state = self.state.lock().map_err(|_| DirectoryError::WebApi("token cache poisoned".to_string()))?;
        self.refresh_locked(&mut state)
    }
}

/// Device token exchange used by the cast addUser step
pub struct SpclientDeviceAuth {
    http_client: ureq::Agent,
    url: String,
}

#[derive(Deserialize)]
struct DeviceTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

impl SpclientDeviceAuth {
    pub fn new() -> Self {
        Self::with_url(DEVICE_AUTH_REFRESH_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            http_client: http_agent(),
            url: url.into(),
        }
    }
}

impl Default for SpclientDeviceAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAuth for SpclientDeviceAuth {
    fn device_token(&self, access_token: &str, client_id: &str, device_id: &str) -> Result<String> {
        let response = self
            .http_client
            .post(&self.url)
            .set("Authorization", &format!("Bearer {}", access_token))
            .send_json(serde_json::json!({ "clientId": client_id, "deviceId": device_id }))
            .map_err(|e| web_api_error(&self.url, e))?;
        let body: DeviceTokenResponse = response.into_json()?;
        Ok(body.access_token)
    }
}
