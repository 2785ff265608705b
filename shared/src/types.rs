use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::{
    ACTION_ADD_USER, ACTION_GET_INFO, ACTION_RESET_USERS, BRAND_SONOS, CAST_TYPE_GROUP,
    TYPE_ADD_USER_ERROR, TYPE_ADD_USER_RESPONSE, TYPE_GET_INFO_ERROR, TYPE_LAUNCH_ERROR,
    TYPE_TRANSFER_ERROR, TYPE_TRANSFER_SUCCESS,
};

/// One multicast-DNS advertisement for a playback endpoint.
///
/// Dynamic devices (only known through the Web API device list) carry a
/// fabricated record with port 0 and no service type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    /// Display name taken from the advertisement, e.g. "Office"
    pub device_name: String,

    /// Stable identity within one discovery session
    pub key: String,

    /// Full DNS-SD instance name, e.g. "Office._spotify-connect._tcp.local."
    pub name: String,

    /// Advertised hostname, e.g. "office-speaker.local."
    pub server: String,

    /// Resolved addresses, in resolution order
    pub host_ip_addresses: Vec<IpAddr>,

    pub host_ip_port: u16,

    /// Service type, `None` for dynamic devices
    pub service_type: Option<String>,

    /// Zeroconf API path advertised in the TXT record
    pub cpath: String,

    /// Zeroconf API version advertised in the TXT record
    pub version: Option<String>,

    /// TXT record key-value pairs
    pub properties: BTreeMap<String, String>,

    /// Whether the record came from the cast service family
    pub is_cast: bool,

    /// Cast type ("cast", "audio" or "group"); `None` for native receivers
    pub cast_type: Option<String>,

    pub model_name: Option<String>,
}

impl DiscoveryRecord {
    /// The address used to reach the receiver: the last resolved IP, or the
    /// advertised hostname when nothing resolved.
    pub fn host_ip_address(&self) -> String {
        self.host_ip_addresses
            .last()
            .map(ToString::to_string)
            .unwrap_or_else(|| self.server.trim_end_matches('.').to_string())
    }

    /// Replace the address used to reach the receiver.
    pub fn set_host_ip_address(&mut self, address: IpAddr) {
        match self.host_ip_addresses.last_mut() {
            Some(last) => *last = address,
            None => self.host_ip_addresses.push(address),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.host_ip_port == 0 && self.service_type.is_none()
    }

    pub fn is_cast_group(&self) -> bool {
        self.cast_type.as_deref() == Some(CAST_TYPE_GROUP)
    }

    /// Zeroconf API endpoint for the given action
    pub fn endpoint_url(&self, action: &str) -> String {
        format!(
            "http://{}:{}{}?action={}&version={}",
            self.host_ip_address(),
            self.host_ip_port,
            self.cpath,
            action,
            self.version.as_deref().unwrap_or("")
        )
    }

    pub fn get_info_url(&self) -> String {
        self.endpoint_url(ACTION_GET_INFO)
    }

    pub fn add_user_url(&self) -> String {
        self.endpoint_url(ACTION_ADD_USER)
    }

    pub fn reset_users_url(&self) -> String {
        self.endpoint_url(ACTION_RESET_USERS)
    }

    /// Whether two records describe the same advertisement
    pub fn same_advertisement(&self, other: &DiscoveryRecord) -> bool {
        self == other
    }

    /// Short human readable description, e.g. `"Office" (192.168.1.20:8200)`
    pub fn description(&self) -> String {
        format!("\"{}\" ({}:{})", self.device_name, self.host_ip_address(), self.host_ip_port)
    }
}

/// An alias exposed by receivers that multiplex several logical players.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAlias {
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(rename = "isGroup", default)]
    pub is_group: bool,
}

/// A receiver's own account of itself (zeroconf `getInfo` payload).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfDescription {
    #[serde(rename = "deviceID", deserialize_with = "lenient::string")]
    pub device_id: String,
    #[serde(rename = "remoteName", deserialize_with = "lenient::string")]
    pub remote_name: String,
    pub aliases: Vec<DeviceAlias>,
    #[serde(rename = "deviceType", deserialize_with = "lenient::string")]
    pub device_type: String,
    #[serde(rename = "brandDisplayName", deserialize_with = "lenient::string")]
    pub brand_display_name: String,
    #[serde(rename = "modelDisplayName", deserialize_with = "lenient::string")]
    pub model_display_name: String,
    #[serde(rename = "productID", deserialize_with = "lenient::string")]
    pub product_id: String,
    /// Canonical login currently signed in; empty when nobody is
    #[serde(rename = "activeUser", deserialize_with = "lenient::string")]
    pub active_user: String,
    #[serde(rename = "groupStatus", deserialize_with = "lenient::string")]
    pub group_status: String,
    #[serde(rename = "clientID", deserialize_with = "lenient::string")]
    pub client_id: String,
    #[serde(rename = "publicKey")]
    pub public_key: Option<String>,
    #[serde(rename = "tokenType", deserialize_with = "lenient::string")]
    pub token_type: String,
    #[serde(deserialize_with = "lenient::string")]
    pub version: String,
    #[serde(rename = "libraryVersion", deserialize_with = "lenient::string")]
    pub library_version: String,
    #[serde(deserialize_with = "lenient::string")]
    pub availability: String,
    #[serde(rename = "accountReq", deserialize_with = "lenient::string")]
    pub account_req: String,
    #[serde(deserialize_with = "lenient::string")]
    pub scope: String,
    #[serde(rename = "voiceSupport", deserialize_with = "lenient::string")]
    pub voice_support: String,
    #[serde(rename = "resolverVersion", deserialize_with = "lenient::string")]
    pub resolver_version: String,
    #[serde(rename = "supported_capabilities", deserialize_with = "lenient::int")]
    pub supported_capabilities: Option<i64>,
    #[serde(deserialize_with = "lenient::int")]
    pub status: Option<i64>,
    #[serde(rename = "statusString", deserialize_with = "lenient::string")]
    pub status_string: String,
    #[serde(rename = "spotifyError", deserialize_with = "lenient::int")]
    pub spotify_error: Option<i64>,
    /// Where this description came from (HTTP getInfo, cast getInfoResponse, ...)
    #[serde(rename = "responseSource", deserialize_with = "lenient::string")]
    pub response_source: String,
}

impl SelfDescription {
    pub fn has_active_user(&self) -> bool {
        !self.active_user.is_empty()
    }

    pub fn is_brand_sonos(&self) -> bool {
        self.brand_display_name.trim().eq_ignore_ascii_case(BRAND_SONOS)
    }

    /// Display name: the remote name, or the first alias name when the
    /// receiver multiplexes several logical players.
    pub fn display_name(&self) -> Option<&str> {
        if !self.remote_name.trim().is_empty() {
            return Some(self.remote_name.as_str());
        }
        self.aliases.first().map(|alias| alias.name.as_str())
    }
}

/// Asynchronous protocol response kinds recorded against a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseKind {
    GetInfoError,
    AddUserResponse,
    AddUserError,
    TransferSuccess,
    TransferError,
    /// Raised locally on launch timeout or misconfiguration
    LaunchError,
}

impl ResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseKind::GetInfoError => TYPE_GET_INFO_ERROR,
            ResponseKind::AddUserResponse => TYPE_ADD_USER_RESPONSE,
            ResponseKind::AddUserError => TYPE_ADD_USER_ERROR,
            ResponseKind::TransferSuccess => TYPE_TRANSFER_SUCCESS,
            ResponseKind::TransferError => TYPE_TRANSFER_ERROR,
            ResponseKind::LaunchError => TYPE_LAUNCH_ERROR,
        }
    }

    pub fn from_type(value: &str) -> Option<Self> {
        match value {
            TYPE_GET_INFO_ERROR => Some(ResponseKind::GetInfoError),
            TYPE_ADD_USER_RESPONSE => Some(ResponseKind::AddUserResponse),
            TYPE_ADD_USER_ERROR => Some(ResponseKind::AddUserError),
            TYPE_TRANSFER_SUCCESS => Some(ResponseKind::TransferSuccess),
            TYPE_TRANSFER_ERROR => Some(ResponseKind::TransferError),
            TYPE_LAUNCH_ERROR => Some(ResponseKind::LaunchError),
            _ => None,
        }
    }

    /// Whether this kind ends the activation (getInfo + addUser) phase
    pub fn completes_activation(self) -> bool {
        matches!(
            self,
            ResponseKind::GetInfoError
                | ResponseKind::AddUserResponse
                | ResponseKind::AddUserError
                | ResponseKind::LaunchError
        )
    }

    /// Whether this kind ends the playback transfer phase
    pub fn completes_transfer(self) -> bool {
        matches!(self, ResponseKind::TransferSuccess | ResponseKind::TransferError)
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last asynchronous protocol response observed for a directory entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolOutcome {
    #[serde(rename = "responseKind")]
    pub kind: Option<ResponseKind>,
    #[serde(deserialize_with = "lenient::int")]
    pub status: Option<i64>,
    #[serde(rename = "statusString", deserialize_with = "lenient::string")]
    pub status_string: String,
    #[serde(rename = "spotifyError", deserialize_with = "lenient::int")]
    pub spotify_error: Option<i64>,
}

impl ProtocolOutcome {
    pub fn new(kind: ResponseKind, status: Option<i64>, status_string: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            status,
            status_string: status_string.into(),
            spotify_error: None,
        }
    }
}

impl fmt::Display for ProtocolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (status={}, statusString=\"{}\", spotifyError={})",
            self.kind.map(ResponseKind::as_str).unwrap_or("none"),
            self.status.map(|s| s.to_string()).unwrap_or_default(),
            self.status_string,
            self.spotify_error.map(|s| s.to_string()).unwrap_or_default(),
        )
    }
}

/// The merged, queryable unit of the device directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: String,
    pub name: String,
    pub discovery: DiscoveryRecord,
    pub description: SelfDescription,
    pub outcome: ProtocolOutcome,

    /// Currently driving playback per the Web API play state
    pub is_active: bool,

    /// Currently present in the Web API device list
    pub is_listed: bool,

    /// Cannot appear in the device list but can still be the active device
    pub is_restricted: bool,

    /// Set once a cast activation logged the account into the receiver
    pub was_reconnected: bool,
}

impl DirectoryEntry {
    pub fn title(&self) -> String {
        format!("\"{}\" ({})", self.name, self.id)
    }

    pub fn is_cast(&self) -> bool {
        self.discovery.is_cast
    }

    pub fn is_dynamic(&self) -> bool {
        self.discovery.is_dynamic()
    }

    pub fn is_sonos(&self) -> bool {
        self.description.is_brand_sonos()
    }
}

/// A player device as reported by the Web API device list / play state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteDevice {
    /// Absent for restricted devices
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub is_active: bool,
    pub is_restricted: bool,
}

/// The subset of the Web API playback state the directory consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackState {
    pub device: Option<RemoteDevice>,
    pub is_playing: bool,
}

/// Point-in-time copy of the whole directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub items: Vec<DirectoryEntry>,
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl DirectorySnapshot {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DirectoryEntry> {
        self.items.iter()
    }
}

/// Receivers are not consistent about JSON types: numbers arrive as strings
/// and strings as numbers or null.
mod lenient {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
        Bool(bool),
        Null(()),
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match Option::<Raw>::deserialize(deserializer)? {
            Some(Raw::Str(s)) => s,
            Some(Raw::Int(i)) => i.to_string(),
            Some(Raw::Float(f)) => f.to_string(),
            Some(Raw::Bool(b)) => b.to_string(),
            Some(Raw::Null(())) | None => String::new(),
        })
    }

    pub fn int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        Ok(match Option::<Raw>::deserialize(deserializer)? {
            Some(Raw::Int(i)) => Some(i),
            Some(Raw::Float(f)) => Some(f as i64),
            Some(Raw::Str(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }
}
