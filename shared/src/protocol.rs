/// mDNS service type advertised by native Spotify Connect receivers
pub const SPOTIFY_CONNECT_SERVICE_TYPE: &str = "_spotify-connect._tcp.local.";

/// mDNS service type advertised by Google Cast receivers (devices and groups)
pub const GOOGLECAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// TXT record keys used by native receivers (matched case-insensitively)
pub const TXT_CPATH: &str = "cpath";
pub const TXT_VERSION: &str = "version";

/// TXT record keys used by cast receivers
pub const TXT_CAST_ID: &str = "id";
pub const TXT_CAST_FRIENDLY_NAME: &str = "fn";
pub const TXT_CAST_MODEL: &str = "md";
pub const TXT_CAST_CAPABILITIES: &str = "ca";

/// Cast type values derived from the receiver capabilities / model
pub const CAST_TYPE_CHROMECAST: &str = "cast";
pub const CAST_TYPE_AUDIO: &str = "audio";
pub const CAST_TYPE_GROUP: &str = "group";

/// Model name reported by cast receivers that represent a speaker group
pub const CAST_GROUP_MODEL_NAME: &str = "Google Cast Group";

/// Placeholder zeroconf path/version for cast receivers, which have no
/// native Spotify Connect endpoint
pub const CAST_PLACEHOLDER_CPATH: &str = "/na";
pub const CAST_PLACEHOLDER_VERSION: &str = "1.0";

/// Zeroconf path/version used for devices only known through the Web API
pub const DYNAMIC_CPATH: &str = "/zc";
pub const DYNAMIC_VERSION: &str = "1.0";
pub const DYNAMIC_HOST: &str = "127.0.0.1";

/// Zeroconf API actions
pub const ACTION_GET_INFO: &str = "getInfo";
pub const ACTION_ADD_USER: &str = "addUser";
pub const ACTION_RESET_USERS: &str = "resetUsers";

/// Default zeroconf client version when the receiver does not advertise one
pub const ZEROCONF_DEFAULT_VERSION: &str = "2.7.1";

/// Zeroconf status code meaning success
pub const STATUS_OK: i64 = 101;
pub const STATUS_OK_STRING: &str = "OK";

/// Status code recorded when a receiver could not describe itself at all
pub const STATUS_GET_INFO_FAILED: i64 = 9999;
pub const GET_INFO_FAILED_DEVICE_ID: &str = "getInfoError";

/// Status code recorded when a cast message could not be processed
pub const STATUS_RECEIVE_MESSAGE_FAILED: i64 = 1000;
pub const STATUS_RECEIVE_MESSAGE_FAILED_STRING: &str = "ERROR-CHROMECAST-RECEIVE-MESSAGE";

/// Spotify cast receiver application
pub const CAST_APP_SPOTIFY: &str = "CC32E753";
pub const CAST_APP_NAMESPACE: &str = "urn:x-cast:com.spotify.chromecast.secure.v1";

/// Spotify cast application message types
pub const TYPE_GET_INFO: &str = "getInfo";
pub const TYPE_GET_INFO_RESPONSE: &str = "getInfoResponse";
pub const TYPE_GET_INFO_ERROR: &str = "getInfoError";
pub const TYPE_ADD_USER: &str = "addUser";
pub const TYPE_ADD_USER_RESPONSE: &str = "addUserResponse";
pub const TYPE_ADD_USER_ERROR: &str = "addUserError";
pub const TYPE_TRANSFER_SUCCESS: &str = "transferSuccess";
pub const TYPE_TRANSFER_ERROR: &str = "transferError";
pub const TYPE_LAUNCH_ERROR: &str = "launchError";

/// Token type sent with cast addUser requests
pub const CAST_TOKEN_TYPE: &str = "accesstoken";

/// Endpoint exchanging an account access token for a device-scoped token
pub const DEVICE_AUTH_REFRESH_URL: &str = "https://spclient.wg.spotify.com/device-auth/v1/refresh";

/// Brand reported by Sonos speakers
pub const BRAND_SONOS: &str = "sonos";

/// API path prefix
pub const API_PREFIX: &str = "/v1";
