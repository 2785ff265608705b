//! Google Cast activation of the Spotify receiver application.

pub mod channel;
pub mod controller;
pub mod session;

pub use channel::{AppLink, CastConnection, CastMessage, CastTransport, TlsCastTransport};
pub use controller::{CastController, ControllerEvent};
pub use session::{CastSession, SessionContext, SessionLink, SessionState};

/// Directory id of a cast device: md5 hex of its friendly name. Renaming the
/// device changes its id.
pub fn device_id_for(friendly_name: &str) -> String {
    format!("{:x}", md5::compute(friendly_name.as_bytes()))
}
