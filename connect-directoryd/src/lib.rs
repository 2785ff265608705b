//! Directory of Spotify Connect playback devices: native zeroconf receivers
//! and Google Cast receivers found over mDNS, merged with the players the
//! Web API reports.

pub mod api;
pub mod cast;
pub mod config;
pub mod directory;
pub mod directory_manager;
pub mod error;
pub mod mdns;
pub mod signal;
pub mod task;
pub mod webapi;
pub mod zeroconf;

#[cfg(test)]
pub(crate) mod test_support;

pub use directory_manager::{DeviceObserver, DirectoryHandle};
pub use error::{DirectoryError, Result};
pub use task::{ActivationTimeouts, Collaborators, DirectoryTask};
