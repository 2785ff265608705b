//! Multicast-DNS discovery of Spotify Connect and Google Cast receivers.

pub mod browser;
pub mod cast_listener;
pub mod connect_listener;

pub use browser::{DiscoveryLock, Listener, ServiceHandler};
pub use cast_listener::CastListener;
pub use connect_listener::ConnectListener;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use mdns_sd::ServiceDaemon;
use shared::protocol::{GOOGLECAST_SERVICE_TYPE, SPOTIFY_CONNECT_SERVICE_TYPE};
use crate::directory_manager::DirectoryHandle;
use crate::error::{DirectoryError, Result};
use crate::webapi::SpeakerFamily;
use crate::zeroconf::ZeroconfClient;

/// Source of discovery notifications feeding the directory
pub trait DiscoveryBackend: Send {
    fn start(&mut self, directory: &DirectoryHandle) -> Result<()>;
    fn stop(&mut self);
}

/// Browses both service families on the local network
pub struct MdnsDiscovery {
    self_description_timeout: Duration,
    speakers: Option<Arc<dyn SpeakerFamily>>,
    daemon: Option<ServiceDaemon>,
    listeners: Vec<Listener>,
}

impl MdnsDiscovery {
    pub fn new(self_description_timeout: Duration, speakers: Option<Arc<dyn SpeakerFamily>>) -> Self {
        Self {
            self_description_timeout,
            speakers,
            daemon: None,
            listeners: Vec::new(),
        }
    }
}

impl DiscoveryBackend for MdnsDiscovery {
    fn start(&mut self, directory: &DirectoryHandle) -> Result<()> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| DirectoryError::Discovery(format!("Failed to create mDNS daemon: {}", e)))?;
        self.daemon = Some(daemon.clone());
        let lock: DiscoveryLock = Arc::new(Mutex::new(()));

        let connect = ConnectListener::new(
            directory.clone(),
            ZeroconfClient::new(self.self_description_timeout),
            self.speakers.clone(),
            lock.clone(),
        );
        self.listeners
            .push(Listener::start(&daemon, SPOTIFY_CONNECT_SERVICE_TYPE, Arc::new(connect))?);

        let cast = CastListener::new(directory.clone(), lock);
        self.listeners
            .push(Listener::start(&daemon, GOOGLECAST_SERVICE_TYPE, Arc::new(cast))?);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(daemon) = self.daemon.take() else {
            return;
        };
        for listener in &mut self.listeners {
            listener.stop(&daemon);
        }
        self.listeners.clear();
        if let Err(e) = daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
    }
}
