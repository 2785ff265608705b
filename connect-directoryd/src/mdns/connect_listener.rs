use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use mdns_sd::ServiceInfo;
use shared::protocol::{GET_INFO_FAILED_DEVICE_ID, STATUS_GET_INFO_FAILED};
use shared::types::{DirectoryEntry, DiscoveryRecord, SelfDescription};
use crate::directory::LOCAL_RESPONSE_SOURCE;
use crate::directory_manager::DirectoryHandle;
use crate::error::{DirectoryError, Result};
use crate::webapi::SpeakerFamily;
use crate::zeroconf::ZeroconfClient;
use super::browser::{discovery_record, hold, DiscoveryLock, ServiceHandler};

const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Handles `_spotify-connect._tcp` advertisements: native receivers that
/// describe themselves over the zeroconf HTTP endpoint.
pub struct ConnectListener {
    directory: DirectoryHandle,
    zeroconf: ZeroconfClient,
    speakers: Option<Arc<dyn SpeakerFamily>>,
    lock: DiscoveryLock,
}

impl ConnectListener {
    pub fn new(
        directory: DirectoryHandle,
        zeroconf: ZeroconfClient,
        speakers: Option<Arc<dyn SpeakerFamily>>,
        lock: DiscoveryLock,
    ) -> Self {
        Self {
            directory,
            zeroconf,
            speakers,
            lock,
        }
    }

    pub fn process_record(&self, mut record: DiscoveryRecord) -> Result<()> {
        {
            let _guard = hold(&self.lock);
            if let Some(existing) = self.directory.get_by_service_name(&record.name)? {
                // keep the address resolved from the hostname
                if record.host_ip_addresses.is_empty() {
                    record.host_ip_addresses = existing.discovery.host_ip_addresses;
                }
                if self.directory.update_discovery(record.clone())? {
                    tracing::info!("Updated discovery details of {}", record.description());
                }
                return Ok(());
            }
        }

        let (record, description) = self.describe(record);
        let name = description
            .display_name()
            .map(str::to_string)
            .unwrap_or_else(|| record.device_name.clone());

        if description.is_brand_sonos() {
            self.log_speaker_info(&record);
        }

        let entry = DirectoryEntry {
            id: description.device_id.clone(),
            name,
            discovery: record,
            description,
            ..Default::default()
        };
        tracing::info!("Discovered Spotify Connect device {}", entry.title());

        let _guard = hold(&self.lock);
        self.directory.upsert_discovered(entry)
    }

    /// getInfo by IP, then by hostname. A receiver that answers neither
    /// still gets an entry carrying the failure.
    fn describe(&self, record: DiscoveryRecord) -> (DiscoveryRecord, SelfDescription) {
        let mut failure = String::from("no IPv4 address advertised");

        if !record.host_ip_addresses.is_empty() {
            match self.zeroconf.get_information(&record) {
                Ok(info) => return (record, info),
                Err(e) => {
                    tracing::warn!("getInfo for {} by IP failed: {}", record.description(), e);
                    failure = e.to_string();
                }
            }
        }

        if !record.server.is_empty() {
            match resolve_host(&record.server, DNS_TIMEOUT) {
                Ok(address) => {
                    let mut by_host = record.clone();
                    by_host.set_host_ip_address(address);
                    match self.zeroconf.get_information(&by_host) {
                        Ok(info) => {
                            tracing::info!("getInfo for {} succeeded via hostname {}", record.device_name, record.server);
                            return (by_host, info);
                        }
                        Err(e) => {
                            tracing::warn!("getInfo for {} by hostname failed: {}", record.description(), e);
                            failure = e.to_string();
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Could not resolve {}: {}", record.server, e);
                }
            }
        }

        let description = SelfDescription {
            device_id: GET_INFO_FAILED_DEVICE_ID.to_string(),
            remote_name: record.device_name.clone(),
            status: Some(STATUS_GET_INFO_FAILED),
            status_string: failure,
            response_source: LOCAL_RESPONSE_SOURCE.to_string(),
            ..Default::default()
        };
        (record, description)
    }

    fn log_speaker_info(&self, record: &DiscoveryRecord) {
        let Some(speakers) = &self.speakers else {
            return;
        };
        match speakers.speaker_info(&record.host_ip_address()) {
            Ok(info) => tracing::info!(
                "Sonos speaker {}: zone \"{}\", model \"{}\", uid {}",
                record.host_ip_address(),
                info.zone_name,
                info.model_name,
                info.uid
            ),
            Err(e) => tracing::warn!("Sonos speaker info for {} unavailable: {}", record.host_ip_address(), e),
        }
    }
}

impl ServiceHandler for ConnectListener {
    fn on_resolved(&self, info: &ServiceInfo) -> Result<()> {
        self.process_record(discovery_record(info))
    }

    fn on_removed(&self, fullname: &str) -> Result<()> {
        let _guard = hold(&self.lock);
        if let Some(removed) = self.directory.remove_by_key(&fullname.to_lowercase())? {
            tracing::info!("Spotify Connect device {} went away", removed.title());
        }
        Ok(())
    }
}

/// System DNS lookup of `host`, bounded by `timeout`
fn resolve_host(host: &str, timeout: Duration) -> Result<IpAddr> {
    let host = host.trim_end_matches('.').to_string();
    let (tx, rx) = flume::bounded(1);
    let lookup_host = host.clone();
    thread::Builder::new()
        .name("dns-lookup".to_string())
        .spawn(move || {
            let address = (lookup_host.as_str(), 0)
                .to_socket_addrs()
                .map(|mut addrs| addrs.find(|a| a.is_ipv4()).map(|a| a.ip()));
            let _ = tx.send(address);
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(Some(address))) => Ok(address),
        Ok(Ok(None)) => Err(DirectoryError::Discovery(format!("{} has no IPv4 address", host))),
        Ok(Err(e)) => Err(DirectoryError::Io(e)),
        Err(_) => Err(DirectoryError::timeout(format!("DNS lookup of {}", host), timeout)),
    }
}
