use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use shared::protocol::{TXT_CPATH, TXT_VERSION};
use shared::types::DiscoveryRecord;
use crate::error::{DirectoryError, Result};

const RECV_POLL: Duration = Duration::from_millis(500);

/// Serialises callback processing across both service families. Always taken
/// before any directory command, never the other way round.
pub type DiscoveryLock = Arc<Mutex<()>>;

pub fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reacts to one service family's advertisements
pub trait ServiceHandler: Send + Sync {
    fn on_resolved(&self, info: &ServiceInfo) -> Result<()>;
    fn on_removed(&self, fullname: &str) -> Result<()>;
}

/// A browse of one service type drained by its own thread
pub struct Listener {
    service_type: String,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Listener {
    pub fn start(daemon: &ServiceDaemon, service_type: &str, handler: Arc<dyn ServiceHandler>) -> Result<Self> {
        let receiver = daemon
            .browse(service_type)
            .map_err(|e| DirectoryError::Discovery(format!("browse {}: {}", service_type, e)))?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = stop.clone();
            let service_type = service_type.to_string();
            thread::Builder::new()
                .name(format!("mdns {}", service_type))
                .spawn(move || run_listener(&service_type, receiver, handler.as_ref(), &stop))?
        };
        tracing::info!("Browsing for {}", service_type);

        Ok(Self {
            service_type: service_type.to_string(),
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self, daemon: &ServiceDaemon) {
        if let Err(e) = daemon.stop_browse(&self.service_type) {
            tracing::debug!("stop_browse {}: {}", self.service_type, e);
        }
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("Listener thread for {} panicked", self.service_type);
            }
        }
        tracing::info!("Stopped browsing for {}", self.service_type);
    }
}

fn run_listener(
    service_type: &str,
    receiver: flume::Receiver<ServiceEvent>,
    handler: &dyn ServiceHandler,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::SeqCst) {
        let event = match receiver.recv_timeout(RECV_POLL) {
            Ok(event) => event,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => {
                tracing::warn!("mDNS receiver for {} disconnected", service_type);
                break;
            }
        };
        let result = match &event {
            ServiceEvent::ServiceResolved(info) => {
                tracing::debug!("Resolved service: {}", info.get_fullname());
                handler.on_resolved(info)
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                tracing::debug!("Service removed: {}", fullname);
                handler.on_removed(fullname)
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!("Error handling {} notification: {}", service_type, e);
        }
    }
}

/// TXT records with lower-cased keys
pub fn txt_properties(info: &ServiceInfo) -> BTreeMap<String, String> {
    info.get_properties()
        .iter()
        .map(|prop| (prop.key().to_ascii_lowercase(), prop.val_str().to_string()))
        .collect()
}

/// Instance name without the service type suffix
pub fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

/// Convert a resolved advertisement into a DiscoveryRecord. Only IPv4
/// addresses are kept, in ascending order.
pub fn discovery_record(info: &ServiceInfo) -> DiscoveryRecord {
    let mut addresses: Vec<IpAddr> = info
        .get_addresses()
        .iter()
        .filter(|addr| addr.is_ipv4())
        .copied()
        .collect();
    addresses.sort();

    let properties = txt_properties(info);
    let fullname = info.get_fullname();
    DiscoveryRecord {
        device_name: instance_name(fullname, info.get_type()),
        key: fullname.to_lowercase(),
        name: fullname.to_string(),
        server: info.get_hostname().to_string(),
        host_ip_addresses: addresses,
        host_ip_port: info.get_port(),
        service_type: Some(info.get_type().to_string()),
        cpath: properties.get(TXT_CPATH).cloned().unwrap_or_default(),
        version: properties.get(TXT_VERSION).cloned(),
        properties,
        ..Default::default()
    }
}
