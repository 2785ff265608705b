//! The directory task: owns the device directory, runs discovery in the
//! background and performs cast activations on request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use shared::protocol::CAST_TOKEN_TYPE;
use shared::types::{DirectoryEntry, DirectorySnapshot, ProtocolOutcome, RemoteDevice, ResponseKind};
use crate::cast::{CastSession, CastTransport, SessionContext, SessionLink};
use crate::config::{ActivationConfig, Config};
use crate::directory::{DeviceDirectory, DirectoryEvent};
use crate::directory_manager::{DeviceObserver, DirectoryHandle};
use crate::error::{DirectoryError, Result};
use crate::mdns::{DiscoveryBackend, MdnsDiscovery};
use crate::signal::Signal;
use crate::webapi::{DeviceAuth, SpeakerFamily, TokenProvider, WebApi};
use crate::zeroconf::ZeroconfClient;

const STOP_POLL: Duration = Duration::from_millis(500);
const GRACE_SLICE: Duration = Duration::from_millis(100);

const DEFAULT_ACTIVATION_SECS: f64 = 15.0;
const MAX_ACTIVATION_SECS: f64 = 30.0;
const DEFAULT_TRANSFER_SECS: f64 = 10.0;
const MAX_TRANSFER_SECS: f64 = 20.0;

/// External services the directory task talks to
#[derive(Clone)]
pub struct Collaborators {
    pub web_api: Arc<dyn WebApi>,
    pub tokens: Arc<dyn TokenProvider>,
    pub device_auth: Arc<dyn DeviceAuth>,
    pub transport: Arc<dyn CastTransport>,
    pub speakers: Option<Arc<dyn SpeakerFamily>>,
}

/// Bounded waits of one activation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivationTimeouts {
    pub activation: Duration,
    pub transfer: Duration,
}

/// Negative delays fall back to the default, long ones are capped
fn validate_delay(secs: f64, default: f64, max: f64) -> Duration {
    let secs = if !secs.is_finite() || secs < 0.0 {
        default
    } else {
        secs.min(max)
    };
    Duration::from_secs_f64(secs)
}

impl ActivationTimeouts {
    pub fn new(activation_secs: f64, transfer_secs: f64) -> Self {
        Self {
            activation: validate_delay(activation_secs, DEFAULT_ACTIVATION_SECS, MAX_ACTIVATION_SECS),
            transfer: validate_delay(transfer_secs, DEFAULT_TRANSFER_SECS, MAX_TRANSFER_SECS),
        }
    }
}

impl Default for ActivationTimeouts {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVATION_SECS, DEFAULT_TRANSFER_SECS)
    }
}

impl From<&ActivationConfig> for ActivationTimeouts {
    fn from(config: &ActivationConfig) -> Self {
        Self::new(config.activation_timeout_secs as f64, config.transfer_timeout_secs as f64)
    }
}

fn protocol_error(operation: &str, outcome: &ProtocolOutcome) -> DirectoryError {
    DirectoryError::Protocol {
        operation: outcome.kind.map(|k| k.as_str().to_string()).unwrap_or_else(|| operation.to_string()),
        status: outcome.status,
        status_string: outcome.status_string.clone(),
        spotify_error: outcome.spotify_error,
    }
}

/// Clears the in-progress flag when an activation ends
struct ActivationGuard<'a>(&'a AtomicBool);

impl<'a> ActivationGuard<'a> {
    fn acquire(flag: &'a AtomicBool, title: &str) -> Result<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(DirectoryError::Busy(format!(
                "another activation is in progress; {} was not activated",
                title
            )));
        }
        Ok(Self(flag))
    }
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct DirectoryTask {
    config: Config,
    directory: DirectoryHandle,
    collaborators: Collaborators,
    ready: Arc<Signal<()>>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    sessions: Mutex<HashMap<String, CastSession>>,
    activating: AtomicBool,
    zeroconf: ZeroconfClient,
}

impl DirectoryTask {
    /// Start the task with mDNS discovery on the local network
    pub fn start(config: Config, collaborators: Collaborators) -> Result<Self> {
        let discovery = MdnsDiscovery::new(
            config.discovery.self_description_timeout(),
            collaborators.speakers.clone(),
        );
        Self::start_with_discovery(config, collaborators, Box::new(discovery))
    }

    pub fn start_with_discovery(
        config: Config,
        collaborators: Collaborators,
        discovery: Box<dyn DiscoveryBackend>,
    ) -> Result<Self> {
        let directory = DirectoryHandle::spawn(DeviceDirectory::new())?;
        let ready = Arc::new(Signal::new());
        let stop = Arc::new(AtomicBool::new(false));

        let background = Background {
            directory: directory.clone(),
            web_api: collaborators.web_api.clone(),
            login_id: config.account.login_id.clone(),
            discovery_enabled: config.discovery.is_enabled(),
            grace: config.discovery.initial_discovery_timeout(),
            discovery,
            ready: ready.clone(),
            stop: stop.clone(),
        };
        let thread = thread::Builder::new()
            .name("directory-task".to_string())
            .spawn(move || background.run())?;

        let zeroconf = ZeroconfClient::new(config.discovery.self_description_timeout());
        Ok(Self {
            config,
            directory,
            collaborators,
            ready,
            stop,
            thread: Mutex::new(Some(thread)),
            sessions: Mutex::new(HashMap::new()),
            activating: AtomicBool::new(false),
            zeroconf,
        })
    }

    /// True once the initial discovery grace period has passed
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        self.ready.wait(timeout).is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    pub fn directory(&self) -> &DirectoryHandle {
        &self.directory
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, CastSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop every cast session, then discovery, then the directory itself.
    /// Receiver applications are left running.
    pub fn stop(&self) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping directory task");

        let sessions: Vec<CastSession> = self.sessions().drain().map(|(_, session)| session).collect();
        for session in &sessions {
            session.stop();
        }
        for mut session in sessions {
            session.join();
        }

        self.stop.store(true, Ordering::SeqCst);
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Directory task thread panicked");
            }
        }

        if let Err(e) = self.directory.shutdown() {
            tracing::debug!("Directory already closed: {}", e);
        }
        tracing::info!("Directory task stopped");
    }

    pub fn get_devices(&self) -> Result<DirectorySnapshot> {
        self.directory.snapshot()
    }

    /// Resolve `value` (id, name, `"*"` or empty) to a device. With
    /// `refresh` the Web API device list is reconciled first; the playback
    /// state is always consulted.
    pub fn get_device(&self, value: &str, refresh: bool, raise_if_not_found: bool) -> Result<Option<DirectoryEntry>> {
        if refresh {
            self.update_player_devices()?;
        }
        let playing = self.update_active_device()?;
        let default_device_id = self.config.account.default_device_id.as_deref();

        match self.directory.resolve(value, default_device_id, playing) {
            Ok(entry) => Ok(Some(entry)),
            Err(DirectoryError::DeviceNotFound { .. }) if !raise_if_not_found => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get_active_device(&self, refresh: bool) -> Result<Option<DirectoryEntry>> {
        if refresh {
            self.update_active_device()?;
        }
        self.directory.active()
    }

    /// The device as present in the Web API device list, if it is listed
    pub fn get_player_device(&self, value: &str, refresh: bool) -> Result<Option<DirectoryEntry>> {
        if refresh {
            self.update_player_devices()?;
        }
        self.directory.player_device(value.trim())
    }

    /// Reconcile the Web API device list and the playback state; returns the
    /// active device
    pub fn refresh_dynamic_devices(&self) -> Result<Option<DirectoryEntry>> {
        self.update_player_devices()?;
        self.update_active_device()?;
        self.directory.active()
    }

    fn update_player_devices(&self) -> Result<()> {
        refresh_listed(&self.directory, self.collaborators.web_api.as_ref(), &self.config.account.login_id)
    }

    fn update_active_device(&self) -> Result<Option<RemoteDevice>> {
        let playing = self
            .collaborators
            .web_api
            .playback_state()?
            .and_then(|state| state.device);
        self.directory.mark_active(playing.clone())?;
        Ok(playing)
    }

    pub fn add_dynamic_device(&self, device: RemoteDevice) -> Result<bool> {
        self.directory.add_dynamic(device, &self.config.account.login_id)
    }

    pub fn remove_device(&self, id: &str, dynamic_only: bool) -> Result<Option<DirectoryEntry>> {
        self.directory.remove(id, dynamic_only)
    }

    pub fn subscribe(&self) -> Result<flume::Receiver<DirectoryEvent>> {
        self.directory.subscribe()
    }

    pub fn observe(&self, observer: Arc<dyn DeviceObserver>) -> Result<thread::JoinHandle<()>> {
        self.directory.observe(observer)
    }

    pub fn fingerprint(&self) -> String {
        self.directory.fingerprint()
    }

    /// Launch the Spotify application on a cast device, log the account in
    /// and optionally move playback there. Returns the updated entry.
    pub fn activate_and_optionally_transfer(
        &self,
        device: &str,
        transfer: bool,
        timeouts: ActivationTimeouts,
    ) -> Result<DirectoryEntry> {
        let entry = self.find_entry(device)?;
        if !entry.is_cast() {
            return Err(DirectoryError::NotCastDevice(entry.title()));
        }
        if !self.config.discovery.is_enabled() {
            return Err(DirectoryError::DiscoveryDisabled);
        }

        let _guard = ActivationGuard::acquire(&self.activating, &entry.title())?;
        let key = entry.discovery.key.clone();
        tracing::info!("Activating {} (transfer={})", entry.title(), transfer);

        let previous = self.sessions().remove(&key);
        if let Some(mut previous) = previous {
            tracing::debug!("Stopping previous cast session for {}", entry.title());
            previous.stop();
            previous.join();
        }
        self.directory.reset_outcome(&key)?;

        let context = SessionContext {
            directory: self.directory.clone(),
            transport: self.collaborators.transport.clone(),
            web_api: self.collaborators.web_api.clone(),
            tokens: self.collaborators.tokens.clone(),
            device_auth: self.collaborators.device_auth.clone(),
        };
        let session = CastSession::start(context, entry.clone(), transfer)?;

        let result = self.await_session(&session, &entry, transfer, timeouts);
        if !self.stop.load(Ordering::SeqCst) {
            self.sessions().insert(session.key().to_string(), session);
        }
        self.reap_sessions();
        result?;

        self.updated(entry)
    }

    /// Drop sessions whose receiver application or connection went away
    fn reap_sessions(&self) {
        let finished: Vec<CastSession> = {
            let mut sessions = self.sessions();
            let keys: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.is_finished())
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| sessions.remove(key)).collect()
        };
        for session in finished {
            tracing::debug!("Cast session for {} finished ({})", session.key(), session.state());
        }
    }

    /// Link to the running cast session of `entry`, if any
    fn session_link(&self, entry: &DirectoryEntry) -> Option<SessionLink> {
        self.reap_sessions();
        self.sessions().get(&entry.discovery.key).map(CastSession::link)
    }

    /// Directory entry for `value` by name, then by id
    fn find_entry(&self, value: &str) -> Result<DirectoryEntry> {
        let value = value.trim();
        if value.is_empty() {
            return Err(DirectoryError::InvalidArgument("device name is required".to_string()));
        }
        match self.directory.get_by_name(value)? {
            Some(entry) => Ok(entry),
            None => self.directory.get_by_id(value)?.ok_or_else(|| DirectoryError::not_found(value)),
        }
    }

    /// Zeroconf endpoint of a native receiver
    fn native_entry(&self, value: &str) -> Result<DirectoryEntry> {
        let entry = self.find_entry(value)?;
        if entry.is_cast() || entry.is_dynamic() {
            return Err(DirectoryError::InvalidArgument(format!(
                "{} has no zeroconf endpoint",
                entry.title()
            )));
        }
        Ok(entry)
    }

    fn updated(&self, entry: DirectoryEntry) -> Result<DirectoryEntry> {
        Ok(self.directory.get_by_key(&entry.discovery.key)?.unwrap_or(entry))
    }

    /// Ask a receiver for a fresh self-description: over zeroconf for native
    /// receivers, through the running session for activated cast receivers.
    pub fn describe_device(&self, value: &str, timeout: Duration) -> Result<DirectoryEntry> {
        let entry = self.find_entry(value)?;
        if entry.is_cast() {
            let link = self.session_link(&entry).ok_or_else(|| DirectoryError::Launch {
                device: entry.title(),
                message: "no running cast session; activate the device first".to_string(),
            })?;
            link.describe(timeout)?;
            return self.updated(entry);
        }

        let entry = self.native_entry(value)?;
        let info = self.zeroconf.get_information(&entry.discovery)?;
        self.directory.apply_self_description(&entry.discovery.key, info)?;
        self.updated(entry)
    }

    /// Log the account into a receiver. Native receivers get a device token
    /// over zeroconf `addUser`; activated cast receivers get one through
    /// their session.
    pub fn connect_device(&self, value: &str, timeout: Duration) -> Result<DirectoryEntry> {
        let entry = self.find_entry(value)?;
        if entry.is_cast() {
            let link = self.session_link(&entry).ok_or_else(|| DirectoryError::Launch {
                device: entry.title(),
                message: "no running cast session; activate the device first".to_string(),
            })?;
            link.login(timeout)?;
            return self.updated(entry);
        }

        let entry = self.native_entry(value)?;
        let key = entry.discovery.key.clone();
        let info = self.zeroconf.get_information(&entry.discovery)?;
        let access_token = self.collaborators.tokens.current_access_token()?;
        let blob = self
            .collaborators
            .device_auth
            .device_token(&access_token, &info.client_id, &info.device_id)?;

        tracing::info!("Connecting {} to {}", self.config.account.login_id, entry.title());
        let mut outcome = self.zeroconf.add_user_token(
            &entry.discovery,
            &info,
            &self.config.account.login_id,
            &blob,
            CAST_TOKEN_TYPE,
        )?;
        outcome.kind = Some(ResponseKind::AddUserResponse);
        self.directory.record_outcome(&key, outcome)?;

        match self.zeroconf.get_information(&entry.discovery) {
            Ok(info) => {
                self.directory.apply_self_description(&key, info)?;
            }
            Err(e) => tracing::warn!("Could not refresh {} after login: {}", entry.title(), e),
        }
        self.directory.mark_reconnected(&key)?;
        self.updated(entry)
    }

    /// Log every user out of a native receiver, or end the session of a
    /// cast receiver
    pub fn disconnect_device(&self, value: &str) -> Result<DirectoryEntry> {
        let entry = self.find_entry(value)?;
        let key = entry.discovery.key.clone();
        if entry.is_cast() {
            let session = self.sessions().remove(&key);
            if let Some(mut session) = session {
                tracing::info!("Ending cast session for {}", entry.title());
                session.stop();
                session.join();
            }
            self.directory.reset_outcome(&key)?;
            return self.updated(entry);
        }

        let entry = self.native_entry(value)?;
        tracing::info!("Logging all users out of {}", entry.title());
        self.zeroconf.reset_users(&entry.discovery)?;
        self.directory.reset_outcome(&key)?;

        let mut info = entry.description.clone();
        info.active_user.clear();
        self.directory.apply_self_description(&key, info)?;
        self.updated(entry)
    }

    fn await_session(
        &self,
        session: &CastSession,
        entry: &DirectoryEntry,
        transfer: bool,
        timeouts: ActivationTimeouts,
    ) -> Result<()> {
        let outcome = session
            .wait_activation(timeouts.activation)
            .ok_or_else(|| DirectoryError::timeout(format!("activation of {}", entry.title()), timeouts.activation))?;
        match outcome.kind {
            Some(ResponseKind::AddUserResponse) => {}
            Some(ResponseKind::LaunchError) => {
                return Err(DirectoryError::Launch {
                    device: entry.title(),
                    message: outcome.status_string,
                })
            }
            _ => return Err(protocol_error("activation", &outcome)),
        }

        if !transfer {
            return Ok(());
        }
        let outcome = session
            .wait_transfer(timeouts.transfer)
            .ok_or_else(|| DirectoryError::timeout(format!("playback transfer to {}", entry.title()), timeouts.transfer))?;
        match outcome.kind {
            Some(ResponseKind::TransferSuccess) => Ok(()),
            _ => Err(protocol_error("transfer", &outcome)),
        }
    }

    /// Address of the Sonos player to control for `entry`: the group
    /// coordinator when asked for and known, the speaker itself otherwise.
    pub fn sonos_player(&self, entry: &DirectoryEntry, return_coordinator: bool) -> Result<String> {
        if !entry.is_sonos() {
            return Err(DirectoryError::InvalidArgument(format!("{} is not a Sonos device", entry.title())));
        }
        let speakers = self
            .collaborators
            .speakers
            .as_ref()
            .ok_or_else(|| DirectoryError::InvalidArgument("no Sonos speaker control configured".to_string()))?;
        let address = entry.discovery.host_ip_address();
        if !return_coordinator {
            return Ok(address);
        }
        match speakers.group_coordinator(&address)? {
            Some(coordinator) => Ok(coordinator),
            None => {
                tracing::warn!(
                    "Group coordinator of {} could not be determined; using the speaker itself",
                    entry.title()
                );
                Ok(address)
            }
        }
    }
}

impl Drop for DirectoryTask {
    fn drop(&mut self) {
        self.stop();
    }
}

fn refresh_listed(directory: &DirectoryHandle, web_api: &dyn WebApi, login_id: &str) -> Result<()> {
    let devices = web_api.list_player_devices()?;
    directory.reconcile_listed(devices, login_id)
}

/// State moved onto the directory task thread
struct Background {
    directory: DirectoryHandle,
    web_api: Arc<dyn WebApi>,
    login_id: String,
    discovery_enabled: bool,
    grace: Duration,
    discovery: Box<dyn DiscoveryBackend>,
    ready: Arc<Signal<()>>,
    stop: Arc<AtomicBool>,
}

impl Background {
    fn run(mut self) {
        tracing::info!("Directory task started");

        if let Err(e) = self.refresh() {
            tracing::warn!("Initial refresh of player devices failed: {}", e);
        }

        if self.discovery_enabled {
            match self.discovery.start(&self.directory) {
                Ok(()) => tracing::info!("Discovery started; waiting {:?} for devices", self.grace),
                Err(e) => tracing::error!("Discovery could not be started: {}", e),
            }
            let deadline = Instant::now() + self.grace;
            while Instant::now() < deadline && !self.stop.load(Ordering::SeqCst) {
                thread::sleep(GRACE_SLICE.min(deadline.saturating_duration_since(Instant::now())));
            }
        } else {
            tracing::info!("Discovery disabled; only Web API devices will be listed");
        }

        self.log_devices();
        self.ready.set(());

        while !self.stop.load(Ordering::SeqCst) {
            thread::sleep(STOP_POLL);
        }

        self.discovery.stop();
        tracing::info!("Directory task finished");
    }

    fn refresh(&self) -> Result<()> {
        refresh_listed(&self.directory, self.web_api.as_ref(), &self.login_id)?;
        let playing = self.web_api.playback_state()?.and_then(|state| state.device);
        self.directory.mark_active(playing)?;
        Ok(())
    }

    fn log_devices(&self) {
        match self.directory.snapshot() {
            Ok(snapshot) => {
                tracing::info!("{} device(s) known after initial discovery", snapshot.len());
                for entry in snapshot.iter() {
                    tracing::info!("  {} via {}", entry.title(), entry.discovery.description());
                }
            }
            Err(e) => tracing::warn!("Could not list devices: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::PlaybackState;
    use crate::config::DiscoveryConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use crate::directory::tests::{discovered, remote};
    use crate::test_support::{
        cast_entry, serve_sequence, FakeCastTransport, FakeDeviceAuth, FakeSpeakers, FakeWebApi, StaticTokens,
    };

    struct NoDiscovery;

    impl DiscoveryBackend for NoDiscovery {
        fn start(&mut self, _directory: &DirectoryHandle) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self) {}
    }

    fn config(grace_secs: f64) -> Config {
        let mut config = Config::default();
        config.account.login_id = "user1".to_string();
        config.discovery = DiscoveryConfig {
            initial_discovery_timeout_secs: grace_secs,
            ..Default::default()
        };
        config
    }

    fn start_task(grace_secs: f64, web_api: Arc<FakeWebApi>, transport: FakeCastTransport) -> DirectoryTask {
        let collaborators = Collaborators {
            web_api,
            tokens: Arc::new(StaticTokens("account".to_string())),
            device_auth: Arc::new(FakeDeviceAuth),
            transport: Arc::new(transport),
            speakers: Some(Arc::new(FakeSpeakers::default())),
        };
        let task = DirectoryTask::start_with_discovery(config(grace_secs), collaborators, Box::new(NoDiscovery)).unwrap();
        assert!(task.wait_ready(Duration::from_secs(5)));
        task
    }

    #[test]
    fn test_timeouts_are_validated() {
        let timeouts = ActivationTimeouts::new(-1.0, 45.0);
        assert_eq!(timeouts.activation, Duration::from_secs(15));
        assert_eq!(timeouts.transfer, Duration::from_secs(20));

        let timeouts = ActivationTimeouts::new(40.0, 0.0);
        assert_eq!(timeouts.activation, Duration::from_secs(30));
        assert_eq!(timeouts.transfer, Duration::ZERO);
    }

    #[test]
    fn test_startup_lists_web_api_devices() {
        let web_api = Arc::new(FakeWebApi::with_devices(vec![remote(Some("w1"), "Web Player (Chrome)")]));
        *web_api.playing.lock().unwrap() = Some(PlaybackState {
            device: Some(remote(Some("w1"), "Web Player (Chrome)")),
            is_playing: true,
        });
        let task = start_task(0.0, web_api, FakeCastTransport::default());

        let devices = task.get_devices().unwrap();
        assert_eq!(devices.len(), 1);
        let active = task.get_active_device(false).unwrap().unwrap();
        assert_eq!(active.id, "w1");
        assert_eq!(active.description.active_user, "user1");
        task.stop();
    }

    #[test]
    fn test_get_device_not_found() {
        let task = start_task(0.0, Arc::new(FakeWebApi::default()), FakeCastTransport::default());

        assert_eq!(task.get_device("Nowhere", true, false).unwrap(), None);
        assert!(matches!(
            task.get_device("Nowhere", false, true),
            Err(DirectoryError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_dynamic_device_lifecycle() {
        let web_api = Arc::new(FakeWebApi::default());
        let task = start_task(0.0, web_api.clone(), FakeCastTransport::default());

        assert!(task.add_dynamic_device(remote(Some("p1"), "Phone")).unwrap());
        assert_eq!(task.get_player_device("phone", false).unwrap().unwrap().id, "p1");

        // not in the Web API list: dropped on the next refresh
        task.refresh_dynamic_devices().unwrap();
        assert!(task.get_devices().unwrap().is_empty());

        assert!(task.add_dynamic_device(remote(Some("p2"), "Tablet")).unwrap());
        assert_eq!(task.remove_device("p2", true).unwrap().unwrap().name, "Tablet");
    }

    #[test]
    fn test_activation_with_transfer() {
        let transport = FakeCastTransport::default();
        let web_api = Arc::new(transport.web_api());
        let task = start_task(0.05, web_api.clone(), transport);
        let entry = cast_entry("Living Room", "uuid-lr");
        task.directory().upsert_discovered(entry.clone()).unwrap();

        let activated = task
            .activate_and_optionally_transfer("Living Room", true, ActivationTimeouts::new(5.0, 5.0))
            .unwrap();
        assert_eq!(activated.id, entry.id);
        assert!(activated.was_reconnected);
        assert_eq!(web_api.transfers(), vec![entry.id.clone()]);
        task.stop();
    }

    #[test]
    fn test_activation_transfers_to_reported_device_id() {
        let transport = FakeCastTransport {
            reported_device_id: Some("coordinator-id".to_string()),
            ..Default::default()
        };
        let web_api = Arc::new(transport.web_api());
        let task = start_task(0.05, web_api.clone(), transport);
        let entry = cast_entry("Living Room", "uuid-lr");
        task.directory().upsert_discovered(entry.clone()).unwrap();

        let activated = task
            .activate_and_optionally_transfer("Living Room", true, ActivationTimeouts::new(5.0, 5.0))
            .unwrap();
        assert_eq!(activated.id, entry.id);
        assert_eq!(web_api.transfers(), vec!["coordinator-id".to_string()]);
        task.stop();
    }

    #[test]
    fn test_transfer_timeout_keeps_activation_outcome() {
        let transport = FakeCastTransport {
            silent_transfer: true,
            ..Default::default()
        };
        let task = start_task(0.05, Arc::new(transport.web_api()), transport);
        let entry = cast_entry("Kitchen", "uuid-k");
        task.directory().upsert_discovered(entry.clone()).unwrap();

        let result = task.activate_and_optionally_transfer("Kitchen", true, ActivationTimeouts::new(5.0, 1.0));
        assert!(matches!(result, Err(DirectoryError::Timeout { .. })), "{:?}", result);

        let stored = task.directory().get_by_key("uuid-k").unwrap().unwrap();
        assert_eq!(stored.outcome.kind, Some(ResponseKind::AddUserResponse));
        task.stop();
    }

    #[test]
    fn test_launch_error_surfaces() {
        let transport = FakeCastTransport {
            launch_error: true,
            ..Default::default()
        };
        let task = start_task(0.05, Arc::new(FakeWebApi::default()), transport);
        task.directory().upsert_discovered(cast_entry("Kitchen", "uuid-k")).unwrap();

        let result = task.activate_and_optionally_transfer(&crate::cast::device_id_for("Kitchen"), false, ActivationTimeouts::default());
        assert!(matches!(result, Err(DirectoryError::Launch { .. })), "{:?}", result);
    }

    #[test]
    fn test_activation_preconditions() {
        let task = start_task(0.05, Arc::new(FakeWebApi::default()), FakeCastTransport::default());
        task.add_dynamic_device(remote(Some("p1"), "Phone")).unwrap();
        task.directory().upsert_discovered(cast_entry("Kitchen", "uuid-k")).unwrap();

        assert!(matches!(
            task.activate_and_optionally_transfer("", false, ActivationTimeouts::default()),
            Err(DirectoryError::InvalidArgument(_))
        ));
        assert!(matches!(
            task.activate_and_optionally_transfer("Attic", false, ActivationTimeouts::default()),
            Err(DirectoryError::DeviceNotFound { .. })
        ));
        assert!(matches!(
            task.activate_and_optionally_transfer("Phone", false, ActivationTimeouts::default()),
            Err(DirectoryError::NotCastDevice(_))
        ));

        task.activating.store(true, Ordering::SeqCst);
        assert!(matches!(
            task.activate_and_optionally_transfer("Kitchen", false, ActivationTimeouts::default()),
            Err(DirectoryError::Busy(_))
        ));
    }

    #[test]
    fn test_activation_requires_discovery() {
        let task = start_task(0.0, Arc::new(FakeWebApi::default()), FakeCastTransport::default());
        task.directory().upsert_discovered(cast_entry("Kitchen", "uuid-k")).unwrap();

        assert!(matches!(
            task.activate_and_optionally_transfer("Kitchen", false, ActivationTimeouts::default()),
            Err(DirectoryError::DiscoveryDisabled)
        ));
    }

    #[test]
    fn test_finished_sessions_are_reaped() {
        let transport = FakeCastTransport {
            close_app_after_activation: true,
            ..Default::default()
        };
        let task = start_task(0.05, Arc::new(transport.web_api()), transport);
        task.directory().upsert_discovered(cast_entry("Kitchen", "uuid-k")).unwrap();

        task.activate_and_optionally_transfer("Kitchen", false, ActivationTimeouts::new(5.0, 5.0))
            .unwrap();
        for _ in 0..100 {
            if task.sessions().values().all(CastSession::is_finished) {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        // the receiver closed the application; there is nothing to log into
        let result = task.connect_device("Kitchen", Duration::from_secs(1));
        assert!(matches!(result, Err(DirectoryError::Launch { .. })), "{:?}", result);
        assert!(task.sessions().is_empty());
        task.stop();
    }

    #[test]
    fn test_cast_describe_and_connect_use_running_session() {
        let transport = FakeCastTransport::default();
        let task = start_task(0.05, Arc::new(transport.web_api()), transport);
        task.directory().upsert_discovered(cast_entry("Kitchen", "uuid-k")).unwrap();

        assert!(matches!(
            task.describe_device("Kitchen", Duration::from_secs(1)),
            Err(DirectoryError::Launch { .. })
        ));
        task.activate_and_optionally_transfer("Kitchen", false, ActivationTimeouts::new(5.0, 5.0))
            .unwrap();

        let described = task.describe_device("Kitchen", Duration::from_secs(2)).unwrap();
        assert_eq!(described.description.client_id, "cid");
        let connected = task.connect_device("Kitchen", Duration::from_secs(2)).unwrap();
        assert_eq!(connected.outcome.kind, Some(ResponseKind::AddUserResponse));
        assert!(connected.was_reconnected);

        let disconnected = task.disconnect_device("Kitchen").unwrap();
        assert_eq!(disconnected.outcome.kind, None);
        assert!(task.sessions().is_empty());
        task.stop();
    }

    fn native_entry(port: u16) -> DirectoryEntry {
        let mut entry = discovered("D1", "Office", "office-key");
        entry.discovery.host_ip_addresses = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
        entry.discovery.host_ip_port = port;
        entry
    }

    const NATIVE_INFO: &str = r#"{"status":101,"statusString":"OK","spotifyError":0,"deviceID":"D1","clientID":"C1","remoteName":"Office","activeUser":""}"#;
    const NATIVE_INFO_LOGGED_IN: &str = r#"{"status":101,"statusString":"OK","spotifyError":0,"deviceID":"D1","clientID":"C1","remoteName":"Office","activeUser":"user1"}"#;
    const NATIVE_OK: &str = r#"{"status":101,"statusString":"OK","spotifyError":0}"#;

    #[test]
    fn test_connect_native_device_over_zeroconf() {
        let (port, server) = serve_sequence(vec![
            ("200 OK", NATIVE_INFO),
            ("200 OK", NATIVE_OK),
            ("200 OK", NATIVE_INFO_LOGGED_IN),
        ]);
        let task = start_task(0.0, Arc::new(FakeWebApi::default()), FakeCastTransport::default());
        task.directory().upsert_discovered(native_entry(port)).unwrap();

        let entry = task.connect_device("Office", Duration::from_secs(4)).unwrap();
        assert_eq!(entry.description.active_user, "user1");
        assert_eq!(entry.outcome.kind, Some(ResponseKind::AddUserResponse));
        assert!(entry.was_reconnected);

        let requests = server.join().unwrap();
        assert!(requests[0].starts_with("GET /zc?action=getInfo"));
        assert!(requests[1].starts_with("POST /zc "));
        assert!(requests[1].contains("blob=device-token%3Aaccount%3AC1%3AD1"), "{}", requests[1]);
        assert!(requests[1].contains("loginId=user1"));
        assert!(requests[1].contains("clientID=C1"));
        assert!(requests[1].contains("deviceID=D1"));
        task.stop();
    }

    #[test]
    fn test_disconnect_native_device_resets_users() {
        let (port, server) = serve_sequence(vec![("200 OK", "")]);
        let task = start_task(0.0, Arc::new(FakeWebApi::default()), FakeCastTransport::default());
        let mut entry = native_entry(port);
        entry.description.active_user = "user1".to_string();
        task.directory().upsert_discovered(entry).unwrap();

        let entry = task.disconnect_device("D1").unwrap();
        assert_eq!(entry.description.active_user, "");
        assert!(!entry.was_reconnected);

        let requests = server.join().unwrap();
        assert!(requests[0].contains("action=resetUsers"));
        task.stop();
    }

    #[test]
    fn test_describe_native_device() {
        let (port, _server) = serve_sequence(vec![("200 OK", NATIVE_INFO_LOGGED_IN)]);
        let task = start_task(0.0, Arc::new(FakeWebApi::default()), FakeCastTransport::default());
        task.directory().upsert_discovered(native_entry(port)).unwrap();
        task.add_dynamic_device(remote(Some("p1"), "Phone")).unwrap();

        let entry = task.describe_device("Office", Duration::from_secs(4)).unwrap();
        assert_eq!(entry.description.active_user, "user1");
        assert_eq!(entry.description.client_id, "C1");

        assert!(matches!(
            task.connect_device("Phone", Duration::from_secs(1)),
            Err(DirectoryError::InvalidArgument(_))
        ));
        task.stop();
    }

    #[test]
    fn test_sonos_player_falls_back_without_coordinator() {
        let task = start_task(0.0, Arc::new(FakeWebApi::default()), FakeCastTransport::default());
        let mut entry = cast_entry("Den", "uuid-den");
        entry.description.brand_display_name = "Sonos".to_string();

        assert_eq!(task.sonos_player(&entry, true).unwrap(), "192.168.1.40");
        assert!(task.sonos_player(&cast_entry("Kitchen", "k"), true).is_err());
    }
}
