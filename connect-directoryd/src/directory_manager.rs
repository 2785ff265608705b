use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tokio::sync::watch;
use shared::types::{
    DirectoryEntry, DirectorySnapshot, DiscoveryRecord, ProtocolOutcome, RemoteDevice,
    SelfDescription,
};
use crate::directory::{DeviceDirectory, DirectoryEvent};
use crate::error::{DirectoryError, Result};

type Reply<T> = flume::Sender<T>;

/// Commands sent to the directory thread
enum DirectoryCommand {
    Snapshot(Reply<DirectorySnapshot>),
    GetById(String, Reply<Option<DirectoryEntry>>),
    GetByName(String, Reply<Option<DirectoryEntry>>),
    GetByKey(String, Reply<Option<DirectoryEntry>>),
    GetByServiceName(String, Reply<Option<DirectoryEntry>>),
    Active(Reply<Option<DirectoryEntry>>),
    PlayerDevice(String, Reply<Option<DirectoryEntry>>),
    Resolve {
        value: String,
        default_device_id: Option<String>,
        playing: Option<RemoteDevice>,
        reply: Reply<Result<DirectoryEntry>>,
    },
    AddDynamic {
        device: RemoteDevice,
        active_user: String,
        reply: Reply<bool>,
    },
    ReconcileListed {
        devices: Vec<RemoteDevice>,
        active_user: String,
        reply: Reply<()>,
    },
    MarkActive(Option<RemoteDevice>, Reply<Option<DirectoryEntry>>),
    UpsertDiscovered(DirectoryEntry, Reply<()>),
    UpdateDiscovery(DiscoveryRecord, Reply<bool>),
    RemoveByKey(String, Reply<Option<DirectoryEntry>>),
    RemoveByServiceName(String, Reply<Option<DirectoryEntry>>),
    Remove {
        id: String,
        dynamic_only: bool,
        reply: Reply<Option<DirectoryEntry>>,
    },
    ApplySelfDescription {
        key: String,
        info: SelfDescription,
        reply: Reply<bool>,
    },
    RecordOutcome {
        key: String,
        outcome: ProtocolOutcome,
        reply: Reply<bool>,
    },
    ResetOutcome(String, Reply<bool>),
    MarkReconnected(String, Reply<bool>),
    Subscribe(flume::Sender<DirectoryEvent>, Reply<()>),
    Shutdown,
}

/// Typed receiver of directory change notifications.
///
/// Callbacks run on a dedicated dispatch thread; a panic in one is logged and
/// the next event is still delivered.
pub trait DeviceObserver: Send + Sync {
    fn on_added(&self, _entry: &DirectoryEntry) {}
    fn on_removed(&self, _entry: &DirectoryEntry) {}
    fn on_updated(&self, _entry: &DirectoryEntry) {}
}

struct DirectoryActor {
    directory: DeviceDirectory,
    subscribers: Vec<flume::Sender<DirectoryEvent>>,
    hash_tx: watch::Sender<String>,
}

impl DirectoryActor {
    fn publish(&mut self, events: Vec<DirectoryEvent>) {
        for event in events {
            tracing::debug!("Device {}: {}", event.label(), event.entry().title());
            self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Publish events and the new fingerprint. Runs before the reply is sent,
    /// so a caller never observes its own mutation ahead of subscribers.
    fn commit(&mut self, events: Vec<DirectoryEvent>) {
        self.publish(events);
        let fingerprint = self.directory.fingerprint();
        self.hash_tx.send_if_modified(|current| {
            if *current == fingerprint {
                false
            } else {
                *current = fingerprint;
                true
            }
        });
    }

    fn run(mut self, rx: flume::Receiver<DirectoryCommand>) {
        while let Ok(cmd) = rx.recv() {
            match cmd {
                DirectoryCommand::Snapshot(reply) => {
                    let _ = reply.send(self.directory.snapshot());
                }
                DirectoryCommand::GetById(id, reply) => {
                    let _ = reply.send(self.directory.get_by_id(&id));
                }
                DirectoryCommand::GetByName(name, reply) => {
                    let _ = reply.send(self.directory.get_by_name(&name));
                }
                DirectoryCommand::GetByKey(key, reply) => {
                    let _ = reply.send(self.directory.get_by_key(&key));
                }
                DirectoryCommand::GetByServiceName(name, reply) => {
                    let _ = reply.send(self.directory.get_by_service_name(&name));
                }
                DirectoryCommand::Active(reply) => {
                    let _ = reply.send(self.directory.active());
                }
                DirectoryCommand::PlayerDevice(value, reply) => {
                    let _ = reply.send(self.directory.player_device(&value));
                }
                DirectoryCommand::Resolve { value, default_device_id, playing, reply } => {
                    let result = self.directory.resolve(&value, default_device_id.as_deref(), playing.as_ref());
                    let _ = reply.send(result);
                }
                DirectoryCommand::AddDynamic { device, active_user, reply } => {
                    let event = self.directory.add_dynamic(&device, &active_user);
                    let added = event.is_some();
                    self.commit(event.into_iter().collect());
                    let _ = reply.send(added);
                }
                DirectoryCommand::ReconcileListed { devices, active_user, reply } => {
                    let events = self.directory.reconcile_listed(&devices, &active_user);
                    self.commit(events);
                    let _ = reply.send(());
                }
                DirectoryCommand::MarkActive(device, reply) => {
                    let active = self.directory.mark_active(device.as_ref());
                    self.commit(Vec::new());
                    let _ = reply.send(active);
                }
                DirectoryCommand::UpsertDiscovered(entry, reply) => {
                    let events = self.directory.upsert_discovered(entry);
                    self.commit(events);
                    let _ = reply.send(());
                }
                DirectoryCommand::UpdateDiscovery(record, reply) => {
                    let event = self.directory.update_discovery(record);
                    let changed = event.is_some();
                    self.commit(event.into_iter().collect());
                    let _ = reply.send(changed);
                }
                DirectoryCommand::RemoveByKey(key, reply) => {
                    let event = self.directory.remove_by_key(&key);
                    let removed = event.as_ref().map(|e| e.entry().clone());
                    self.commit(event.into_iter().collect());
                    let _ = reply.send(removed);
                }
                DirectoryCommand::RemoveByServiceName(name, reply) => {
                    let event = self.directory.remove_by_service_name(&name);
                    let removed = event.as_ref().map(|e| e.entry().clone());
                    self.commit(event.into_iter().collect());
                    let _ = reply.send(removed);
                }
                DirectoryCommand::Remove { id, dynamic_only, reply } => {
                    let event = self.directory.remove(&id, dynamic_only);
                    let removed = event.as_ref().map(|e| e.entry().clone());
                    self.commit(event.into_iter().collect());
                    let _ = reply.send(removed);
                }
                DirectoryCommand::ApplySelfDescription { key, info, reply } => {
                    let event = self.directory.apply_self_description(&key, info);
                    let found = event.is_some();
                    self.commit(event.into_iter().collect());
                    let _ = reply.send(found);
                }
                DirectoryCommand::RecordOutcome { key, outcome, reply } => {
                    let event = self.directory.record_outcome(&key, outcome);
                    let found = event.is_some();
                    self.commit(event.into_iter().collect());
                    let _ = reply.send(found);
                }
                DirectoryCommand::ResetOutcome(key, reply) => {
                    let found = self.directory.reset_outcome(&key);
                    self.commit(Vec::new());
                    let _ = reply.send(found);
                }
                DirectoryCommand::MarkReconnected(key, reply) => {
                    let event = self.directory.mark_reconnected(&key);
                    let found = event.is_some();
                    self.commit(event.into_iter().collect());
                    let _ = reply.send(found);
                }
                DirectoryCommand::Subscribe(tx, reply) => {
                    self.subscribers.push(tx);
                    let _ = reply.send(());
                }
                DirectoryCommand::Shutdown => {
                    tracing::info!("Directory thread shutting down");
                    break;
                }
            }
        }
    }
}

/// Handle to the thread that owns the device directory
#[derive(Clone)]
pub struct DirectoryHandle {
    tx: flume::Sender<DirectoryCommand>,
    hash_rx: watch::Receiver<String>,
}

impl DirectoryHandle {
    /// Spawn the directory thread around the given (usually empty) directory
    pub fn spawn(directory: DeviceDirectory) -> Result<Self> {
        let (tx, rx) = flume::unbounded::<DirectoryCommand>();
        let (hash_tx, hash_rx) = watch::channel(directory.fingerprint());

        let actor = DirectoryActor {
            directory,
            subscribers: Vec::new(),
            hash_tx,
        };
        thread::Builder::new()
            .name("device-directory".to_string())
            .spawn(move || actor.run(rx))?;

        Ok(Self { tx, hash_rx })
    }

    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> DirectoryCommand) -> Result<T> {
        let (reply, rx) = flume::bounded(1);
        self.tx
            .send(build(reply))
            .map_err(|_| DirectoryError::DirectoryClosed)?;
        rx.recv().map_err(|_| DirectoryError::DirectoryClosed)
    }

    /// Deep copy of every entry
    pub fn snapshot(&self) -> Result<DirectorySnapshot> {
        self.request(DirectoryCommand::Snapshot)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<DirectoryEntry>> {
        self.request(|reply| DirectoryCommand::GetById(id.to_string(), reply))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<DirectoryEntry>> {
        self.request(|reply| DirectoryCommand::GetByName(name.to_string(), reply))
    }

    pub fn get_by_key(&self, key: &str) -> Result<Option<DirectoryEntry>> {
        self.request(|reply| DirectoryCommand::GetByKey(key.to_string(), reply))
    }

    pub fn get_by_service_name(&self, name: &str) -> Result<Option<DirectoryEntry>> {
        self.request(|reply| DirectoryCommand::GetByServiceName(name.to_string(), reply))
    }

    pub fn active(&self) -> Result<Option<DirectoryEntry>> {
        self.request(DirectoryCommand::Active)
    }

    pub fn player_device(&self, value: &str) -> Result<Option<DirectoryEntry>> {
        self.request(|reply| DirectoryCommand::PlayerDevice(value.to_string(), reply))
    }

    pub fn resolve(
        &self,
        value: &str,
        default_device_id: Option<&str>,
        playing: Option<RemoteDevice>,
    ) -> Result<DirectoryEntry> {
        self.request(|reply| DirectoryCommand::Resolve {
            value: value.to_string(),
            default_device_id: default_device_id.map(str::to_string),
            playing,
            reply,
        })?
    }

    /// Returns true when a new entry was created
    pub fn add_dynamic(&self, device: RemoteDevice, active_user: &str) -> Result<bool> {
        self.request(|reply| DirectoryCommand::AddDynamic {
            device,
            active_user: active_user.to_string(),
            reply,
        })
    }

    pub fn reconcile_listed(&self, devices: Vec<RemoteDevice>, active_user: &str) -> Result<()> {
        self.request(|reply| DirectoryCommand::ReconcileListed {
            devices,
            active_user: active_user.to_string(),
            reply,
        })
    }

    pub fn mark_active(&self, device: Option<RemoteDevice>) -> Result<Option<DirectoryEntry>> {
        self.request(|reply| DirectoryCommand::MarkActive(device, reply))
    }

    pub fn upsert_discovered(&self, entry: DirectoryEntry) -> Result<()> {
        self.request(|reply| DirectoryCommand::UpsertDiscovered(entry, reply))
    }

    /// Returns true when the advertisement changed
    pub fn update_discovery(&self, record: DiscoveryRecord) -> Result<bool> {
        self.request(|reply| DirectoryCommand::UpdateDiscovery(record, reply))
    }

    pub fn remove_by_key(&self, key: &str) -> Result<Option<DirectoryEntry>> {
        self.request(|reply| DirectoryCommand::RemoveByKey(key.to_string(), reply))
    }

    pub fn remove_by_service_name(&self, name: &str) -> Result<Option<DirectoryEntry>> {
        self.request(|reply| DirectoryCommand::RemoveByServiceName(name.to_string(), reply))
    }

    pub fn remove(&self, id: &str, dynamic_only: bool) -> Result<Option<DirectoryEntry>> {
        self.request(|reply| DirectoryCommand::Remove {
            id: id.to_string(),
            dynamic_only,
            reply,
        })
    }

    pub fn apply_self_description(&self, key: &str, info: SelfDescription) -> Result<bool> {
        self.request(|reply| DirectoryCommand::ApplySelfDescription {
            key: key.to_string(),
            info,
            reply,
        })
    }

    pub fn record_outcome(&self, key: &str, outcome: ProtocolOutcome) -> Result<bool> {
        self.request(|reply| DirectoryCommand::RecordOutcome {
            key: key.to_string(),
            outcome,
            reply,
        })
    }

    pub fn reset_outcome(&self, key: &str) -> Result<bool> {
        self.request(|reply| DirectoryCommand::ResetOutcome(key.to_string(), reply))
    }

    pub fn mark_reconnected(&self, key: &str) -> Result<bool> {
        self.request(|reply| DirectoryCommand::MarkReconnected(key.to_string(), reply))
    }

    /// Current directory fingerprint (see `directory::hash`)
    pub fn fingerprint(&self) -> String {
        self.hash_rx.borrow().clone()
    }

    pub fn fingerprint_receiver(&self) -> watch::Receiver<String> {
        self.hash_rx.clone()
    }

    /// Every event from now on. The channel closes when the directory shuts down.
    pub fn subscribe(&self) -> Result<flume::Receiver<DirectoryEvent>> {
        let (tx, rx) = flume::unbounded();
        self.request(|reply| DirectoryCommand::Subscribe(tx, reply))?;
        Ok(rx)
    }

    /// Deliver events to `observer` on its own thread
    pub fn observe(&self, observer: Arc<dyn DeviceObserver>) -> Result<thread::JoinHandle<()>> {
        let rx = self.subscribe()?;
        let handle = thread::Builder::new()
            .name("directory-observer".to_string())
            .spawn(move || {
                for event in rx.iter() {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &event {
                        DirectoryEvent::Added(entry) => observer.on_added(entry),
                        DirectoryEvent::Removed(entry) => observer.on_removed(entry),
                        DirectoryEvent::Updated(entry) => observer.on_updated(entry),
                    }));
                    if outcome.is_err() {
                        tracing::error!("Directory observer panicked handling {}", event.entry().title());
                    }
                }
            })?;
        Ok(handle)
    }

    /// Stop the directory thread
    pub fn shutdown(&self) -> Result<()> {
        self.tx
            .send(DirectoryCommand::Shutdown)
            .map_err(|_| DirectoryError::DirectoryClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use crate::directory::tests::{discovered, remote};

    #[test]
    fn test_spawn_returns_running_handle() {
        let handle: Result<DirectoryHandle> = DirectoryHandle::spawn(DeviceDirectory::new());
        let handle = handle.unwrap();
        assert!(handle.snapshot().unwrap().is_empty());

        // thread spawn failures surface as I/O errors
        let spawn_error: DirectoryError = std::io::Error::from(std::io::ErrorKind::OutOfMemory).into();
        assert!(matches!(spawn_error, DirectoryError::Io(_)));
        handle.shutdown().unwrap();
    }

    #[test]
    fn test_events_precede_reply() {
        let handle = DirectoryHandle::spawn(DeviceDirectory::new()).unwrap();
        let events = handle.subscribe().unwrap();

        handle.upsert_discovered(discovered("d1", "Office", "k1")).unwrap();
        match events.try_recv() {
            Ok(DirectoryEvent::Added(entry)) => assert_eq!(entry.id, "d1"),
            other => panic!("expected Added before reply, got {:?}", other),
        }

        handle.remove_by_key("k1").unwrap();
        assert!(matches!(events.try_recv(), Ok(DirectoryEvent::Removed(_))));
        handle.shutdown().unwrap();
    }

    #[test]
    fn test_office_discovery_scenario() {
        let handle = DirectoryHandle::spawn(DeviceDirectory::new()).unwrap();
        handle.upsert_discovered(discovered("D1", "Office", "K1")).unwrap();

        let entry = handle.resolve("Office", None, None).unwrap();
        assert_eq!(entry.id, "D1");

        handle.remove_by_key("K1").unwrap();
        assert!(handle.get_by_name("Office").unwrap().is_none());
        assert!(matches!(
            handle.resolve("Office", None, None),
            Err(DirectoryError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_snapshot_isolation() {
        let handle = DirectoryHandle::spawn(DeviceDirectory::new()).unwrap();
        handle.upsert_discovered(discovered("d1", "Office", "k1")).unwrap();

        let mut snapshot = handle.snapshot().unwrap();
        snapshot.items[0].name = "Garage".to_string();
        snapshot.items.clear();

        let again = handle.snapshot().unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again.items[0].name, "Office");
    }

    #[test]
    fn test_fingerprint_follows_mutations() {
        let handle = DirectoryHandle::spawn(DeviceDirectory::new()).unwrap();
        let empty = handle.fingerprint();

        handle.upsert_discovered(discovered("d1", "Office", "k1")).unwrap();
        let one = handle.fingerprint();
        assert_ne!(empty, one);

        handle.mark_active(Some(remote(Some("d1"), "Office"))).unwrap();
        let active = handle.fingerprint();
        assert_ne!(one, active);

        let mut hash_rx = handle.fingerprint_receiver();
        hash_rx.borrow_and_update();
        assert!(handle.mark_reconnected("k1").unwrap());
        assert!(hash_rx.has_changed().unwrap());
        assert_ne!(active, handle.fingerprint());

        handle.remove_by_key("k1").unwrap();
        assert_eq!(empty, handle.fingerprint());
    }

    struct CountingObserver {
        seen: AtomicUsize,
        done: flume::Sender<usize>,
    }

    impl DeviceObserver for CountingObserver {
        fn on_added(&self, _entry: &DirectoryEntry) {
            let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                panic!("first observer call fails");
            }
            let _ = self.done.send(n);
        }
    }

    #[test]
    fn test_panicking_observer_keeps_receiving() {
        let handle = DirectoryHandle::spawn(DeviceDirectory::new()).unwrap();
        let (done_tx, done_rx) = flume::unbounded();
        handle
            .observe(Arc::new(CountingObserver { seen: AtomicUsize::new(0), done: done_tx }))
            .unwrap();

        handle.upsert_discovered(discovered("d1", "Office", "k1")).unwrap();
        handle.upsert_discovered(discovered("d2", "Kitchen", "k2")).unwrap();

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert_eq!(handle.snapshot().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_mutations_and_queries() {
        let handle = DirectoryHandle::spawn(DeviceDirectory::new()).unwrap();
        let events = handle.subscribe().unwrap();
        let mut workers = Vec::new();

        for worker in 0..4 {
            let handle = handle.clone();
            workers.push(thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("k{}", i % 10);
                    let name = format!("Speaker {}", i % 10);
                    match (i + worker) % 5 {
                        0 => handle.upsert_discovered(discovered(&format!("d{}", i % 10), &name, &key)).unwrap(),
                        1 => {
                            handle.remove_by_key(&key).unwrap();
                        }
                        2 => {
                            let mut entry = discovered(&format!("d{}", i % 10), &name, &key);
                            entry.discovery.host_ip_port = 8200 + (i as u16);
                            handle.update_discovery(entry.discovery).unwrap();
                        }
                        3 => handle
                            .reconcile_listed(vec![remote(Some(&format!("p{}", i % 3)), "Phone")], "")
                            .unwrap(),
                        _ => {
                            handle.mark_active(Some(remote(Some(&format!("d{}", i % 10)), &name))).unwrap();
                        }
                    }
                }
            }));
        }

        for _ in 0..2 {
            let handle = handle.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = handle.snapshot().unwrap();
                    let keys: HashSet<&str> = snapshot.iter().map(|e| e.discovery.key.as_str()).collect();
                    assert_eq!(keys.len(), snapshot.len(), "duplicate discovery keys");
                    assert!(snapshot.iter().filter(|e| e.is_active).count() <= 1);
                    let _ = handle.resolve("*", Some("d1"), None);
                }
            }));
        }

        for worker in workers {
            worker.join().unwrap();
        }

        let snapshot = handle.snapshot().unwrap();
        let keys: HashSet<&str> = snapshot.iter().map(|e| e.discovery.key.as_str()).collect();
        assert_eq!(keys.len(), snapshot.len());
        assert!(events.try_iter().count() > 0);
        handle.shutdown().unwrap();
    }
}
