//! The device directory: every playback endpoint we know about, merged from
//! mDNS discovery and the Web API device list.
//!
//! `DeviceDirectory` is plain owned state. It is only ever touched from the
//! actor thread in `directory_manager`, which is what makes it thread-safe.

pub mod hash;

use std::net::{IpAddr, Ipv4Addr};
use chrono::{DateTime, Utc};
use shared::protocol::{
    DYNAMIC_CPATH, DYNAMIC_HOST, DYNAMIC_VERSION, GET_INFO_FAILED_DEVICE_ID, STATUS_OK,
    STATUS_OK_STRING,
};
use shared::types::{
    DirectoryEntry, DirectorySnapshot, DiscoveryRecord, ProtocolOutcome, RemoteDevice,
    SelfDescription,
};
use crate::error::{DirectoryError, Result};

/// Response source recorded on descriptions this crate fabricates
pub const LOCAL_RESPONSE_SOURCE: &str = "connect-directoryd";

/// Change notifications, delivered after the mutation is applied
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    Added(DirectoryEntry),
    Removed(DirectoryEntry),
    Updated(DirectoryEntry),
}

impl DirectoryEvent {
    pub fn entry(&self) -> &DirectoryEntry {
        match self {
            DirectoryEvent::Added(entry)
            | DirectoryEvent::Removed(entry)
            | DirectoryEvent::Updated(entry) => entry,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DirectoryEvent::Added(_) => "added",
            DirectoryEvent::Removed(_) => "removed",
            DirectoryEvent::Updated(_) => "updated",
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceDirectory {
    items: Vec<DirectoryEntry>,
    last_refreshed: Option<DateTime<Utc>>,
}

fn matches_id(entry: &DirectoryEntry, value: &str) -> bool {
    entry.id == value || entry.description.aliases.iter().any(|alias| alias.id == value)
}

fn matches_name(entry: &DirectoryEntry, value: &str) -> bool {
    entry.name.eq_ignore_ascii_case(value)
        || entry
            .description
            .aliases
            .iter()
            .any(|alias| alias.name.eq_ignore_ascii_case(value))
}

/// Brand, model and product for players only known through the Web API.
fn web_player_identity(name: &str) -> (&'static str, &'static str, &'static str) {
    match name {
        "Web Player (Chrome)" => ("Google", "Chrome", "Web Player"),
        "Web Player (Microsoft Edge)" => ("Microsoft", "Edge", "Web Player"),
        _ => ("unknown", "unknown", "unknown"),
    }
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            items: self.items.clone(),
            last_refreshed: self.last_refreshed,
        }
    }

    pub fn fingerprint(&self) -> String {
        hash::compute_fingerprint(&self.items)
    }

    pub fn get_by_id(&self, value: &str) -> Option<DirectoryEntry> {
        self.items.iter().find(|e| matches_id(e, value)).cloned()
    }

    pub fn get_by_name(&self, value: &str) -> Option<DirectoryEntry> {
        self.items.iter().find(|e| matches_name(e, value)).cloned()
    }

    pub fn get_by_key(&self, key: &str) -> Option<DirectoryEntry> {
        self.items.iter().find(|e| e.discovery.key == key).cloned()
    }

    pub fn get_by_service_name(&self, name: &str) -> Option<DirectoryEntry> {
        self.items
            .iter()
            .find(|e| e.discovery.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn active(&self) -> Option<DirectoryEntry> {
        self.items.iter().find(|e| e.is_active).cloned()
    }

    /// First entry present in the Web API device list matching by id, name
    /// or advertised device name.
    pub fn player_device(&self, value: &str) -> Option<DirectoryEntry> {
        self.items
            .iter()
            .filter(|e| e.is_listed)
            .find(|e| {
                matches_id(e, value)
                    || matches_name(e, value)
                    || e.discovery.device_name.eq_ignore_ascii_case(value)
            })
            .cloned()
    }

    fn touch(&mut self) {
        self.items.sort_by_key(|e| e.name.to_lowercase());
        self.last_refreshed = Some(Utc::now());
    }

    fn position_by_key(&self, key: &str) -> Option<usize> {
        self.items.iter().position(|e| e.discovery.key == key)
    }

    fn take_at(&mut self, index: usize) -> DirectoryEntry {
        self.items.remove(index)
    }

    /// Fabricate an entry for a player only known through the Web API.
    /// Returns `None` when the device has no id or is already present.
    pub fn add_dynamic(&mut self, device: &RemoteDevice, active_user: &str) -> Option<DirectoryEvent> {
        let id = device.id.as_deref().filter(|id| !id.is_empty())?;
        if self.items.iter().any(|e| matches_id(e, id)) {
            return None;
        }

        let (brand, model, product) = web_player_identity(&device.name);
        let host = DYNAMIC_HOST
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let entry = DirectoryEntry {
            id: id.to_string(),
            name: device.name.clone(),
            discovery: DiscoveryRecord {
                device_name: device.name.clone(),
                key: id.to_string(),
                name: device.name.clone(),
                server: DYNAMIC_HOST.to_string(),
                host_ip_addresses: vec![host],
                host_ip_port: 0,
                service_type: None,
                cpath: DYNAMIC_CPATH.to_string(),
                version: Some(DYNAMIC_VERSION.to_string()),
                ..Default::default()
            },
            description: SelfDescription {
                device_id: id.to_string(),
                remote_name: device.name.clone(),
                device_type: device.device_type.clone(),
                brand_display_name: brand.to_string(),
                model_display_name: model.to_string(),
                product_id: product.to_string(),
                active_user: active_user.to_string(),
                status: Some(STATUS_OK),
                status_string: STATUS_OK_STRING.to_string(),
                spotify_error: Some(0),
                response_source: LOCAL_RESPONSE_SOURCE.to_string(),
                ..Default::default()
            },
            is_active: device.is_active,
            is_listed: true,
            is_restricted: device.is_restricted,
            ..Default::default()
        };

        tracing::debug!("Adding dynamic device {}", entry.title());
        self.items.push(entry.clone());
        self.touch();
        Some(DirectoryEvent::Added(entry))
    }

    /// Recompute `is_listed` from the Web API device list, adding dynamic
    /// entries for unknown players and dropping dynamic entries no longer
    /// listed.
    pub fn reconcile_listed(&mut self, remote: &[RemoteDevice], active_user: &str) -> Vec<DirectoryEvent> {
        let mut events = Vec::new();

        for entry in &mut self.items {
            entry.is_listed = false;
        }

        for device in remote {
            let Some(id) = device.id.as_deref().filter(|id| !id.is_empty()) else {
                continue;
            };
            if let Some(event) = self.add_dynamic(device, active_user) {
                events.push(event);
            }
            for entry in self.items.iter_mut().filter(|e| matches_id(e, id)) {
                entry.is_listed = true;
            }
        }

        let mut index = 0;
        while index < self.items.len() {
            if self.items[index].is_dynamic() && !self.items[index].is_listed {
                let removed = self.take_at(index);
                tracing::debug!("Removing unlisted dynamic device {}", removed.title());
                events.push(DirectoryEvent::Removed(removed));
            } else {
                index += 1;
            }
        }

        self.touch();
        events
    }

    /// Flag the device currently driving playback. Devices without an id
    /// (restricted ones) are matched by name.
    pub fn mark_active(&mut self, playing: Option<&RemoteDevice>) -> Option<DirectoryEntry> {
        for entry in &mut self.items {
            entry.is_active = false;
        }

        let device = playing?;
        let position = match device.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => self.items.iter().position(|e| matches_id(e, id)),
            None => self.items.iter().position(|e| matches_name(e, &device.name)),
        }?;

        let entry = &mut self.items[position];
        entry.is_active = true;
        entry.is_restricted = device.is_restricted;
        Some(entry.clone())
    }

    /// Device selection policy.
    ///
    /// * `""`: the active device, else the default device
    /// * `"*"`: the default device, else the active device
    /// * otherwise: id, then name (active entry wins a name collision), then
    ///   the active device when it is restricted and matches by id or name
    pub fn resolve(
        &self,
        value: &str,
        default_device_id: Option<&str>,
        playing: Option<&RemoteDevice>,
    ) -> Result<DirectoryEntry> {
        let value = value.trim();
        let default_entry = || {
            default_device_id
                .filter(|id| !id.is_empty())
                .and_then(|id| self.get_by_id(id).or_else(|| self.get_by_name(id)))
        };

        if value.is_empty() {
            return self
                .active()
                .or_else(default_entry)
                .ok_or_else(|| DirectoryError::not_found(default_device_id.unwrap_or_default()));
        }

        if value == "*" {
            return default_entry()
                .or_else(|| self.active())
                .ok_or_else(|| DirectoryError::not_found(default_device_id.unwrap_or("*")));
        }

        if let Some(entry) = self.get_by_id(value) {
            return Ok(entry);
        }

        let named: Vec<&DirectoryEntry> = self.items.iter().filter(|e| matches_name(e, value)).collect();
        if let Some(entry) = named.iter().find(|e| e.is_active).or_else(|| named.first()) {
            return Ok((*entry).clone());
        }

        if let Some(device) = playing.filter(|d| d.is_restricted) {
            let matches = device.id.as_deref() == Some(value) || device.name.eq_ignore_ascii_case(value);
            if matches {
                if let Some(active) = self.active() {
                    return Ok(active);
                }
            }
        }

        Err(DirectoryError::not_found(value))
    }

    /// Insert an entry built from an mDNS advertisement.
    ///
    /// An entry with the same discovery key is replaced in place. A dynamic
    /// entry with the same id is retired and its listed/active state carried
    /// over; a different discovered entry with the same id is replaced.
    pub fn upsert_discovered(&mut self, mut entry: DirectoryEntry) -> Vec<DirectoryEvent> {
        let mut events = Vec::new();

        if let Some(index) = self.position_by_key(&entry.discovery.key) {
            let existing = &self.items[index];
            entry.is_active = existing.is_active;
            entry.is_listed = existing.is_listed;
            entry.is_restricted = existing.is_restricted;
            entry.was_reconnected = existing.was_reconnected;
            self.items[index] = entry.clone();
            self.touch();
            events.push(DirectoryEvent::Updated(entry));
            return events;
        }

        if entry.id != GET_INFO_FAILED_DEVICE_ID && !entry.id.is_empty() {
            if let Some(index) = self.items.iter().position(|e| e.id == entry.id) {
                let previous = self.take_at(index);
                if previous.is_dynamic() {
                    entry.is_active |= previous.is_active;
                    entry.is_listed |= previous.is_listed;
                    entry.is_restricted |= previous.is_restricted;
                } else {
                    tracing::debug!(
                        "Replacing {} advertised as {} with advertisement {}",
                        previous.title(),
                        previous.discovery.key,
                        entry.discovery.key
                    );
                }
                events.push(DirectoryEvent::Removed(previous));
            }
        }

        self.items.push(entry.clone());
        self.touch();
        events.push(DirectoryEvent::Added(entry));
        events
    }

    /// Replace the discovery record of the entry advertised under
    /// `record.name`. Only emits when the advertisement actually changed.
    pub fn update_discovery(&mut self, record: DiscoveryRecord) -> Option<DirectoryEvent> {
        let entry = self
            .items
            .iter_mut()
            .find(|e| e.discovery.name.eq_ignore_ascii_case(&record.name))?;
        if entry.discovery.same_advertisement(&record) {
            return None;
        }
        entry.discovery = record;
        let updated = entry.clone();
        self.touch();
        Some(DirectoryEvent::Updated(updated))
    }

    pub fn remove_by_key(&mut self, key: &str) -> Option<DirectoryEvent> {
        let index = self.position_by_key(key)?;
        let removed = self.take_at(index);
        self.touch();
        Some(DirectoryEvent::Removed(removed))
    }

    pub fn remove_by_service_name(&mut self, name: &str) -> Option<DirectoryEvent> {
        let index = self
            .items
            .iter()
            .position(|e| e.discovery.name.eq_ignore_ascii_case(name))?;
        let removed = self.take_at(index);
        self.touch();
        Some(DirectoryEvent::Removed(removed))
    }

    /// Remove the entry with the given id; with `dynamic_only` discovered
    /// entries are left alone.
    pub fn remove(&mut self, id: &str, dynamic_only: bool) -> Option<DirectoryEvent> {
        let index = self
            .items
            .iter()
            .position(|e| e.id == id && (!dynamic_only || e.is_dynamic()))?;
        let removed = self.take_at(index);
        self.touch();
        Some(DirectoryEvent::Removed(removed))
    }

    /// Merge a self-description obtained over the cast channel. The id stays
    /// as assigned at discovery, as do device type, brand and model, which the
    /// cast advertisement describes more consistently.
    pub fn apply_self_description(&mut self, key: &str, info: SelfDescription) -> Option<DirectoryEvent> {
        let index = self.position_by_key(key)?;
        let entry = &mut self.items[index];
        let brand = std::mem::take(&mut entry.description.brand_display_name);
        let device_type = std::mem::take(&mut entry.description.device_type);
        let model = std::mem::take(&mut entry.description.model_display_name);

        entry.description = SelfDescription {
            brand_display_name: brand,
            device_type,
            model_display_name: model,
            ..info
        };
        let updated = entry.clone();
        self.touch();
        Some(DirectoryEvent::Updated(updated))
    }

    pub fn record_outcome(&mut self, key: &str, outcome: ProtocolOutcome) -> Option<DirectoryEvent> {
        let index = self.position_by_key(key)?;
        self.items[index].outcome = outcome;
        let updated = self.items[index].clone();
        self.touch();
        Some(DirectoryEvent::Updated(updated))
    }

    pub fn reset_outcome(&mut self, key: &str) -> bool {
        match self.position_by_key(key) {
            Some(index) => {
                self.items[index].outcome = ProtocolOutcome::default();
                self.items[index].was_reconnected = false;
                self.touch();
                true
            }
            None => false,
        }
    }

    pub fn mark_reconnected(&mut self, key: &str) -> Option<DirectoryEvent> {
        let index = self.position_by_key(key)?;
        self.items[index].was_reconnected = true;
        let updated = self.items[index].clone();
        self.touch();
        Some(DirectoryEvent::Updated(updated))
    }
}
