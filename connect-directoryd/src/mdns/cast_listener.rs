use mdns_sd::ServiceInfo;
use shared::protocol::{
    CAST_GROUP_MODEL_NAME, CAST_PLACEHOLDER_CPATH, CAST_PLACEHOLDER_VERSION, CAST_TYPE_AUDIO,
    CAST_TYPE_CHROMECAST, CAST_TYPE_GROUP, TXT_CAST_CAPABILITIES, TXT_CAST_FRIENDLY_NAME,
    TXT_CAST_ID, TXT_CAST_MODEL,
};
use shared::types::{DirectoryEntry, DiscoveryRecord, SelfDescription};
use crate::cast::device_id_for;
use crate::directory_manager::DirectoryHandle;
use crate::error::Result;
use super::browser::{discovery_record, hold, DiscoveryLock, ServiceHandler};

// `ca` capability bits
const CAPABILITY_VIDEO_OUT: i64 = 0x01;
const CAPABILITY_AUDIO_OUT: i64 = 0x04;
const CAPABILITY_MULTIZONE_GROUP: i64 = 0x20;

const CAST_DEVICE_TYPE: &str = "CastAudio";
/// Brand of every cast entry; cast advertisements carry no manufacturer
const CAST_DEFAULT_BRAND: &str = "ChromeCast";

/// Cast type from the advertised model and capabilities. `Err` when the
/// receiver cannot play audio; `Ok(None)` when nothing was advertised.
fn cast_type(model: &str, capabilities: Option<&str>) -> std::result::Result<Option<&'static str>, ()> {
    if model == CAST_GROUP_MODEL_NAME {
        return Ok(Some(CAST_TYPE_GROUP));
    }
    let Some(bits) = capabilities.and_then(|ca| ca.trim().parse::<i64>().ok()) else {
        return Ok(None);
    };
    if bits & CAPABILITY_MULTIZONE_GROUP != 0 {
        Ok(Some(CAST_TYPE_GROUP))
    } else if bits & CAPABILITY_VIDEO_OUT != 0 {
        Ok(Some(CAST_TYPE_CHROMECAST))
    } else if bits & CAPABILITY_AUDIO_OUT != 0 {
        Ok(Some(CAST_TYPE_AUDIO))
    } else {
        Err(())
    }
}

/// DiscoveryRecord for a `_googlecast._tcp` advertisement, keyed by the
/// cast `id`. `None` for receivers Spotify cannot play on.
pub fn cast_record(info: &ServiceInfo) -> Option<DiscoveryRecord> {
    let mut record = discovery_record(info);
    let property = |key: &str| record.properties.get(key).cloned().unwrap_or_default();

    let friendly_name = property(TXT_CAST_FRIENDLY_NAME);
    let id = property(TXT_CAST_ID);
    let model = property(TXT_CAST_MODEL);
    let cast_type = match cast_type(&model, record.properties.get(TXT_CAST_CAPABILITIES).map(String::as_str)) {
        Ok(cast_type) => cast_type,
        Err(()) => {
            tracing::debug!("Cast device {} cannot play audio; ignoring", info.get_fullname());
            return None;
        }
    };

    if !friendly_name.is_empty() {
        record.device_name = friendly_name;
    }
    if !id.is_empty() {
        record.key = id;
    }
    record.cpath = CAST_PLACEHOLDER_CPATH.to_string();
    record.version = Some(CAST_PLACEHOLDER_VERSION.to_string());
    record.is_cast = true;
    record.cast_type = cast_type.map(str::to_string);
    record.model_name = Some(model).filter(|m| !m.is_empty());
    Some(record)
}

/// Handles `_googlecast._tcp` advertisements. Entries get a placeholder
/// description until an activation asks the receiver itself.
pub struct CastListener {
    directory: DirectoryHandle,
    lock: DiscoveryLock,
}

impl CastListener {
    pub fn new(directory: DirectoryHandle, lock: DiscoveryLock) -> Self {
        Self { directory, lock }
    }

    pub fn process_record(&self, record: DiscoveryRecord) -> Result<()> {
        let _guard = hold(&self.lock);

        if let Some(existing) = self.directory.get_by_service_name(&record.name)? {
            if record.is_cast_group() && existing.discovery.server != record.server {
                tracing::debug!("Ignoring group member announcement of {} from {}", existing.title(), record.server);
                return Ok(());
            }
            if self.directory.update_discovery(record.clone())? {
                tracing::info!("Updated discovery details of {}", record.description());
            }
            return Ok(());
        }

        if record.is_cast_group() {
            if let Some(existing) = self.directory.get_by_key(&record.key)? {
                tracing::debug!("Cast group {} already known; ignoring {}", existing.title(), record.name);
                return Ok(());
            }
        }

        let entry = placeholder_entry(record);
        tracing::info!("Discovered cast device {}", entry.title());
        self.directory.upsert_discovered(entry)
    }
}

fn placeholder_entry(record: DiscoveryRecord) -> DirectoryEntry {
    let id = device_id_for(&record.device_name);
    DirectoryEntry {
        id: id.clone(),
        name: record.device_name.clone(),
        description: SelfDescription {
            device_id: id,
            device_type: CAST_DEVICE_TYPE.to_string(),
            brand_display_name: CAST_DEFAULT_BRAND.to_string(),
            model_display_name: record.model_name.clone().unwrap_or_default(),
            remote_name: record.device_name.clone(),
            ..Default::default()
        },
        discovery: record,
        ..Default::default()
    }
}

impl ServiceHandler for CastListener {
    fn on_resolved(&self, info: &ServiceInfo) -> Result<()> {
        match cast_record(info) {
            Some(record) => self.process_record(record),
            None => Ok(()),
        }
    }

    fn on_removed(&self, fullname: &str) -> Result<()> {
        let _guard = hold(&self.lock);
        if let Some(removed) = self.directory.remove_by_service_name(fullname)? {
            tracing::info!("Cast device {} went away", removed.title());
        }
        Ok(())
    }
}
