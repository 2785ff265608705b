use std::net::IpAddr;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{DirectoryEntry, ResponseKind};

/// Only the fields a poller cares about. `last_refreshed` and the raw TXT
/// properties churn on every re-announce without changing what a device is.
#[derive(Serialize)]
struct FingerprintView<'a> {
    id: &'a str,
    name: &'a str,
    key: &'a str,
    device_name: &'a str,
    addresses: &'a [IpAddr],
    port: u16,
    is_cast: bool,
    active_user: &'a str,
    is_active: bool,
    is_listed: bool,
    is_restricted: bool,
    was_reconnected: bool,
    outcome: Option<ResponseKind>,
}

/// SHA-256 over the directory contents, independent of entry order.
pub fn compute_fingerprint(entries: &[DirectoryEntry]) -> String {
    let mut indices: Vec<usize> = (0..entries.len()).collect();
    indices.sort_by(|&a, &b| {
        entries[a]
            .id
            .cmp(&entries[b].id)
            .then_with(|| entries[a].discovery.key.cmp(&entries[b].discovery.key))
    });

    let views: Vec<FingerprintView<'_>> = indices
        .iter()
        .map(|&i| {
            let e = &entries[i];
            FingerprintView {
                id: &e.id,
                name: &e.name,
                key: &e.discovery.key,
                device_name: &e.discovery.device_name,
                addresses: &e.discovery.host_ip_addresses,
                port: e.discovery.host_ip_port,
                is_cast: e.discovery.is_cast,
                active_user: &e.description.active_user,
                is_active: e.is_active,
                is_listed: e.is_listed,
                is_restricted: e.is_restricted,
                was_reconnected: e.was_reconnected,
                outcome: e.outcome.kind,
            }
        })
        .collect();

    let json = serde_json::to_vec(&views).unwrap_or_default();
    hex::encode(Sha256::digest(&json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use shared::types::DiscoveryRecord;

    fn test_entry(id: &str, name: &str) -> DirectoryEntry {
        DirectoryEntry {
            id: id.to_string(),
            name: name.to_string(),
            discovery: DiscoveryRecord {
                device_name: name.to_string(),
                key: format!("{}._spotify-connect._tcp.local.", name.to_lowercase()),
                host_ip_addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))],
                host_ip_port: 8200,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_ignores_order() {
        let a = test_entry("d1", "Office");
        let b = test_entry("d2", "Kitchen");

        assert_eq!(
            compute_fingerprint(&[a.clone(), b.clone()]),
            compute_fingerprint(&[b, a]),
        );
    }

    #[test]
    fn test_fingerprint_tracks_active_flag() {
        let a = test_entry("d1", "Office");
        let mut b = a.clone();
        b.is_active = true;

        assert_ne!(compute_fingerprint(&[a]), compute_fingerprint(&[b]));
    }

    #[test]
    fn test_fingerprint_ignores_txt_churn() {
        let a = test_entry("d1", "Office");
        let mut b = a.clone();
        b.discovery.properties.insert("stack".to_string(), "SP".to_string());

        assert_eq!(compute_fingerprint(&[a]), compute_fingerprint(&[b]));
    }
}
