//! Blocking client for the zeroconf HTTP endpoint native receivers expose at
//! `http://<host>:<port><cpath>`.

use std::thread;
use std::time::Duration;
use shared::protocol::{
    ACTION_ADD_USER, ACTION_GET_INFO, ACTION_RESET_USERS, STATUS_OK, STATUS_OK_STRING,
    ZEROCONF_DEFAULT_VERSION,
};
use shared::types::{DiscoveryRecord, ProtocolOutcome, SelfDescription};
use crate::error::{DirectoryError, Result};

/// Attempts made while a receiver refuses connections (it may still be
/// starting its HTTP server right after announcing itself)
const REFUSED_ATTEMPTS: usize = 4;
const REFUSED_DELAY: Duration = Duration::from_millis(250);

pub struct ZeroconfClient {
    http_client: ureq::Agent,
}

fn version_of(record: &DiscoveryRecord) -> &str {
    record
        .version
        .as_deref()
        .filter(|v| !v.is_empty())
        .unwrap_or(ZEROCONF_DEFAULT_VERSION)
}

fn base_url(record: &DiscoveryRecord) -> String {
    format!("http://{}:{}{}", record.host_ip_address(), record.host_ip_port, record.cpath)
}

fn map_ureq_error(url: &str, error: ureq::Error) -> DirectoryError {
    match error {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            DirectoryError::http(url, format!("HTTP {}: {}", code, body.trim()))
        }
        ureq::Error::Transport(transport) => DirectoryError::http(url, transport),
    }
}

fn check_status(operation: &str, status: Option<i64>, status_string: &str, spotify_error: Option<i64>) -> Result<()> {
    if status == Some(STATUS_OK) {
        return Ok(());
    }
    Err(DirectoryError::Protocol {
        operation: operation.to_string(),
        status,
        status_string: status_string.to_string(),
        spotify_error,
    })
}

impl ZeroconfClient {
    pub fn new(timeout: Duration) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self { http_client }
    }

    fn get_with_retry(&self, url: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.http_client.get(url).call() {
                Ok(response) => return Ok(response.into_string()?),
                Err(error) => {
                    let error = map_ureq_error(url, error);
                    if attempt < REFUSED_ATTEMPTS && error.is_connection_refused() {
                        tracing::debug!("Connection refused by {} (attempt {}), retrying", url, attempt);
                        thread::sleep(REFUSED_DELAY);
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<String> {
        match self.http_client.post(url).send_form(form) {
            Ok(response) => Ok(response.into_string()?),
            Err(error) => Err(map_ureq_error(url, error)),
        }
    }

    /// `getInfo`: the receiver's own description of itself
    pub fn get_information(&self, record: &DiscoveryRecord) -> Result<SelfDescription> {
        let url = format!("{}?action={}&version={}", base_url(record), ACTION_GET_INFO, version_of(record));
        tracing::debug!("Requesting self-description from {}", url);

        let body = self.get_with_retry(&url)?;
        let mut info: SelfDescription = serde_json::from_str(&body)?;
        check_status(ACTION_GET_INFO, info.status, &info.status_string, info.spotify_error)?;
        if info.response_source.is_empty() {
            info.response_source = ACTION_GET_INFO.to_string();
        }
        Ok(info)
    }

    /// `resetUsers`: log every user out of the receiver. Some receivers
    /// answer with a bare HTTP 200, which counts as success.
    pub fn reset_users(&self, record: &DiscoveryRecord) -> Result<ProtocolOutcome> {
        let url = base_url(record);
        let body = self.post_form(&url, &[("action", ACTION_RESET_USERS), ("version", version_of(record))])?;
        let outcome = parse_outcome(&body)?;
        check_status(ACTION_RESET_USERS, outcome.status, &outcome.status_string, outcome.spotify_error)?;
        Ok(outcome)
    }

    /// `addUser` for receivers accepting an access token directly. `info`
    /// is the receiver's current description; its client and device ids
    /// identify which player the token is scoped to.
    pub fn add_user_token(
        &self,
        record: &DiscoveryRecord,
        info: &SelfDescription,
        login_id: &str,
        blob: &str,
        token_type: &str,
    ) -> Result<ProtocolOutcome> {
        let url = base_url(record);
        let form = [
            ("action", ACTION_ADD_USER),
            ("version", version_of(record)),
            ("userName", login_id),
            ("loginId", login_id),
            ("blob", blob),
            ("clientKey", ""),
            ("tokenType", token_type),
            ("clientID", info.client_id.as_str()),
            ("deviceID", info.device_id.as_str()),
        ];
        tracing::debug!("Logging {} into {} ({})", login_id, record.device_name, url);
        let body = self.post_form(&url, &form)?;
        let outcome = parse_outcome(&body)?;
        check_status(ACTION_ADD_USER, outcome.status, &outcome.status_string, outcome.spotify_error)?;
        Ok(outcome)
    }
}

fn parse_outcome(body: &str) -> Result<ProtocolOutcome> {
    if body.trim().is_empty() {
        return Ok(ProtocolOutcome {
            status: Some(STATUS_OK),
            status_string: STATUS_OK_STRING.to_string(),
            spotify_error: Some(0),
            ..Default::default()
        });
    }
    Ok(serde_json::from_str(body)?)
}
