//! The Spotify cast application's message protocol:
//! `{"type": ..., "payload": ...}` JSON on the app namespace.

use std::sync::Arc;
use std::time::{Duration, Instant};
use serde_json::Value;
use shared::protocol::{
    CAST_APP_NAMESPACE, CAST_GROUP_MODEL_NAME, CAST_TOKEN_TYPE, STATUS_RECEIVE_MESSAGE_FAILED,
    STATUS_RECEIVE_MESSAGE_FAILED_STRING, TYPE_ADD_USER, TYPE_GET_INFO, TYPE_GET_INFO_RESPONSE,
};
use shared::types::{DirectoryEntry, ProtocolOutcome, ResponseKind, SelfDescription};
use crate::error::{DirectoryError, Result};
use crate::signal::Signal;
use crate::webapi::{DeviceAuth, TokenProvider};
use super::channel::AppLink;

const REPLY_POLL: Duration = Duration::from_millis(250);

/// What a received message meant for the activation
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// getInfoResponse: addUser should follow
    Described(SelfDescription),
    /// Any of the outcome types, or a synthetic outcome for a malformed message
    Outcome(ProtocolOutcome),
    Ignored,
}

type InfoReply = std::result::Result<SelfDescription, ProtocolOutcome>;

fn protocol_error(operation: &str, outcome: &ProtocolOutcome) -> DirectoryError {
    DirectoryError::Protocol {
        operation: operation.to_string(),
        status: outcome.status,
        status_string: outcome.status_string.clone(),
        spotify_error: outcome.spotify_error,
    }
}

pub struct CastController {
    device_id: String,
    device_name: String,
    is_group: bool,
    info: SelfDescription,
    /// Between the application launch and the end of the login handshake.
    /// Requests sent in this window are answered through `dispatch` only.
    launching: bool,
    user_requested: bool,
    info_reply: Signal<InfoReply>,
    user_reply: Signal<ProtocolOutcome>,
    tokens: Arc<dyn TokenProvider>,
    device_auth: Arc<dyn DeviceAuth>,
}

impl CastController {
    pub fn new(entry: &DirectoryEntry, tokens: Arc<dyn TokenProvider>, device_auth: Arc<dyn DeviceAuth>) -> Self {
        let is_group = entry.discovery.is_cast_group()
            || entry.discovery.model_name.as_deref() == Some(CAST_GROUP_MODEL_NAME);
        Self {
            device_id: entry.id.clone(),
            device_name: entry.discovery.device_name.clone(),
            is_group,
            info: entry.description.clone(),
            launching: false,
            user_requested: false,
            info_reply: Signal::new(),
            user_reply: Signal::new(),
            tokens,
            device_auth,
        }
    }

    /// The latest self-description, refined by getInfoResponse / addUserResponse
    pub fn info(&self) -> &SelfDescription {
        &self.info
    }

    /// Enter the launch sequence: getInfo and addUser return once sent
    pub fn begin_launch(&mut self) {
        self.launching = true;
        self.user_requested = false;
    }

    /// Send getInfo. Outside the launch sequence, wait up to `timeout` for
    /// the receiver's description; `Ok(None)` inside it.
    pub fn get_information(&mut self, link: &dyn AppLink, timeout: Duration) -> Result<Option<SelfDescription>> {
        self.info_reply.reset();
        let request = serde_json::json!({
            "type": TYPE_GET_INFO,
            "payload": {
                "remoteName": self.device_name,
                "deviceID": self.device_id,
                "deviceAPI_isGroup": self.is_group,
            }
        });
        tracing::debug!("Sending getInfo to \"{}\"", self.device_name);
        link.send_app(CAST_APP_NAMESPACE, &request)?;
        if self.launching {
            return Ok(None);
        }

        match self.await_reply(link, timeout, TYPE_GET_INFO, |ctl| ctl.info_reply.get())? {
            Ok(info) => Ok(Some(info)),
            Err(outcome) => Err(protocol_error(TYPE_GET_INFO, &outcome)),
        }
    }

    /// Send addUser with a device-scoped token for the described receiver.
    /// Outside the launch sequence, wait up to `timeout` for the response;
    /// `Ok(None)` inside it, or when the launch already sent one.
    pub fn add_user(&mut self, link: &dyn AppLink, timeout: Duration) -> Result<Option<ProtocolOutcome>> {
        if self.launching && self.user_requested {
            return Ok(None);
        }
        self.user_reply.reset();
        let access_token = self.tokens.current_access_token()?;
        let blob = self
            .device_auth
            .device_token(&access_token, &self.info.client_id, &self.info.device_id)?;
        let request = serde_json::json!({
            "type": TYPE_ADD_USER,
            "payload": {
                "blob": blob,
                "tokenType": CAST_TOKEN_TYPE,
            }
        });
        tracing::debug!("Sending addUser to \"{}\"", self.device_name);
        link.send_app(CAST_APP_NAMESPACE, &request)?;
        self.user_requested = true;
        if self.launching {
            return Ok(None);
        }

        let outcome = self.await_reply(link, timeout, TYPE_ADD_USER, |ctl| ctl.user_reply.get())?;
        match outcome.kind {
            Some(ResponseKind::AddUserResponse) => Ok(Some(outcome)),
            _ => Err(protocol_error(TYPE_ADD_USER, &outcome)),
        }
    }

    /// Dispatch incoming messages until `reply` yields or `timeout` elapses
    fn await_reply<T>(
        &mut self,
        link: &dyn AppLink,
        timeout: Duration,
        operation: &str,
        reply: impl Fn(&Self) -> Option<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = reply(self) {
                return Ok(value);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DirectoryError::timeout(
                    format!("{} response from \"{}\"", operation, self.device_name),
                    timeout,
                ));
            }
            if let Some(message) = link.recv_app(remaining.min(REPLY_POLL))? {
                if message.namespace == CAST_APP_NAMESPACE {
                    self.dispatch(&message.payload);
                }
            }
        }
    }

    /// Handle one application message
    pub fn dispatch(&mut self, raw: &str) -> ControllerEvent {
        match self.try_dispatch(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Could not process cast message from \"{}\": {}", self.device_name, e);
                ControllerEvent::Outcome(ProtocolOutcome {
                    kind: None,
                    status: Some(STATUS_RECEIVE_MESSAGE_FAILED),
                    status_string: STATUS_RECEIVE_MESSAGE_FAILED_STRING.to_string(),
                    spotify_error: None,
                })
            }
        }
    }

    fn try_dispatch(&mut self, raw: &str) -> Result<ControllerEvent> {
        let message: Value = serde_json::from_str(raw)?;
        let kind = message.get("type").and_then(Value::as_str).unwrap_or_default();
        let payload = message.get("payload").cloned().unwrap_or(Value::Null);
        tracing::debug!("Cast message \"{}\" from \"{}\"", kind, self.device_name);

        if kind == TYPE_GET_INFO_RESPONSE {
            let mut info: SelfDescription = serde_json::from_value(payload)?;
            if info.public_key.as_deref() == Some("empty") {
                info.public_key = None;
            }
            info.response_source = TYPE_GET_INFO_RESPONSE.to_string();
            self.info = info.clone();
            self.info_reply.set(Ok(info.clone()));
            return Ok(ControllerEvent::Described(info));
        }

        let Some(response_kind) = ResponseKind::from_type(kind) else {
            tracing::debug!("Ignoring cast message type \"{}\"", kind);
            return Ok(ControllerEvent::Ignored);
        };

        let mut outcome: ProtocolOutcome = if payload.is_object() {
            serde_json::from_value(payload.clone())?
        } else {
            ProtocolOutcome::default()
        };
        outcome.kind = Some(response_kind);

        match response_kind {
            ResponseKind::AddUserResponse => {
                self.launching = false;
                if !self.info.has_active_user() {
                    if let Some(user) = payload.pointer("/user/id").and_then(Value::as_str) {
                        self.info.active_user = user.to_string();
                    }
                }
                self.user_reply.set(outcome.clone());
            }
            ResponseKind::AddUserError => self.user_reply.set(outcome.clone()),
            ResponseKind::GetInfoError => self.info_reply.set(Err(outcome.clone())),
            _ => {}
        }

        Ok(ControllerEvent::Outcome(outcome))
    }
}
