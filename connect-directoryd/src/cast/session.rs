use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use shared::protocol::{CAST_APP_NAMESPACE, CAST_APP_SPOTIFY};
use shared::types::{DirectoryEntry, ProtocolOutcome, ResponseKind, SelfDescription};
use crate::directory_manager::DirectoryHandle;
use crate::error::{DirectoryError, Result};
use crate::signal::Signal;
use crate::webapi::{DeviceAuth, TokenProvider, WebApi};
use super::channel::{AppLink, CastChannel, CastTransport};
use super::controller::{CastController, ControllerEvent};

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);
const LAUNCH_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Launching,
    AwaitGetInfo,
    AwaitAddUser,
    Activated,
    AwaitTransfer,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Collaborators a cast session needs
#[derive(Clone)]
pub struct SessionContext {
    pub directory: DirectoryHandle,
    pub transport: Arc<dyn CastTransport>,
    pub web_api: Arc<dyn WebApi>,
    pub tokens: Arc<dyn TokenProvider>,
    pub device_auth: Arc<dyn DeviceAuth>,
}

/// Requests served by a running session
enum SessionCommand {
    Describe(Duration, flume::Sender<Result<SelfDescription>>),
    Login(Duration, flume::Sender<Result<ProtocolOutcome>>),
}

/// State shared between a session handle and its thread
struct Shared {
    state: Mutex<SessionState>,
    stop: AtomicBool,
    activated: Signal<ProtocolOutcome>,
    transferred: Signal<ProtocolOutcome>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Supervised handle to the thread driving one cast activation.
///
/// The thread launches the Spotify receiver application, logs the account in
/// (getInfo, addUser), optionally transfers playback and then keeps the
/// connection open until `stop`.
pub struct CastSession {
    key: String,
    title: String,
    shared: Arc<Shared>,
    commands: flume::Sender<SessionCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Cloneable access to a running session's receiver application
#[derive(Clone)]
pub struct SessionLink {
    title: String,
    commands: flume::Sender<SessionCommand>,
}

impl SessionLink {
    fn request<T>(&self, command: SessionCommand, replies: flume::Receiver<Result<T>>, timeout: Duration) -> Result<T> {
        let closed = || DirectoryError::Launch {
            device: self.title.clone(),
            message: "cast session has ended".to_string(),
        };
        self.commands.send(command).map_err(|_| closed())?;
        // the session answers within `timeout` once it picks the command up
        match replies.recv_timeout(timeout + STOP_POLL * 2) {
            Ok(result) => result,
            Err(flume::RecvTimeoutError::Timeout) => Err(DirectoryError::timeout(
                format!("cast session for {}", self.title),
                timeout,
            )),
            Err(flume::RecvTimeoutError::Disconnected) => Err(closed()),
        }
    }

    /// Ask the receiver for a fresh self-description
    pub fn describe(&self, timeout: Duration) -> Result<SelfDescription> {
        let (reply, replies) = flume::bounded(1);
        self.request(SessionCommand::Describe(timeout, reply), replies, timeout)
    }

    /// Log the account into the receiver again
    pub fn login(&self, timeout: Duration) -> Result<ProtocolOutcome> {
        let (reply, replies) = flume::bounded(1);
        self.request(SessionCommand::Login(timeout, reply), replies, timeout)
    }
}

impl CastSession {
    pub fn start(context: SessionContext, entry: DirectoryEntry, transfer: bool) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Idle),
            stop: AtomicBool::new(false),
            activated: Signal::new(),
            transferred: Signal::new(),
        });
        let key = entry.discovery.key.clone();
        let title = entry.title();
        let (commands, command_rx) = flume::unbounded();

        let worker = SessionWorker {
            controller: CastController::new(&entry, context.tokens.clone(), context.device_auth.clone()),
            context,
            entry,
            transfer,
            shared: shared.clone(),
            commands: command_rx,
        };
        let thread = thread::Builder::new()
            .name(format!("cast-session {}", key))
            .spawn(move || worker.run())?;

        Ok(Self {
            key,
            title,
            shared,
            commands,
            thread: Some(thread),
        })
    }

    /// Discovery key of the device this session drives
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn link(&self) -> SessionLink {
        SessionLink {
            title: self.title.clone(),
            commands: self.commands.clone(),
        }
    }

    /// Outcome that ended the activation phase, or `None` on timeout
    pub fn wait_activation(&self, timeout: Duration) -> Option<ProtocolOutcome> {
        self.shared.activated.wait(timeout)
    }

    /// Outcome of the playback transfer, or `None` on timeout
    pub fn wait_transfer(&self, timeout: Duration) -> Option<ProtocolOutcome> {
        self.shared.transferred.wait(timeout)
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("Cast session thread for {} panicked", self.title);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for CastSession {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

struct SessionWorker {
    context: SessionContext,
    entry: DirectoryEntry,
    transfer: bool,
    controller: CastController,
    shared: Arc<Shared>,
    commands: flume::Receiver<SessionCommand>,
}

impl SessionWorker {
    fn key(&self) -> &str {
        &self.entry.discovery.key
    }

    fn run(mut self) {
        self.shared.set_state(SessionState::Launching);
        tracing::info!("Launching Spotify cast application on {}", self.entry.title());

        let mut channel = match self.launch() {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!("Cast launch on {} failed: {}", self.entry.title(), e);
                let outcome = ProtocolOutcome::new(ResponseKind::LaunchError, None, e.to_string());
                self.finish_activation(outcome, SessionState::Error);
                return;
            }
        };

        self.controller.begin_launch();
        self.shared.set_state(SessionState::AwaitGetInfo);
        if let Err(e) = self.controller.get_information(&channel, LAUNCH_REPLY_TIMEOUT) {
            let outcome = ProtocolOutcome::new(ResponseKind::GetInfoError, None, e.to_string());
            self.finish_activation(outcome, SessionState::Error);
            channel.close();
            return;
        }

        while !self.shared.stop.load(Ordering::SeqCst) {
            if self.shared.state() == SessionState::Running {
                while let Ok(command) = self.commands.try_recv() {
                    self.serve(&channel, command);
                }
            }
            let message = match channel.recv_app(STOP_POLL) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    if !self.shared.activated.is_set() {
                        tracing::warn!("Cast connection to {} lost: {}", self.entry.title(), e);
                        let outcome = ProtocolOutcome::new(ResponseKind::LaunchError, None, e.to_string());
                        self.finish_activation(outcome, SessionState::Error);
                    } else {
                        tracing::info!("Cast connection to {} ended: {}", self.entry.title(), e);
                    }
                    break;
                }
            };
            if message.namespace != CAST_APP_NAMESPACE {
                continue;
            }
            if !self.handle(&channel, &message.payload) {
                break;
            }
        }

        channel.close();
        if self.shared.state() != SessionState::Error {
            self.shared.set_state(SessionState::Stopped);
        }
        tracing::info!("Cast session for {} ended", self.entry.title());
    }

    fn launch(&self) -> Result<CastChannel> {
        let mut channel = CastChannel::open(self.context.transport.as_ref(), &self.entry.discovery, CAST_APP_SPOTIFY)?;
        channel.launch(LAUNCH_TIMEOUT)?;
        Ok(channel)
    }

    fn serve(&mut self, channel: &CastChannel, command: SessionCommand) {
        match command {
            SessionCommand::Describe(timeout, reply) => {
                let result = self.controller.get_information(channel, timeout).and_then(|info| {
                    let info = info.unwrap_or_else(|| self.controller.info().clone());
                    self.context.directory.apply_self_description(self.key(), info.clone())?;
                    Ok(info)
                });
                let _ = reply.send(result);
            }
            SessionCommand::Login(timeout, reply) => {
                let result = self.controller.add_user(channel, timeout).and_then(|outcome| {
                    let outcome = outcome.unwrap_or_else(|| {
                        ProtocolOutcome::new(ResponseKind::AddUserResponse, None, String::new())
                    });
                    self.record(&outcome);
                    self.context
                        .directory
                        .apply_self_description(self.key(), self.controller.info().clone())?;
                    self.context.directory.mark_reconnected(self.key())?;
                    Ok(outcome)
                });
                let _ = reply.send(result);
            }
        }
    }

    /// Returns false when the session cannot continue
    fn handle(&mut self, channel: &CastChannel, payload: &str) -> bool {
        match self.controller.dispatch(payload) {
            ControllerEvent::Described(info) => {
                if let Err(e) = self.context.directory.apply_self_description(self.key(), info) {
                    tracing::warn!("Could not store self-description of {}: {}", self.entry.title(), e);
                }
                self.shared.set_state(SessionState::AwaitAddUser);
                if let Err(e) = self.controller.add_user(channel, LAUNCH_REPLY_TIMEOUT) {
                    tracing::error!("Login of {} failed: {}", self.entry.title(), e);
                    let outcome = ProtocolOutcome::new(ResponseKind::AddUserError, None, e.to_string());
                    self.record(&outcome);
                    self.finish_activation(outcome, SessionState::Error);
                    return false;
                }
                true
            }
            ControllerEvent::Outcome(outcome) => self.on_outcome(outcome),
            ControllerEvent::Ignored => true,
        }
    }

    fn on_outcome(&mut self, outcome: ProtocolOutcome) -> bool {
        if outcome.kind.is_none() && self.shared.activated.is_set() {
            // unreadable message from a logged-in receiver; keep its outcome
            tracing::debug!("Ignoring unreadable message from {}: {}", self.entry.title(), outcome);
            return true;
        }
        self.record(&outcome);
        match outcome.kind {
            Some(ResponseKind::AddUserResponse) => {
                let directory = &self.context.directory;
                if let Err(e) = directory
                    .apply_self_description(self.key(), self.controller.info().clone())
                    .and_then(|_| directory.mark_reconnected(self.key()))
                {
                    tracing::warn!("Could not update {} after activation: {}", self.entry.title(), e);
                }
                tracing::info!("Activated {}", self.entry.title());
                self.finish_activation(outcome, SessionState::Activated);
                if self.transfer {
                    self.request_transfer();
                } else {
                    self.shared.set_state(SessionState::Running);
                }
                true
            }
            Some(kind) if kind.completes_transfer() => {
                tracing::info!("Playback transfer to {}: {}", self.entry.title(), outcome);
                self.shared.transferred.set(outcome);
                self.shared.set_state(SessionState::Running);
                true
            }
            Some(kind) if kind.completes_activation() => {
                tracing::error!("Activation of {} failed: {}", self.entry.title(), outcome);
                self.finish_activation(outcome, SessionState::Error);
                false
            }
            _ => {
                // a malformed message during the handshake ends the activation
                if !self.shared.activated.is_set() {
                    self.finish_activation(outcome, SessionState::Error);
                    return false;
                }
                true
            }
        }
    }

    /// The player id the Web API knows the receiver by: its own reported
    /// device id, falling back to the directory id
    fn transfer_target(&self) -> &str {
        let reported = self.controller.info().device_id.as_str();
        if reported.is_empty() {
            &self.entry.id
        } else {
            reported
        }
    }

    fn request_transfer(&self) {
        self.shared.set_state(SessionState::AwaitTransfer);
        let target = self.transfer_target();
        tracing::debug!("Transferring playback to {} as {}", self.entry.title(), target);
        if let Err(e) = self.context.web_api.transfer_playback(target, true) {
            tracing::error!("Playback transfer to {} failed: {}", self.entry.title(), e);
            let outcome = ProtocolOutcome::new(ResponseKind::TransferError, None, e.to_string());
            self.record(&outcome);
            self.shared.transferred.set(outcome);
            self.shared.set_state(SessionState::Running);
        }
    }

    fn record(&self, outcome: &ProtocolOutcome) {
        if let Err(e) = self.context.directory.record_outcome(self.key(), outcome.clone()) {
            tracing::warn!("Could not record outcome for {}: {}", self.entry.title(), e);
        }
    }

    fn finish_activation(&self, outcome: ProtocolOutcome, state: SessionState) {
        if outcome.kind == Some(ResponseKind::LaunchError) {
            self.record(&outcome);
        }
        self.shared.set_state(state);
        self.shared.activated.set(outcome);
    }
}
