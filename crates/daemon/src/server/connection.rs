//! Per-connection SSH handler.
//!
//! One [`ConnectionHandler`] exists per TCP connection. It routes
//! authentication to the [`AuthPolicy`], collects the PTY and environment
//! requests of the single session channel, and starts the session on a shell
//! or exec request. Data and window changes that arrive afterwards are fed to
//! the running session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Response, Session};
use russh::{Channel, ChannelId, Pty};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::remote::SshChannel;
use crate::auth::{AuthDecision, AuthPolicy, Credential, Identity};
use crate::session::{PtyRequest, SessionHandler, SessionIo, SessionRequest, WindowSize};

/// Input chunks buffered between the connection and the PTY writer.
const INPUT_QUEUE_CAPACITY: usize = 256;

/// How long a data message may wait for room in the input queue before the
/// process is considered stalled and further input is dropped.
const INPUT_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// State of the connection's session channel.
struct SessionChannel {
    pty: Option<PtyRequest>,
    env: Vec<(String, String)>,
    input: Option<mpsc::Sender<Vec<u8>>>,
    resizes: Option<mpsc::UnboundedSender<WindowSize>>,
    started: bool,
    input_stalled: bool,
    input_stall_timeout: Duration,
    cancel: CancellationToken,
}

impl SessionChannel {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            pty: None,
            env: Vec::new(),
            input: None,
            resizes: None,
            started: false,
            input_stalled: false,
            input_stall_timeout: INPUT_STALL_TIMEOUT,
            cancel,
        }
    }

    /// Records a PTY request. Refused once the session has started.
    fn request_pty(&mut self, request: PtyRequest) -> bool {
        if self.started {
            return false;
        }
        tracing::debug!(
            term = %request.term,
            cols = request.size.cols,
            rows = request.size.rows,
            "PTY requested"
        );
        self.pty = Some(request);
        true
    }

    fn set_env(&mut self, name: &str, value: &str) -> bool {
        if self.started {
            return false;
        }
        self.env.push((name.to_string(), value.to_string()));
        true
    }

    /// Queues a window change, or updates the PTY size if the session has
    /// not started yet.
    fn change_window(&mut self, size: WindowSize) {
        if let Some(resizes) = &self.resizes {
            if resizes.send(size).is_err() {
                tracing::debug!(cols = size.cols, rows = size.rows, "Session ended, ignoring window change");
            }
        } else if let Some(pty) = self.pty.as_mut() {
            pty.size = size;
        }
    }

    /// Builds the session request and its I/O streams. Returns `None` if
    /// the session already started.
    fn start(&mut self, identity: Identity) -> Option<(SessionRequest, SessionIo, CancellationToken)> {
        if self.started {
            return None;
        }
        self.started = true;

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        self.input = Some(input_tx);
        self.resizes = Some(resize_tx);

        let request = SessionRequest {
            id: Uuid::new_v4().to_string(),
            identity,
            pty: self.pty.clone(),
            env: std::mem::take(&mut self.env),
        };
        let io = SessionIo {
            input: input_rx,
            resizes: resize_rx,
        };
        Some((request, io, self.cancel.clone()))
    }

    /// Queues client input for the session.
    ///
    /// Waits for room in the queue for at most the stall timeout. After a
    /// stall, input is dropped without waiting until the queue has room
    /// again, so the connection keeps processing close and disconnect
    /// messages while the process is not reading.
    async fn forward(&mut self, data: &[u8]) {
        let Some(input) = self.input.clone() else {
            return;
        };

        if self.input_stalled {
            match input.try_send(data.to_vec()) {
                Ok(()) => {
                    tracing::debug!("Session input resumed");
                    self.input_stalled = false;
                }
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(bytes = data.len(), "Session input stalled, dropping data");
                }
                Err(TrySendError::Closed(_)) => {}
            }
            return;
        }

        // The send fails at once when the session ends and drops its receiver.
        tokio::select! {
            sent = input.send(data.to_vec()) => {
                if sent.is_err() {
                    tracing::debug!("Session input closed, dropping data");
                }
            }
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.input_stall_timeout) => {
                tracing::warn!(
                    timeout_ms = self.input_stall_timeout.as_millis() as u64,
                    "Process is not reading input, dropping data"
                );
                self.input_stalled = true;
            }
        }
    }

    fn end_input(&mut self) {
        self.input = None;
    }

    fn close(&mut self) {
        self.cancel.cancel();
        self.input = None;
        self.resizes = None;
    }
}

/// Handles one SSH connection.
pub struct ConnectionHandler {
    peer: Option<SocketAddr>,
    policy: Arc<dyn AuthPolicy>,
    sessions: Arc<SessionHandler>,
    identity: Option<Identity>,
    channel: Option<(ChannelId, SessionChannel)>,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        peer: Option<SocketAddr>,
        policy: Arc<dyn AuthPolicy>,
        sessions: Arc<SessionHandler>,
    ) -> Self {
        Self {
            peer,
            policy,
            sessions,
            identity: None,
            channel: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelled when the connection goes away.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    fn authenticate(&mut self, credential: Credential<'_>) -> Auth {
        match self.policy.authenticate(&credential) {
            AuthDecision::Accept(identity) => {
                tracing::info!(
                    peer = ?self.peer,
                    user = %identity.user,
                    method = ?identity.method,
                    fingerprint = identity.fingerprint.as_deref().unwrap_or("-"),
                    policy = self.policy.name(),
                    "Client authenticated"
                );
                self.identity = Some(identity);
                Auth::Accept
            }
            AuthDecision::Reject => {
                tracing::warn!(
                    peer = ?self.peer,
                    user = credential.user(),
                    method = ?credential.method(),
                    policy = self.policy.name(),
                    "Authentication rejected"
                );
                Auth::Reject {
                    proceed_with_methods: None,
                }
            }
        }
    }

    fn pty_allowed(&self, request: &PtyRequest) -> bool {
        match &self.identity {
            Some(identity) => self.policy.allow_pty(identity, request),
            None => false,
        }
    }

    /// The session channel, if `id` names it.
    fn channel_mut(&mut self, id: ChannelId) -> Option<&mut SessionChannel> {
        match self.channel.as_mut() {
            Some((channel_id, state)) if *channel_id == id => Some(state),
            _ => None,
        }
    }

    fn open_channel(&mut self, id: ChannelId) -> bool {
        if self.channel.is_some() {
            tracing::warn!(peer = ?self.peer, channel = ?id, "Refusing additional session channel");
            return false;
        }
        self.channel = Some((id, SessionChannel::new(self.cancel.child_token())));
        true
    }

    fn request_pty(&mut self, id: ChannelId, request: PtyRequest) -> bool {
        let allowed = self.pty_allowed(&request);
        let peer = self.peer;
        let term = request.term.clone();
        let accepted = match self.channel_mut(id) {
            Some(state) if allowed => state.request_pty(request),
            _ => false,
        };
        if !accepted {
            tracing::warn!(peer = ?peer, term = %term, "PTY request refused");
        }
        accepted
    }

    fn start_session(&mut self, id: ChannelId, session: &mut Session) {
        let identity = self.identity.clone();
        let prepared = match (identity, self.channel_mut(id)) {
            (Some(identity), Some(state)) => state.start(identity),
            _ => None,
        };
        let Some((request, io, cancel)) = prepared else {
            session.channel_failure(id);
            return;
        };
        session.channel_success(id);

        let remote = Arc::new(SshChannel::new(session.handle(), id));
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let id = request.id.clone();
            let outcome = sessions.run(request, remote, io, cancel).await;
            tracing::debug!(session_id = %id, outcome = ?outcome, "Session task finished");
        });
    }

    async fn forward_input(&mut self, id: ChannelId, data: &[u8]) {
        if let Some(state) = self.channel_mut(id) {
            state.forward(data).await;
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        tracing::debug!(peer = ?self.peer, "Connection closed");
        self.cancel.cancel();
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(self.authenticate(Credential::Password { user, password }))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();
        Ok(self.authenticate(Credential::PublicKey {
            user,
            fingerprint: &fingerprint,
        }))
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        _response: Option<Response<'async_trait>>,
    ) -> Result<Auth, Self::Error> {
        Ok(self.authenticate(Credential::KeyboardInteractive { user }))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open_channel(channel.id()))
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = PtyRequest {
            term: term.to_string(),
            size: WindowSize::from_ssh(col_width, row_height),
        };
        if self.request_pty(channel, request) {
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let accepted = self
            .channel_mut(channel)
            .map(|state| state.set_env(variable_name, variable_value))
            .unwrap_or(false);
        if accepted {
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session(channel, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // The configured executable always runs; the requested command is ignored.
        tracing::debug!(command = %String::from_utf8_lossy(data), "Exec request");
        self.start_session(channel, session);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channel_mut(channel) {
            state.change_window(WindowSize::from_ssh(col_width, row_height));
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_input(channel, data).await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channel_mut(channel) {
            state.end_input();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channel_mut(channel) {
            state.close();
        }
        Ok(())
    }
}
