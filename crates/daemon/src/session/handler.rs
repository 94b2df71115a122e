//! Per-session orchestration.
//!
//! [`SessionHandler::run`] takes one interactive request from validation to
//! teardown:
//!
//! ```text
//! validate ──> provision config ──> spawn on PTY ──> bridge ──> teardown
//!    │               │                   │                        │
//!    └─ reject       └─ abort            └─ report error          └─ close PTY, wait for
//!                                                                    exit, delete config
//! ```
//!
//! While bridging, three flows share the PTY: remote input is copied into
//! the PTY, PTY output is copied to the remote, and window changes are
//! applied as they arrive. Teardown starts when PTY output reaches end of
//! stream or when the session's cancellation token fires.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::provision::ConfigProvisioner;
use super::pty::{
    Killer, Process, PtyCommand, PtySpawner, SessionError, SessionId, SessionStatus, SpawnedPty,
    Terminal, WindowSize,
};
use super::registry::{SessionInfo, SessionRegistry};
use super::resize::ResizePropagator;
use crate::auth::Identity;

/// Message sent to clients that did not request a PTY.
pub const NON_INTERACTIVE_MESSAGE: &str = "Error: Non-interactive terminals are not supported";

/// Exit status reported when a session fails before its process runs.
pub const FAILURE_EXIT_STATUS: u32 = 1;

/// Default time to wait for PTY output to drain after the process is killed,
/// and for the process to honour the hangup before it is forced.
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the queues between the PTY threads and async tasks.
const PTY_CHANNEL_CAPACITY: usize = 64;

/// The client end of a session.
#[async_trait]
pub trait RemoteChannel: Send + Sync + 'static {
    /// Sends terminal output to the client.
    async fn send(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Reports the exit status of the session.
    async fn exit(&self, status: u32);

    /// Closes the channel.
    async fn close(&self);
}

/// PTY parameters negotiated by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Terminal type, exported to the process as `TERM`.
    pub term: String,
    /// Initial window size.
    pub size: WindowSize,
}

/// Everything the connection knows about a session when it starts.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub id: SessionId,
    pub identity: Identity,
    /// `None` when the client did not request a PTY.
    pub pty: Option<PtyRequest>,
    /// Environment variables sent by the client.
    pub env: Vec<(String, String)>,
}

/// Client-to-server streams of a session.
pub struct SessionIo {
    /// Bytes typed by the client. Closing the sender signals end of input.
    pub input: mpsc::Receiver<Vec<u8>>,
    /// Window-change notifications. Unbounded so that none is ever dropped.
    pub resizes: mpsc::UnboundedReceiver<WindowSize>,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The request was not interactive; nothing was spawned.
    Rejected,
    /// The config artifact could not be created; nothing was spawned.
    ProvisionFailed,
    /// The PTY or process could not be started.
    SpawnFailed,
    /// The process ran and has exited.
    Completed(SessionStatus),
}

/// Runs sessions for one server.
pub struct SessionHandler {
    executable: PathBuf,
    provisioner: Arc<ConfigProvisioner>,
    spawner: Arc<dyn PtySpawner>,
    registry: Arc<SessionRegistry>,
    teardown_grace: Duration,
}

impl SessionHandler {
    pub fn new(
        executable: impl Into<PathBuf>,
        provisioner: Arc<ConfigProvisioner>,
        spawner: Arc<dyn PtySpawner>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            executable: executable.into(),
            provisioner,
            spawner,
            registry,
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
        }
    }

    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Builds `<executable> --config <path>` with the client environment
    /// plus `TERM`.
    pub fn command_for(
        &self,
        request: &SessionRequest,
        pty: &PtyRequest,
        config_path: &Path,
    ) -> PtyCommand {
        PtyCommand::new(&self.executable)
            .arg("--config")
            .arg(config_path)
            .envs(request.env.iter().cloned())
            .env("TERM", pty.term.clone())
            .size(pty.size)
    }

    /// Runs a session to completion.
    ///
    /// `cancel` is tied to the client connection; cancelling it kills the
    /// process and tears the session down.
    pub async fn run(
        &self,
        request: SessionRequest,
        remote: Arc<dyn RemoteChannel>,
        io: SessionIo,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let span = tracing::info_span!(
            "session",
            session_id = %request.id,
            user = %request.identity.user,
        );
        self.run_session(request, remote, io, cancel)
            .instrument(span)
            .await
    }

    async fn run_session(
        &self,
        request: SessionRequest,
        remote: Arc<dyn RemoteChannel>,
        io: SessionIo,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let Some(pty) = request.pty.clone() else {
            tracing::warn!("Rejecting non-interactive session");
            if let Err(e) = remote.send(NON_INTERACTIVE_MESSAGE.as_bytes()).await {
                tracing::debug!(error = %e, "Failed to send rejection message");
            }
            finish(remote.as_ref(), FAILURE_EXIT_STATUS).await;
            return SessionOutcome::Rejected;
        };

        let artifact = match self.provisioner.provision() {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::error!(error = %e, "Failed to provision session config");
                finish(remote.as_ref(), FAILURE_EXIT_STATUS).await;
                return SessionOutcome::ProvisionFailed;
            }
        };

        let command = self.command_for(&request, &pty, artifact.path());
        let spawned = match self.spawner.spawn(&command) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(
                    program = %command.program.display(),
                    error = %e,
                    "Failed to start process"
                );
                if let Err(send_err) = remote.send(e.to_string().as_bytes()).await {
                    tracing::debug!(error = %send_err, "Failed to report spawn error");
                }
                if let Err(e) = artifact.release() {
                    tracing::warn!(error = %e, "Failed to remove session config");
                }
                finish(remote.as_ref(), FAILURE_EXIT_STATUS).await;
                return SessionOutcome::SpawnFailed;
            }
        };

        let pid = spawned.process.pid();
        self.registry.register(SessionInfo {
            id: request.id.clone(),
            user: request.identity.user.clone(),
            term: pty.term.clone(),
            size: pty.size,
            pid,
            started_at: SystemTime::now(),
        });
        tracing::info!(
            pid = ?pid,
            term = %pty.term,
            cols = pty.size.cols,
            rows = pty.size.rows,
            "Session started"
        );

        let status = self.bridge(spawned, Arc::clone(&remote), io, &cancel).await;

        self.registry.remove(&request.id);
        if let Err(e) = artifact.release() {
            tracing::warn!(error = %e, "Failed to remove session config");
        }

        tracing::info!(status = ?status, "Session finished");
        finish(remote.as_ref(), status.exit_code()).await;
        SessionOutcome::Completed(status)
    }

    /// Runs the three I/O flows, then closes the PTY and waits for the
    /// process.
    async fn bridge(
        &self,
        spawned: SpawnedPty,
        remote: Arc<dyn RemoteChannel>,
        io: SessionIo,
        cancel: &CancellationToken,
    ) -> SessionStatus {
        let SpawnedPty {
            terminal,
            reader,
            writer,
            process,
        } = spawned;
        let mut killer = process.killer();
        let stop = CancellationToken::new();

        let resize_task = tokio::spawn(
            ResizePropagator::new(Arc::clone(&terminal), io.resizes)
                .run(stop.clone())
                .in_current_span(),
        );
        let input_task = tokio::spawn(
            copy_remote_to_pty(io.input, writer, stop.clone()).in_current_span(),
        );
        let mut output_task: JoinHandle<Result<u64, SessionError>> =
            tokio::spawn(copy_pty_to_remote(reader, remote).in_current_span());

        let mut killed = false;
        tokio::select! {
            result = &mut output_task => match result {
                Ok(Ok(bytes)) => {
                    tracing::debug!(bytes, "PTY output reached end of stream");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Output flow failed, terminating process");
                    killed = kill(killer.as_mut());
                }
                Err(e) => {
                    tracing::error!(error = %e, "Output flow panicked, terminating process");
                    killed = kill(killer.as_mut());
                }
            },
            _ = cancel.cancelled() => {
                tracing::info!("Session cancelled, terminating process");
                killed = kill(killer.as_mut());
                match tokio::time::timeout(self.teardown_grace, &mut output_task).await {
                    Ok(_) => tracing::debug!("Output flow drained after cancellation"),
                    Err(_) => {
                        tracing::warn!(
                            grace_ms = self.teardown_grace.as_millis() as u64,
                            "Output flow still blocked after grace period, abandoning it"
                        );
                        output_task.abort();
                    }
                }
            }
        }

        stop.cancel();
        terminal.close();

        let status = wait_for_exit(process, killer, killed, cancel, self.teardown_grace).await;

        match resize_task.await {
            Ok(applied) => tracing::debug!(applied, "Resize flow stopped"),
            Err(e) => tracing::warn!(error = %e, "Resize flow panicked"),
        }
        match input_task.await {
            Ok(bytes) => tracing::debug!(bytes, "Input flow stopped"),
            Err(e) => tracing::warn!(error = %e, "Input flow panicked"),
        }

        status
    }
}

/// Sends the exit status and closes the channel.
async fn finish(remote: &dyn RemoteChannel, status: u32) {
    remote.exit(status).await;
    remote.close().await;
}

/// Returns true when the kill signal was delivered.
fn kill(killer: &mut dyn Killer) -> bool {
    match killer.kill() {
        Ok(()) => true,
        Err(e) => {
            // The process usually exited already.
            tracing::debug!(error = %e, "Failed to kill process");
            false
        }
    }
}

type WaitTask = JoinHandle<Result<u32, SessionError>>;

/// Waits for the process to exit. A cancellation while waiting kills it.
async fn wait_for_exit(
    mut process: Box<dyn Process>,
    mut killer: Box<dyn Killer>,
    mut killed: bool,
    cancel: &CancellationToken,
    grace: Duration,
) -> SessionStatus {
    let mut wait: WaitTask = tokio::task::spawn_blocking(move || process.wait());

    let result = if killed {
        reap(&mut wait, killer.as_mut(), grace).await
    } else {
        tokio::select! {
            result = &mut wait => result,
            _ = cancel.cancelled() => {
                tracing::info!("Session cancelled while waiting for process exit");
                killed = kill(killer.as_mut());
                reap(&mut wait, killer.as_mut(), grace).await
            }
        }
    };

    match result {
        Ok(Ok(code)) if killed => SessionStatus::Killed(code),
        Ok(Ok(code)) => SessionStatus::Exited(code),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to collect process exit status");
            SessionStatus::Terminated
        }
        Err(e) => {
            tracing::error!(error = %e, "Wait task panicked");
            SessionStatus::Terminated
        }
    }
}

/// Waits for a process that was asked to exit, forcing it once `grace`
/// runs out.
async fn reap(
    wait: &mut WaitTask,
    killer: &mut dyn Killer,
    grace: Duration,
) -> Result<Result<u32, SessionError>, JoinError> {
    if let Ok(result) = tokio::time::timeout(grace, &mut *wait).await {
        return result;
    }

    tracing::warn!(
        grace_ms = grace.as_millis() as u64,
        "Process still running after hangup, forcing termination"
    );
    if let Err(e) = killer.force_kill() {
        tracing::warn!(error = %e, "Failed to force kill process");
    }
    wait.await
}

/// Copies client input into the PTY until input ends or `stop` fires.
///
/// Writes happen on a dedicated thread since the PTY writer blocks.
async fn copy_remote_to_pty(
    mut input: mpsc::Receiver<Vec<u8>>,
    writer: Box<dyn Write + Send>,
    stop: CancellationToken,
) -> u64 {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(PTY_CHANNEL_CAPACITY);

    if let Err(e) = std::thread::Builder::new()
        .name("pty-writer".into())
        .spawn(move || write_loop(writer, rx))
    {
        tracing::error!(error = %e, "Failed to start PTY writer thread");
        return 0;
    }

    let mut forwarded = 0u64;
    loop {
        let data = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            data = input.recv() => match data {
                Some(data) => data,
                None => {
                    tracing::debug!("Remote input reached end of stream");
                    break;
                }
            },
        };

        let len = data.len() as u64;
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            sent = tx.send(data) => {
                if sent.is_err() {
                    break;
                }
                forwarded += len;
            }
        }
    }

    forwarded
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            tracing::debug!(error = %e, "PTY write failed");
            break;
        }
    }
}

/// Copies PTY output to the client until the PTY reaches end of stream.
///
/// Fails only when the client can no longer receive data.
async fn copy_pty_to_remote(
    reader: Box<dyn Read + Send>,
    remote: Arc<dyn RemoteChannel>,
) -> Result<u64, SessionError> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PTY_CHANNEL_CAPACITY);

    std::thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || read_loop(reader, tx))?;

    let mut copied = 0u64;
    while let Some(chunk) = rx.recv().await {
        remote.send(&chunk).await?;
        copied += chunk.len() as u64;
    }

    Ok(copied)
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the slave side is closed is the normal end on Linux.
                tracing::debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}
