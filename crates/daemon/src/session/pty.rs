//! PTY spawning and control.
//!
//! A [`PtySpawner`] starts a program attached to a fresh pseudo-terminal and
//! hands back the pieces a session needs: a [`Terminal`] for resize and close,
//! a blocking reader and writer over the master side, and the child
//! [`Process`]. The native implementation is backed by `portable-pty`.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

/// How often a waiting thread polls the child for exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Failed to create the per-session config artifact.
    #[error("failed to provision session config: {0}")]
    ProvisionFailed(#[source] std::io::Error),

    /// Failed to allocate the PTY or start the process.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// The PTY has already been closed.
    #[error("PTY is closed")]
    Closed,

    /// Failed to wait for the process to exit.
    #[error("failed to wait for process: {0}")]
    WaitFailed(String),

    /// Failed to kill the process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// The remote side of the session is gone.
    #[error("remote channel closed")]
    RemoteClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Final status of a session's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The process exited on its own with a code.
    Exited(u32),
    /// The process was killed by the session and reported this code.
    Killed(u32),
    /// The exit status could not be collected.
    Terminated,
}

impl SessionStatus {
    /// Exit code reported to the remote client.
    pub fn exit_code(&self) -> u32 {
        match self {
            SessionStatus::Exited(code) | SessionStatus::Killed(code) => *code,
            SessionStatus::Terminated => 1,
        }
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Builds a size from the 32-bit fields carried by SSH requests,
    /// saturating at `u16::MAX`.
    pub fn from_ssh(col_width: u32, row_height: u32) -> Self {
        Self {
            cols: u16::try_from(col_width).unwrap_or(u16::MAX),
            rows: u16::try_from(row_height).unwrap_or(u16::MAX),
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<WindowSize> for PtySize {
    fn from(size: WindowSize) -> Self {
        // Pixel dimensions are not tracked.
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl From<PtySize> for WindowSize {
    fn from(size: PtySize) -> Self {
        Self {
            cols: size.cols,
            rows: size.rows,
        }
    }
}

/// A program to start on a PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyCommand {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments, not including the program itself.
    pub args: Vec<OsString>,
    /// Complete environment of the child. Nothing else is inherited.
    pub env: Vec<(String, String)>,
    /// Initial terminal size.
    pub size: WindowSize,
}

impl PtyCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            size: WindowSize::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn size(mut self, size: WindowSize) -> Self {
        self.size = size;
        self
    }

    /// Returns the value of an environment variable, last definition wins.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Control surface of an allocated PTY.
pub trait Terminal: Send + Sync {
    /// Applies a new window size.
    fn resize(&self, size: WindowSize) -> Result<(), SessionError>;

    /// Returns the current window size.
    fn size(&self) -> Result<WindowSize, SessionError>;

    /// Releases the master side. Calling it again is a no-op.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Handle for terminating a process from another task.
pub trait Killer: Send + Sync {
    /// Asks the process to exit. On Unix this is a hangup, which the
    /// process may ignore.
    fn kill(&mut self) -> Result<(), SessionError>;

    /// Terminates the process unconditionally.
    fn force_kill(&mut self) -> Result<(), SessionError>;
}

/// A child process started on a PTY.
pub trait Process: Send {
    fn pid(&self) -> Option<u32>;

    fn killer(&self) -> Box<dyn Killer>;

    /// Blocks until the process exits and returns its exit code. Must not
    /// prevent a [`Killer`] from acting while it blocks.
    fn wait(&mut self) -> Result<u32, SessionError>;
}

/// Everything produced by a successful spawn.
pub struct SpawnedPty {
    pub terminal: Arc<dyn Terminal>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub process: Box<dyn Process>,
}

/// Starts programs attached to pseudo-terminals.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, command: &PtyCommand) -> Result<SpawnedPty, SessionError>;
}

/// Spawner backed by the platform PTY implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, command: &PtyCommand) -> Result<SpawnedPty, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(command.size.into())
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd.env_clear();
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // The child holds its own copy of the slave side.
        drop(pair.slave);

        let handles = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));

        let (reader, writer) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SessionError::SpawnFailed(e.to_string()));
            }
        };

        tracing::debug!(
            program = %command.program.display(),
            pid = ?child.process_id(),
            cols = command.size.cols,
            rows = command.size.rows,
            "Spawned process on PTY"
        );

        Ok(SpawnedPty {
            terminal: Arc::new(NativeTerminal::new(pair.master)),
            reader,
            writer,
            process: Box::new(NativeProcess {
                child: Arc::new(Mutex::new(child)),
            }),
        })
    }
}

/// Master side of a native PTY.
struct NativeTerminal {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    closed: AtomicBool,
}

impl NativeTerminal {
    fn new(master: Box<dyn MasterPty + Send>) -> Self {
        Self {
            master: Mutex::new(Some(master)),
            closed: AtomicBool::new(false),
        }
    }
}

impl Terminal for NativeTerminal {
    fn resize(&self, size: WindowSize) -> Result<(), SessionError> {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        let master = master.as_ref().ok_or(SessionError::Closed)?;
        master
            .resize(size.into())
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    fn size(&self) -> Result<WindowSize, SessionError> {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        let master = master.as_ref().ok_or(SessionError::Closed)?;
        master
            .get_size()
            .map(WindowSize::from)
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let master = self
            .master
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(master);
        tracing::debug!("Closed PTY master");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

fn lock_child(child: &SharedChild) -> std::sync::MutexGuard<'_, Box<dyn Child + Send + Sync>> {
    child.lock().unwrap_or_else(|e| e.into_inner())
}

struct NativeProcess {
    child: SharedChild,
}

impl Process for NativeProcess {
    fn pid(&self) -> Option<u32> {
        lock_child(&self.child).process_id()
    }

    fn killer(&self) -> Box<dyn Killer> {
        Box::new(NativeKiller {
            hangup: lock_child(&self.child).clone_killer(),
            child: Arc::clone(&self.child),
        })
    }

    // Polls instead of blocking in `Child::wait` so the child stays
    // reachable for `force_kill`.
    fn wait(&mut self) -> Result<u32, SessionError> {
        loop {
            let status = lock_child(&self.child)
                .try_wait()
                .map_err(|e| SessionError::WaitFailed(e.to_string()))?;
            if let Some(status) = status {
                return Ok(status.exit_code());
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

struct NativeKiller {
    hangup: Box<dyn ChildKiller + Send + Sync>,
    child: SharedChild,
}

impl Killer for NativeKiller {
    fn kill(&mut self) -> Result<(), SessionError> {
        self.hangup
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))
    }

    fn force_kill(&mut self) -> Result<(), SessionError> {
        // `Child::kill` escalates to SIGKILL when the hangup is not honoured.
        lock_child(&self.child)
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))
    }
}
