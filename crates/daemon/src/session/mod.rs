//! Session management module.
//!
//! One session per interactive SSH channel: a temporary config file is
//! provisioned, the configured executable is spawned on a PTY, I/O and
//! window changes are bridged, and everything is torn down when either side
//! goes away.

pub mod handler;
pub mod provision;
pub mod pty;
pub mod registry;
pub mod resize;

pub use handler::{
    PtyRequest, RemoteChannel, SessionHandler, SessionIo, SessionOutcome, SessionRequest,
    NON_INTERACTIVE_MESSAGE,
};
pub use provision::{ConfigArtifact, ConfigProvisioner};
pub use pty::{
    NativePtySpawner, PtyCommand, PtySpawner, SessionError, SessionId, SessionStatus, WindowSize,
};
pub use registry::{SessionInfo, SessionRegistry};
pub use resize::ResizePropagator;
