//! # Shellgate Daemon Library
//!
//! An SSH server that gives every interactive client its own instance of a
//! configured program, running on a pseudo-terminal.
//!
//! ## Overview
//!
//! For each session the daemon:
//!
//! - **Provisions** a temporary config file for the session
//! - **Spawns** `<executable> --config <path>` on a fresh PTY, with the
//!   client's environment plus `TERM`
//! - **Bridges** terminal input, output and window changes
//! - **Tears down** in order: close the PTY, wait for the process, delete the
//!   config file
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        SSH Listener                          │
//! │        host key · accept loop · graceful shutdown            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────┐        ┌──────────────────────────┐  │
//! │  │ ConnectionHandler  │───────>│       AuthPolicy         │  │
//! │  └─────────┬──────────┘        └──────────────────────────┘  │
//! │            │ shell / exec                                     │
//! │  ┌─────────▼──────────────────────────────────────────────┐  │
//! │  │                  SessionHandler                         │  │
//! │  │  ConfigProvisioner · PtySpawner · ResizePropagator      │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let server = Server::new(config.server.clone());
//!     let shutdown = server.shutdown_token();
//!     let bound = server.bind().await?;
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.cancel();
//!     });
//!     bound.serve().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`auth`]: Authentication policies
//! - [`server`]: SSH listener and connection handling
//! - [`session`]: Session orchestration, PTY spawning and config provisioning

pub mod auth;
pub mod config;
pub mod server;
pub mod session;

#[cfg(test)]
mod test_utils;

// Re-export config types for convenience
pub use config::Config;

// Re-export auth types for convenience
pub use auth::{AuthDecision, AuthPolicy, Credential, FingerprintAllowList, Identity, PermissivePolicy};

// Re-export server types for convenience
pub use server::{BoundServer, Server, ServerError};

// Re-export session types for convenience
pub use session::{
    ConfigProvisioner, NativePtySpawner, PtySpawner, SessionError, SessionHandler, SessionId,
    SessionOutcome, SessionRegistry, SessionStatus, WindowSize,
};
