//! SSH listener.
//!
//! [`Server`] loads the host key, binds the listening socket and hands every
//! accepted connection to a fresh [`ConnectionHandler`]. Shutting down stops
//! the accept loop and closes the socket; sessions already running are left
//! to finish on their own.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use russh::MethodSet;
use russh_keys::key::KeyPair;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionHandler;
use crate::auth::{AuthPolicy, PermissivePolicy};
use crate::config::ServerConfig;
use crate::session::{ConfigProvisioner, NativePtySpawner, PtySpawner, SessionHandler, SessionRegistry};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors that prevent the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("home directory is unavailable; set server.host_key explicitly")]
    HomeDirUnavailable,

    #[error("SSH key is required to start server: {0} not found")]
    HostKeyMissing(PathBuf),

    #[error("failed to read host key {path}: {source}")]
    HostKeyUnreadable {
        path: PathBuf,
        #[source]
        source: russh_keys::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Returns `~/.ssh/id_rsa`.
pub fn default_host_key_path() -> Result<PathBuf, ServerError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("id_rsa"))
        .ok_or(ServerError::HomeDirUnavailable)
}

/// Loads the host private key.
pub fn load_host_key(path: &Path) -> Result<KeyPair, ServerError> {
    if !path.exists() {
        return Err(ServerError::HostKeyMissing(path.to_path_buf()));
    }
    russh_keys::load_secret_key(path, None).map_err(|source| ServerError::HostKeyUnreadable {
        path: path.to_path_buf(),
        source,
    })
}

/// An SSH server that is not yet listening.
pub struct Server {
    config: ServerConfig,
    policy: Arc<dyn AuthPolicy>,
    provisioner: Arc<ConfigProvisioner>,
    spawner: Arc<dyn PtySpawner>,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            policy: Arc::new(PermissivePolicy),
            provisioner: Arc::new(ConfigProvisioner::new()),
            spawner: Arc::new(NativePtySpawner),
            registry: Arc::new(SessionRegistry::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_auth_policy(mut self, policy: Arc<dyn AuthPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_provisioner(mut self, provisioner: ConfigProvisioner) -> Self {
        self.provisioner = Arc::new(provisioner);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn PtySpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Token that stops the accept loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops accepting connections. Running sessions are not interrupted.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Configured host key path, or `~/.ssh/id_rsa`.
    pub fn host_key_path(&self) -> Result<PathBuf, ServerError> {
        match &self.config.host_key {
            Some(path) => Ok(path.clone()),
            None => default_host_key_path(),
        }
    }

    /// Loads the host key and binds the listening socket.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let key_path = self.host_key_path()?;
        let host_key = load_host_key(&key_path)?;
        if let Ok(public) = host_key.clone_public_key() {
            tracing::info!(
                path = %key_path.display(),
                fingerprint = %public.fingerprint(),
                "Loaded host key"
            );
        }

        let addr = format!("{}:{}", self.config.address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        let ssh_config = russh::server::Config {
            inactivity_timeout: self.config.idle_timeout(),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods: MethodSet::PUBLICKEY | MethodSet::PASSWORD | MethodSet::KEYBOARD_INTERACTIVE,
            keys: vec![host_key],
            ..Default::default()
        };

        let executable = self
            .config
            .resolved_executable()
            .unwrap_or_else(|_| PathBuf::from(&self.config.executable));
        let sessions = SessionHandler::new(
            executable,
            self.provisioner,
            self.spawner,
            Arc::clone(&self.registry),
        )
        .with_teardown_grace(self.config.teardown_grace());

        if self.policy.name() == PermissivePolicy.name() {
            tracing::warn!("Permissive authentication policy active: every client is accepted");
        }

        tracing::info!(
            addr = %addr,
            executable = %sessions.executable().display(),
            idle_timeout_secs = self.config.idle_timeout_secs,
            "SSH server listening"
        );

        Ok(BoundServer {
            listener,
            ssh_config: Arc::new(ssh_config),
            policy: self.policy,
            sessions: Arc::new(sessions),
            registry: self.registry,
            shutdown: self.shutdown,
        })
    }

    /// Binds and serves until shut down.
    pub async fn listen_and_serve(self) -> Result<(), ServerError> {
        self.bind().await?.serve().await;
        Ok(())
    }
}

/// An SSH server bound to its listening socket.
pub struct BoundServer {
    listener: TcpListener,
    ssh_config: Arc<russh::server::Config>,
    policy: Arc<dyn AuthPolicy>,
    sessions: Arc<SessionHandler>,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
}

impl BoundServer {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts connections until the shutdown token fires, then closes the
    /// listening socket.
    pub async fn serve(self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(self.listener);

        let active = self.registry.list();
        tracing::info!(active_sessions = active.len(), "SSH server stopped accepting connections");
        for session in active {
            tracing::info!(
                session_id = %session.id,
                user = %session.user,
                pid = ?session.pid,
                "Session still running"
            );
        }
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        tracing::debug!(peer = %peer, "Accepted connection");
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let handler = ConnectionHandler::new(
            Some(peer),
            Arc::clone(&self.policy),
            Arc::clone(&self.sessions),
        );
        let config = Arc::clone(&self.ssh_config);

        tokio::spawn(async move {
            match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "SSH handshake failed");
                }
            }
        });
    }
}
