//! Registry of live sessions.
//!
//! Sessions register themselves once their process is running and remove
//! themselves during teardown. The registry never owns session resources; it
//! only records what is running for operators and shutdown reporting.

use std::time::SystemTime;

use dashmap::DashMap;

use super::pty::{SessionId, WindowSize};

/// Information about a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Authenticated user name.
    pub user: String,
    /// Terminal type negotiated with the client.
    pub term: String,
    /// Size at spawn time.
    pub size: WindowSize,
    /// Process ID of the child, if known.
    pub pid: Option<u32>,
    /// When the process was started.
    pub started_at: SystemTime,
}

/// Thread-safe session registry using DashMap.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: SessionInfo) {
        tracing::debug!(session_id = %info.id, pid = ?info.pid, "Registered session");
        self.sessions.insert(info.id.clone(), info);
    }

    pub fn remove(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.remove(id).map(|(_, info)| info)
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Lists all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|info| info.started_at);
        sessions
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
