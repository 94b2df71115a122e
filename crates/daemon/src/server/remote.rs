//! SSH channel as a session's remote end.

use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};

use crate::session::{RemoteChannel, SessionError};

/// Sends session output over an SSH channel.
pub struct SshChannel {
    handle: Handle,
    channel: ChannelId,
}

impl SshChannel {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn send(&self, data: &[u8]) -> Result<(), SessionError> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| SessionError::RemoteClosed)
    }

    async fn exit(&self, status: u32) {
        if self
            .handle
            .exit_status_request(self.channel, status)
            .await
            .is_err()
        {
            tracing::debug!(channel = ?self.channel, status, "Could not send exit status");
        }
    }

    async fn close(&self) {
        // EOF first so clients flush pending output before the close.
        if self.handle.eof(self.channel).await.is_err() {
            tracing::debug!(channel = ?self.channel, "Could not send EOF");
        }
        if self.handle.close(self.channel).await.is_err() {
            tracing::debug!(channel = ?self.channel, "Channel already closed");
        }
    }
}
