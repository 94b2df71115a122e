//! Window-change propagation.
//!
//! The remote client reports terminal size changes as a stream of
//! notifications. [`ResizePropagator`] drains that stream in order and applies
//! each size to the PTY, so the terminal always reflects the latest one.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::pty::{SessionError, Terminal, WindowSize};

/// Applies queued window sizes to a terminal.
pub struct ResizePropagator {
    terminal: Arc<dyn Terminal>,
    events: mpsc::UnboundedReceiver<WindowSize>,
}

impl ResizePropagator {
    pub fn new(terminal: Arc<dyn Terminal>, events: mpsc::UnboundedReceiver<WindowSize>) -> Self {
        Self { terminal, events }
    }

    /// Runs until the event stream ends, `stop` fires, or the terminal is
    /// closed. Returns the number of sizes applied.
    pub async fn run(mut self, stop: CancellationToken) -> usize {
        let mut applied = 0;

        loop {
            let size = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(size) => size,
                    None => break,
                },
            };

            match self.terminal.resize(size) {
                Ok(()) => {
                    applied += 1;
                    tracing::debug!(cols = size.cols, rows = size.rows, "Resized PTY");
                }
                Err(SessionError::Closed) => {
                    tracing::debug!("Terminal closed, dropping remaining resize events");
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        cols = size.cols,
                        rows = size.rows,
                        error = %e,
                        "Failed to resize PTY"
                    );
                }
            }
        }

        applied
    }
}
