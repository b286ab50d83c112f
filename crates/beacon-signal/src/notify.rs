//! Outbound presence notifications

use async_trait::async_trait;
use thiserror::Error;

/// Notification failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("client {0} is not connected")]
    NotConnected(String),

    #[error("send to client {0} failed: channel closed")]
    ChannelClosed(String),
}

impl NotifyError {
    /// The client simply has no socket right now (closed without `leave`)
    pub fn is_disconnected(&self) -> bool {
        matches!(self, NotifyError::NotConnected(_))
    }
}

/// Delivers liveness probes and eviction notices to clients
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Ask a quiet client to prove it is still there
    async fn send_ping(&self, client_id: &str) -> Result<(), NotifyError>;

    /// Tell a client it has been evicted
    async fn send_bye(&self, client_id: &str) -> Result<(), NotifyError>;
}
