use thiserror::Error;

use crate::broadcast::BroadcastError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to bind session transport: {0}")]
    Bind(#[source] TransportError),

    #[error("Cannot invite own address {0}")]
    SelfInvite(String),

    #[error("Failed to send to {peer}: {source}")]
    Send {
        peer: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error("Session has been terminated")]
    Terminated,
}

impl SessionError {
    pub fn is_terminated(&self) -> bool {
        matches!(self, SessionError::Terminated)
    }
}
