//! Transport abstraction between sessions.
//!
//! The session only needs three things from the network: send a message to an
//! address, receive the next inbound message, and shut down. `recv` returning
//! `None` is the shutdown sentinel.
//!
//! ## Implementations
//!
//! - [`WsTransport`]: WebSocket listener + lazily connected outbound sockets
//! - [`MemoryTransport`]: in-process hub for tests and benchmarks

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{Message, ProtocolError};

pub mod memory;
pub mod ws;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use ws::WsTransport;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Inbound messages buffered before readers stall
    pub inbox_capacity: usize,
    /// Timeout for establishing an outbound connection
    pub connect_timeout_secs: u64,
    /// Timeout for a single outbound frame
    pub send_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 256,
            connect_timeout_secs: 5,
            send_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("Failed to send to {addr}: {reason}")]
    Send { addr: String, reason: String },
    #[error("Timed out talking to {0}")]
    Timeout(String),
    #[error("Transport is shut down")]
    Closed,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Message transport used by a session.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address this transport is bound to.
    fn local_addr(&self) -> &str;

    /// Send `message` to `recipient`.
    ///
    /// Implementations apply their own timeouts and never retry.
    async fn send(&self, message: &Message, recipient: &str) -> Result<(), TransportError>;

    /// Next inbound message, or `None` once the transport is shut down.
    ///
    /// Messages from one sender arrive in the order they were sent.
    async fn recv(&self) -> Option<Message>;

    /// Release all resources. Pending and future `recv` calls return `None`.
    async fn shutdown(&self);
}

/// Resolves once `rx` observes `true` or its sender is gone.
pub(crate) async fn shutdown_signaled(mut rx: tokio::sync::watch::Receiver<bool>) {
    loop {
        let done = *rx.borrow_and_update();
        if done || rx.changed().await.is_err() {
            return;
        }
    }
}
