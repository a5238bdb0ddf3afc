//! In-process transport for tests and benchmarks.
//!
//! A [`MemoryNetwork`] is a hub of named endpoints. Every endpoint owns an
//! inbox channel; `send` looks up the recipient's inbox and pushes a clone of
//! the message. The hub also keeps a log of every send attempt and can be told
//! to fail sends to chosen addresses.
//!
//! ```rust,ignore
//! let network = MemoryNetwork::new();
//! let a = network.bind("A:9000").await?;
//! let b = network.bind("B:9001").await?;
//!
//! a.send(&Message::invite("A:9000", "B:9001"), "B:9001").await?;
//! assert_eq!(b.recv().await.unwrap().sender(), "A:9000");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use super::{shutdown_signaled, Transport, TransportError};
use crate::protocol::Message;

const DEFAULT_INBOX_CAPACITY: usize = 1024;

#[derive(Default)]
struct NetworkInner {
    endpoints: RwLock<HashMap<String, mpsc::Sender<Message>>>,
    sent: Mutex<Vec<(Message, String)>>,
    failing: RwLock<HashSet<String>>,
}

/// Shared hub connecting [`MemoryTransport`] endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
    inbox_capacity: Option<usize>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub whose endpoints buffer at most `capacity` inbound messages.
    pub fn with_inbox_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::default(),
            inbox_capacity: Some(capacity),
        }
    }

    /// Register a new endpoint. Fails if the address is already taken.
    pub async fn bind(&self, addr: impl Into<String>) -> Result<MemoryTransport, TransportError> {
        let addr = addr.into();
        let mut endpoints = self.inner.endpoints.write().await;
        if endpoints.contains_key(&addr) {
            return Err(TransportError::Bind {
                source: std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "address already in use",
                ),
                addr,
            });
        }

        let capacity = self.inbox_capacity.unwrap_or(DEFAULT_INBOX_CAPACITY);
        let (tx, rx) = mpsc::channel(capacity);
        endpoints.insert(addr.clone(), tx);
        let (shutdown, _) = watch::channel(false);

        Ok(MemoryTransport {
            addr,
            network: self.clone(),
            inbox: Mutex::new(rx),
            shutdown,
        })
    }

    /// Deliver `message` straight into its recipient's inbox, as if it
    /// arrived from a remote peer. Not recorded in the send log.
    pub async fn deliver(&self, message: Message) -> Result<(), TransportError> {
        let recipient = message.recipient().to_string();
        let tx = self.endpoint(&recipient).await?;
        tx.send(message).await.map_err(|_| TransportError::Send {
            addr: recipient,
            reason: "endpoint closed".into(),
        })
    }

    /// Every `(message, recipient)` passed to `send`, in call order.
    pub async fn sent(&self) -> Vec<(Message, String)> {
        self.inner.sent.lock().await.clone()
    }

    /// Sends addressed to `recipient`, in call order.
    pub async fn sent_to(&self, recipient: &str) -> Vec<Message> {
        self.inner
            .sent
            .lock()
            .await
            .iter()
            .filter(|(_, to)| to == recipient)
            .map(|(msg, _)| msg.clone())
            .collect()
    }

    pub async fn clear_sent(&self) {
        self.inner.sent.lock().await.clear();
    }

    /// Make every subsequent send to `addr` fail.
    pub async fn fail_sends_to(&self, addr: impl Into<String>) {
        self.inner.failing.write().await.insert(addr.into());
    }

    pub async fn restore(&self, addr: &str) {
        self.inner.failing.write().await.remove(addr);
    }

    pub async fn is_bound(&self, addr: &str) -> bool {
        self.inner.endpoints.read().await.contains_key(addr)
    }

    async fn endpoint(&self, addr: &str) -> Result<mpsc::Sender<Message>, TransportError> {
        self.inner
            .endpoints
            .read()
            .await
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::Connect {
                addr: addr.to_string(),
                reason: "no such endpoint".into(),
            })
    }

    async fn unbind(&self, addr: &str) {
        self.inner.endpoints.write().await.remove(addr);
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    addr: String,
    network: MemoryNetwork,
    inbox: Mutex<mpsc::Receiver<Message>>,
    shutdown: watch::Sender<bool>,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> &str {
        &self.addr
    }

    async fn send(&self, message: &Message, recipient: &str) -> Result<(), TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::Closed);
        }

        self.network
            .inner
            .sent
            .lock()
            .await
            .push((message.clone(), recipient.to_string()));

        if self.network.inner.failing.read().await.contains(recipient) {
            return Err(TransportError::Send {
                addr: recipient.to_string(),
                reason: "injected failure".into(),
            });
        }

        let tx = self.network.endpoint(recipient).await?;
        tx.send(message.clone())
            .await
            .map_err(|_| TransportError::Send {
                addr: recipient.to_string(),
                reason: "endpoint closed".into(),
            })
    }

    async fn recv(&self) -> Option<Message> {
        let closed = shutdown_signaled(self.shutdown.subscribe());
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            biased;
            _ = closed => None,
            msg = inbox.recv() => msg,
        }
    }

    async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.network.unbind(&self.addr).await;
        log::debug!("Memory transport {} shut down", self.addr);
    }
}
