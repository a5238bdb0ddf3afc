//! Session coordinator: membership, edit relay and the dispatch loop.
//!
//! Architecture:
//! ```text
//!  caller tasks                              dispatch task (one per session)
//!  ────────────                              ──────────────────────────────
//!  invite(addr) ──┐                          loop {
//!  notify(edit) ──┼── state lock ──┐            transport.recv()
//!  terminate()  ──┘  (peers, flag) │              ├─ Invite → peers.insert(sender)
//!                                  │              └─ Edit   → engine.apply(edit)
//!                      Transport ◄─┘                             │
//!                                                                ▼
//!  fetch_updates() ◄──────────────── UpdateStream ◄── push (bounded, blocking)
//! ```
//!
//! The merge engine is moved into the dispatch task, so no other task can
//! apply edits to the document.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use red_core::{Edit, MergeEngine, TextMergeEngine};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::broadcast::{broadcast, BroadcastReport};
use crate::error::SessionError;
use crate::membership::PeerSet;
use crate::protocol::Message;
use crate::transport::{shutdown_signaled, Transport, TransportConfig, WsTransport};
use crate::updates::{self, UpdateSender, UpdateStream};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Undelivered updates buffered before the dispatch task blocks
    pub update_capacity: usize,
    /// Settings for the WebSocket transport built by [`Session::create`]
    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            update_capacity: 64,
            transport: TransportConfig::default(),
        }
    }
}

/// Session counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub invites_sent: u64,
    pub invites_received: u64,
    pub edits_sent: u64,
    pub edits_received: u64,
    pub updates_delivered: u64,
    pub send_failures: u64,
    pub merge_failures: u64,
}

/// Lock-free counters behind [`SessionStats`].
#[derive(Default)]
struct AtomicSessionStats {
    invites_sent: AtomicU64,
    invites_received: AtomicU64,
    edits_sent: AtomicU64,
    edits_received: AtomicU64,
    updates_delivered: AtomicU64,
    send_failures: AtomicU64,
    merge_failures: AtomicU64,
}

impl AtomicSessionStats {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            invites_sent: self.invites_sent.load(Ordering::Relaxed),
            invites_received: self.invites_received.load(Ordering::Relaxed),
            edits_sent: self.edits_sent.load(Ordering::Relaxed),
            edits_received: self.edits_received.load(Ordering::Relaxed),
            updates_delivered: self.updates_delivered.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            merge_failures: self.merge_failures.load(Ordering::Relaxed),
        }
    }
}

/// Everything guarded by the session lock.
struct SessionState {
    peers: PeerSet,
    terminated: bool,
    /// Producer side of the update queue; `None` once closed.
    updates: Option<UpdateSender>,
}

struct SessionInner {
    addr: String,
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    shutdown: watch::Sender<bool>,
    stats: AtomicSessionStats,
}

/// One participant in a collaborative editing session.
pub struct Session {
    inner: Arc<SessionInner>,
    updates: UpdateStream,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Bind a WebSocket transport on `addr` and start the session with an
    /// empty document and default configuration.
    pub async fn create(addr: impl Into<String>) -> Result<Self, SessionError> {
        Self::create_with_config(addr, SessionConfig::default()).await
    }

    pub async fn create_with_config(
        addr: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let transport = WsTransport::bind(addr, config.transport.clone())
            .await
            .map_err(SessionError::Bind)?;
        Ok(Self::with_parts(transport, TextMergeEngine::new(), config))
    }

    /// Start a session over an already bound transport.
    ///
    /// Spawns the dispatch task, so this must run inside a Tokio runtime.
    pub fn with_parts<T, E>(transport: T, engine: E, config: SessionConfig) -> Self
    where
        T: Transport,
        E: MergeEngine,
    {
        let addr = transport.local_addr().to_string();
        let (updates_tx, updates) = updates::channel(config.update_capacity);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(SessionInner {
            state: Mutex::new(SessionState {
                peers: PeerSet::new(addr.clone()),
                terminated: false,
                updates: Some(updates_tx),
            }),
            addr,
            transport: Arc::new(transport),
            shutdown,
            stats: AtomicSessionStats::default(),
        });

        let dispatch = tokio::spawn(dispatch_loop(inner.clone(), Box::new(engine)));
        log::info!("Session started on {}", inner.addr);

        Self {
            inner,
            updates,
            dispatch: Mutex::new(Some(dispatch)),
        }
    }

    /// Invite `addr` into the session.
    ///
    /// The peer is recorded locally before the INVITE is sent and stays
    /// recorded even if sending fails; the send error is still returned.
    pub async fn invite(&self, addr: &str) -> Result<(), SessionError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.terminated {
                return Err(SessionError::Terminated);
            }
            if state.peers.is_own(addr) {
                return Err(SessionError::SelfInvite(addr.to_string()));
            }
            if state.peers.insert(addr) {
                log::info!("{} added peer {addr}", self.inner.addr);
            }
        }

        let message = Message::invite(self.inner.addr.as_str(), addr);
        match self.inner.transport.send(&message, addr).await {
            Ok(()) => {
                AtomicSessionStats::bump(&self.inner.stats.invites_sent, 1);
                Ok(())
            }
            Err(source) => {
                log::warn!("INVITE to {addr} failed: {source}");
                AtomicSessionStats::bump(&self.inner.stats.send_failures, 1);
                Err(SessionError::Send {
                    peer: addr.to_string(),
                    source,
                })
            }
        }
    }

    /// Relay a local edit to every known peer.
    ///
    /// Peers are snapshotted under the lock, then each gets one send attempt.
    /// If any send fails the error carries the full [`BroadcastReport`].
    pub async fn notify(&self, edit: Edit) -> Result<BroadcastReport, SessionError> {
        let peers = {
            let state = self.inner.state.lock().await;
            if state.terminated {
                return Err(SessionError::Terminated);
            }
            state.peers.snapshot()
        };

        log::debug!("{} relaying {edit} to {} peers", self.inner.addr, peers.len());
        let template = Message::edit(self.inner.addr.as_str(), "", edit);
        let report = broadcast(self.inner.transport.as_ref(), &template, &peers).await;

        let stats = &self.inner.stats;
        AtomicSessionStats::bump(&stats.edits_sent, report.delivered.len() as u64);
        AtomicSessionStats::bump(&stats.send_failures, report.failures.len() as u64);

        report.into_result().map_err(SessionError::from)
    }

    /// Handle to the converged document updates. Always the same queue.
    pub fn fetch_updates(&self) -> UpdateStream {
        self.updates.clone()
    }

    /// Stop the session.
    ///
    /// Closes the update queue, shuts the transport down and waits for the
    /// dispatch task to exit. Calls after the first return immediately.
    pub async fn terminate(&self) {
        let updates = {
            let mut state = self.inner.state.lock().await;
            if state.terminated {
                log::debug!("Session {} already terminated", self.inner.addr);
                return;
            }
            state.terminated = true;
            state.updates.take()
        };

        log::info!("Terminating session {}", self.inner.addr);
        drop(updates);
        self.inner.shutdown.send_replace(true);
        self.inner.transport.shutdown().await;

        if let Some(task) = self.dispatch.lock().await.take() {
            if let Err(e) = task.await {
                log::error!("Dispatch task for {} failed: {e}", self.inner.addr);
            }
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.addr
    }

    /// Sorted snapshot of the current peers.
    pub async fn peers(&self) -> Vec<String> {
        self.inner.state.lock().await.peers.snapshot()
    }

    pub async fn is_terminated(&self) -> bool {
        self.inner.state.lock().await.terminated
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.stats.snapshot()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Lets the dispatch task exit if terminate() was never awaited
        self.inner.shutdown.send_replace(true);
    }
}

impl SessionInner {
    async fn accept_invite(&self, sender: &str) {
        {
            let mut state = self.state.lock().await;
            if state.peers.is_own(sender) {
                log::warn!("{} ignored an INVITE from its own address", self.addr);
            } else if state.peers.insert(sender) {
                log::info!("{} accepted an INVITE from {sender}", self.addr);
            } else {
                log::debug!("{} already knows {sender}", self.addr);
            }
        }
        // Counted after the insert so the count never runs ahead of membership
        AtomicSessionStats::bump(&self.stats.invites_received, 1);
    }

    /// Push one update, blocking while the queue is full.
    ///
    /// Fails with `Terminated` once termination has begun, including when it
    /// begins while this push is waiting for room.
    async fn deliver(&self, text: String) -> Result<(), SessionError> {
        let tx = {
            let state = self.state.lock().await;
            match &state.updates {
                Some(tx) if !state.terminated => tx.clone(),
                _ => return Err(SessionError::Terminated),
            }
        };

        let permit = tokio::select! {
            biased;
            _ = shutdown_signaled(self.shutdown.subscribe()) => {
                return Err(SessionError::Terminated);
            }
            permit = tx.reserve_owned() => permit.map_err(|_| SessionError::Terminated)?,
        };

        // Re-check under the lock that closes the queue
        let state = self.state.lock().await;
        if state.terminated {
            return Err(SessionError::Terminated);
        }
        permit.send(text);
        AtomicSessionStats::bump(&self.stats.updates_delivered, 1);
        Ok(())
    }
}

/// Consume inbound messages one at a time until the transport or the
/// session shuts down.
async fn dispatch_loop(inner: Arc<SessionInner>, mut engine: Box<dyn MergeEngine>) {
    let closed = shutdown_signaled(inner.shutdown.subscribe());
    tokio::pin!(closed);

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut closed => None,
            message = inner.transport.recv() => message,
        };
        let Some(message) = next else {
            break;
        };

        match message {
            Message::Invite { sender, .. } => inner.accept_invite(&sender).await,
            Message::Edit { sender, edit, .. } => {
                log::debug!("{} accepted an EDIT from {sender}: {edit}", inner.addr);
                AtomicSessionStats::bump(&inner.stats.edits_received, 1);

                let text = match engine.apply(&edit) {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("Dropping EDIT from {sender}: {e}");
                        AtomicSessionStats::bump(&inner.stats.merge_failures, 1);
                        continue;
                    }
                };
                if inner.deliver(text).await.is_err() {
                    break;
                }
            }
        }
    }

    log::info!("Dispatch loop for {} stopped", inner.addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use tokio::time::{timeout, Duration};

    async fn memory_session(network: &MemoryNetwork, addr: &str) -> Session {
        let transport = network.bind(addr).await.unwrap();
        Session::with_parts(transport, TextMergeEngine::new(), SessionConfig::default())
    }

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.update_capacity, 64);
        assert_eq!(config.transport.inbox_capacity, 256);
        assert_eq!(config.transport.connect_timeout_secs, 5);
        assert_eq!(config.transport.send_timeout_secs, 5);
    }

    #[tokio::test]
    async fn test_new_session_is_empty_and_running() {
        let network = MemoryNetwork::new();
        let session = memory_session(&network, "A:9000").await;

        assert_eq!(session.address(), "A:9000");
        assert!(session.peers().await.is_empty());
        assert!(!session.is_terminated().await);
        assert_eq!(session.stats(), SessionStats::default());
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_self_invite_rejected() {
        let network = MemoryNetwork::new();
        let session = memory_session(&network, "A:9000").await;

        let err = session.invite("A:9000").await.unwrap_err();
        assert!(matches!(err, SessionError::SelfInvite(_)));
        assert!(session.peers().await.is_empty());
        assert!(network.sent().await.is_empty());
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_invite_is_optimistic() {
        let network = MemoryNetwork::new();
        let session = memory_session(&network, "A:9000").await;

        // Nobody listens on B, the peer is recorded anyway
        let err = session.invite("B:9001").await.unwrap_err();
        assert!(matches!(err, SessionError::Send { ref peer, .. } if peer == "B:9001"));
        assert_eq!(session.peers().await, vec!["B:9001"]);
        assert_eq!(session.stats().send_failures, 1);
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_merge_failure_skips_update() {
        let network = MemoryNetwork::new();
        let session = memory_session(&network, "A:9000").await;
        let updates = session.fetch_updates();

        network
            .deliver(Message::edit("B:9001", "A:9000", Edit::delete(0)))
            .await
            .unwrap();
        network
            .deliver(Message::edit("B:9001", "A:9000", Edit::insert(0, 'k')))
            .await
            .unwrap();

        let text = timeout(Duration::from_secs(1), updates.recv()).await.unwrap();
        assert_eq!(text.as_deref(), Some("k"));
        assert_eq!(session.stats().merge_failures, 1);
        assert_eq!(session.stats().edits_received, 2);
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_edit_splitting_surrogate_pair_counted_as_merge_failure() {
        let network = MemoryNetwork::new();
        let session = memory_session(&network, "A:9000").await;
        let updates = session.fetch_updates();

        for edit in [
            Edit::insert(0, '\u{1F600}'),
            Edit::delete(1),
            Edit::insert(1, 'x'),
            Edit::insert(2, '!'),
        ] {
            network
                .deliver(Message::edit("B:9001", "A:9000", edit))
                .await
                .unwrap();
        }

        let first = timeout(Duration::from_secs(1), updates.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(1), updates.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("\u{1F600}"));
        assert_eq!(second.as_deref(), Some("\u{1F600}!"));
        assert_eq!(session.stats().merge_failures, 2);
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_inbound_invite_from_own_address_ignored() {
        let network = MemoryNetwork::new();
        let session = memory_session(&network, "A:9000").await;

        network
            .deliver(Message::invite("A:9000", "A:9000"))
            .await
            .unwrap();
        network
            .deliver(Message::invite("B:9001", "A:9000"))
            .await
            .unwrap();

        timeout(Duration::from_secs(1), async {
            while session.stats().invites_received < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.peers().await, vec!["B:9001"]);
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_twice_is_noop() {
        let network = MemoryNetwork::new();
        let session = memory_session(&network, "A:9000").await;

        session.terminate().await;
        session.terminate().await;
        assert!(session.is_terminated().await);
    }
}
