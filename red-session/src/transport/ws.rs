//! WebSocket transport.
//!
//! ```text
//!  send(msg, "B:9001")                         accept loop (A:9000)
//!        │                                            │
//!        ▼                                            ▼
//!  outbound["B:9001"] ── ws://B:9001 ──►  reader task per connection
//!  (one cached socket per peer)                       │  decode frame
//!                                                     ▼
//!                                               inbox (bounded) ──► recv()
//! ```
//!
//! Inbound and outbound traffic use separate sockets: a session only ever
//! writes to connections it opened and only reads from connections it
//! accepted. Frames on one connection are read in order, which gives the
//! per-peer FIFO guarantee.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{shutdown_signaled, Transport, TransportConfig, TransportError};
use crate::protocol::Message;

type OutboundSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection slot for one peer. Its lock is held while connecting and
/// sending, so a slow peer only delays sends to itself.
type OutboundSlot = Arc<Mutex<Option<OutboundSocket>>>;

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

pub struct WsTransport {
    addr: String,
    config: TransportConfig,
    inbox: Mutex<mpsc::Receiver<Message>>,
    outbound: Mutex<HashMap<String, OutboundSlot>>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Bind a listener on `addr` and start accepting connections.
    ///
    /// Binding port 0 picks a free port; [`Transport::local_addr`] then
    /// reports the actual address. The address doubles as the session's
    /// identity on the wire, so wildcard hosts such as `0.0.0.0` are
    /// rejected: peers could not dial them back.
    pub async fn bind(
        addr: impl Into<String>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let requested = addr.into();
        if let Ok(parsed) = requested.parse::<SocketAddr>() {
            if parsed.ip().is_unspecified() {
                return Err(TransportError::Bind {
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "wildcard host is not reachable by peers",
                    ),
                    addr: requested,
                });
            }
        }

        let listener = TcpListener::bind(&requested)
            .await
            .map_err(|source| TransportError::Bind {
                addr: requested.clone(),
                source,
            })?;

        let addr = match listener.local_addr() {
            Ok(bound) if requested.ends_with(":0") => bound.to_string(),
            _ => requested,
        };

        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, inbox_tx, shutdown_rx));

        log::info!("Transport listening on {addr}");

        Ok(Self {
            addr,
            config,
            inbox: Mutex::new(inbox_rx),
            outbound: Mutex::new(HashMap::new()),
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Number of cached outbound connections.
    pub async fn connection_count(&self) -> usize {
        let slots: Vec<OutboundSlot> = self.outbound.lock().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    async fn slot(&self, peer: &str) -> OutboundSlot {
        self.outbound
            .lock()
            .await
            .entry(peer.to_string())
            .or_default()
            .clone()
    }

    async fn connect(&self, addr: &str) -> Result<OutboundSocket, TransportError> {
        let url = format!("ws://{addr}");
        let limit = Duration::from_secs(self.config.connect_timeout_secs);

        match timeout(limit, tokio_tungstenite::connect_async(url)).await {
            Ok(Ok((socket, _))) => {
                log::debug!("{} connected to {addr}", self.addr);
                Ok(socket)
            }
            Ok(Err(e)) => Err(TransportError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::Timeout(addr.to_string())),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn local_addr(&self) -> &str {
        &self.addr
    }

    async fn send(&self, message: &Message, recipient: &str) -> Result<(), TransportError> {
        if *self.shutdown.borrow() {
            return Err(TransportError::Closed);
        }
        let bytes = message.encode()?;

        let slot = self.slot(recipient).await;
        let mut cached = slot.lock().await;
        let mut socket = match cached.take() {
            Some(socket) => socket,
            None => self.connect(recipient).await?,
        };

        // A socket that fails or times out is dropped; the next send reconnects
        let limit = Duration::from_secs(self.config.send_timeout_secs);
        match timeout(limit, socket.send(WsMessage::Binary(bytes.into()))).await {
            Ok(Ok(())) => {
                *cached = Some(socket);
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Send {
                addr: recipient.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::Timeout(recipient.to_string())),
        }
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

        let slots: Vec<(String, OutboundSlot)> = self.outbound.lock().await.drain().collect();
        for (peer, slot) in slots {
            let Some(mut socket) = slot.lock().await.take() else {
                continue;
            };
            if let Ok(Err(e)) = timeout(CLOSE_TIMEOUT, socket.close(None)).await {
                log::debug!("Closing connection to {peer}: {e}");
            }
        }

        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                log::error!("Accept loop for {} failed: {e}", self.addr);
            }
        }

        log::info!("Transport on {} shut down", self.addr);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        // Stops the accept loop and readers if shutdown() was never called
        self.shutdown.send_replace(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbox: mpsc::Sender<Message>,
    shutdown: watch::Receiver<bool>,
) {
    let closed = shutdown_signaled(shutdown.clone());
    tokio::pin!(closed);

    loop {
        tokio::select! {
            biased;
            _ = &mut closed => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    log::debug!("New TCP connection from {peer_addr}");
                    tokio::spawn(read_connection(
                        stream,
                        peer_addr,
                        inbox.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => log::warn!("Accept failed: {e}"),
            },
        }
    }
}

/// Decode frames from one accepted connection into the shared inbox.
async fn read_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    inbox: mpsc::Sender<Message>,
    shutdown: watch::Receiver<bool>,
) {
    let closed = shutdown_signaled(shutdown);
    tokio::pin!(closed);

    let handshake = tokio::select! {
        biased;
        _ = &mut closed => return,
        ws = tokio_tungstenite::accept_async(stream) => ws,
    };
    let mut ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("WebSocket handshake with {peer_addr} failed: {e}");
            return;
        }
    };

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut closed => break,
            frame = ws.next() => frame,
        };

        match frame {
            Some(Ok(WsMessage::Binary(data))) => {
                let msg = match Message::decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Failed to decode message from {peer_addr}: {e}");
                        continue;
                    }
                };
                log::trace!("{:?} from {} via {peer_addr}", msg.msg_type(), msg.sender());

                // A full inbox stalls this connection only
                tokio::select! {
                    biased;
                    _ = &mut closed => break,
                    sent = inbox.send(msg) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                log::debug!("Connection closed from {peer_addr}");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::warn!("WebSocket error from {peer_addr}: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use red_core::Edit;

    async fn bind_local() -> WsTransport {
        WsTransport::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bind_reports_actual_port() {
        let transport = bind_local().await;
        assert!(transport.local_addr().starts_with("127.0.0.1:"));
        assert!(!transport.local_addr().ends_with(":0"));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_in_use_address_fails() {
        let first = bind_local().await;
        let err = WsTransport::bind(first.local_addr().to_string(), TransportConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_wildcard_host_rejected() {
        for addr in ["0.0.0.0:0", "[::]:0"] {
            let err = WsTransport::bind(addr, TransportConfig::default())
                .await
                .err()
                .unwrap();
            match err {
                TransportError::Bind { source, .. } => {
                    assert_eq!(source.kind(), std::io::ErrorKind::InvalidInput)
                }
                other => panic!("Expected Bind error for {addr}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_block_other_sends() {
        let config = TransportConfig {
            connect_timeout_secs: 1,
            ..TransportConfig::default()
        };
        let a = Arc::new(WsTransport::bind("127.0.0.1:0", config).await.unwrap());
        let b = bind_local().await;

        // Completes the TCP handshake but never answers the WebSocket upgrade
        let stalled_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stalled_addr = stalled_listener.local_addr().unwrap().to_string();

        let stalled = {
            let a = a.clone();
            tokio::spawn(async move {
                let msg = Message::invite(a.local_addr(), stalled_addr.as_str());
                a.send(&msg, &stalled_addr).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let to = b.local_addr().to_string();
        let msg = Message::invite(a.local_addr(), to.as_str());
        timeout(Duration::from_millis(500), a.send(&msg, &to))
            .await
            .expect("send waited on the stalled peer")
            .unwrap();
        assert_eq!(
            timeout(Duration::from_secs(1), b.recv()).await.unwrap(),
            Some(msg)
        );

        let err = stalled.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert_eq!(a.connection_count().await, 1);

        drop(stalled_listener);
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_recv_in_order() {
        let a = bind_local().await;
        let b = bind_local().await;
        let to = b.local_addr().to_string();

        for pos in 0..10 {
            let msg = Message::edit(a.local_addr(), to.as_str(), Edit::insert(pos, 'q'));
            a.send(&msg, &to).await.unwrap();
        }
        assert_eq!(a.connection_count().await, 1);

        for pos in 0..10 {
            let msg = timeout(Duration::from_secs(2), b.recv()).await.unwrap();
            match msg {
                Some(Message::Edit { edit, sender, .. }) => {
                    assert_eq!(edit.pos, pos);
                    assert_eq!(sender, a.local_addr());
                }
                other => panic!("Expected Edit, got {other:?}"),
            }
        }

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_unreachable_peer_fails() {
        let a = bind_local().await;
        // Bind then release a port so nothing listens on it
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let err = a
            .send(&Message::invite(a.local_addr(), dead.as_str()), &dead)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect { .. } | TransportError::Timeout(_)
        ));
        assert_eq!(a.connection_count().await, 0);
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_recv() {
        let a = std::sync::Arc::new(bind_local().await);
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        a.shutdown().await;
        let received = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(received.is_none());

        let err = a
            .send(&Message::invite(a.local_addr(), "127.0.0.1:1"), "127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
