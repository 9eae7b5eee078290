use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::ReconnectPolicy;
use crate::telemetry::RECONNECT_ATTEMPTS_TOTAL;
use crate::{SyncError, SyncResult};

pub mod memory;
pub mod websocket;

pub use memory::{MemoryAcceptor, MemoryConnector, MemoryPeer};
pub use websocket::WebSocketConnector;

/// One physical duplex link carrying text frames. Dropping `outbound`
/// closes the link; `inbound` yields `None` once the peer is gone.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> SyncResult<Link>;
}

/// Receives connection lifecycle events and inbound frames. Called from the
/// supervisor task, one event at a time, in arrival order.
pub trait FrameHandler: Send + Sync + 'static {
    /// `reconnect` is false only for the very first open.
    fn on_open(&self, reconnect: bool);
    fn on_frame(&self, text: &str);
    fn on_close(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Shared handle to the supervised connection. Clones refer to the same
/// link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connected: watch::Sender<bool>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                outbound: Mutex::new(None),
                connected: watch::channel(false).0,
                state: watch::channel(ConnectionState::Connecting).0,
                shutdown: watch::channel(false).0,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Spawns the supervisor that keeps a link open for the lifetime of this
    /// connection. Calling it again while a supervisor runs is a no-op.
    pub fn start<C, H>(&self, connector: C, policy: ReconnectPolicy, handler: Arc<H>)
    where
        C: Connector,
        H: FrameHandler,
    {
        let mut guard = self.inner.supervisor.lock();
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handler: Arc<dyn FrameHandler> = handler;
        *guard = Some(tokio::spawn(supervise(
            inner,
            Box::new(connector),
            policy,
            handler,
        )));
    }

    pub fn send(&self, text: String) -> SyncResult<()> {
        let guard = self.inner.outbound.lock();
        let sender = guard.as_ref().ok_or(SyncError::NotConnected)?;
        sender.send(text).map_err(|_| SyncError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Signals the supervisor to stop without waiting for it.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Stops the supervisor and drops the current link without reconnecting.
    pub async fn close(&self) {
        self.shutdown();
        let task = self.inner.supervisor.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.mark_down();
        self.inner.state.send_replace(ConnectionState::Closed);
    }
}

impl ConnectionInner {
    fn mark_down(&self) {
        self.outbound.lock().take();
        self.connected.send_replace(false);
    }
}

async fn supervise(
    inner: Arc<ConnectionInner>,
    connector: Box<dyn Connector>,
    policy: ReconnectPolicy,
    handler: Arc<dyn FrameHandler>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut opened_before = false;
    let mut attempt: u32 = 0;

    'supervisor: loop {
        let connected = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => break 'supervisor,
            result = connector.connect() => result,
        };

        match connected {
            Ok(Link {
                outbound,
                mut inbound,
            }) => {
                attempt = 0;
                *inner.outbound.lock() = Some(outbound);
                inner.connected.send_replace(true);
                inner.state.send_replace(ConnectionState::Connected);
                info!(
                    target = "realtime_sync::transport",
                    reconnect = opened_before,
                    "connection open"
                );
                handler.on_open(opened_before);
                opened_before = true;

                let stopping = loop {
                    tokio::select! {
                        _ = shutdown.wait_for(|closed| *closed) => break true,
                        frame = inbound.recv() => match frame {
                            Some(text) => handler.on_frame(&text),
                            None => break false,
                        },
                    }
                };

                inner.mark_down();
                handler.on_close();
                if stopping {
                    debug!(target = "realtime_sync::transport", "connection closed on request");
                    break 'supervisor;
                }
                warn!(
                    target = "realtime_sync::transport",
                    "connection lost; scheduling reconnect"
                );
            }
            Err(err) => {
                warn!(
                    target = "realtime_sync::transport",
                    attempt,
                    error = %err,
                    "connect attempt failed"
                );
            }
        }

        attempt = attempt.saturating_add(1);
        if policy.is_exhausted(attempt) {
            error!(
                target = "realtime_sync::transport",
                attempts = attempt - 1,
                "exhausted reconnect attempts; giving up"
            );
            break 'supervisor;
        }

        inner.state.send_replace(ConnectionState::Reconnecting);
        counter!(RECONNECT_ATTEMPTS_TOTAL, 1);
        let delay = policy.delay_for(attempt);
        debug!(
            target = "realtime_sync::transport",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "waiting before reconnect"
        );
        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => break 'supervisor,
            _ = sleep(delay) => {}
        }
    }

    inner.mark_down();
    inner.state.send_replace(ConnectionState::Closed);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    struct Inert;

    impl FrameHandler for Inert {
        fn on_open(&self, _reconnect: bool) {}
        fn on_frame(&self, _text: &str) {}
    }

    /// A started connection over an in-memory link, plus the server end.
    pub(crate) async fn open_connection() -> (Connection, MemoryPeer) {
        let (connector, mut acceptor) = MemoryConnector::pair();
        let connection = Connection::new();
        connection.start(connector, ReconnectPolicy::default(), Arc::new(Inert));
        let peer = acceptor.accept().await.expect("accepted link");
        let mut connected = connection.connected();
        connected.wait_for(|up| *up).await.expect("connection open");
        (connection, peer)
    }
}
