//! In-process connector. The acceptor side plays the server: every
//! successful `connect` hands it a [`MemoryPeer`] wired to the new link.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sync_proto::Envelope;
use tokio::sync::mpsc;

use super::{Connector, Link};
use crate::{SyncError, SyncResult};

#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

struct Shared {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicUsize,
    attempts: AtomicUsize,
}

pub struct MemoryAcceptor {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Server end of one in-memory link.
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl MemoryConnector {
    pub fn pair() -> (MemoryConnector, MemoryAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = MemoryConnector {
            shared: Arc::new(Shared {
                accept_tx,
                refuse: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
            }),
        };
        (connector, MemoryAcceptor { accept_rx })
    }

    /// Fails the next `count` connect attempts.
    pub fn refuse_next(&self, count: usize) {
        self.shared.refuse.store(count, Ordering::SeqCst);
    }

    /// Number of connect attempts made so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> SyncResult<Link> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .shared
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SyncError::Transport("connection refused".into()));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.shared
            .accept_tx
            .send(MemoryPeer {
                from_client,
                to_client,
            })
            .map_err(|_| SyncError::Transport("acceptor gone".into()))?;
        Ok(Link { outbound, inbound })
    }
}

impl MemoryAcceptor {
    /// Waits for the client's next successful connect.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

impl MemoryPeer {
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next client frame that parses as an envelope; unparseable frames
    /// are skipped.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        while let Some(text) = self.from_client.recv().await {
            if let Ok(envelope) = Envelope::from_text(&text) {
                return Some(envelope);
            }
        }
        None
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_text() {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Drops the link as if the server went away.
    pub fn close(self) {}
}
