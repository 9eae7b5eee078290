use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use sync_proto::{Envelope, MessageType};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::telemetry::{DROP_UNMATCHED_REPLY, FRAMES_DROPPED_TOTAL};
use crate::transport::Connection;
use crate::{SyncError, SyncResult};

type ReplyHook = Box<dyn FnOnce(&Value) + Send>;

struct PendingEntry {
    completion: oneshot::Sender<SyncResult<Value>>,
    on_reply: Option<ReplyHook>,
}

/// Assigns correlation ids to outgoing requests and matches replies back to
/// their callers. Every pending entry is one-shot.
pub struct Correlator {
    connection: Connection,
    sequence: AtomicU64,
    pending: Mutex<HashMap<u64, PendingEntry>>,
}

impl Correlator {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            sequence: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn send(&self, correlation_id: u64, payload: Value) -> SyncResult<()> {
        let text = Envelope::new(MessageType::Request, correlation_id, payload).to_text()?;
        trace!(target = "realtime_sync::correlator", correlation_id, "sending request");
        self.connection.send(text)
    }

    /// Sends a request without tracking a reply.
    pub fn emit(&self, payload: Value) -> SyncResult<u64> {
        let correlation_id = self.next_id();
        self.send(correlation_id, payload)?;
        Ok(correlation_id)
    }

    /// Sends a request whose reply can be awaited through the returned
    /// handle. The entry is registered before the frame leaves.
    pub fn request(self: &Arc<Self>, payload: Value) -> SyncResult<PendingReply> {
        self.register(payload, None)
    }

    /// Like [`Self::request`], and `on_reply` runs with the reply data on the
    /// dispatching task, before any later frame is handled.
    pub fn request_with<F>(
        self: &Arc<Self>,
        payload: Value,
        on_reply: F,
    ) -> SyncResult<PendingReply>
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        self.register(payload, Some(Box::new(on_reply)))
    }

    fn register(
        self: &Arc<Self>,
        payload: Value,
        on_reply: Option<ReplyHook>,
    ) -> SyncResult<PendingReply> {
        let correlation_id = self.next_id();
        let (completion, rx) = oneshot::channel();
        self.pending.lock().insert(
            correlation_id,
            PendingEntry {
                completion,
                on_reply,
            },
        );
        if let Err(err) = self.send(correlation_id, payload) {
            self.pending.lock().remove(&correlation_id);
            return Err(err);
        }
        Ok(PendingReply {
            correlation_id,
            rx,
            correlator: Arc::downgrade(self),
        })
    }

    /// Completes the entry for `correlation_id`. Returns false when nothing
    /// was waiting, in which case the outcome is dropped.
    pub fn resolve(&self, correlation_id: u64, outcome: SyncResult<Value>) -> bool {
        let entry = self.pending.lock().remove(&correlation_id);
        match entry {
            Some(entry) => {
                if let (Ok(data), Some(on_reply)) = (&outcome, entry.on_reply) {
                    on_reply(data);
                }
                let _ = entry.completion.send(outcome);
                true
            }
            None => {
                counter!(FRAMES_DROPPED_TOTAL, 1, "reason" => DROP_UNMATCHED_REPLY);
                debug!(
                    target = "realtime_sync::correlator",
                    correlation_id, "no pending request for reply"
                );
                false
            }
        }
    }

    /// Forgets a pending entry without completing it.
    pub fn cancel(&self, correlation_id: u64) -> bool {
        self.pending.lock().remove(&correlation_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, correlation_id: u64) -> bool {
        self.pending.lock().contains_key(&correlation_id)
    }
}

/// Handle to one in-flight request. Dropping it cancels the request.
pub struct PendingReply {
    correlation_id: u64,
    rx: oneshot::Receiver<SyncResult<Value>>,
    correlator: Weak<Correlator>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Resolves with the reply's `data`, or the server exception. With a
    /// timeout, expiry removes the entry and fails with
    /// [`SyncError::RequestTimeout`].
    pub async fn wait(mut self, timeout: Option<Duration>) -> SyncResult<Value> {
        let received = match timeout {
            None => (&mut self.rx).await,
            Some(after) => match tokio::time::timeout(after, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.cancel();
                    return Err(SyncError::RequestTimeout {
                        correlation_id: self.correlation_id,
                        after,
                    });
                }
            },
        };
        received.unwrap_or(Err(SyncError::Cancelled))
    }

    pub fn cancel(&self) {
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.cancel(self.correlation_id);
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::open_connection;
    use serde_json::json;
    use sync_proto::ExceptionKind;

    #[test_timeout::tokio_timeout_test]
    async fn request_resolves_on_matching_reply() {
        let (connection, mut peer) = open_connection().await;
        let correlator = Arc::new(Correlator::new(connection));

        let first = correlator.request(json!({"time": "subscribe"})).unwrap();
        let second = correlator.request(json!({"links": "subscribe"})).unwrap();
        assert_eq!(first.correlation_id(), 1);
        assert_eq!(second.correlation_id(), 2);
        assert_eq!(correlator.pending_count(), 2);

        let sent = peer.recv_envelope().await.unwrap();
        assert_eq!(sent.message_type, MessageType::Request);
        assert_eq!(sent.correlation_id, 1);
        assert_eq!(sent.payload, json!({"time": "subscribe"}));

        assert!(correlator.resolve(2, Ok(json!({"ok": 2}))));
        assert!(correlator.resolve(
            1,
            Err(SyncError::Exception {
                kind: ExceptionKind::InvalidRequest,
                message: "bad".into(),
            })
        ));
        assert_eq!(second.wait(None).await.unwrap(), json!({"ok": 2}));
        assert!(matches!(
            first.wait(None).await,
            Err(SyncError::Exception {
                kind: ExceptionKind::InvalidRequest,
                ..
            })
        ));
        assert_eq!(correlator.pending_count(), 0);
        // one-shot: a duplicate reply finds nothing
        assert!(!correlator.resolve(2, Ok(Value::Null)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn reply_hook_runs_before_the_waiter_wakes() {
        let (connection, _peer) = open_connection().await;
        let correlator = Arc::new(Correlator::new(connection));
        let seen = Arc::new(Mutex::new(None));

        let pending = correlator
            .request_with(json!({"parameter": "subscribe"}), {
                let seen = seen.clone();
                move |data| *seen.lock() = data.get("subscriptionId").cloned()
            })
            .unwrap();
        correlator.resolve(pending.correlation_id(), Ok(json!({"subscriptionId": 4})));
        assert_eq!(*seen.lock(), Some(json!(4)));
        assert_eq!(pending.wait(None).await.unwrap()["subscriptionId"], 4);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn timeout_removes_entry_and_drops_late_reply() {
        let (connection, _peer) = open_connection().await;
        let correlator = Arc::new(Correlator::new(connection));

        let pending = correlator.request(json!({"time": "subscribe"})).unwrap();
        let id = pending.correlation_id();
        let outcome = pending.wait(Some(Duration::from_millis(500))).await;
        assert!(matches!(
            outcome,
            Err(SyncError::RequestTimeout { correlation_id, .. }) if correlation_id == id
        ));
        assert!(!correlator.is_pending(id));
        assert!(!correlator.resolve(id, Ok(Value::Null)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropping_or_cancelling_forgets_the_entry() {
        let (connection, _peer) = open_connection().await;
        let correlator = Arc::new(Correlator::new(connection));

        let dropped = correlator.request(json!({"alarms": "subscribe"})).unwrap();
        let dropped_id = dropped.correlation_id();
        drop(dropped);
        assert!(!correlator.is_pending(dropped_id));

        let kept = correlator.request(json!({"events": "subscribe"})).unwrap();
        assert!(correlator.cancel(kept.correlation_id()));
        assert!(matches!(kept.wait(None).await, Err(SyncError::Cancelled)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_request_leaves_no_entry_and_emit_numbers_sequentially() {
        let correlator = Arc::new(Correlator::new(Connection::new()));
        assert!(matches!(
            correlator.request(json!({"time": "subscribe"})),
            Err(SyncError::NotConnected)
        ));
        assert_eq!(correlator.pending_count(), 0);

        let (connection, mut peer) = open_connection().await;
        let correlator = Correlator::new(connection);
        assert_eq!(correlator.emit(json!({"time": "subscribe"})).unwrap(), 1);
        assert_eq!(correlator.emit(json!({"time": "subscribe"})).unwrap(), 2);
        assert_eq!(peer.recv_envelope().await.unwrap().correlation_id, 1);
        assert_eq!(peer.recv_envelope().await.unwrap().correlation_id, 2);
    }
}
