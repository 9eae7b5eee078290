use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use sync_proto::{subscribe_payload, Topic};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::correlator::{Correlator, PendingReply};
use crate::demux::{DataStream, Demultiplexer};
use crate::{SyncError, SyncResult};

/// Client-side handle for one wanted subscription. Stable across reconnects,
/// unlike the id the server assigns.
pub type SubscriptionId = u64;

/// Lifecycle of a wanted subscription. An unsubscribed one is removed at
/// once, so [`Registry::state`] reports it as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
}

/// Outcome of a successful subscribe.
#[derive(Debug)]
pub struct ActiveSubscription {
    pub id: SubscriptionId,
    pub topic: Topic,
    /// Id assigned by the server, present for parallel topics.
    pub server_id: Option<u64>,
    /// `data` of the subscribe reply.
    pub reply: Value,
    pub data: DataStream,
}

struct Entry {
    id: SubscriptionId,
    topic: Topic,
    params: Option<Value>,
    state: SubscriptionState,
    server_id: Option<u64>,
    reply: Value,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Entry {
    fn matches(&self, topic: Topic, params: Option<&Value>) -> bool {
        self.topic == topic && self.params.as_ref() == params
    }
}

enum Plan {
    Ready(ActiveSubscription),
    Join(SubscriptionId, DataStream, oneshot::Receiver<()>),
    Request(SubscriptionId, DataStream, oneshot::Receiver<()>),
}

/// The set of subscriptions this client wants, in registration order.
pub struct Registry {
    correlator: Arc<Correlator>,
    demux: Arc<Demultiplexer>,
    request_timeout: Option<Duration>,
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub fn new(
        correlator: Arc<Correlator>,
        demux: Arc<Demultiplexer>,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            correlator,
            demux,
            request_timeout,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes to `topic`. An equivalent live subscription gains another
    /// consumer instead of a second request.
    pub async fn subscribe(
        self: &Arc<Self>,
        topic: Topic,
        params: Option<Value>,
    ) -> SyncResult<ActiveSubscription> {
        match self.plan(topic, params.as_ref())? {
            Plan::Ready(active) => Ok(active),
            Plan::Join(id, data, activated) => {
                activated.await.map_err(|_| SyncError::Cancelled)?;
                self.active(id, data)
            }
            Plan::Request(id, data, activated) => {
                let pending = match self.send_subscribe(id, topic, params.as_ref()) {
                    Ok(pending) => pending,
                    Err(err) => {
                        self.discard(id);
                        return Err(err);
                    }
                };
                debug!(
                    target = "realtime_sync::registry",
                    subscription = id,
                    %topic,
                    correlation_id = pending.correlation_id(),
                    "subscribe sent"
                );

                tokio::select! {
                    outcome = pending.wait(self.request_timeout) => match outcome {
                        Ok(_) => self.active(id, data),
                        Err(err) => {
                            // a replayed request may have activated it meanwhile
                            if self.state(id) == Some(SubscriptionState::Active) {
                                return self.active(id, data);
                            }
                            self.discard(id);
                            Err(err)
                        }
                    },
                    _ = activated => self.active(id, data),
                }
            }
        }
    }

    /// Sends a subscribe whose reply activates `id` as soon as it is
    /// dispatched, so DATA frames right behind the reply find their route.
    fn send_subscribe(
        self: &Arc<Self>,
        id: SubscriptionId,
        topic: Topic,
        params: Option<&Value>,
    ) -> SyncResult<PendingReply> {
        let registry = Arc::downgrade(self);
        self.correlator
            .request_with(subscribe_payload(topic, params), move |reply| {
                if let Some(registry) = registry.upgrade() {
                    registry.activate(id, reply.clone());
                }
            })
    }

    fn plan(&self, topic: Topic, params: Option<&Value>) -> SyncResult<Plan> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.matches(topic, params)) {
            let data = self.demux.attach(entry.id).ok_or(SyncError::Cancelled)?;
            if entry.state == SubscriptionState::Active {
                return Ok(Plan::Ready(ActiveSubscription {
                    id: entry.id,
                    topic,
                    server_id: entry.server_id,
                    reply: entry.reply.clone(),
                    data,
                }));
            }
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);
            return Ok(Plan::Join(entry.id, data, rx));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.demux.open(id, topic);
        let Some(data) = self.demux.attach(id) else {
            self.demux.close(id);
            return Err(SyncError::Cancelled);
        };
        let (tx, rx) = oneshot::channel();
        entries.push(Entry {
            id,
            topic,
            params: params.cloned(),
            state: SubscriptionState::Pending,
            server_id: None,
            reply: Value::Null,
            waiters: vec![tx],
        });
        Ok(Plan::Request(id, data, rx))
    }

    /// Applies a subscribe reply: records the server id, points the route at
    /// it and wakes anyone waiting on the subscription.
    fn activate(&self, id: SubscriptionId, reply: Value) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().find(|entry| entry.id == id) else {
            debug!(
                target = "realtime_sync::registry",
                subscription = id,
                "reply for a subscription that is gone"
            );
            return false;
        };
        entry.server_id = reply.get("subscriptionId").and_then(Value::as_u64);
        entry.reply = reply;
        entry.state = SubscriptionState::Active;
        if entry.topic.is_parallel() {
            if let Some(server_id) = entry.server_id {
                self.demux.alias(server_id, id);
            }
        }
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(());
        }
        true
    }

    fn active(&self, id: SubscriptionId, data: DataStream) -> SyncResult<ActiveSubscription> {
        let entries = self.entries.lock();
        let entry = entries
            .iter()
            .find(|entry| entry.id == id && entry.state == SubscriptionState::Active)
            .ok_or(SyncError::Cancelled)?;
        Ok(ActiveSubscription {
            id,
            topic: entry.topic,
            server_id: entry.server_id,
            reply: entry.reply.clone(),
            data,
        })
    }

    fn discard(&self, id: SubscriptionId) {
        self.entries.lock().retain(|entry| entry.id != id);
        self.demux.close(id);
    }

    /// Drops the subscription and ends all of its consumer streams. Nothing
    /// is sent to the server.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            match entries.iter().position(|entry| entry.id == id) {
                Some(index) => {
                    entries.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.demux.close(id);
            debug!(target = "realtime_sync::registry", subscription = id, "unsubscribed");
        }
        removed
    }

    /// Re-sends one subscribe per wanted subscription, in registration
    /// order, without waiting for replies. Each reply rebinds the route to
    /// the fresh server id. Returns the number of requests sent.
    pub fn replay(self: &Arc<Self>) -> usize {
        let wanted: Vec<(SubscriptionId, Topic, Option<Value>)> = self
            .entries
            .lock()
            .iter()
            .map(|entry| (entry.id, entry.topic, entry.params.clone()))
            .collect();

        let mut sent = 0;
        for (id, topic, params) in wanted {
            let pending = match self.send_subscribe(id, topic, params.as_ref()) {
                Ok(pending) => pending,
                Err(err) => {
                    warn!(
                        target = "realtime_sync::registry",
                        subscription = id,
                        %topic,
                        error = %err,
                        "replay stopped; link dropped again"
                    );
                    break;
                }
            };
            sent += 1;

            let timeout = self.request_timeout;
            tokio::spawn(async move {
                match pending.wait(timeout).await {
                    Ok(_) => debug!(
                        target = "realtime_sync::registry",
                        subscription = id,
                        "resubscribed"
                    ),
                    Err(err) => warn!(
                        target = "realtime_sync::registry",
                        subscription = id,
                        %topic,
                        error = %err,
                        "resubscribe failed"
                    ),
                }
            });
        }

        if sent > 0 {
            info!(target = "realtime_sync::registry", count = sent, "replayed subscriptions");
        }
        sent
    }

    pub fn state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.state)
    }

    pub fn server_id(&self, id: SubscriptionId) -> Option<u64> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.id == id)
            .and_then(|entry| entry.server_id)
    }

    /// Live subscriptions in registration order.
    pub fn subscriptions(&self) -> Vec<(SubscriptionId, Topic)> {
        self.entries
            .lock()
            .iter()
            .map(|entry| (entry.id, entry.topic))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::open_connection;
    use crate::transport::MemoryPeer;
    use serde_json::json;
    use sync_proto::{DataFrame, DataKind, Envelope, ExceptionKind};

    async fn setup(
        timeout: Option<Duration>,
    ) -> (Arc<Registry>, Arc<Correlator>, Arc<Demultiplexer>, MemoryPeer) {
        let (connection, peer) = open_connection().await;
        let correlator = Arc::new(Correlator::new(connection));
        let demux = Arc::new(Demultiplexer::new());
        let registry = Arc::new(Registry::new(correlator.clone(), demux.clone(), timeout));
        (registry, correlator, demux, peer)
    }

    async fn next_request(peer: &mut MemoryPeer) -> Envelope {
        peer.recv_envelope().await.expect("request frame")
    }

    #[test_timeout::tokio_timeout_test]
    async fn subscribe_activates_and_routes_parallel_data() {
        let (registry, correlator, demux, mut peer) = setup(None).await;

        let task = tokio::spawn({
            let registry = registry.clone();
            async move {
                registry
                    .subscribe(Topic::Parameter, Some(json!({"id": [{"name": "/a"}]})))
                    .await
            }
        });
        let request = next_request(&mut peer).await;
        assert_eq!(
            request.payload,
            json!({"parameter": "subscribe", "data": {"id": [{"name": "/a"}]}})
        );
        correlator.resolve(request.correlation_id, Ok(json!({"subscriptionId": 42})));

        let mut active = task.await.unwrap().unwrap();
        assert_eq!(active.server_id, Some(42));
        assert_eq!(registry.state(active.id), Some(SubscriptionState::Active));

        for n in 0..3 {
            demux.route(DataFrame {
                kind: DataKind::Parameter,
                subscription_id: Some(42),
                data: json!({"subscriptionId": 42, "n": n}),
            });
        }
        for n in 0..3 {
            assert_eq!(active.data.recv().await.unwrap().data["n"], n);
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn equivalent_subscribe_reuses_the_entry() {
        let (registry, correlator, demux, mut peer) = setup(None).await;

        let task = tokio::spawn({
            let registry = registry.clone();
            async move { registry.subscribe(Topic::Time, None).await }
        });
        let request = next_request(&mut peer).await;
        correlator.resolve(request.correlation_id, Ok(json!({})));
        let first = task.await.unwrap().unwrap();

        let second = registry.subscribe(Topic::Time, None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);
        assert_eq!(demux.consumer_count(first.id), 2);

        // the next frame on the wire is this emit, not a second subscribe
        correlator.emit(json!({"ping": true})).unwrap();
        assert_eq!(next_request(&mut peer).await.payload, json!({"ping": true}));
    }

    #[test_timeout::tokio_timeout_test]
    async fn exception_removes_the_pending_entry() {
        let (registry, correlator, demux, mut peer) = setup(None).await;

        let task = tokio::spawn({
            let registry = registry.clone();
            async move { registry.subscribe(Topic::Links, None).await }
        });
        let request = next_request(&mut peer).await;
        correlator.resolve(
            request.correlation_id,
            Err(SyncError::Exception {
                kind: ExceptionKind::ForbiddenRequest,
                message: "no links for you".into(),
            }),
        );

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SyncError::Exception {
                kind: ExceptionKind::ForbiddenRequest,
                ..
            }
        ));
        assert!(registry.is_empty());
        assert_eq!(
            demux.route(DataFrame {
                kind: DataKind::LinkEvent,
                subscription_id: None,
                data: json!({}),
            }),
            0
        );
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn unanswered_subscribe_times_out() {
        let (registry, correlator, _demux, _peer) = setup(Some(Duration::from_secs(2))).await;
        let err = registry.subscribe(Topic::Events, None).await.unwrap_err();
        assert!(matches!(err, SyncError::RequestTimeout { .. }));
        assert!(registry.is_empty());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn replay_resends_wanted_subscriptions_in_order_and_rebinds() {
        let (registry, correlator, demux, mut peer) = setup(None).await;

        let mut subscribed = Vec::new();
        for (topic, reply) in [
            (Topic::Parameter, json!({"subscriptionId": 7})),
            (Topic::Alarms, json!({})),
            (Topic::Time, json!({})),
        ] {
            let task = tokio::spawn({
                let registry = registry.clone();
                async move { registry.subscribe(topic, None).await }
            });
            let request = next_request(&mut peer).await;
            correlator.resolve(request.correlation_id, Ok(reply));
            subscribed.push(task.await.unwrap().unwrap());
        }
        let mut parameter = subscribed.remove(0);
        assert!(registry.unsubscribe(subscribed[0].id));

        assert_eq!(registry.replay(), 2);
        let first = next_request(&mut peer).await;
        let second = next_request(&mut peer).await;
        assert_eq!(first.payload, json!({"parameter": "subscribe"}));
        assert_eq!(second.payload, json!({"time": "subscribe"}));

        correlator.resolve(first.correlation_id, Ok(json!({"subscriptionId": 8})));
        correlator.resolve(second.correlation_id, Ok(json!({})));
        while registry.server_id(parameter.id) != Some(8) {
            tokio::task::yield_now().await;
        }

        let stale = DataFrame {
            kind: DataKind::Parameter,
            subscription_id: Some(7),
            data: json!({"stale": true}),
        };
        assert_eq!(demux.route(stale), 0);
        demux.route(DataFrame {
            kind: DataKind::Parameter,
            subscription_id: Some(8),
            data: json!({"fresh": true}),
        });
        assert_eq!(parameter.data.recv().await.unwrap().data["fresh"], true);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unsubscribe_while_pending_rejects_the_subscriber() {
        let (registry, correlator, _demux, mut peer) = setup(None).await;
        let task = tokio::spawn({
            let registry = registry.clone();
            async move { registry.subscribe(Topic::Alarms, None).await }
        });
        let request = next_request(&mut peer).await;
        let (id, _) = registry.subscriptions()[0];
        assert_eq!(registry.state(id), Some(SubscriptionState::Pending));

        assert!(registry.unsubscribe(id));
        assert!(matches!(task.await.unwrap(), Err(SyncError::Cancelled)));
        assert!(!correlator.resolve(request.correlation_id, Ok(json!({}))));
        assert!(registry.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn unsubscribe_ends_every_consumer() {
        let (registry, correlator, _demux, mut peer) = setup(None).await;
        let task = tokio::spawn({
            let registry = registry.clone();
            async move { registry.subscribe(Topic::Events, None).await }
        });
        let request = next_request(&mut peer).await;
        correlator.resolve(request.correlation_id, Ok(json!({})));
        let mut first = task.await.unwrap().unwrap();
        let mut second = registry.subscribe(Topic::Events, None).await.unwrap();

        assert!(registry.unsubscribe(first.id));
        assert!(!registry.unsubscribe(first.id));
        assert!(first.data.recv().await.is_none());
        assert!(second.data.recv().await.is_none());
        assert_eq!(registry.state(second.id), None);
    }
}
