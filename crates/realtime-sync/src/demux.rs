use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use metrics::counter;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use slab::Slab;
use sync_proto::{DataFrame, DataKind, Topic};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::registry::SubscriptionId;
use crate::telemetry::{DROP_UNROUTED, FRAMES_DROPPED_TOTAL};
use crate::{SyncError, SyncResult};

/// One DATA payload delivered to a subscription consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicData {
    pub kind: DataKind,
    pub data: Value,
}

impl TopicData {
    pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<T> {
        T::deserialize(&self.data).map_err(|source| SyncError::Decode {
            kind: self.kind,
            source,
        })
    }
}

/// Consumer end of a subscription. Ends once the subscription is removed.
#[derive(Debug)]
pub struct DataStream {
    rx: mpsc::UnboundedReceiver<TopicData>,
}

impl DataStream {
    pub async fn recv(&mut self) -> Option<TopicData> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TopicData> {
        self.rx.try_recv().ok()
    }
}

impl Stream for DataStream {
    type Item = TopicData;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Routes DATA frames to subscription consumers. Parallel topics are keyed by
/// the server-assigned subscription id, the rest by topic.
#[derive(Default)]
pub struct Demultiplexer {
    state: Mutex<RouteTable>,
}

#[derive(Default)]
struct RouteTable {
    consumers: HashMap<SubscriptionId, Slab<mpsc::UnboundedSender<TopicData>>>,
    by_topic: HashMap<Topic, Vec<SubscriptionId>>,
    by_server_id: HashMap<u64, SubscriptionId>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a route for subscription `id`. Singleton topics start
    /// receiving immediately; parallel ones once [`Self::alias`] names the
    /// server id.
    pub fn open(&self, id: SubscriptionId, topic: Topic) {
        let mut state = self.state.lock();
        state.consumers.entry(id).or_default();
        if !topic.is_parallel() {
            let ids = state.by_topic.entry(topic).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    /// Adds a consumer to an open route.
    pub fn attach(&self, id: SubscriptionId) -> Option<DataStream> {
        let mut state = self.state.lock();
        let consumers = state.consumers.get_mut(&id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        consumers.insert(tx);
        Some(DataStream { rx })
    }

    /// Points a server subscription id at `id`, replacing any earlier server
    /// id for the same subscription.
    pub fn alias(&self, server_id: u64, id: SubscriptionId) {
        let mut state = self.state.lock();
        state.by_server_id.retain(|_, local| *local != id);
        state.by_server_id.insert(server_id, id);
    }

    /// Removes the route; its consumer streams end.
    pub fn close(&self, id: SubscriptionId) {
        let mut state = self.state.lock();
        state.consumers.remove(&id);
        state.by_server_id.retain(|_, local| *local != id);
        state.by_topic.retain(|_, ids| {
            ids.retain(|local| *local != id);
            !ids.is_empty()
        });
    }

    pub fn consumer_count(&self, id: SubscriptionId) -> usize {
        self.state
            .lock()
            .consumers
            .get(&id)
            .map_or(0, |consumers| consumers.len())
    }

    /// Delivers one frame. Returns the number of consumers reached.
    pub fn route(&self, frame: DataFrame) -> usize {
        let Some(topic) = frame.kind.topic() else {
            return self.unrouted(frame.kind);
        };

        let mut state = self.state.lock();
        let targets: Vec<SubscriptionId> = if topic.is_parallel() {
            frame
                .subscription_id
                .and_then(|server_id| state.by_server_id.get(&server_id).copied())
                .into_iter()
                .collect()
        } else {
            state.by_topic.get(&topic).cloned().unwrap_or_default()
        };

        let item = TopicData {
            kind: frame.kind,
            data: frame.data,
        };
        let mut delivered = 0;
        for id in targets {
            let Some(consumers) = state.consumers.get_mut(&id) else {
                continue;
            };
            consumers.retain(|key, tx| {
                if tx.send(item.clone()).is_ok() {
                    delivered += 1;
                    true
                } else {
                    trace!(
                        target = "realtime_sync::demux",
                        subscription = id,
                        consumer = key,
                        "evicting dropped consumer"
                    );
                    false
                }
            });
        }
        drop(state);

        if delivered == 0 {
            return self.unrouted(item.kind);
        }
        delivered
    }

    fn unrouted(&self, kind: DataKind) -> usize {
        counter!(FRAMES_DROPPED_TOTAL, 1, "reason" => DROP_UNROUTED);
        debug!(target = "realtime_sync::demux", %kind, "no consumer for data frame");
        0
    }
}
