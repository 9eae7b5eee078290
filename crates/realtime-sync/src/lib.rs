//! Realtime synchronization layer.
//!
//! One duplex connection carries every topic subscription. Around it:
//! - [`transport`]: the connection supervisor, auto-reconnecting per [`ReconnectPolicy`]
//! - [`correlator`]: correlation ids and the one-shot pending-reply table
//! - [`registry`]: wanted subscriptions, replayed after every reconnect
//! - [`demux`]: routes DATA frames to per-subscription consumers
//! - [`buffer`] and [`series`]: merge an archive fetch with a bounded realtime ring
//! - [`synchronizer`]: periodic tick that publishes snapshots of dirty views
//!
//! [`SyncClient`] wires the protocol side together.

pub mod buffer;
pub mod client;
pub mod config;
pub mod correlator;
pub mod demux;
mod error;
pub mod registry;
pub mod series;
pub mod synchronizer;
pub mod telemetry;
pub mod transport;

pub use buffer::{Admission, BufferItem, BufferState, CommandHistoryRecord, CommandId, MergeBuffer};
pub use client::{ConnectionInfo, SyncClient};
pub use config::{ClientConfig, ReconnectPolicy, SeriesConfig};
pub use demux::{DataStream, TopicData};
pub use error::{SyncError, SyncResult};
pub use registry::{ActiveSubscription, SubscriptionId, SubscriptionState};
pub use series::{ArchivePager, Page, SeriesView};
pub use synchronizer::Synchronizer;
pub use transport::{Connection, ConnectionState, Connector, Link};

pub use sync_proto::{DataKind, ExceptionKind, Topic};
