use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sync_proto::{DataKind, Envelope, ServerFrame, Topic};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::demux::Demultiplexer;
use crate::registry::{ActiveSubscription, Registry, SubscriptionId};
use crate::telemetry::{DROP_UNDECODABLE, FRAMES_DROPPED_TOTAL};
use crate::transport::{Connection, ConnectionState, Connector, FrameHandler, WebSocketConnector};
use crate::{SyncError, SyncResult};

/// Bootstrap frame the server sends first on every new connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub client_id: Option<u64>,
    pub instance: Option<Value>,
    pub processor: Option<Value>,
}

struct Dispatcher {
    correlator: Arc<Correlator>,
    registry: Arc<Registry>,
    demux: Arc<Demultiplexer>,
    info: watch::Sender<Option<ConnectionInfo>>,
}

impl FrameHandler for Dispatcher {
    fn on_open(&self, reconnect: bool) {
        if reconnect {
            self.registry.replay();
        }
    }

    fn on_frame(&self, text: &str) {
        let frame = match Envelope::from_text(text).and_then(Envelope::into_frame) {
            Ok(frame) => frame,
            Err(err) => {
                counter!(FRAMES_DROPPED_TOTAL, 1, "reason" => DROP_UNDECODABLE);
                debug!(target = "realtime_sync::transport", error = %err, "dropping frame");
                return;
            }
        };

        match frame {
            ServerFrame::Reply {
                correlation_id,
                data,
            } => {
                self.correlator.resolve(correlation_id, Ok(data));
            }
            ServerFrame::Exception {
                correlation_id,
                exception,
            } => {
                let kind = exception.kind();
                if !self.correlator.is_pending(correlation_id) {
                    warn!(
                        target = "realtime_sync::correlator",
                        correlation_id,
                        et = kind.as_wire(),
                        msg = %exception.msg,
                        "server exception without a pending request"
                    );
                }
                self.correlator.resolve(
                    correlation_id,
                    Err(SyncError::Exception {
                        kind,
                        message: exception.msg,
                    }),
                );
            }
            ServerFrame::Data(frame) if frame.kind == DataKind::ConnectionInfo => {
                match serde_json::from_value::<ConnectionInfo>(frame.data) {
                    Ok(info) => {
                        debug!(
                            target = "realtime_sync::transport",
                            client_id = ?info.client_id,
                            "connection info"
                        );
                        self.info.send_replace(Some(info));
                    }
                    Err(err) => {
                        counter!(FRAMES_DROPPED_TOTAL, 1, "reason" => DROP_UNDECODABLE);
                        debug!(
                            target = "realtime_sync::transport",
                            error = %err,
                            "bad connection info"
                        );
                    }
                }
            }
            ServerFrame::Data(frame) => {
                self.demux.route(frame);
            }
        }
    }
}

/// Subscription client over one auto-reconnecting connection.
pub struct SyncClient {
    config: ClientConfig,
    connection: Connection,
    correlator: Arc<Correlator>,
    registry: Arc<Registry>,
    info: watch::Receiver<Option<ConnectionInfo>>,
}

impl SyncClient {
    /// Starts the connection and waits for the first open.
    pub async fn connect<C: Connector>(config: ClientConfig, connector: C) -> SyncResult<Self> {
        let connection = Connection::new();
        let correlator = Arc::new(Correlator::new(connection.clone()));
        let demux = Arc::new(Demultiplexer::new());
        let registry = Arc::new(Registry::new(
            correlator.clone(),
            demux.clone(),
            config.request_timeout,
        ));
        let (info_tx, info) = watch::channel(None);
        let dispatcher = Arc::new(Dispatcher {
            correlator: correlator.clone(),
            registry: registry.clone(),
            demux,
            info: info_tx,
        });

        let mut connected = connection.connected();
        connection.start(connector, config.reconnect.clone(), dispatcher);
        let ready = matches!(
            timeout(config.connect_timeout, connected.wait_for(|up| *up)).await,
            Ok(Ok(_))
        );
        if !ready {
            connection.close().await;
            return Err(SyncError::ConnectTimeout(config.connect_timeout));
        }
        info!(target = "realtime_sync::transport", endpoint = %config.endpoint(), "connected");

        Ok(Self {
            config,
            connection,
            correlator,
            registry,
            info,
        })
    }

    pub async fn connect_websocket(config: ClientConfig) -> SyncResult<Self> {
        let connector = WebSocketConnector::new(config.endpoint());
        Self::connect(config, connector).await
    }

    pub async fn subscribe(
        &self,
        topic: Topic,
        params: Option<Value>,
    ) -> SyncResult<ActiveSubscription> {
        self.registry.subscribe(topic, params).await
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Sends a raw request payload and waits for its reply `data`.
    pub async fn request(&self, payload: Value) -> SyncResult<Value> {
        self.correlator
            .request(payload)?
            .wait(self.config.request_timeout)
            .await
    }

    /// Sends a raw request payload without waiting for a reply.
    pub fn emit(&self, payload: Value) -> SyncResult<u64> {
        self.correlator.emit(payload)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connection.connected()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state()
    }

    /// Latest bootstrap info from the server, if any arrived yet.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.info.borrow().clone()
    }

    pub fn connection_info_updates(&self) -> watch::Receiver<Option<ConnectionInfo>> {
        self.info.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.connection.shutdown();
    }
}
