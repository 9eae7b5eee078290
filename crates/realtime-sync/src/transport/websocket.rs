use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::{Connector, Link};
use crate::telemetry::FRAMES_DROPPED_TOTAL;
use crate::{SyncError, SyncResult};

const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Opens a fresh websocket to `url` on every connect.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> SyncResult<Link> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        debug!(target = "realtime_sync::transport", url = %self.url, "websocket open");

        let (outbound, rx_out) = mpsc::unbounded_channel();
        let (tx_in, inbound) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws_stream, rx_out, tx_in));
        Ok(Link { outbound, inbound })
    }
}

async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    tx_in: mpsc::UnboundedSender<String>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx_out.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if tx_in.send(text).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => {
                    if tx_in.send(text).is_err() {
                        break;
                    }
                }
                Err(_) => {
                    counter!(FRAMES_DROPPED_TOTAL, 1, "reason" => "binary");
                    trace!(target = "realtime_sync::transport", "dropped non-utf8 binary frame");
                }
            },
            Ok(Message::Close(frame)) => {
                debug!(target = "realtime_sync::transport", ?frame, "peer closed websocket");
                break;
            }
            Err(err) => {
                debug!(target = "realtime_sync::transport", error = %err, "websocket read failed");
                break;
            }
            _ => {}
        }
    }
    drop(tx_in);

    if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
}
