use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use realtime_sync::{
    ActiveSubscription, ArchivePager, ClientConfig, CommandHistoryRecord, ConnectionState,
    ReconnectPolicy, SeriesConfig, SeriesView, SyncClient, SyncResult, Synchronizer, Topic,
};
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::{net::TcpListener, signal};
use tracing::{debug, info, warn};

mod archive;
mod telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "sync-tail",
    author,
    version,
    about = "Subscribes to realtime topics and logs what arrives"
)]
struct Cli {
    /// Websocket endpoint, without the instance segment.
    #[arg(long, env = "SYNC_URL", default_value = "ws://127.0.0.1:8090/_websocket")]
    url: String,

    /// Instance appended to the websocket endpoint.
    #[arg(long, env = "SYNC_INSTANCE")]
    instance: Option<String>,

    /// Topics to subscribe to, by request verb (e.g. `time,alarms,cmdhistory`).
    #[arg(
        long = "topic",
        env = "SYNC_TOPICS",
        value_delimiter = ',',
        value_parser = parse_topic,
        default_value = "time"
    )]
    topics: Vec<Topic>,

    /// Fully qualified parameter names for the `parameter` topic.
    #[arg(long = "parameter", env = "SYNC_PARAMETERS", value_delimiter = ',')]
    parameters: Vec<String>,

    /// REST API root used to backfill command history (e.g. `http://host:8090/api`).
    #[arg(long, env = "SYNC_ARCHIVE_URL")]
    archive_url: Option<String>,

    #[arg(long, env = "SYNC_CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    connect_timeout_ms: u64,

    /// Per-request reply deadline; 0 waits forever.
    #[arg(long, env = "SYNC_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,

    #[arg(long, env = "SYNC_RECONNECT_DELAY_MS", default_value_t = 1_000)]
    reconnect_delay_ms: u64,

    /// Upper bound for exponential backoff; unset keeps a constant delay.
    #[arg(long, env = "SYNC_RECONNECT_MAX_DELAY_MS")]
    reconnect_max_delay_ms: Option<u64>,

    #[arg(long, env = "SYNC_RECONNECT_MAX_ATTEMPTS")]
    reconnect_max_attempts: Option<u32>,

    #[arg(long, env = "SYNC_BUFFER_SIZE", default_value_t = 500)]
    buffer_size: usize,

    #[arg(long, env = "SYNC_BUFFER_WATERMARK", default_value_t = 400)]
    buffer_watermark: usize,

    #[arg(long, env = "SYNC_PAGE_SIZE", default_value_t = 100)]
    page_size: usize,

    /// Archive pages fetched when backfilling command history.
    #[arg(long, env = "SYNC_HISTORY_PAGES", default_value_t = 5)]
    history_pages: usize,

    /// Snapshot publication period of the command history view.
    #[arg(long, env = "SYNC_PERIOD_MS", default_value_t = 1_000)]
    sync_period_ms: u64,

    /// Serve `/metrics` and `/healthz` on this address.
    #[arg(long, env = "SYNC_METRICS_LISTEN")]
    metrics_listen: Option<String>,

    /// Print finished tracing spans to stdout.
    #[arg(long, env = "SYNC_TAIL_OTEL_STDOUT")]
    otel_stdout: bool,
}

#[derive(Debug, Clone)]
struct TailConfig {
    client: ClientConfig,
    series: SeriesConfig,
    topics: Vec<Topic>,
    parameters: Vec<String>,
    archive_url: Option<String>,
    history_pages: usize,
    sync_period: Duration,
    metrics_listen: Option<SocketAddr>,
}

impl TryFrom<Cli> for TailConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.topics.contains(&Topic::Parameter) && cli.parameters.is_empty() {
            bail!("the parameter topic needs at least one --parameter name");
        }
        if cli.buffer_watermark == 0 || cli.buffer_watermark > cli.buffer_size {
            bail!(
                "buffer watermark {} must be within 1..={}",
                cli.buffer_watermark,
                cli.buffer_size
            );
        }
        let metrics_listen = cli
            .metrics_listen
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid metrics address: {addr}"))
            })
            .transpose()?;

        let delay = Duration::from_millis(cli.reconnect_delay_ms);
        let reconnect = match cli.reconnect_max_delay_ms.map(Duration::from_millis) {
            Some(max_delay) if max_delay > delay => ReconnectPolicy::exponential(delay, max_delay),
            _ => ReconnectPolicy::constant(delay),
        }
        .with_max_attempts(cli.reconnect_max_attempts);

        let mut client = ClientConfig::new(cli.url)
            .with_reconnect(reconnect)
            .with_request_timeout(
                Some(Duration::from_millis(cli.request_timeout_ms))
                    .filter(|timeout| !timeout.is_zero()),
            );
        client.instance = cli.instance.filter(|instance| !instance.is_empty());
        client.connect_timeout = Duration::from_millis(cli.connect_timeout_ms);

        let mut topics: Vec<Topic> = Vec::with_capacity(cli.topics.len());
        for topic in cli.topics {
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }

        Ok(TailConfig {
            client,
            series: SeriesConfig {
                buffer_size: cli.buffer_size,
                watermark: cli.buffer_watermark,
                compact_limit: cli.buffer_size,
                page_size: cli.page_size,
            },
            topics,
            parameters: cli.parameters,
            archive_url: cli.archive_url,
            history_pages: cli.history_pages.max(1),
            sync_period: Duration::from_millis(cli.sync_period_ms.max(1)),
            metrics_listen,
        })
    }
}

fn parse_topic(value: &str) -> Result<Topic, String> {
    Topic::ALL
        .into_iter()
        .find(|topic| topic.verb() == value.trim())
        .ok_or_else(|| {
            let known: Vec<_> = Topic::ALL.iter().map(|topic| topic.verb()).collect();
            format!("unknown topic {value:?}, expected one of {}", known.join(", "))
        })
}

impl TailConfig {
    fn params_for(&self, topic: Topic) -> Option<Value> {
        match topic {
            Topic::Parameter => {
                let ids: Vec<_> = self
                    .parameters
                    .iter()
                    .map(|name| json!({ "name": name }))
                    .collect();
                Some(json!({ "id": ids }))
            }
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = telemetry::Telemetry::install(telemetry::TelemetryOptions {
        span_stdout: cli.otel_stdout,
    })?;
    let config = TailConfig::try_from(cli)?;
    info!(
        endpoint = %config.client.endpoint(),
        topics = ?config.topics,
        archive = config.archive_url.is_some(),
        "starting sync-tail"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: TailConfig, metrics: PrometheusHandle) -> Result<()> {
    let (metrics_stop, metrics_server) = match config.metrics_listen {
        Some(addr) => {
            let (stop_tx, server) = serve_metrics(addr, metrics).await?;
            (Some(stop_tx), Some(server))
        }
        None => (None, None),
    };

    let client = SyncClient::connect_websocket(config.client.clone())
        .await
        .with_context(|| format!("failed to connect to {}", config.client.endpoint()))?;
    let mut tasks = vec![log_connectivity(client.state())];
    let synchronizer = Synchronizer::spawn(config.sync_period);
    let mut views = Vec::new();

    for &topic in &config.topics {
        let subscription = client
            .subscribe(topic, config.params_for(topic))
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
        info!(
            subscription = subscription.id,
            %topic,
            server_id = ?subscription.server_id,
            "subscribed"
        );

        match (topic, config.archive_url.as_deref(), config.client.instance.as_deref()) {
            (Topic::CommandHistory, Some(api_url), Some(instance)) => {
                let archive = archive::CommandArchive::new(api_url, instance, config.series.page_size);
                let view = SeriesView::<CommandHistoryRecord>::new(&config.series);
                view.attach(&synchronizer)?;
                tasks.push(log_snapshots(&view));
                // records arriving meanwhile wait in the subscription stream
                match backfill(&view, &archive, config.history_pages).await {
                    Ok(pages) => info!(pages, more = view.has_more(), "command history backfilled"),
                    Err(err) => {
                        warn!(error = %err, "command history backfill failed; showing realtime only")
                    }
                }
                tasks.push(view.feed(subscription.data));
                views.push(view);
            }
            (Topic::CommandHistory, Some(_), None) => {
                warn!("command history backfill needs --instance; showing realtime only");
                tasks.push(tail(subscription));
            }
            _ => tasks.push(tail(subscription)),
        }
    }

    shutdown_signal().await;
    info!("shutting down");
    client.close().await;
    for task in tasks {
        task.abort();
    }
    drop(views);

    if let Some(stop_tx) = metrics_stop {
        let _ = stop_tx.send(());
    }
    if let Some(server) = metrics_server {
        let _ = server.await;
    }
    Ok(())
}

/// Loads the newest archive page, then older ones while the archive has
/// more, up to `max_pages`. Returns the number of pages fetched.
async fn backfill<P>(
    view: &SeriesView<CommandHistoryRecord>,
    pager: &P,
    max_pages: usize,
) -> SyncResult<usize>
where
    P: ArchivePager<CommandHistoryRecord> + ?Sized,
{
    view.load(pager).await?;
    let mut pages = 1;
    while pages < max_pages && view.has_more() {
        if !view.load_more(pager).await? {
            break;
        }
        pages += 1;
    }
    Ok(pages)
}

fn tail(subscription: ActiveSubscription) -> JoinHandle<()> {
    let ActiveSubscription {
        id,
        topic,
        mut data,
        ..
    } = subscription;
    tokio::spawn(async move {
        while let Some(item) = data.recv().await {
            info!(subscription = id, %topic, kind = %item.kind, data = %item.data, "data");
        }
        debug!(subscription = id, "stream ended");
    })
}

fn log_snapshots(view: &SeriesView<CommandHistoryRecord>) -> JoinHandle<()> {
    let mut snapshots = view.snapshots();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            info!(
                entries = snapshot.len(),
                newest = snapshot.first().map(|record| record.command_name.as_str()),
                "command history"
            );
        }
    })
}

fn log_connectivity(mut state: watch::Receiver<ConnectionState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => info!("connection up"),
                ConnectionState::Reconnecting => warn!("connection lost; reconnecting"),
                ConnectionState::Connecting => debug!("connecting"),
                ConnectionState::Closed => {
                    warn!("connection closed");
                    break;
                }
            }
        }
    })
}

async fn serve_metrics(
    addr: SocketAddr,
    metrics: PrometheusHandle,
) -> Result<(oneshot::Sender<()>, JoinHandle<()>)> {
    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    info!(%addr, "serving metrics");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await;
        if let Err(err) = served {
            warn!(error = %err, "metrics server stopped");
        }
    });
    Ok((stop_tx, server))
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn metrics_handler(State(metrics): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use realtime_sync::Page;

    use super::*;

    /// Endless archive: every page holds one record and points to another.
    #[derive(Default)]
    struct EndlessArchive {
        served: AtomicUsize,
    }

    #[async_trait]
    impl ArchivePager<CommandHistoryRecord> for EndlessArchive {
        async fn load_page(
            &self,
            _continuation: Option<&str>,
        ) -> SyncResult<Page<CommandHistoryRecord>> {
            let n = self.served.fetch_add(1, Ordering::SeqCst);
            let record = serde_json::from_value(json!({
                "commandId": {
                    "generationTime": format!("2024-03-01T10:00:{:02}Z", 59 - n),
                    "origin": "ops",
                    "sequenceNumber": n
                },
                "commandName": format!("CMD_{n}")
            }))
            .expect("record");
            Ok(Page {
                entries: vec![record],
                continuation_token: Some(format!("page-{}", n + 1)),
            })
        }
    }

    #[tokio::test]
    async fn backfill_pages_until_the_cap() {
        let view = SeriesView::new(&SeriesConfig::default());
        let archive = EndlessArchive::default();

        assert_eq!(backfill(&view, &archive, 3).await.unwrap(), 3);
        assert_eq!(archive.served.load(Ordering::SeqCst), 3);
        assert!(view.has_more());
        assert!(view.flush());
        let names: Vec<_> = view
            .latest()
            .iter()
            .map(|record| record.command_name.clone())
            .collect();
        assert_eq!(names, vec!["CMD_0", "CMD_1", "CMD_2"]);
    }

    fn parse(args: &[&str]) -> Result<TailConfig> {
        let mut argv = vec!["sync-tail"];
        argv.extend_from_slice(args);
        TailConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn topics_parse_by_verb() {
        let config =
            parse(&["--topic", "time,cmdhistory,time", "--instance", "simulator"]).unwrap();
        assert_eq!(config.topics, vec![Topic::Time, Topic::CommandHistory]);
        assert_eq!(
            config.client.endpoint(),
            "ws://127.0.0.1:8090/_websocket/simulator"
        );
        assert!(parse(&["--topic", "telemetry"]).is_err());
    }

    #[test]
    fn parameter_topic_requires_names() {
        assert!(parse(&["--topic", "parameter"]).is_err());

        let config = parse(&["--topic", "parameter", "--parameter", "/YSS/A,/YSS/B"]).unwrap();
        assert_eq!(
            config.params_for(Topic::Parameter),
            Some(json!({"id": [{"name": "/YSS/A"}, {"name": "/YSS/B"}]}))
        );
        assert_eq!(config.params_for(Topic::Time), None);
    }

    #[test]
    fn timeouts_and_backoff() {
        let config = parse(&[
            "--request-timeout-ms",
            "0",
            "--reconnect-delay-ms",
            "250",
            "--reconnect-max-delay-ms",
            "4000",
            "--reconnect-max-attempts",
            "5",
        ])
        .unwrap();
        assert_eq!(config.client.request_timeout, None);
        assert_eq!(
            config.client.reconnect.max_delay,
            Duration::from_millis(4000)
        );
        assert_eq!(config.client.reconnect.max_attempts, Some(5));
        assert!(config.metrics_listen.is_none());
    }

    #[test]
    fn rejects_bad_buffer_and_metrics_settings() {
        assert!(parse(&["--buffer-size", "10", "--buffer-watermark", "20"]).is_err());
        assert!(parse(&["--metrics-listen", "not-an-addr"]).is_err());
        let config = parse(&["--metrics-listen", "127.0.0.1:9100"]).unwrap();
        assert_eq!(config.metrics_listen, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn history_pages_fetch_at_least_one() {
        assert_eq!(parse(&[]).unwrap().history_pages, 5);
        assert_eq!(parse(&["--history-pages", "0"]).unwrap().history_pages, 1);
    }
}
