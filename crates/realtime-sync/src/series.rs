use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffer::{Admission, BufferItem, BufferState, MergeBuffer};
use crate::config::SeriesConfig;
use crate::demux::DataStream;
use crate::synchronizer::{Syncable, Synchronizer};
use crate::telemetry::{DROP_UNDECODABLE, FRAMES_DROPPED_TOTAL, SNAPSHOTS_PUBLISHED_TOTAL};
use crate::{SyncError, SyncResult};

/// One page of an archive listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub entries: Vec<T>,
    /// Present while more pages remain.
    pub continuation_token: Option<String>,
}

/// Source of archived records, usually a REST listing.
#[async_trait]
pub trait ArchivePager<T>: Send + Sync {
    async fn load_page(&self, continuation: Option<&str>) -> SyncResult<Page<T>>;
}

/// Archive + realtime view over one record series. Snapshots are published
/// by whichever [`Synchronizer`] the view is attached to.
pub struct SeriesView<T: BufferItem> {
    inner: Arc<SeriesInner<T>>,
}

impl<T: BufferItem> Clone for SeriesView<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SeriesInner<T: BufferItem> {
    buffer: Mutex<MergeBuffer<T>>,
    continuation: Mutex<Option<String>>,
    published: watch::Sender<Arc<Vec<T>>>,
    compact_limit: usize,
    attached: AtomicBool,
    generation: AtomicU64,
}

impl<T: BufferItem + Sync> SeriesView<T> {
    pub fn new(config: &SeriesConfig) -> Self {
        let (published, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(SeriesInner {
                buffer: Mutex::new(MergeBuffer::from_config(config)),
                continuation: Mutex::new(None),
                published,
                compact_limit: config.compact_limit,
                attached: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Resets the view and loads the first archive page. Realtime items that
    /// arrive meanwhile are kept. If the returned future is dropped before
    /// the page arrives the view leaves `Loading` with whatever it holds.
    pub async fn load<P>(&self, pager: &P) -> SyncResult<()>
    where
        P: ArchivePager<T> + ?Sized,
    {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.buffer.lock().begin_load();
        *self.inner.continuation.lock() = None;
        let mut guard = LoadGuard {
            inner: &self.inner,
            generation,
            armed: true,
        };

        let page = pager.load_page(None).await?;
        if !self.is_current(generation) {
            debug!(target = "realtime_sync::buffer", "discarding page from superseded load");
            return Ok(());
        }

        guard.armed = false;
        let mut buffer = self.inner.buffer.lock();
        buffer.add_archive_data(page.entries);
        self.inner.settle(&mut buffer);
        *self.inner.continuation.lock() = page.continuation_token;
        Ok(())
    }

    /// Appends the next archive page. Returns false when nothing was left.
    pub async fn load_more<P>(&self, pager: &P) -> SyncResult<bool>
    where
        P: ArchivePager<T> + ?Sized,
    {
        let Some(token) = self.inner.continuation.lock().clone() else {
            return Ok(false);
        };
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let page = pager.load_page(Some(&token)).await?;
        if !self.is_current(generation) {
            return Ok(false);
        }

        self.inner.buffer.lock().add_archive_data(page.entries);
        *self.inner.continuation.lock() = page.continuation_token;
        Ok(true)
    }

    pub fn has_more(&self) -> bool {
        self.inner.continuation.lock().is_some()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Adds one live item, compacting once the ring reaches its watermark.
    /// Mid-load the compaction waits until the load settles.
    pub fn push_realtime(&self, item: T) -> Admission {
        let mut buffer = self.inner.buffer.lock();
        let admission = buffer.add_realtime(item);
        if admission == Admission::WatermarkReached && !buffer.is_loading() {
            buffer.compact(self.inner.compact_limit);
        }
        admission
    }

    pub fn state(&self) -> BufferState {
        self.inner.buffer.lock().state()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.buffer.lock().is_dirty()
    }

    /// Receiver of published snapshots.
    pub fn snapshots(&self) -> watch::Receiver<Arc<Vec<T>>> {
        self.inner.published.subscribe()
    }

    /// Last published snapshot.
    pub fn latest(&self) -> Arc<Vec<T>> {
        self.inner.published.borrow().clone()
    }

    /// Publishes a snapshot if the buffer changed and is not mid-load.
    pub fn flush(&self) -> bool {
        self.inner.flush()
    }

    /// Hands the view to `synchronizer`. A view accepts one synchronizer.
    pub fn attach(&self, synchronizer: &Synchronizer) -> SyncResult<()> {
        if self.inner.attached.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyAttached);
        }
        let inner: Arc<dyn Syncable> = self.inner.clone();
        synchronizer.register(Arc::downgrade(&inner));
        Ok(())
    }
}

impl<T> SeriesView<T>
where
    T: BufferItem + Sync + DeserializeOwned,
{
    /// Spawns a task pushing every decodable frame of `stream` into the
    /// view. The task ends with the stream or when the view is dropped.
    pub fn feed(&self, mut stream: DataStream) -> JoinHandle<()> {
        let view: Weak<SeriesInner<T>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(item) = stream.recv().await {
                let Some(inner) = view.upgrade() else {
                    break;
                };
                match item.decode::<T>() {
                    Ok(record) => {
                        let view = SeriesView { inner };
                        view.push_realtime(record);
                    }
                    Err(err) => {
                        counter!(FRAMES_DROPPED_TOTAL, 1, "reason" => DROP_UNDECODABLE);
                        warn!(
                            target = "realtime_sync::buffer",
                            error = %err,
                            "dropping undecodable record"
                        );
                    }
                }
            }
        })
    }
}

impl<T: BufferItem> SeriesInner<T> {
    /// Leaves `Loading`, running the compaction a mid-load watermark deferred.
    fn settle(&self, buffer: &mut MergeBuffer<T>) {
        buffer.finish_load();
        if buffer.over_watermark() {
            buffer.compact(self.compact_limit);
        }
    }
}

/// Settles an interrupted load, unless a newer load has taken over.
struct LoadGuard<'a, T: BufferItem> {
    inner: &'a SeriesInner<T>,
    generation: u64,
    armed: bool,
}

impl<T: BufferItem> Drop for LoadGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed || self.inner.generation.load(Ordering::SeqCst) != self.generation {
            return;
        }
        let mut buffer = self.inner.buffer.lock();
        if buffer.is_loading() {
            self.inner.settle(&mut buffer);
        }
    }
}

impl<T: BufferItem + Sync> Syncable for SeriesInner<T> {
    fn flush(&self) -> bool {
        let mut buffer = self.buffer.lock();
        if !buffer.is_dirty() || buffer.is_loading() {
            return false;
        }
        let snapshot = Arc::new(buffer.snapshot());
        buffer.mark_clean();
        self.published.send_replace(snapshot);
        counter!(SNAPSHOTS_PUBLISHED_TOTAL, 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;
    use sync_proto::{DataFrame, DataKind, Topic};
    use tokio::sync::Notify;

    use super::*;
    use crate::demux::Demultiplexer;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Tick {
        id: u32,
        at: u32,
    }

    impl BufferItem for Tick {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }

        fn order(&self, other: &Self) -> std::cmp::Ordering {
            other.at.cmp(&self.at)
        }
    }

    fn tick(id: u32, at: u32) -> Tick {
        Tick { id, at }
    }

    struct ScriptedPager {
        pages: Mutex<VecDeque<SyncResult<Page<Tick>>>>,
        tokens: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedPager {
        fn new(pages: Vec<SyncResult<Page<Tick>>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                tokens: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ArchivePager<Tick> for ScriptedPager {
        async fn load_page(&self, continuation: Option<&str>) -> SyncResult<Page<Tick>> {
            self.tokens.lock().push(continuation.map(str::to_string));
            self.pages
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SyncError::Archive("script exhausted".into())))
        }
    }

    /// Serves one page once the gate is opened.
    struct GatedPager {
        gate: Notify,
        page: Mutex<Option<Page<Tick>>>,
    }

    impl GatedPager {
        fn new(entries: Vec<Tick>) -> Self {
            Self {
                gate: Notify::new(),
                page: Mutex::new(Some(Page {
                    entries,
                    continuation_token: None,
                })),
            }
        }
    }

    #[async_trait]
    impl ArchivePager<Tick> for GatedPager {
        async fn load_page(&self, _continuation: Option<&str>) -> SyncResult<Page<Tick>> {
            self.gate.notified().await;
            self.page
                .lock()
                .take()
                .ok_or_else(|| SyncError::Archive("page already served".into()))
        }
    }

    struct StalledPager;

    #[async_trait]
    impl ArchivePager<Tick> for StalledPager {
        async fn load_page(&self, _continuation: Option<&str>) -> SyncResult<Page<Tick>> {
            std::future::pending::<SyncResult<Page<Tick>>>().await
        }
    }

    fn config() -> SeriesConfig {
        SeriesConfig {
            buffer_size: 8,
            watermark: 4,
            compact_limit: 3,
            page_size: 2,
        }
    }

    fn ids(snapshot: &[Tick]) -> Vec<u32> {
        snapshot.iter().map(|t| t.id).collect()
    }

    #[test_timeout::tokio_timeout_test]
    async fn paginated_load_merges_with_realtime() {
        let pager = ScriptedPager::new(vec![
            Ok(Page {
                entries: vec![tick(1, 10), tick(2, 20)],
                continuation_token: Some("next-1".into()),
            }),
            Ok(Page {
                entries: vec![tick(3, 5)],
                continuation_token: None,
            }),
        ]);
        let view = SeriesView::new(&config());

        view.load(&pager).await.unwrap();
        assert!(view.has_more());
        view.push_realtime(tick(2, 25));
        assert!(view.load_more(&pager).await.unwrap());
        assert!(!view.has_more());
        assert!(!view.load_more(&pager).await.unwrap());

        assert!(view.flush());
        assert_eq!(ids(&view.latest()), vec![2, 1, 3]);
        assert_eq!(
            *pager.tokens.lock(),
            vec![None, Some("next-1".to_string())]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn flush_publishes_only_when_dirty_and_not_loading() {
        let view: SeriesView<Tick> = SeriesView::new(&config());
        assert!(!view.flush());

        view.inner.buffer.lock().begin_load();
        view.push_realtime(tick(1, 1));
        assert!(!view.flush());
        assert!(view.latest().is_empty());

        view.inner.buffer.lock().finish_load();
        let mut snapshots = view.snapshots();
        assert!(view.flush());
        assert!(!view.is_dirty());
        assert!(!view.flush());
        snapshots.changed().await.unwrap();
        assert_eq!(ids(&snapshots.borrow()), vec![1]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn watermark_compacts_to_limit() {
        let view = SeriesView::new(&config());
        let admissions: Vec<_> = (1..=4).map(|n| view.push_realtime(tick(n, n))).collect();
        assert_eq!(admissions[3], Admission::WatermarkReached);

        let buffer = view.inner.buffer.lock();
        assert_eq!(buffer.pointer(), 0);
        assert_eq!(buffer.archived(), 3);
        assert_eq!(ids(&buffer.snapshot()), vec![4, 3, 2]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn watermark_during_load_waits_and_keys_stay_unique() {
        let config = SeriesConfig {
            buffer_size: 10,
            watermark: 4,
            compact_limit: 10,
            page_size: 4,
        };
        let view: SeriesView<Tick> = SeriesView::new(&config);
        let pager = Arc::new(GatedPager::new((1..=4).map(|n| tick(n, n)).collect()));
        let loading = tokio::spawn({
            let view = view.clone();
            let pager = pager.clone();
            async move { view.load(&*pager).await }
        });
        while view.state() != BufferState::Loading {
            tokio::task::yield_now().await;
        }

        let admissions: Vec<_> = (1..=4).map(|n| view.push_realtime(tick(n, 10 + n))).collect();
        assert_eq!(admissions[3], Admission::WatermarkReached);
        assert_eq!(view.inner.buffer.lock().pointer(), 4);
        assert!(!view.flush());

        pager.gate.notify_one();
        loading.await.unwrap().unwrap();
        assert_eq!(view.state(), BufferState::Ready);
        assert_eq!(view.inner.buffer.lock().pointer(), 0);

        assert!(view.flush());
        let latest = view.latest();
        assert_eq!(ids(&latest), vec![4, 3, 2, 1]);
        assert!(latest.iter().all(|t| t.at > 10));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn abandoned_load_does_not_stay_loading() {
        let view: SeriesView<Tick> = SeriesView::new(&config());
        let outcome =
            tokio::time::timeout(Duration::from_millis(20), view.load(&StalledPager)).await;
        assert!(outcome.is_err());
        assert_eq!(view.state(), BufferState::Ready);

        view.push_realtime(tick(1, 1));
        assert!(view.flush());
        assert_eq!(ids(&view.latest()), vec![1]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_load_does_not_stay_loading() {
        let pager = ScriptedPager::new(vec![Err(SyncError::Archive("503".into()))]);
        let view: SeriesView<Tick> = SeriesView::new(&config());
        assert!(matches!(view.load(&pager).await, Err(SyncError::Archive(_))));
        assert_eq!(view.state(), BufferState::Ready);
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_attach_is_rejected() {
        let view: SeriesView<Tick> = SeriesView::new(&config());
        let first = Synchronizer::new(Duration::from_secs(1));
        let second = Synchronizer::new(Duration::from_secs(1));
        view.attach(&first).unwrap();
        assert!(matches!(view.attach(&second), Err(SyncError::AlreadyAttached)));
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn feed_decodes_routed_frames() {
        let demux = Demultiplexer::new();
        demux.open(1, Topic::CommandHistory);
        let stream = demux.attach(1).unwrap();
        let view: SeriesView<Tick> = SeriesView::new(&config());
        let task = view.feed(stream);

        let frames = [
            json!({"id": 1, "at": 1}),
            json!({"bogus": true}),
            json!({"id": 2, "at": 2}),
        ];
        for data in frames {
            demux.route(DataFrame {
                kind: DataKind::CommandHistory,
                subscription_id: None,
                data,
            });
        }
        demux.close(1);
        task.await.unwrap();

        assert!(view.flush());
        assert_eq!(ids(&view.latest()), vec![2, 1]);
    }
}
