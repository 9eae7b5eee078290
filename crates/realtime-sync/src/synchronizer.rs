use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::trace;

/// Something a [`Synchronizer`] can publish on each tick.
pub trait Syncable: Send + Sync {
    /// Publishes pending changes. Returns true if anything was published.
    fn flush(&self) -> bool;
}

pub const DEFAULT_PERIOD: Duration = Duration::from_millis(1000);

/// Periodically flushes the views registered with it. Views are held
/// weakly and pruned once dropped.
pub struct Synchronizer {
    inner: Arc<Inner>,
    ticker: Option<JoinHandle<()>>,
}

struct Inner {
    period: Duration,
    views: Mutex<Vec<Weak<dyn Syncable>>>,
}

impl Synchronizer {
    /// A synchronizer without a background ticker; drive it with
    /// [`Synchronizer::tick`].
    pub fn new(period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                period,
                views: Mutex::new(Vec::new()),
            }),
            ticker: None,
        }
    }

    /// Starts ticking every `period` on the current runtime.
    pub fn spawn(period: Duration) -> Self {
        let mut synchronizer = Self::new(period);
        let inner = Arc::downgrade(&synchronizer.inner);
        synchronizer.ticker = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.tick();
            }
        }));
        synchronizer
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    pub(crate) fn register(&self, view: Weak<dyn Syncable>) {
        self.inner.views.lock().push(view);
    }

    /// Flushes every live view once. Returns how many published.
    pub fn tick(&self) -> usize {
        self.inner.tick()
    }

    /// Registered views still alive.
    pub fn len(&self) -> usize {
        self.inner
            .views
            .lock()
            .iter()
            .filter(|view| view.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn tick(&self) -> usize {
        let live: Vec<Arc<dyn Syncable>> = {
            let mut views = self.views.lock();
            views.retain(|view| view.strong_count() > 0);
            views.iter().filter_map(Weak::upgrade).collect()
        };
        let published = live.iter().filter(|view| view.flush()).count();
        if published > 0 {
            trace!(target = "realtime_sync::synchronizer", published, "tick");
        }
        published
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD)
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}
