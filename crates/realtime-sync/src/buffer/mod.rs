//! Archive + realtime merge buffer.
//!
//! An archive fetch lands in an append-only store while live items go into a
//! fixed-size ring. `snapshot` folds the ring over the archive by identity
//! key and sorts once; sorting never happens on the insert path.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use metrics::counter;
use tracing::{debug, trace};

use crate::config::SeriesConfig;
use crate::telemetry::BUFFER_OVERFLOW_TOTAL;

mod command_history;

pub use command_history::{CommandHistoryRecord, CommandId};

/// A record that can live in a [`MergeBuffer`].
pub trait BufferItem: Clone + Send + 'static {
    type Key: Eq + Hash + Clone + Send;

    /// Identity; a realtime item replaces the archived item with the same key.
    fn key(&self) -> Self::Key;

    /// Total snapshot order.
    fn order(&self, other: &Self) -> Ordering;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    Loading,
    Ready,
}

/// Result of offering one realtime item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Accepted, and the ring just reached the watermark for the first time
    /// since the last reset or compaction.
    WatermarkReached,
    /// The ring was full; the item was discarded.
    Dropped,
}

type WatermarkObserver = Box<dyn FnMut(usize) + Send>;

pub struct MergeBuffer<T: BufferItem> {
    archive: Vec<T>,
    ring: Vec<T>,
    buffer_size: usize,
    watermark: usize,
    watermark_fired: bool,
    on_watermark: Option<WatermarkObserver>,
    dropped: u64,
    dirty: bool,
    state: BufferState,
}

impl<T: BufferItem> fmt::Debug for MergeBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeBuffer")
            .field("archived", &self.archive.len())
            .field("pointer", &self.ring.len())
            .field("buffer_size", &self.buffer_size)
            .field("watermark", &self.watermark)
            .field("dropped", &self.dropped)
            .field("dirty", &self.dirty)
            .field("state", &self.state)
            .finish()
    }
}

impl<T: BufferItem> MergeBuffer<T> {
    pub fn new(buffer_size: usize, watermark: usize) -> Self {
        Self {
            archive: Vec::new(),
            ring: Vec::with_capacity(buffer_size),
            buffer_size,
            watermark: watermark.min(buffer_size),
            watermark_fired: false,
            on_watermark: None,
            dropped: 0,
            dirty: false,
            state: BufferState::Empty,
        }
    }

    pub fn from_config(config: &SeriesConfig) -> Self {
        Self::new(config.buffer_size, config.watermark)
    }

    /// Called with the ring fill level when the watermark is reached.
    pub fn set_watermark_observer(&mut self, observer: impl FnMut(usize) + Send + 'static) {
        self.on_watermark = Some(Box::new(observer));
    }

    fn touch(&mut self) {
        self.dirty = true;
        if self.state == BufferState::Empty {
            self.state = BufferState::Ready;
        }
    }

    pub fn add_archive_data(&mut self, items: impl IntoIterator<Item = T>) {
        self.archive.extend(items);
        self.touch();
    }

    pub fn add_realtime(&mut self, item: T) -> Admission {
        self.touch();
        if self.ring.len() >= self.buffer_size {
            self.dropped += 1;
            counter!(BUFFER_OVERFLOW_TOTAL, 1);
            trace!(
                target = "realtime_sync::buffer",
                dropped = self.dropped,
                "realtime ring full; item dropped"
            );
            return Admission::Dropped;
        }

        self.ring.push(item);
        if !self.watermark_fired && self.ring.len() >= self.watermark {
            self.watermark_fired = true;
            debug!(
                target = "realtime_sync::buffer",
                pointer = self.ring.len(),
                "watermark reached"
            );
            if let Some(observer) = self.on_watermark.as_mut() {
                observer(self.ring.len());
            }
            return Admission::WatermarkReached;
        }
        Admission::Accepted
    }

    /// Archive overlaid with the ring, sorted. Does not modify the buffer.
    ///
    /// Each key appears once: a later item, archived or live, replaces an
    /// earlier one in place.
    pub fn snapshot(&self) -> Vec<T> {
        let mut merged: Vec<T> = Vec::with_capacity(self.archive.len() + self.ring.len());
        let mut positions: HashMap<T::Key, usize> = HashMap::with_capacity(merged.capacity());

        for item in self.archive.iter().chain(&self.ring) {
            match positions.get(&item.key()) {
                Some(&index) => merged[index] = item.clone(),
                None => {
                    positions.insert(item.key(), merged.len());
                    merged.push(item.clone());
                }
            }
        }

        merged.sort_by(|a, b| a.order(b));
        merged
    }

    /// Collapses both stores into an archive of at most `limit` items and
    /// empties the ring. The watermark is re-armed.
    pub fn compact(&mut self, limit: usize) {
        let mut merged = self.snapshot();
        merged.truncate(limit);
        debug!(
            target = "realtime_sync::buffer",
            kept = merged.len(),
            ring = self.ring.len(),
            "compacted"
        );
        self.archive = merged;
        self.ring.clear();
        self.watermark_fired = false;
        self.touch();
    }

    pub fn reset(&mut self) {
        self.archive.clear();
        self.ring.clear();
        self.watermark_fired = false;
        self.dirty = true;
    }

    /// Resets and enters `Loading` ahead of a fresh paginated fetch.
    pub fn begin_load(&mut self) {
        self.reset();
        self.state = BufferState::Loading;
    }

    pub fn finish_load(&mut self) {
        self.state = BufferState::Ready;
        self.dirty = true;
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        self.state == BufferState::Loading
    }

    /// True while the ring holds at least `watermark` items.
    pub fn over_watermark(&self) -> bool {
        self.ring.len() >= self.watermark
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Ring fill level.
    pub fn pointer(&self) -> usize {
        self.ring.len()
    }

    pub fn archived(&self) -> usize {
        self.archive.len()
    }

    /// Realtime items discarded because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
