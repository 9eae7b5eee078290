//! Metric names emitted through the `metrics` facade. Nothing is recorded
//! unless the host process installs a recorder.

pub const RECONNECT_ATTEMPTS_TOTAL: &str = "realtime_sync_reconnect_attempts_total";
pub const FRAMES_DROPPED_TOTAL: &str = "realtime_sync_frames_dropped_total";
pub const BUFFER_OVERFLOW_TOTAL: &str = "realtime_sync_buffer_overflow_total";
pub const SNAPSHOTS_PUBLISHED_TOTAL: &str = "realtime_sync_snapshots_published_total";

pub const DROP_UNDECODABLE: &str = "undecodable";
pub const DROP_UNROUTED: &str = "unrouted";
pub const DROP_UNMATCHED_REPLY: &str = "unmatched_reply";
