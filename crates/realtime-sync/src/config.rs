use std::env;
use std::time::Duration;

use rand::Rng;

const DEFAULT_URL: &str = "ws://127.0.0.1:8090/_websocket";
const DEFAULT_BUFFER_SIZE: usize = 500;
const DEFAULT_BUFFER_WATERMARK: usize = 400;
const DEFAULT_PAGE_SIZE: usize = 100;

/// Connection-level settings for [`crate::SyncClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Websocket endpoint, without the instance suffix.
    pub url: String,
    pub instance: Option<String>,
    /// How long `SyncClient::connect` waits for the first open.
    pub connect_timeout: Duration,
    /// Deadline for each request/reply exchange. `None` waits forever.
    pub request_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        let request_timeout = match env_parse::<u64>("SYNC_REQUEST_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.request_timeout,
        };
        Self {
            url: env::var("SYNC_URL").unwrap_or(defaults.url),
            instance: env::var("SYNC_INSTANCE").ok().filter(|value| !value.is_empty()),
            connect_timeout: env_parse("SYNC_CONNECT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            request_timeout,
            reconnect: ReconnectPolicy::from_env(),
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Full endpoint; the instance, when set, is appended as a path segment.
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        match &self.instance {
            Some(instance) => format!("{base}/{instance}"),
            None => base.to_string(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            instance: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(30)),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Delay schedule between reconnect attempts.
///
/// Attempt `n` (1-based, counted since the last successful open) waits
/// `initial_delay * multiplier^(n-1)`, capped at `max_delay`, then shortened
/// by up to `jitter` of itself. `max_attempts` bounds consecutive attempts;
/// `None` retries forever.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn from_env() -> Self {
        let delay = env_parse("SYNC_RECONNECT_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(1));
        let policy = match env_parse("SYNC_RECONNECT_MAX_DELAY_MS").map(Duration::from_millis) {
            Some(max_delay) if max_delay > delay => Self::exponential(delay, max_delay),
            _ => Self::constant(delay),
        };
        policy.with_max_attempts(env_parse("SYNC_RECONNECT_MAX_ATTEMPTS"))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempt > max)
    }

    /// Delay before the given attempt, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let cut = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.mul_f64(1.0 - cut)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::constant(Duration::from_secs(1))
    }
}

/// Sizing for one [`crate::SeriesView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesConfig {
    /// Capacity of the realtime ring.
    pub buffer_size: usize,
    /// Ring fill level that triggers compaction.
    pub watermark: usize,
    /// Entries kept by a compaction.
    pub compact_limit: usize,
    /// Entries requested per archive page.
    pub page_size: usize,
}

impl SeriesConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            buffer_size: env_parse("SYNC_BUFFER_SIZE").unwrap_or(defaults.buffer_size),
            watermark: env_parse("SYNC_BUFFER_WATERMARK").unwrap_or(defaults.watermark),
            compact_limit: env_parse("SYNC_COMPACT_LIMIT").unwrap_or(defaults.compact_limit),
            page_size: env_parse("SYNC_PAGE_SIZE").unwrap_or(defaults.page_size),
        }
    }
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            watermark: DEFAULT_BUFFER_WATERMARK,
            compact_limit: DEFAULT_BUFFER_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}
