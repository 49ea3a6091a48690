//! Trigger policies deciding which events cause a mail to be sent.
//!
//! A policy is a predicate over a single event. It is evaluated on the
//! producing thread for every appended event, after the event has been
//! pushed into the buffer, so it must be cheap and never block.
//!
//! # Policies
//!
//! - [`SeverityThreshold`]: events at or above a level (default `ERROR`)
//! - [`RateLimited`]: severity threshold capped to `count` triggers per
//!   window, globally or per logger, backed by a moka TTL cache
//! - [`EveryNth`]: every n-th event at or above a level

use crate::config::TriggerConfig;
use crate::event::{Level, LogEvent};
use moka::sync::Cache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Maximum number of distinct logger keys tracked by [`RateLimited`].
const DEFAULT_MAX_KEYS: u64 = 10_000;

const GLOBAL_KEY: &str = "*";

/// Decides whether an event triggers a send.
pub trait TriggerPolicy: Send + Sync {
    fn should_trigger(&self, event: &LogEvent) -> bool;
}

impl std::fmt::Debug for dyn TriggerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TriggerPolicy")
    }
}

/// Build the policy described by a trigger configuration.
pub fn from_config(config: &TriggerConfig) -> Arc<dyn TriggerPolicy> {
    match config {
        TriggerConfig::Severity { level } => Arc::new(SeverityThreshold::new(*level)),
        TriggerConfig::RateLimited {
            level,
            count,
            window,
            per_logger,
        } => Arc::new(RateLimited::new(*level, *count, *window, *per_logger)),
        TriggerConfig::Count { level, every } => Arc::new(EveryNth::new(*level, *every)),
    }
}

/// Triggers on every event whose level is at or above the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityThreshold {
    level: Level,
}

impl SeverityThreshold {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Default for SeverityThreshold {
    fn default() -> Self {
        Self::new(Level::Error)
    }
}

impl TriggerPolicy for SeverityThreshold {
    fn should_trigger(&self, event: &LogEvent) -> bool {
        event.level >= self.level
    }
}

/// Severity threshold limited to `max_count` triggers per time window.
///
/// Counters live in a moka cache whose entries expire `window` after
/// creation, so the first trigger of a key opens its window.
pub struct RateLimited {
    threshold: SeverityThreshold,
    cache: Cache<String, Arc<AtomicU32>>,
    max_count: u32,
    per_logger: bool,
}

impl RateLimited {
    pub fn new(level: Level, max_count: u32, window: Duration, per_logger: bool) -> Self {
        Self::with_capacity(level, max_count, window, per_logger, DEFAULT_MAX_KEYS)
    }

    /// Create a limiter tracking at most `max_keys` loggers.
    pub fn with_capacity(
        level: Level,
        max_count: u32,
        window: Duration,
        per_logger: bool,
        max_keys: u64,
    ) -> Self {
        let cache = Cache::builder()
            .time_to_live(window)
            .max_capacity(max_keys)
            .build();

        Self {
            threshold: SeverityThreshold::new(level),
            cache,
            max_count,
            per_logger,
        }
    }

    fn key<'a>(&self, event: &'a LogEvent) -> &'a str {
        if self.per_logger {
            &event.logger
        } else {
            GLOBAL_KEY
        }
    }
}

impl TriggerPolicy for RateLimited {
    fn should_trigger(&self, event: &LogEvent) -> bool {
        if !self.threshold.should_trigger(event) {
            return false;
        }

        let key = self.key(event);
        let entry = self
            .cache
            .get_with(key.to_string(), || Arc::new(AtomicU32::new(0)));
        let count = entry.fetch_add(1, Ordering::SeqCst) + 1;

        if count <= self.max_count {
            true
        } else {
            tracing::debug!(
                key = %key,
                count = count,
                max_count = self.max_count,
                "Trigger suppressed by rate limit"
            );
            metrics::counter!("logmailer_triggers_suppressed_total").increment(1);
            false
        }
    }
}

impl std::fmt::Debug for RateLimited {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimited")
            .field("threshold", &self.threshold)
            .field("max_count", &self.max_count)
            .field("per_logger", &self.per_logger)
            .field("cache_entry_count", &self.cache.entry_count())
            .finish()
    }
}

/// Triggers on every `every`-th event at or above the threshold.
#[derive(Debug)]
pub struct EveryNth {
    threshold: SeverityThreshold,
    every: u64,
    seen: AtomicU64,
}

impl EveryNth {
    pub fn new(level: Level, every: u64) -> Self {
        Self {
            threshold: SeverityThreshold::new(level),
            every: every.max(1),
            seen: AtomicU64::new(0),
        }
    }
}

impl TriggerPolicy for EveryNth {
    fn should_trigger(&self, event: &LogEvent) -> bool {
        if !self.threshold.should_trigger(event) {
            return false;
        }
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        seen % self.every == 0
    }
}
