// Request and cache counters shared by all sessions
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

use crate::settings::Engine;

/// Counters for one reporting window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub primary_requests: u64,
    pub fallback_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub synthesis_failures: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl StatsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

/// Injected metrics sink
pub struct Stats {
    total_requests: AtomicU64,
    primary_requests: AtomicU64,
    fallback_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    synthesis_failures: AtomicU64,
    window_start: Mutex<DateTime<Utc>>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            primary_requests: AtomicU64::new(0),
            fallback_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            synthesis_failures: AtomicU64::new(0),
            window_start: Mutex::new(Utc::now()),
        }
    }

    /// Record a synthesis request
    pub fn record_request(&self, engine: Engine) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match engine {
            Engine::Primary => self.primary_requests.fetch_add(1, Ordering::Relaxed),
            Engine::Fallback => self.fallback_requests.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self) {
        self.synthesis_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current window without resetting it
    pub fn snapshot(&self) -> StatsSnapshot {
        let window_start = match self.window_start.lock() {
            Ok(start) => *start,
            Err(poisoned) => *poisoned.into_inner(),
        };
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            primary_requests: self.primary_requests.load(Ordering::Relaxed),
            fallback_requests: self.fallback_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            synthesis_failures: self.synthesis_failures.load(Ordering::Relaxed),
            window_start,
            window_end: Utc::now(),
        }
    }

    /// Close the current window and start a new one
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let now = Utc::now();
        let window_start = match self.window_start.lock() {
            Ok(mut start) => std::mem::replace(&mut *start, now),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), now),
        };
        StatsSnapshot {
            total_requests: self.total_requests.swap(0, Ordering::Relaxed),
            primary_requests: self.primary_requests.swap(0, Ordering::Relaxed),
            fallback_requests: self.fallback_requests.swap(0, Ordering::Relaxed),
            cache_hits: self.cache_hits.swap(0, Ordering::Relaxed),
            cache_misses: self.cache_misses.swap(0, Ordering::Relaxed),
            synthesis_failures: self.synthesis_failures.swap(0, Ordering::Relaxed),
            window_start,
            window_end: now,
        }
    }

    /// Print a window to the log
    pub fn log_snapshot(snapshot: &StatsSnapshot) {
        info!(
            target = "stats",
            total = snapshot.total_requests,
            primary = snapshot.primary_requests,
            fallback = snapshot.fallback_requests,
            cache_hits = snapshot.cache_hits,
            cache_misses = snapshot.cache_misses,
            failures = snapshot.synthesis_failures,
            hit_rate = format!("{:.1}%", snapshot.cache_hit_rate() * 100.0),
            "Usage report"
        );
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_engine_and_cache_result() {
        let stats = Stats::new();
        stats.record_request(Engine::Primary);
        stats.record_request(Engine::Primary);
        stats.record_request(Engine::Fallback);
        stats.record_cache(true);
        stats.record_cache(false);

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.primary_requests, 2);
        assert_eq!(snap.fallback_requests, 1);
        assert_eq!(snap.cache_hit_rate(), 0.5);
    }

    #[test]
    fn test_snapshot_and_reset_starts_new_window() {
        let stats = Stats::new();
        stats.record_request(Engine::Primary);
        stats.record_failure();

        let first = stats.snapshot_and_reset();
        assert_eq!(first.total_requests, 1);
        assert_eq!(first.synthesis_failures, 1);

        let second = stats.snapshot();
        assert_eq!(second.total_requests, 0);
        assert_eq!(second.synthesis_failures, 0);
        assert!(second.window_start >= first.window_start);
    }
}
