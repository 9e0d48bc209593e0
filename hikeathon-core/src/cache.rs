use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Insertion-ordered cache with a time-to-live and a size cap. When full,
/// the oldest entry is evicted first.
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    capacity: usize,
    entries: VecDeque<(String, Instant, V)>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        self.evict_expired(now);
        self.entries
            .iter()
            .find(|(k, _, _)| k == key)
            .map(|(_, _, value)| value.clone())
    }

    /// Stores `value`, replacing any entry under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: V, now: Instant) {
        let key = key.into();
        self.evict_expired(now);
        self.entries.retain(|(k, _, _)| *k != key);
        self.entries.push_back((key, now, value));
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|(_, stored_at, _)| now.saturating_duration_since(*stored_at) < ttl);
    }
}

/// Sliding-window limiter: at most `limit` acquisitions per `window`.
#[derive(Debug)]
pub struct RateWindow {
    limit: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: VecDeque::new(),
        }
    }

    pub fn per_minute(limit: usize) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(&first) = self.hits.front() {
            if now.saturating_duration_since(first) < self.window {
                break;
            }
            self.hits.pop_front();
        }
        if self.hits.len() >= self.limit {
            return false;
        }
        self.hits.push_back(now);
        true
    }

    pub fn used(&self) -> usize {
        self.hits.len()
    }
}
