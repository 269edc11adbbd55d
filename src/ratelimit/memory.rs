//! In-process counting store.
//!
//! Counts live in a ring of sub-window slots. A fixed-window store has a
//! single slot that is cleared once per window, so a client can burst up to
//! twice the limit across a boundary. A bucketed store splits the window into
//! `n` slots and clears the oldest one every `window / n`, which bounds that
//! burst to `limit * (1 + 1/n)` at the cost of `n` maps.
//!
//! Slots are rotated lazily on every access and by a background timer that
//! only holds a weak reference to the store, so it neither keeps the store
//! alive nor blocks runtime shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::store::{Capabilities, ClientRateLimitInfo, Store, StoreOptions};
use super::validation::MAX_WINDOW_MS;
use crate::error::StoreError;

/// Window used until the options resolver calls [`Store::init`].
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Longest window the ring will track.
const MAX_WINDOW: Duration = Duration::from_millis(MAX_WINDOW_MS as u64);

/// How the in-memory store divides its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStrategy {
    /// One slot, cleared every window
    Fixed,
    /// `n` slots, the oldest cleared every `window / n`
    Bucketed(usize),
}

impl WindowStrategy {
    /// Slot count for `window`, at most one slot per millisecond.
    fn slots(&self, window: Duration) -> usize {
        let max = window.as_millis().clamp(1, u32::MAX as u128) as usize;
        match self {
            WindowStrategy::Fixed => 1,
            WindowStrategy::Bucketed(n) => (*n).clamp(1, max),
        }
    }
}

/// Ring of per-slot hit maps, oldest first.
struct Slots {
    window: Duration,
    ring: VecDeque<HashMap<String, u64>>,
    /// When the oldest slot is next discarded
    next_rotation: Instant,
}

impl Slots {
    fn new(slots: usize, window: Duration) -> Self {
        let window = window.min(MAX_WINDOW);
        let mut ring = VecDeque::with_capacity(slots);
        ring.resize_with(slots, HashMap::new);
        let mut this = Self {
            window,
            ring,
            next_rotation: Instant::now(),
        };
        this.next_rotation = Instant::now() + this.slot_length();
        this
    }

    fn slot_length(&self) -> Duration {
        self.window / self.ring.len() as u32
    }

    /// Discard every slot whose time has passed.
    fn advance(&mut self, now: Instant) {
        if now < self.next_rotation {
            return;
        }

        let slot = self.slot_length();
        let behind = now.duration_since(self.next_rotation).as_nanos() / slot.as_nanos().max(1);
        let rotations = behind + 1;

        for _ in 0..rotations.min(self.ring.len() as u128) {
            self.ring.pop_front();
            self.ring.push_back(HashMap::new());
        }

        self.next_rotation += Duration::from_nanos((slot.as_nanos() * rotations) as u64);
        trace!(rotations = rotations as u64, "Rotated memory store slots");
    }

    fn clear(&mut self) {
        self.ring.iter_mut().for_each(HashMap::clear);
    }

    fn total(&self, key: &str) -> Option<u64> {
        self.ring
            .iter()
            .filter_map(|slot| slot.get(key))
            .fold(None, |acc, hits| Some(acc.unwrap_or(0) + hits))
    }

    /// Instant at which the newest slot holding `key` is discarded.
    fn reset_instant(&self, key: &str) -> Instant {
        let newest = self
            .ring
            .iter()
            .rposition(|slot| slot.contains_key(key))
            .unwrap_or(self.ring.len() - 1);
        self.next_rotation + self.slot_length() * newest as u32
    }

    fn info(&self, key: &str) -> Option<ClientRateLimitInfo> {
        let total_hits = self.total(key)?;
        Some(ClientRateLimitInfo {
            total_hits,
            reset_time: Some(to_wall_clock(self.reset_instant(key))),
        })
    }
}

fn to_wall_clock(instant: Instant) -> DateTime<Utc> {
    let remaining = instant.saturating_duration_since(Instant::now());
    Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
}

/// A counting store that keeps every record in process memory.
pub struct MemoryStore {
    strategy: WindowStrategy,
    slots: Arc<Mutex<Slots>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create a fixed-window store.
    pub fn new() -> Self {
        Self::with_strategy(WindowStrategy::Fixed)
    }

    /// Create a store that divides its window into `slots` sub-windows.
    pub fn bucketed(slots: usize) -> Self {
        Self::with_strategy(WindowStrategy::Bucketed(slots))
    }

    /// Create a store with an explicit window strategy.
    pub fn with_strategy(strategy: WindowStrategy) -> Self {
        Self {
            strategy,
            slots: Arc::new(Mutex::new(Slots::new(strategy.slots(DEFAULT_WINDOW), DEFAULT_WINDOW))),
            timer: Mutex::new(None),
        }
    }

    /// The strategy this store was built with.
    pub fn strategy(&self) -> WindowStrategy {
        self.strategy
    }

    /// Stop the rotation timer and drop every record.
    pub fn shutdown(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        self.slots.lock().clear();
        debug!("Memory store shut down");
    }

    /// Number of keys with a live record.
    pub fn key_count(&self) -> usize {
        let mut slots = self.slots.lock();
        slots.advance(Instant::now());
        let mut keys: Vec<&String> = slots.ring.iter().flat_map(|slot| slot.keys()).collect();
        keys.sort_unstable();
        keys.dedup();
        keys.len()
    }

    fn spawn_timer(&self, period: Duration) {
        if period.is_zero() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime available, memory store will rotate lazily");
            return;
        };

        let slots: Weak<Mutex<Slots>> = Arc::downgrade(&self.slots);
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(slots) = slots.upgrade() else {
                    break;
                };
                slots.lock().advance(Instant::now());
            }
        });

        if let Some(previous) = self.timer.lock().replace(task) {
            previous.abort();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn init(&self, options: &StoreOptions) {
        let period = {
            let mut slots = self.slots.lock();
            *slots = Slots::new(self.strategy.slots(options.window), options.window);
            slots.slot_length()
        };

        debug!(
            window_ms = options.window.as_millis() as u64,
            strategy = ?self.strategy,
            "Initializing memory store"
        );
        self.spawn_timer(period);
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn local_keys(&self) -> bool {
        true
    }

    async fn increment(&self, key: &str) -> Result<ClientRateLimitInfo, StoreError> {
        let mut slots = self.slots.lock();
        slots.advance(Instant::now());

        if let Some(current) = slots.ring.back_mut() {
            *current.entry(key.to_string()).or_insert(0) += 1;
        }

        let info = slots
            .info(key)
            .ok_or_else(|| StoreError::Backend(format!("no record for {key} after increment")))?;
        trace!(key = %key, total_hits = info.total_hits, "Incremented memory store");
        Ok(info)
    }

    async fn decrement(&self, key: &str) -> Result<(), StoreError> {
        let mut slots = self.slots.lock();
        slots.advance(Instant::now());

        if let Some(hits) = slots
            .ring
            .iter_mut()
            .rev()
            .filter_map(|slot| slot.get_mut(key))
            .find(|hits| **hits > 0)
        {
            *hits -= 1;
        }
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<(), StoreError> {
        let mut slots = self.slots.lock();
        for slot in slots.ring.iter_mut() {
            slot.remove(key);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<ClientRateLimitInfo>, StoreError> {
        let mut slots = self.slots.lock();
        slots.advance(Instant::now());
        Ok(slots.info(key))
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        self.slots.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_window(strategy: WindowStrategy, window: Duration) -> MemoryStore {
        let store = MemoryStore::with_strategy(strategy);
        store.init(&StoreOptions { window });
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_counts_per_key() {
        let store = store_with_window(WindowStrategy::Fixed, Duration::from_secs(1));

        assert_eq!(store.increment("a").await.unwrap().total_hits, 1);
        assert_eq!(store.increment("a").await.unwrap().total_hits, 2);
        assert_eq!(store.increment("b").await.unwrap().total_hits, 1);
        assert_eq!(store.key_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_time_is_one_window_ahead() {
        let store = store_with_window(WindowStrategy::Fixed, Duration::from_secs(10));

        let info = store.increment("a").await.unwrap();
        let reset = info.reset_time.unwrap();
        let delta = (reset - Utc::now()).num_milliseconds();
        assert!((9_000..=10_000).contains(&delta), "delta was {delta}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_clears_after_window() {
        let store = store_with_window(WindowStrategy::Fixed, Duration::from_secs(1));

        store.increment("a").await.unwrap();
        store.increment("a").await.unwrap();

        tokio::time::advance(Duration::from_millis(1001)).await;

        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.increment("a").await.unwrap().total_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_allows_boundary_burst() {
        let store = store_with_window(WindowStrategy::Fixed, Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(900)).await;
        store.increment("a").await.unwrap();
        store.increment("a").await.unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        // Hits from 200ms ago are already forgotten.
        assert_eq!(store.increment("a").await.unwrap().total_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucketed_window_forgets_one_slot_at_a_time() {
        let store = store_with_window(WindowStrategy::Bucketed(4), Duration::from_secs(4));

        store.increment("a").await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        store.increment("a").await.unwrap();

        // Both hits are still within the window.
        assert_eq!(store.get("a").await.unwrap().unwrap().total_hits, 2);

        tokio::time::advance(Duration::from_millis(2600)).await;
        // The first hit's slot has rotated out, the second remains.
        assert_eq!(store.get("a").await.unwrap().unwrap().total_hits, 1);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucketed_reset_time_tracks_newest_slot() {
        let store = store_with_window(WindowStrategy::Bucketed(2), Duration::from_secs(2));

        let info = store.increment("a").await.unwrap();
        let delta = (info.reset_time.unwrap() - Utc::now()).num_milliseconds();
        assert!((1_900..=2_000).contains(&delta), "delta was {delta}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrement_does_not_go_below_zero() {
        let store = store_with_window(WindowStrategy::Fixed, Duration::from_secs(1));

        store.increment("a").await.unwrap();
        store.decrement("a").await.unwrap();
        store.decrement("a").await.unwrap();

        let info = store.get("a").await.unwrap();
        assert_eq!(info.map(|i| i.total_hits), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_key_removes_record() {
        let store = store_with_window(WindowStrategy::Fixed, Duration::from_secs(1));

        store.increment("a").await.unwrap();
        store.increment("b").await.unwrap();
        store.reset_key("a").await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all_and_shutdown() {
        let store = store_with_window(WindowStrategy::Bucketed(3), Duration::from_secs(3));

        store.increment("a").await.unwrap();
        store.increment("b").await.unwrap();
        store.reset_all().await.unwrap();
        assert_eq!(store.key_count(), 0);

        store.increment("a").await.unwrap();
        store.shutdown();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_rotates_without_access() {
        let store = store_with_window(WindowStrategy::Fixed, Duration::from_secs(1));
        store.increment("a").await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        // Read the ring directly so the lazy rotation path is not involved.
        assert_eq!(store.slots.lock().total("a"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(store_with_window(WindowStrategy::Fixed, Duration::from_secs(60)));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("k").await.unwrap().total_hits })
            })
            .collect();

        let mut totals = Vec::new();
        for task in tasks {
            totals.push(task.await.unwrap());
        }
        totals.sort_unstable();

        assert_eq!(totals, (1..=200).collect::<Vec<u64>>());
        assert_eq!(store.get("k").await.unwrap().unwrap().total_hits, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_count_is_bounded_by_window() {
        let store = store_with_window(WindowStrategy::Bucketed(usize::MAX), Duration::from_millis(10));
        assert_eq!(store.slots.lock().ring.len(), 10);
        assert_eq!(store.slots.lock().slot_length(), Duration::from_millis(1));

        store.increment("a").await.unwrap();
        store.increment("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().total_hits, 2);

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_window_is_capped() {
        let store = store_with_window(WindowStrategy::Fixed, Duration::MAX);
        assert_eq!(store.slots.lock().window, MAX_WINDOW);
        assert_eq!(store.increment("a").await.unwrap().total_hits, 1);
    }

    #[test]
    fn test_lazy_rotation_without_runtime() {
        let store = MemoryStore::new();
        store.init(&StoreOptions {
            window: Duration::from_secs(1),
        });
        assert!(store.timer.lock().is_none());
        assert_eq!(store.strategy(), WindowStrategy::Fixed);
    }
}
