//! In-memory, time-ordered record cache with age and count retention.
//!
//! All mutation happens on one writer task fed through a [`RecordQueue`];
//! range queries take the read side of the list lock.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use seedlink_hub_protocol::MessageNumber;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::queue::RecordQueue;
use crate::record::BinaryRecord;
use crate::time::now_ms;

/// Default idle wake-up of the writer task, for ageing out a quiet cache.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(60);

/// Shared handle to the message cache. Clone is cheap (Arc).
#[derive(Clone)]
pub struct MessageCache(Arc<CacheInner>);

struct CacheInner {
    records: RwLock<VecDeque<Arc<BinaryRecord>>>,
    /// Milliseconds; 0 = unlimited.
    max_age_ms: AtomicI64,
    /// 0 = unlimited.
    max_count: AtomicUsize,
    inserts: RecordQueue<Arc<BinaryRecord>>,
    wait_time: Duration,
}

impl MessageCache {
    /// Create a cache. A zero `max_age` or `max_count` disables that limit.
    pub fn new(max_age: Duration, max_count: usize, wait_time: Duration) -> Self {
        Self(Arc::new(CacheInner {
            records: RwLock::new(VecDeque::new()),
            max_age_ms: AtomicI64::new(max_age.as_millis() as i64),
            max_count: AtomicUsize::new(max_count),
            inserts: RecordQueue::new(max_count),
            wait_time,
        }))
    }

    /// Spawn the single writer task that applies queued inserts.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = self.0.clone();
        tokio::spawn(async move {
            debug!("cache writer started");
            while inner.inserts.keep_running() {
                match inner.inserts.pop() {
                    Some(record) => {
                        // One bad record must not take the writer down.
                        let applied = std::panic::catch_unwind(AssertUnwindSafe(|| {
                            inner.evict_at(now_ms());
                            inner.store(record);
                        }));
                        if applied.is_err() {
                            error!("cache insert panicked; record dropped");
                        }
                    }
                    None => {
                        inner.evict_at(now_ms());
                        inner.inserts.wait_for_item(Some(inner.wait_time)).await;
                    }
                }
            }
            debug!("cache writer stopped");
        })
    }

    /// Let the writer apply what is already queued, then exit.
    pub fn stop(&self) {
        self.0.inserts.finish();
    }

    /// Queue a record for the writer task.
    pub fn insert(&self, record: Arc<BinaryRecord>) {
        if !self.0.inserts.push(record) {
            warn!("cache insert queue full, oldest pending insert dropped");
        }
    }

    /// Run an eviction pass against the current clock.
    pub fn evict(&self) {
        self.0.evict_at(now_ms());
    }

    /// Run an eviction pass as if the clock read `now` (epoch ms).
    pub fn evict_at(&self, now: i64) {
        self.0.evict_at(now);
    }

    /// Change the age limit (zero = unlimited) and evict immediately.
    pub fn set_max_age(&self, max_age: Duration) {
        self.0
            .max_age_ms
            .store(max_age.as_millis() as i64, Ordering::Relaxed);
        self.evict();
    }

    /// Change the count limit (zero = unlimited) and evict immediately.
    pub fn set_max_count(&self, max_count: usize) {
        self.0.max_count.store(max_count, Ordering::Relaxed);
        self.0.inserts.set_max_len(max_count);
        self.evict();
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.0.max_age_ms.load(Ordering::Relaxed).max(0) as u64)
    }

    pub fn max_count(&self) -> usize {
        self.0.max_count.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records at or after message number `from` whose start time lies in
    /// `begin..=end`, in ascending time order.
    ///
    /// `from = None`, or a number no longer cached, starts at the oldest
    /// record. Either time bound may be omitted.
    pub fn query(
        &self,
        from: Option<MessageNumber>,
        begin: Option<i64>,
        end: Option<i64>,
    ) -> Vec<Arc<BinaryRecord>> {
        let records = self.0.read();
        let (Some(oldest), Some(newest)) = (records.front(), records.back()) else {
            return Vec::new();
        };

        // Message numbers wrap, so this cannot be a binary search.
        let start = from
            .and_then(|n| records.iter().position(|r| r.message_number == n))
            .unwrap_or(0);

        if end.is_some_and(|end| end < oldest.start_time)
            || begin.is_some_and(|begin| begin > newest.start_time)
        {
            return Vec::new();
        }

        // First record with start >= begin (earliest of equal times).
        let lower = begin.map_or(0, |begin| records.partition_point(|r| r.start_time < begin));
        // One past the last record with start <= end (latest of equal times).
        let upper = end.map_or(records.len(), |end| {
            records.partition_point(|r| r.start_time <= end)
        });
        let from_idx = start.max(lower);

        if upper > records.len() {
            warn!(upper, len = records.len(), "cache query index out of range");
            return Vec::new();
        }
        if from_idx >= upper {
            return Vec::new();
        }

        trace!(from_idx, upper, "cache query");
        records.range(from_idx..upper).cloned().collect()
    }

    /// Apply an insert directly, bypassing the writer queue.
    #[cfg(test)]
    pub(crate) fn store(&self, record: BinaryRecord) {
        self.0.evict_at(now_ms());
        self.0.store(Arc::new(record));
    }
}

impl CacheInner {
    /// The record list. A panic under the write lock leaves the list intact,
    /// so a poisoned lock is used as is.
    fn read(&self) -> RwLockReadGuard<'_, VecDeque<Arc<BinaryRecord>>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, VecDeque<Arc<BinaryRecord>>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, record: Arc<BinaryRecord>) {
        let mut records = self.write();
        let in_order = records
            .back()
            .is_none_or(|last| last.start_time <= record.start_time);
        if in_order {
            records.push_back(record);
        } else {
            // Keep the list sorted so binary search stays valid.
            let idx = records.partition_point(|r| r.start_time <= record.start_time);
            debug!(
                channel = %record.scnl,
                start_time = record.start_time,
                idx,
                "out-of-order record placed by start time"
            );
            records.insert(idx, record);
        }
    }

    fn evict_at(&self, now: i64) {
        let max_age = self.max_age_ms.load(Ordering::Relaxed);
        let max_count = self.max_count.load(Ordering::Relaxed);
        if max_age <= 0 && max_count == 0 {
            return;
        }

        let mut records = self.write();
        let before = records.len();
        if max_age > 0 {
            while records
                .front()
                .is_some_and(|oldest| now - oldest.created_at > max_age)
            {
                records.pop_front();
            }
        }
        if max_count > 0 {
            while records.len() >= max_count {
                records.pop_front();
            }
        }
        let removed = before - records.len();
        if removed > 0 {
            trace!(removed, remaining = records.len(), "cache eviction");
        }
    }
}
