//! Bounded FIFO with drop-oldest overflow and async wait-for-items.
//!
//! Used for the cache's serialized insert pipeline and for every session's
//! outbound delivery pipeline.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

struct QueueState<T> {
    items: VecDeque<T>,
    /// 0 = unlimited.
    max_len: usize,
    running: bool,
    finish_work: bool,
}

pub(crate) struct RecordQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> RecordQueue<T> {
    pub fn new(max_len: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                max_len,
                running: true,
                finish_work: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an item and wake the consumer.
    ///
    /// Returns `false` if the queue was full and its oldest item was dropped.
    pub fn push(&self, item: T) -> bool {
        let room = {
            let mut state = self.state.lock().unwrap();
            let full = state.max_len > 0 && state.items.len() >= state.max_len;
            if full {
                state.items.pop_front();
            }
            state.items.push_back(item);
            !full
        };
        self.notify.notify_one();
        room
    }

    /// Put an item back at the head without waking anyone.
    ///
    /// Returns `false` (and drops the item) if the queue is at capacity.
    pub fn push_front(&self, item: T) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.max_len == 0 || state.items.len() < state.max_len {
            state.items.push_front(item);
            true
        } else {
            false
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.state.lock().unwrap().items.pop_front()
    }

    /// Wait until the queue holds an item, the queue is stopped, `notify()`
    /// is called, or `timeout` elapses (`None` waits without limit).
    ///
    /// Returns the number of queued items.
    pub async fn wait_for_item(&self, timeout: Option<Duration>) -> usize {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking so a push between the check and the
        // await still wakes us.
        notified.as_mut().enable();

        {
            let state = self.state.lock().unwrap();
            if !state.items.is_empty() || !state.running {
                return state.items.len();
            }
        }

        match timeout {
            Some(limit) => {
                let _ = tokio::time::timeout(limit, notified).await;
            }
            None => notified.await,
        }
        self.len()
    }

    /// Wait for the next `push`, `notify` or `stop`, whatever is queued.
    pub async fn wait_for_push(&self) {
        self.notify.notified().await;
    }

    /// Wake a pending `wait_for_item` without adding anything.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().items.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change the capacity, dropping the oldest items beyond it.
    pub fn set_max_len(&self, max_len: usize) {
        let mut state = self.state.lock().unwrap();
        state.max_len = max_len;
        if max_len > 0 {
            while state.items.len() > max_len {
                state.items.pop_front();
            }
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Whether the consumer loop should keep going: running, and not asked
    /// to finish with nothing left to drain.
    pub fn keep_running(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.running && !(state.finish_work && state.items.is_empty())
    }

    /// Stop immediately; queued items are abandoned.
    pub fn stop(&self) {
        self.state.lock().unwrap().running = false;
        self.notify.notify_one();
    }

    /// Ask the consumer to drain what is queued, then stop.
    pub fn finish(&self) {
        self.state.lock().unwrap().finish_work = true;
        self.notify.notify_one();
    }
}
