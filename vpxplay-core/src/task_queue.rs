//! # Task Queue - Producer/Consumer Handoff
//!
//! FIFO between the playback loop (producer) and the decode worker
//! (consumer). Push never blocks; pop blocks until an item arrives or the
//! queue is shut down.
//!
//! ```text
//! ┌───────────┐  push   ┌───────────┐  pop   ┌──────────────┐
//! │ Playback  │────────►│ TaskQueue │───────►│ Decode       │
//! │ Pipeline  │         │           │        │ Worker       │
//! └───────────┘         └───────────┘        └──────────────┘
//! ```

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct QueueInner<T> {
    items: VecDeque<T>,
    shutdown: bool,
    high_water: usize,
}

/// Thread-safe FIFO with blocking pop and cooperative shutdown.
pub struct TaskQueue<T> {
    inner: Mutex<QueueInner<T>>,
    available: Condvar,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                shutdown: false,
                high_water: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue an item and wake one waiting consumer.
    ///
    /// Returns false (dropping the item) once the queue is shut down.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return false;
        }
        inner.items.push_back(item);
        inner.high_water = inner.high_water.max(inner.items.len());
        drop(inner);
        self.available.notify_one();
        true
    }

    /// Block until an item is available.
    ///
    /// Items queued before shutdown are still handed out; `None` means the
    /// queue is shut down and empty.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.shutdown {
                return None;
            }
            // Re-checked after every wake, spurious or not.
            self.available.wait(&mut inner);
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Stop accepting work and wake every consumer.
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.available.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deepest the queue has ever been.
    pub fn high_water_mark(&self) -> usize {
        self.inner.lock().high_water
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new();
        for i in 0..4 {
            assert!(queue.push(i));
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.high_water_mark(), 4);
        let drained: Vec<i32> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push("work");
        assert_eq!(consumer.join().unwrap(), Some("work"));
    }

    #[test]
    fn test_shutdown_wakes_blocked_consumer() {
        let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_shutdown_drains_then_ends() {
        let queue = TaskQueue::new();
        queue.push(1);
        queue.shutdown();
        assert!(!queue.push(2));
        assert!(queue.is_shutdown());
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }
}
