use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::shutdown::Shutdown;

/// Bounded FIFO that never blocks its producer: when full, the oldest entry
/// is evicted to admit the new one.
pub struct DropOldestBuffer<T> {
    name: &'static str,
    tx: Sender<T>,
    rx: Receiver<T>,
    evicted: AtomicU64,
}

impl<T> DropOldestBuffer<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            name,
            tx,
            rx,
            evicted: AtomicU64::new(0),
        }
    }

    /// Adds `item`, evicting from the front until it fits. Returns the last
    /// evicted entry, if any.
    pub fn push(&self, item: T) -> Option<T> {
        let mut item = item;
        let mut evicted = None;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if let Ok(old) = self.rx.try_recv() {
                        let total = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::trace!(buffer = self.name, evicted = total, "evicted oldest entry");
                        evicted = Some(old);
                    }
                }
                // both ends live in `self`
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// Waits up to `timeout` for the oldest entry. Returns `None` on timeout
    /// or as soon as `shutdown` is triggered.
    pub fn pop(&self, timeout: Duration, shutdown: &Shutdown) -> Option<T> {
        crossbeam_channel::select! {
            recv(self.rx) -> item => item.ok(),
            recv(shutdown.signal()) -> _ => None,
            default(timeout) => None,
        }
    }

    /// Drains the buffer and returns only the newest entry.
    pub fn latest(&self) -> Option<T> {
        self.rx.try_iter().last()
    }
}

#[cfg(test)]
impl<T> DropOldestBuffer<T> {
    fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    fn len(&self) -> usize {
        self.rx.len()
    }

    fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }

    fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_evicts_oldest_when_full() {
        let buf = DropOldestBuffer::new("test", 3);
        for i in 0..3 {
            assert_eq!(buf.push(i), None);
        }
        assert_eq!(buf.push(3), Some(0));
        assert_eq!(buf.push(4), Some(1));
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.evicted(), 2);

        let drained: Vec<_> = std::iter::from_fn(|| buf.try_pop()).collect();
        assert_eq!(drained, vec![2, 3, 4]);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let buf = DropOldestBuffer::new("test", 5);
        for i in 0..100 {
            buf.push(i);
            assert!(buf.len() <= buf.capacity());
        }
        assert_eq!(buf.latest(), Some(99));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pop_times_out() {
        let buf: DropOldestBuffer<u32> = DropOldestBuffer::new("test", 2);
        let shutdown = Shutdown::new();
        let start = Instant::now();
        assert_eq!(buf.pop(Duration::from_millis(30), &shutdown), None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_pop_returns_in_arrival_order() {
        let buf = DropOldestBuffer::new("test", 4);
        let shutdown = Shutdown::new();
        buf.push("a");
        buf.push("b");
        assert_eq!(buf.pop(Duration::from_millis(10), &shutdown), Some("a"));
        assert_eq!(buf.pop(Duration::from_millis(10), &shutdown), Some("b"));
    }

    #[test]
    fn test_shutdown_interrupts_pop() {
        let buf: Arc<DropOldestBuffer<u32>> = Arc::new(DropOldestBuffer::new("test", 2));
        let shutdown = Shutdown::new();

        let (b, s) = (Arc::clone(&buf), shutdown.clone());
        let start = Instant::now();
        let handle = thread::spawn(move || b.pop(Duration::from_secs(30), &s));

        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        assert_eq!(handle.join().unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_producer_never_blocks_without_consumer() {
        let buf = DropOldestBuffer::new("test", 1);
        let start = Instant::now();
        for i in 0..10_000 {
            buf.push(i);
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(buf.try_pop(), Some(9_999));
    }
}
