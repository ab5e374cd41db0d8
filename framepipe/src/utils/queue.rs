use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A bounded, closable FIFO shared between producer and consumer threads.
///
/// `put` blocks while the queue is full unless the caller asks to drop on
/// overflow. `get` blocks until an element is available or the queue has been
/// closed; elements already queued at `close` time remain retrievable.
///
/// # Example
///
/// ```rust
/// use framepipe::utils::queue::BlockingQueue;
///
/// let queue = BlockingQueue::new(2);
/// assert!(queue.put(1, true));
/// assert!(queue.put(2, true));
/// assert!(!queue.put(3, true)); // full, dropped
///
/// queue.close();
/// assert_eq!(queue.get(), Some(1));
/// assert_eq!(queue.get(), Some(2));
/// assert_eq!(queue.get(), None);
/// ```
#[derive(Debug)]
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    size_limit: usize,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    max_size: usize,
}

impl<T> BlockingQueue<T> {
    /// Creates a queue holding at most `size_limit` elements.
    ///
    /// # Panics
    ///
    /// Panics if `size_limit` is zero.
    pub fn new(size_limit: usize) -> Self {
        assert!(size_limit > 0, "size_limit must be > 0");
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(size_limit),
                closed: false,
                max_size: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            size_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `item`, blocking while the queue is full.
    ///
    /// With `drop_on_overflow` set a full queue rejects the item immediately
    /// and `false` is returned. A closed queue rejects every item.
    pub fn put(&self, item: T, drop_on_overflow: bool) -> bool {
        let mut state = self.lock();

        if state.closed || (drop_on_overflow && state.items.len() >= self.size_limit) {
            return false;
        }

        // close() wakes blocked producers; they must not insert afterwards
        state = self
            .not_full
            .wait_while(state, |s| !s.closed && s.items.len() >= self.size_limit)
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return false;
        }

        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_all();
        true
    }

    /// Removes the oldest element, blocking until one is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn get(&self) -> Option<T> {
        self.get_where(|_| true)
    }

    /// Removes the oldest element accepted by `filter`.
    ///
    /// Elements are scanned from oldest to newest so FIFO order is kept among
    /// matches. Blocks until a match exists; returns `None` when the queue is
    /// closed and holds no match, since none can arrive later.
    pub fn get_where<F>(&self, mut filter: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut state = self.lock();
        let index = loop {
            if let Some(index) = state.items.iter().position(&mut filter) {
                break index;
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        };

        if state.items.len() > state.max_size {
            state.max_size = state.items.len();
        }

        let item = state.items.remove(index);
        let has_room = state.items.len() < self.size_limit;
        drop(state);
        if has_room {
            self.not_full.notify_all();
        }
        item
    }

    /// Removes the oldest element without blocking.
    pub fn try_get(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.items.pop_front();
        drop(state);
        if item.is_some() {
            self.not_full.notify_all();
        }
        item
    }

    /// Closes the queue and wakes every blocked producer and consumer.
    ///
    /// Queued elements are kept; consumers drain them before seeing `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn size(&self) -> usize {
        self.lock().items.len()
    }

    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Largest queue length observed by a consumer.
    pub fn max_size(&self) -> usize {
        self.lock().max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn fifo_order() {
        let queue = BlockingQueue::new(16);
        for i in 0..10 {
            assert!(queue.put(i, false));
        }
        let got: Vec<_> = (0..10).map(|_| queue.get().unwrap()).collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn drop_on_overflow_keeps_size() {
        let queue = BlockingQueue::new(2);
        assert!(queue.put('a', true));
        assert!(queue.put('b', true));
        assert!(!queue.put('c', true));
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn bound_after_blocking_puts() {
        let queue = BlockingQueue::new(3);
        for i in 0..3 {
            assert!(queue.put(i, false));
        }
        assert!(!queue.put(99, true));
        assert_eq!(queue.size(), 3);
        assert_eq!(queue.size_limit(), 3);
    }

    #[test]
    fn close_keeps_contents_for_drain() {
        let queue = BlockingQueue::new(4);
        queue.put(1, false);
        queue.put(2, false);
        queue.close();

        assert_eq!(queue.get(), Some(1));
        assert_eq!(queue.get(), Some(2));
        assert_eq!(queue.get(), None);
        assert_eq!(queue.get(), None);
    }

    #[test]
    fn closed_queue_rejects_put() {
        let queue = BlockingQueue::new(4);
        queue.close();
        assert!(!queue.put(1, false));
        assert!(queue.is_closed());
    }

    #[test]
    fn filtered_get_is_fifo_among_matches() {
        let queue = BlockingQueue::new(8);
        for i in [1, 2, 3, 4, 5, 6] {
            queue.put(i, false);
        }
        assert_eq!(queue.get_where(|v| v % 2 == 0), Some(2));
        assert_eq!(queue.get_where(|v| v % 2 == 0), Some(4));
        assert_eq!(queue.get(), Some(1));
        assert_eq!(queue.size(), 3);
    }

    #[test]
    fn filtered_get_on_closed_queue_without_match_returns_promptly() {
        let queue = BlockingQueue::new(4);
        queue.put(1, false);
        queue.close();

        let start = Instant::now();
        assert_eq!(queue.get_where(|v| *v > 10), None);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn get_blocks_until_put() {
        let queue = Arc::new(BlockingQueue::new(1));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.get())
        };

        thread::sleep(Duration::from_millis(30));
        assert!(queue.put(7, false));
        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn filtered_get_wakes_on_matching_put() {
        let queue = Arc::new(BlockingQueue::new(4));
        queue.put(1, false);
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.get_where(|v| *v == 3))
        };

        thread::sleep(Duration::from_millis(20));
        queue.put(2, false);
        queue.put(3, false);
        assert_eq!(consumer.join().unwrap(), Some(3));
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn put_blocks_until_get() {
        let queue = Arc::new(BlockingQueue::new(1));
        queue.put(0, false);

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let ok = queue.put(1, false);
                (ok, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.get(), Some(0));
        let (ok, waited) = producer.join().unwrap();
        assert!(ok);
        assert!(waited >= Duration::from_millis(40));
        assert_eq!(queue.get(), Some(1));
    }

    #[test]
    fn close_wakes_blocked_consumer_and_producer() {
        let queue = Arc::new(BlockingQueue::<u32>::new(1));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.get())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);

        let full = Arc::new(BlockingQueue::new(1));
        full.put(1u32, false);
        let producer = {
            let full = full.clone();
            thread::spawn(move || full.put(2, false))
        };
        thread::sleep(Duration::from_millis(20));
        full.close();
        assert!(!producer.join().unwrap());
        assert_eq!(full.get(), Some(1));
        assert_eq!(full.get(), None);
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        let queue = Arc::new(BlockingQueue::new(4));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        assert!(queue.put(p * 1000 + i, false));
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(v) = queue.get() {
                        seen.push(v);
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        queue.close();

        let mut all: Vec<_> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all.len(), 1000);
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert!(queue.max_size() <= 4);
    }
}
