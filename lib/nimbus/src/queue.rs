use crate::shared::{StreamError, StreamResult};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

/// Bounded FIFO shared between producer and consumer threads. Producers get
/// a bound-exceeded signal instead of blocking; the consumer can block, poll,
/// or conditionally pop for batching.
pub struct BlockingQueue<T> {
    bound: usize,
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> BlockingQueue<T> {
    #[inline]
    pub fn new(bound: usize) -> BlockingQueue<T> {
        BlockingQueue {
            bound,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(bound),
                shutdown: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Appends `item` unless the queue is full or shut down. Never blocks.
    pub fn offer(&self, item: T) -> StreamResult<()> {
        let mut inner = self.lock();

        if inner.shutdown {
            return Err(StreamError::Shutdown);
        }

        if inner.items.len() >= self.bound {
            return Err(StreamError::BoundExceeded);
        }

        inner.items.push_back(item);
        self.available.notify_one();

        Ok(())
    }

    /// Blocks until an element is available or the queue is shut down.
    pub fn wait(&self) -> StreamResult<T> {
        let mut inner = self.lock();

        loop {
            if let Some(item) = inner.items.pop_front() {
                return Ok(item);
            }

            if inner.shutdown {
                return Err(StreamError::Shutdown);
            }

            inner = self
                .available
                .wait(inner)
                .expect("Queue mutex poisoned");
        }
    }

    /// Removes and returns the head, if any.
    #[inline]
    pub fn poll(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Removes the head only when `accept` approves it. The check and the
    /// removal happen under one lock, which is what the batching loops need
    /// to peek without racing the producers.
    pub fn poll_if<F>(&self, accept: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut inner = self.lock();

        match inner.items.front() {
            Some(head) if accept(head) => inner.items.pop_front(),
            _ => None,
        }
    }

    /// Rejects all further offers and wakes blocked consumers.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.shutdown = true;
        self.available.notify_all();
    }

    /// Removes and returns everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        self.lock().items.drain(..).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[inline]
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("Queue mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_offer_and_poll_preserve_order() {
        let queue = BlockingQueue::new(4);

        queue.offer(1).unwrap();
        queue.offer(2).unwrap();
        queue.offer(3).unwrap();

        assert_eq!(queue.poll(), Some(1));
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.poll(), Some(3));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_offer_signals_bound() {
        let queue = BlockingQueue::new(2);

        queue.offer(1).unwrap();
        queue.offer(2).unwrap();

        assert_eq!(queue.offer(3), Err(StreamError::BoundExceeded));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_wait_blocks_until_offer() {
        let queue = Arc::new(BlockingQueue::new(4));

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait())
        };

        queue.offer(42).unwrap();

        assert_eq!(consumer.join().unwrap(), Ok(42));
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let queue: Arc<BlockingQueue<i32>> = Arc::new(BlockingQueue::new(4));

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait())
        };

        queue.shutdown();

        assert_eq!(consumer.join().unwrap(), Err(StreamError::Shutdown));
    }

    #[test]
    fn test_shutdown_drains_pending_elements_first() {
        let queue = BlockingQueue::new(4);

        queue.offer(1).unwrap();
        queue.shutdown();

        assert_eq!(queue.offer(2), Err(StreamError::Shutdown));
        assert_eq!(queue.wait(), Ok(1));
        assert_eq!(queue.wait(), Err(StreamError::Shutdown));
    }

    #[test]
    fn test_poll_if_pops_only_accepted_head() {
        let queue = BlockingQueue::new(4);

        queue.offer(10).unwrap();
        queue.offer(11).unwrap();

        assert_eq!(queue.poll_if(|head| *head > 50), None);
        assert_eq!(queue.poll_if(|head| *head == 10), Some(10));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_empties_queue() {
        let queue = BlockingQueue::new(4);

        queue.offer(1).unwrap();
        queue.offer(2).unwrap();

        assert_eq!(queue.drain(), vec![1, 2]);
        assert_eq!(queue.len(), 0);
    }
}
