//! FIFO stores connecting pipeline modules.
//!
//! A store is the conduit between exactly one producer module and one
//! consumer module. Writes block while a bounded store is full (producer
//! backpressure); reads never block. Modules that prefer to wait instead of
//! spinning use [`Store::recv_timeout`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::element::Element;

/// Ordered, thread-safe conduit of elements.
///
/// `is_empty` and `size` are advisory observers for backpressure and
/// progress metrics; they are not transactionally consistent with
/// concurrent writers.
pub trait Store<E>: Send + Sync {
    /// Append an element at the tail. Blocks the caller while a bounded
    /// store is at capacity.
    fn put(&self, el: Element<E>);

    /// Remove and return the head element, or `None` immediately when the
    /// store is empty. Never blocks, never errors.
    fn get(&self) -> Option<Element<E>>;

    /// Like [`Store::put`], but gives up after `timeout` and hands the
    /// element back instead of blocking indefinitely. Run loops write
    /// through this so a producer stalled on backpressure still observes
    /// cancellation. The default suits stores whose `put` never blocks;
    /// bounded stores override it.
    fn put_timeout(&self, el: Element<E>, _timeout: Duration) -> Result<(), Element<E>> {
        self.put(el);
        Ok(())
    }

    /// Like [`Store::get`], but waits up to `timeout` for an element to
    /// arrive. The default implementation polls `get` against a deadline;
    /// channel-backed stores override it with a native bounded wait.
    fn recv_timeout(&self, timeout: Duration) -> Option<Element<E>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(el) = self.get() {
                return Some(el);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Whether the store currently holds no elements.
    fn is_empty(&self) -> bool;

    /// Number of elements currently held.
    fn size(&self) -> usize;
}

/// A shared, reference-counted store handle.
pub type StoreRef<E> = Arc<dyn Store<E>>;

/// Channel-backed FIFO store, the standard conduit allocated by the manager
/// when two modules are linked.
pub struct QueueStore<E> {
    tx: flume::Sender<Element<E>>,
    rx: flume::Receiver<Element<E>>,
}

impl<E: Send> QueueStore<E> {
    /// A store that accepts exactly `capacity` elements before `put` blocks.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }

    /// A store whose writes never block. Memory growth is bounded only by
    /// the producer, so this suits sink-side stores.
    pub fn unbounded() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Configured capacity, or `None` for an unbounded store.
    pub fn capacity(&self) -> Option<usize> {
        self.rx.capacity()
    }
}

impl<E: Send> Store<E> for QueueStore<E> {
    fn put(&self, el: Element<E>) {
        // Both halves live in this struct, so the channel can only
        // disconnect once the store itself is dropped.
        if self.tx.send(el).is_err() {
            debug!("put on a disconnected store dropped an element");
        }
    }

    fn put_timeout(&self, el: Element<E>, timeout: Duration) -> Result<(), Element<E>> {
        match self.tx.send_timeout(el, timeout) {
            Ok(()) => Ok(()),
            Err(flume::SendTimeoutError::Timeout(el)) => Err(el),
            Err(flume::SendTimeoutError::Disconnected(_)) => {
                debug!("put on a disconnected store dropped an element");
                Ok(())
            }
        }
    }

    fn get(&self) -> Option<Element<E>> {
        self.rx.try_recv().ok()
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<Element<E>> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn size(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn empty_get_returns_none_immediately() {
        let store = QueueStore::<i64>::bounded(4);
        let started = Instant::now();
        assert!(store.get().is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(store.is_empty());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn fifo_order_preserved() {
        let store = QueueStore::bounded(8);
        for i in 0..8 {
            store.put(Element::Data(i));
        }
        for i in 0..8 {
            assert_eq!(store.get(), Some(Element::Data(i)));
        }
        assert!(store.get().is_none());
    }

    #[test]
    fn bounded_put_blocks_until_get() {
        let store = Arc::new(QueueStore::bounded(2));
        store.put(Element::Data(1));
        store.put(Element::Data(2));
        assert_eq!(store.size(), 2);

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                // Blocks: the store is at capacity.
                store.put(Element::Data(3));
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        assert_eq!(store.get(), Some(Element::Data(1)));
        writer.join().unwrap();
        assert_eq!(store.get(), Some(Element::Data(2)));
        assert_eq!(store.get(), Some(Element::Data(3)));
    }

    #[test]
    fn put_timeout_hands_the_element_back_when_full() {
        let store = QueueStore::bounded(1);
        store.put(Element::Data(1));
        let returned = store
            .put_timeout(Element::Data(2), Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(returned, Element::Data(2));
        // Draining frees capacity for the retried put.
        assert_eq!(store.get(), Some(Element::Data(1)));
        assert!(store
            .put_timeout(returned, Duration::from_millis(10))
            .is_ok());
    }

    #[test]
    fn recv_timeout_times_out_when_idle() {
        let store = QueueStore::<u8>::unbounded();
        let started = Instant::now();
        assert!(store.recv_timeout(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn recv_timeout_returns_early_on_data() {
        let store = Arc::new(QueueStore::<u8>::unbounded());
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                store.put(Element::Last(9));
            })
        };
        let el = store.recv_timeout(Duration::from_secs(1));
        assert_eq!(el, Some(Element::Last(9)));
        writer.join().unwrap();
    }

    proptest! {
        #[test]
        fn n_puts_then_n_gets_return_in_put_order(xs in proptest::collection::vec(any::<i64>(), 0..64)) {
            let store = QueueStore::unbounded();
            for &x in &xs {
                store.put(Element::Data(x));
            }
            prop_assert_eq!(store.size(), xs.len());
            for &x in &xs {
                prop_assert_eq!(store.get(), Some(Element::Data(x)));
            }
            prop_assert!(store.get().is_none());
        }
    }
}
