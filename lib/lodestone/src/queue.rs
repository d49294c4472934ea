//! The MPMC FIFO between the reactor and the worker pool: a Michael-Scott
//! queue with a sentinel node. Retired nodes go through epoch-based
//! reclamation, and a separate mutex + condvar pair acts purely as a parking
//! lot for idle consumers.

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use crossbeam_utils::CachePadded;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

struct Node<T> {
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Node<T> {
        Node {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        }
    }
}

pub struct WorkQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,

    // Parking lot for consumers that popped empty. Never held across a
    // push/pop CAS sequence.
    parking: Mutex<()>,
    available: Condvar,
}

unsafe impl<T: Send> Send for WorkQueue<T> {}
unsafe impl<T: Send> Sync for WorkQueue<T> {}

impl<T> WorkQueue<T> {
    pub fn new() -> WorkQueue<T> {
        let queue = WorkQueue {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
            parking: Mutex::new(()),
            available: Condvar::new(),
        };

        // Both ends start out pointing at the sentinel.
        let sentinel = Owned::new(Node::sentinel()).into_shared(unsafe { epoch::unprotected() });
        queue.head.store(sentinel, Ordering::Relaxed);
        queue.tail.store(sentinel, Ordering::Relaxed);

        queue
    }

    /// Append `value` at the tail. Never blocks: the two-CAS enqueue either
    /// links the new node behind a quiescent tail or helps a lagging tail
    /// forward and retries. One parked consumer is signalled afterwards.
    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        let new = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        })
        .into_shared(&guard);

        loop {
            let tail = self.tail.load(Ordering::Acquire, &guard);
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, &guard);

            // Bail out if the tail moved underneath us.
            if tail != self.tail.load(Ordering::Acquire, &guard) {
                continue;
            }

            if next.is_null() {
                if tail_ref
                    .next
                    .compare_exchange(
                        Shared::null(),
                        new,
                        Ordering::Release,
                        Ordering::Relaxed,
                        &guard,
                    )
                    .is_ok()
                {
                    // Linked in; swinging the tail is best-effort.
                    let _ = self.tail.compare_exchange(
                        tail,
                        new,
                        Ordering::Release,
                        Ordering::Relaxed,
                        &guard,
                    );
                    break;
                }
            } else {
                // Tail is lagging: help it forward and retry.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
            }
        }

        drop(guard);

        // Signal under the parking mutex so the wakeup cannot slip between a
        // consumer's empty re-pop and its wait.
        let _parking = self.parking.lock().expect("queue parking lock poisoned");
        self.available.notify_one();
    }

    /// Remove and return the oldest item, or `None` without blocking.
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();

        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let tail = self.tail.load(Ordering::Acquire, &guard);
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, &guard);

            if head != self.head.load(Ordering::Acquire, &guard) {
                continue;
            }

            if head == tail {
                if next.is_null() {
                    return None;
                }

                // Tail is lagging behind the sentinel: help it forward.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
            } else {
                let next_ref = unsafe { next.deref() };

                if self
                    .head
                    .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, &guard)
                    .is_ok()
                {
                    // The popped node becomes the new sentinel; the old one is
                    // retired through the epoch collector once no pinned
                    // thread can still reach it.
                    unsafe {
                        let value = next_ref.value.as_ptr().read();
                        guard.defer_destroy(head);
                        return Some(value);
                    }
                }
            }
        }
    }

    /// True when no item is reachable from the sentinel.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let head = self.head.load(Ordering::Acquire, &guard);

        unsafe { head.deref() }
            .next
            .load(Ordering::Acquire, &guard)
            .is_null()
    }

    /// Park the calling consumer until a push or a broadcast. The queue is
    /// re-popped after the parking mutex is taken, closing the lost-wakeup
    /// window, and once more after waking. `None` means the caller should
    /// re-examine `stop` and loop; spurious wakeups are expected.
    pub fn park(&self, stop: &AtomicBool) -> Option<T> {
        let parking = self.parking.lock().expect("queue parking lock poisoned");

        if let Some(item) = self.pop() {
            return Some(item);
        }

        if stop.load(Ordering::Relaxed) {
            return None;
        }

        let _parking = self
            .available
            .wait(parking)
            .expect("queue parking lock poisoned");

        self.pop()
    }

    /// Wake every parked consumer. Used on shutdown.
    pub fn notify_all(&self) {
        let _parking = self.parking.lock().expect("queue parking lock poisoned");
        self.available.notify_all();
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> WorkQueue<T> {
        WorkQueue::new()
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        // Drain remaining items so their destructors run, then free the
        // sentinel. The queue is quiescent here; `&mut self` proves it.
        while self.pop().is_some() {}

        unsafe {
            let guard = epoch::unprotected();
            let sentinel = self.head.load(Ordering::Relaxed, guard);
            drop(sentinel.into_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_single_thread() {
        let queue = WorkQueue::new();

        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);

        for i in 0..100 {
            queue.push(i);
        }

        assert!(!queue.is_empty());

        for i in 0..100 {
            assert_eq!(queue.pop(), Some(i));
        }

        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_releases_queued_items() {
        let queue = WorkQueue::new();
        let item = Arc::new(());

        for _ in 0..10 {
            queue.push(item.clone());
        }

        drop(queue);

        // Every queued clone was dropped along with its node.
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn test_mpmc_order_per_producer() {
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 2;
        const PER_PRODUCER: u64 = 1000;

        let queue = Arc::new(WorkQueue::new());
        let produced = PRODUCERS * PER_PRODUCER;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|id| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        queue.push((id, seq));
                    }
                })
            })
            .collect();

        let drained = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let drained = drained.clone();
                thread::spawn(move || {
                    let mut popped = Vec::new();
                    while drained.load(Ordering::Relaxed) < produced {
                        match queue.pop() {
                            Some(item) => {
                                drained.fetch_add(1, Ordering::Relaxed);
                                popped.push(item);
                            }
                            None => thread::yield_now(),
                        }
                    }
                    popped
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        let mut total = 0u64;
        for consumer in consumers {
            let popped = consumer.join().unwrap();
            total += popped.len() as u64;

            // Within one consumer, each producer's items appear in push order.
            let mut last_seen: HashMap<u64, u64> = HashMap::new();
            for (id, seq) in popped {
                if let Some(prev) = last_seen.insert(id, seq) {
                    assert!(prev < seq, "producer {} reordered: {} before {}", id, prev, seq);
                }
            }
        }

        assert_eq!(total, produced);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_wakes_parked_consumer() {
        let queue = Arc::new(WorkQueue::<u32>::new());
        let stop = Arc::new(AtomicBool::new(false));

        let consumer = {
            let queue = queue.clone();
            let stop = stop.clone();
            thread::spawn(move || loop {
                if let Some(item) = queue.park(&stop) {
                    break item;
                }
                assert!(!stop.load(Ordering::Relaxed));
            })
        };

        // Give the consumer time to park before pushing.
        thread::sleep(Duration::from_millis(50));
        queue.push(42);

        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn test_broadcast_releases_all_parked_consumers() {
        let queue = Arc::new(WorkQueue::<u32>::new());
        let stop = Arc::new(AtomicBool::new(false));

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        queue.park(&stop);
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        queue.notify_all();

        for consumer in consumers {
            consumer.join().unwrap();
        }
    }
}
