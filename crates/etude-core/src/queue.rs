// src/queue.rs
//! A FIFO over one contiguous backing store that grows and shrinks in batches.
//!
//! The store is addressed by four cursors, all counted in elements:
//!
//! ```text
//! start(0)      front           rear            end(buf.len())
//!   |  slack     |   occupied    |    slack       |
//! ```
//!
//! `enqueue` reclaims front slack by compacting before it ever reallocates,
//! and `dequeue` hands memory back once the combined slack reaches the shrink
//! threshold. The queue has no locking of its own; share it behind a mutex.

use std::mem;

#[derive(Debug, Clone)]
pub struct GrowableQueue<T> {
    buf: Vec<T>,
    front: usize,
    rear: usize,
    grow_step: usize,
    shrink_threshold: usize,
}

impl<T: Copy + Default> GrowableQueue<T> {
    /// Allocate an empty queue with room for `initial_capacity` elements.
    ///
    /// A `grow_step` of zero is raised to one so a full queue can always grow.
    pub fn new(initial_capacity: usize, grow_step: usize, shrink_threshold: usize) -> Self {
        Self {
            buf: vec![T::default(); initial_capacity],
            front: 0,
            rear: 0,
            grow_step: grow_step.max(1),
            shrink_threshold,
        }
    }

    /// Allocate `data.len() + grow_step` elements and seed them with `data`.
    pub fn from_slice(data: &[T], grow_step: usize, shrink_threshold: usize) -> Self {
        let grow_step = grow_step.max(1);
        let mut buf = Vec::with_capacity(data.len() + grow_step);
        buf.extend_from_slice(data);
        buf.resize(data.len() + grow_step, T::default());

        Self {
            buf,
            front: 0,
            rear: data.len(),
            grow_step,
            shrink_threshold,
        }
    }

    /// Append one element at the rear.
    pub fn enqueue(&mut self, item: T) {
        if self.rear == self.buf.len() {
            if self.front == 0 {
                let end = self.buf.len() + self.grow_step;
                self.buf.resize(end, T::default());
            } else {
                self.compact();
            }
        }

        self.buf[self.rear] = item;
        self.rear += 1;
    }

    /// Remove and return the front element, or `None` when empty.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.front == self.rear {
            return None;
        }

        let item = self.buf[self.front];
        self.front += 1;

        if self.slack() >= self.shrink_threshold {
            self.compact();
            let end = self.rear + self.grow_step;
            self.buf.resize(end, T::default());
            self.buf.shrink_to_fit();
        }

        Some(item)
    }

    /// Move the occupied region down to the start of the store.
    fn compact(&mut self) {
        if self.front == 0 {
            return;
        }
        self.buf.copy_within(self.front..self.rear, 0);
        self.rear -= self.front;
        self.front = 0;
    }
}

impl<T> GrowableQueue<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.rear - self.front
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.front == self.rear
    }

    /// Number of elements the backing store holds without reallocating.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes per element.
    #[inline]
    pub fn item_size(&self) -> usize {
        mem::size_of::<T>()
    }

    /// Unoccupied elements on both sides of the occupied region.
    #[inline]
    pub fn slack(&self) -> usize {
        self.front + (self.buf.len() - self.rear)
    }

    pub fn peek_front(&self) -> Option<&T> {
        self.as_slice().first()
    }

    pub fn peek_back(&self) -> Option<&T> {
        self.as_slice().last()
    }

    /// Element at `index` counted from the front.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Occupied elements in FIFO order.
    pub fn as_slice(&self) -> &[T] {
        &self.buf[self.front..self.rear]
    }
}

impl<T: PartialEq> GrowableQueue<T> {
    /// Linear scan for the first element equal to `item`; the position is
    /// counted from the front.
    pub fn find_first(&self, item: &T) -> Option<usize> {
        self.as_slice().iter().position(|candidate| candidate == item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_cursors<T>(q: &GrowableQueue<T>) {
        assert!(q.front <= q.rear, "front {} past rear {}", q.front, q.rear);
        assert!(q.rear <= q.buf.len(), "rear {} past end {}", q.rear, q.buf.len());
    }

    /// Small deterministic generator so the interleavings are reproducible.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn test_fifo_order_across_resizes() {
        let mut rng = Lcg(7);
        let mut q: GrowableQueue<u32> = GrowableQueue::new(2, 3, 5);
        let mut next_in = 0u32;
        let mut next_out = 0u32;

        for _ in 0..5_000 {
            if rng.next() % 3 != 0 {
                q.enqueue(next_in);
                next_in += 1;
            } else if let Some(v) = q.dequeue() {
                assert_eq!(v, next_out);
                next_out += 1;
            } else {
                assert_eq!(next_in, next_out);
            }
            assert_cursors(&q);
            assert_eq!(q.len(), (next_in - next_out) as usize);
        }

        while let Some(v) = q.dequeue() {
            assert_eq!(v, next_out);
            next_out += 1;
        }
        assert_eq!(next_in, next_out);
    }

    #[test]
    fn test_fill_then_drain_returns_to_empty() {
        for n in [0usize, 1, 2, 7, 64, 300] {
            for step in [1usize, 2, 16, 256] {
                for threshold in [0usize, 1, 4, 256] {
                    let mut q: GrowableQueue<i32> = GrowableQueue::new(4, step, threshold);
                    for i in 0..n {
                        q.enqueue(i as i32);
                    }
                    for i in 0..n {
                        assert_eq!(q.dequeue(), Some(i as i32));
                        assert_cursors(&q);
                    }
                    assert!(q.is_empty());
                    assert_eq!(q.front, q.rear);
                    assert_eq!(q.dequeue(), None);
                }
            }
        }
    }

    #[test]
    fn test_full_queue_without_front_slack_grows_by_step() {
        let mut q: GrowableQueue<u8> = GrowableQueue::new(2, 3, 100);
        q.enqueue(1);
        q.enqueue(2);
        assert_eq!(q.capacity(), 2);

        q.enqueue(3);
        assert_eq!(q.capacity(), 5);
        assert_eq!(q.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_full_queue_with_front_slack_compacts_in_place() {
        let mut q: GrowableQueue<u8> = GrowableQueue::new(4, 2, 100);
        for v in 1..=4 {
            q.enqueue(v);
        }
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));

        q.enqueue(5);
        assert_eq!(q.capacity(), 4, "compaction must not reallocate");
        assert_eq!(q.front, 0);
        assert_eq!(q.rear, 3);
        assert_eq!(q.as_slice(), &[3, 4, 5]);
    }

    #[test]
    fn test_dequeue_shrinks_once_slack_reaches_threshold() {
        let mut q: GrowableQueue<u64> = GrowableQueue::new(16, 2, 4);
        q.enqueue(10);
        q.enqueue(11);
        q.enqueue(12);

        assert_eq!(q.dequeue(), Some(10));
        // two occupied plus one grow step of slack
        assert_eq!(q.capacity(), 4);
        assert_eq!(q.front, 0);
        assert_eq!(q.as_slice(), &[11, 12]);
    }

    #[test]
    fn test_dequeue_on_empty_never_shrinks() {
        let mut q: GrowableQueue<u16> = GrowableQueue::new(32, 1, 0);
        assert_eq!(q.dequeue(), None);
        assert_eq!(q.capacity(), 32);
    }

    #[test]
    fn test_from_slice_seeds_contents() {
        let q = GrowableQueue::from_slice(&[4i32, 5, 6], 8, 16);
        assert_eq!(q.len(), 3);
        assert_eq!(q.capacity(), 11);
        assert_eq!(q.peek_front(), Some(&4));
        assert_eq!(q.peek_back(), Some(&6));
        assert_eq!(q.item_size(), std::mem::size_of::<i32>());
    }

    #[test]
    fn test_queries_on_empty_queue() {
        let q: GrowableQueue<i32> = GrowableQueue::new(0, 1, 1);
        assert_eq!(q.peek_front(), None);
        assert_eq!(q.peek_back(), None);
        assert_eq!(q.get(0), None);
        assert_eq!(q.find_first(&0), None);
    }

    #[test]
    fn test_find_first_reports_position_from_front() {
        let mut q: GrowableQueue<i32> = GrowableQueue::new(2, 2, 64);
        for v in [9, 8, 7, 6] {
            q.enqueue(v);
        }
        q.dequeue();

        assert_eq!(q.find_first(&8), Some(0));
        assert_eq!(q.find_first(&6), Some(2));
        assert_eq!(q.find_first(&9), None);
        assert_eq!(q.get(1), Some(&7));
    }
}
