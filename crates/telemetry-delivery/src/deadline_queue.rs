// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mutex-guarded indexed min-heap of pending requests ordered by deadline.
//!
//! Every [`QueueEntry`] remembers its own slot in the backing array, so an entry that completes
//! before its deadline can be removed in O(log n) without a search. The slot is `-1` whenever the
//! entry is not in the heap, which makes removal idempotent: completion and expiry may both try to
//! remove the same entry and only the first one has any effect.
//!
//! The backing array is never exposed. All mutation goes through [`DeadlineQueue::push`],
//! [`DeadlineQueue::pop_if_due`] and [`DeadlineQueue::remove`], serialized by a single lock.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const NOT_QUEUED: isize = -1;

/// Storage never shrinks below this many slots.
const MIN_CAPACITY: usize = 16;

/// One pending request awaiting completion or expiry.
///
/// An entry belongs to at most one [`DeadlineQueue`] at a time.
#[derive(Debug)]
pub struct QueueEntry<T> {
    handle: T,
    deadline: Option<Instant>,
    // only written while the owning queue's lock is held
    index: AtomicIsize,
}

impl<T> QueueEntry<T> {
    #[must_use]
    pub fn new(handle: T, deadline: Option<Instant>) -> Arc<Self> {
        Arc::new(Self {
            handle,
            deadline,
            index: AtomicIsize::new(NOT_QUEUED),
        })
    }

    pub fn handle(&self) -> &T {
        &self.handle
    }

    /// Absolute deadline, `None` when the entry never expires.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the entry currently sits in a queue.
    pub fn is_queued(&self) -> bool {
        self.index.load(Ordering::Relaxed) != NOT_QUEUED
    }

    fn slot(&self) -> Option<usize> {
        usize::try_from(self.index.load(Ordering::Relaxed)).ok()
    }

    fn set_slot(&self, slot: usize) {
        #[allow(clippy::cast_possible_wrap)]
        self.index.store(slot as isize, Ordering::Relaxed);
    }

    fn clear_slot(&self) {
        self.index.store(NOT_QUEUED, Ordering::Relaxed);
    }

    /// Heap order: earlier deadlines first, entries without a deadline last.
    fn expires_before(&self, other: &Self) -> bool {
        match (self.deadline, other.deadline) {
            (Some(a), Some(b)) => a < b,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Result of [`DeadlineQueue::pop_if_due`].
#[derive(Debug)]
pub enum Poll<T> {
    /// The earliest entry has expired and was removed from the queue.
    Due(Arc<QueueEntry<T>>),
    /// Nothing has expired yet; the earliest deadline is this far away.
    Wait(Duration),
    /// The queue is empty or no queued entry carries a deadline.
    Idle,
}

#[derive(Debug)]
pub struct DeadlineQueue<T> {
    heap: Mutex<Vec<Arc<QueueEntry<T>>>>,
}

impl<T> Default for DeadlineQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeadlineQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(Vec::with_capacity(MIN_CAPACITY)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<QueueEntry<T>>>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `entry`. Pushing an entry that is already queued is a no-op.
    pub fn push(&self, entry: &Arc<QueueEntry<T>>) {
        let mut heap = self.lock();
        if entry.is_queued() {
            return;
        }
        if heap.len() == heap.capacity() {
            let grow_by = heap.capacity().max(MIN_CAPACITY);
            heap.reserve_exact(grow_by);
        }
        heap.push(Arc::clone(entry));
        let slot = heap.len() - 1;
        entry.set_slot(slot);
        sift_up(&mut heap, slot);
    }

    /// Removes and returns the earliest entry if its deadline is at or before `now`.
    pub fn pop_if_due(&self, now: Instant) -> Poll<T> {
        let mut heap = self.lock();
        let Some(deadline) = heap.first().and_then(|top| top.deadline) else {
            return Poll::Idle;
        };
        if deadline > now {
            return Poll::Wait(deadline - now);
        }
        Poll::Due(remove_at(&mut heap, 0))
    }

    /// Removes `entry` using its stored slot.
    ///
    /// Returns `false` without touching the heap when the entry is not queued, which is the
    /// expected outcome when completion races an expiry sweep that already popped it.
    pub fn remove(&self, entry: &QueueEntry<T>) -> bool {
        let mut heap = self.lock();
        let Some(slot) = entry.slot() else {
            return false;
        };
        let owned = heap
            .get(slot)
            .is_some_and(|queued| std::ptr::eq(Arc::as_ptr(queued), entry));
        if !owned {
            // entry belongs to another queue
            return false;
        }
        remove_at(&mut heap, slot);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Allocated slots in the backing storage.
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let heap = self.lock();
        for (slot, entry) in heap.iter().enumerate() {
            assert_eq!(entry.slot(), Some(slot), "stored slot out of sync");
            if slot > 0 {
                let parent = &heap[(slot - 1) / 2];
                assert!(
                    !entry.expires_before(parent),
                    "heap order violated at slot {slot}"
                );
            }
        }
    }
}

fn swap<T>(heap: &mut [Arc<QueueEntry<T>>], a: usize, b: usize) {
    heap.swap(a, b);
    heap[a].set_slot(a);
    heap[b].set_slot(b);
}

fn sift_up<T>(heap: &mut [Arc<QueueEntry<T>>], mut slot: usize) {
    while slot > 0 {
        let parent = (slot - 1) / 2;
        if !heap[slot].expires_before(&heap[parent]) {
            break;
        }
        swap(heap, slot, parent);
        slot = parent;
    }
}

/// Returns `true` if the entry at `slot` moved.
fn sift_down<T>(heap: &mut [Arc<QueueEntry<T>>], mut slot: usize) -> bool {
    let start = slot;
    loop {
        let left = 2 * slot + 1;
        if left >= heap.len() {
            break;
        }
        let right = left + 1;
        let mut child = left;
        if right < heap.len() && heap[right].expires_before(&heap[left]) {
            child = right;
        }
        if !heap[child].expires_before(&heap[slot]) {
            break;
        }
        swap(heap, slot, child);
        slot = child;
    }
    slot != start
}

fn remove_at<T>(heap: &mut Vec<Arc<QueueEntry<T>>>, slot: usize) -> Arc<QueueEntry<T>> {
    let last = heap.len() - 1;
    if slot != last {
        swap(heap, slot, last);
    }
    // slot is always in bounds, so the heap is non-empty here
    let removed = heap.swap_remove(last);
    removed.clear_slot();
    if slot < heap.len() && !sift_down(heap, slot) {
        sift_up(heap, slot);
    }
    let capacity = heap.capacity();
    if capacity > MIN_CAPACITY && heap.len() < capacity / 4 {
        heap.shrink_to((capacity / 2).max(MIN_CAPACITY));
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(base: Instant, millis: u64) -> Option<Instant> {
        Some(base + Duration::from_millis(millis))
    }

    #[test]
    fn pops_in_deadline_order() {
        let base = Instant::now();
        let queue = DeadlineQueue::new();
        for (id, millis) in [(1, 30), (2, 10), (3, 20)] {
            queue.push(&QueueEntry::new(id, at(base, millis)));
        }

        let later = base + Duration::from_secs(1);
        let mut order = Vec::new();
        while let Poll::Due(entry) = queue.pop_if_due(later) {
            assert!(!entry.is_queued());
            order.push(*entry.handle());
        }
        assert_eq!(order, vec![2, 3, 1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn reports_wait_until_next_deadline() {
        let base = Instant::now();
        let queue = DeadlineQueue::new();
        queue.push(&QueueEntry::new((), at(base, 100)));

        match queue.pop_if_due(base + Duration::from_millis(40)) {
            Poll::Wait(remaining) => assert_eq!(remaining, Duration::from_millis(60)),
            other => panic!("expected Wait, got {other:?}"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn entries_without_deadline_are_never_due() {
        let queue = DeadlineQueue::new();
        queue.push(&QueueEntry::new((), None));
        assert!(matches!(
            queue.pop_if_due(Instant::now() + Duration::from_secs(3600)),
            Poll::Idle
        ));
        assert!(matches!(
            DeadlineQueue::<()>::new().pop_if_due(Instant::now()),
            Poll::Idle
        ));
    }

    #[test]
    fn remove_is_idempotent() {
        let base = Instant::now();
        let queue = DeadlineQueue::new();
        let first = QueueEntry::new("first", at(base, 10));
        let second = QueueEntry::new("second", at(base, 20));
        queue.push(&first);
        queue.push(&second);

        assert!(queue.remove(&first));
        assert!(!queue.remove(&first));
        assert_eq!(queue.len(), 1);
        assert!(second.is_queued());
        queue.assert_consistent();
    }

    #[test]
    fn remove_after_expiry_pop_is_a_no_op() {
        let base = Instant::now();
        let queue = DeadlineQueue::new();
        let expired = QueueEntry::new(1, at(base, 0));
        let pending = QueueEntry::new(2, at(base, 10_000));
        queue.push(&expired);
        queue.push(&pending);

        let Poll::Due(popped) = queue.pop_if_due(base) else {
            panic!("expected a due entry");
        };
        assert!(Arc::ptr_eq(&popped, &expired));

        // completion path arriving after the sweep
        assert!(!queue.remove(&expired));
        assert_eq!(queue.len(), 1);
        assert!(pending.is_queued());
    }

    #[test]
    fn remove_rejects_entries_from_another_queue() {
        let base = Instant::now();
        let ours = DeadlineQueue::new();
        let theirs = DeadlineQueue::new();
        let mine = QueueEntry::new(1, at(base, 5));
        let foreign = QueueEntry::new(2, at(base, 5));
        ours.push(&mine);
        theirs.push(&foreign);

        assert!(!ours.remove(&foreign));
        assert_eq!(ours.len(), 1);
        assert!(mine.is_queued());
    }

    #[test]
    fn double_push_is_ignored() {
        let queue = DeadlineQueue::new();
        let entry = QueueEntry::new((), Some(Instant::now()));
        queue.push(&entry);
        queue.push(&entry);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn storage_shrinks_after_spike() {
        let base = Instant::now();
        let queue = DeadlineQueue::new();
        let entries: Vec<_> = (0..1000u64)
            .map(|i| QueueEntry::new(i, at(base, i)))
            .collect();
        for entry in &entries {
            queue.push(entry);
        }
        assert!(queue.capacity() >= 1000);

        for entry in &entries {
            assert!(queue.remove(entry));
        }
        assert!(queue.is_empty());
        assert!(queue.capacity() <= 4 * MIN_CAPACITY);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u64),
        Remove(usize),
        Pop(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..500).prop_map(Op::Push),
            (0usize..64).prop_map(Op::Remove),
            (0u64..500).prop_map(Op::Pop),
        ]
    }

    proptest! {
        #[test]
        fn heap_invariants_hold(ops in proptest::collection::vec(op(), 1..200)) {
            let base = Instant::now();
            let queue = DeadlineQueue::new();
            let mut created: Vec<Arc<QueueEntry<u64>>> = Vec::new();

            for op in ops {
                match op {
                    Op::Push(millis) => {
                        let entry = QueueEntry::new(millis, at(base, millis));
                        queue.push(&entry);
                        created.push(entry);
                    }
                    Op::Remove(pick) => {
                        if !created.is_empty() {
                            let entry = &created[pick % created.len()];
                            let was_queued = entry.is_queued();
                            let before = queue.len();
                            prop_assert_eq!(queue.remove(entry), was_queued);
                            prop_assert_eq!(queue.len(), before - usize::from(was_queued));
                            prop_assert!(!entry.is_queued());
                        }
                    }
                    Op::Pop(millis) => {
                        let now = base + Duration::from_millis(millis);
                        let earliest = created
                            .iter()
                            .filter(|e| e.is_queued())
                            .filter_map(|e| e.deadline())
                            .min();
                        match queue.pop_if_due(now) {
                            Poll::Due(entry) => {
                                prop_assert_eq!(entry.deadline(), earliest);
                                prop_assert!(entry.deadline().is_some_and(|d| d <= now));
                                prop_assert!(!entry.is_queued());
                            }
                            Poll::Wait(remaining) => {
                                prop_assert_eq!(earliest.map(|d| d - now), Some(remaining));
                            }
                            Poll::Idle => prop_assert!(earliest.is_none()),
                        }
                    }
                }
                queue.assert_consistent();
                prop_assert_eq!(queue.len(), created.iter().filter(|e| e.is_queued()).count());
            }
        }
    }
}
