//! Bounded write-behind queues.

use heapless::Deque;

use crate::record::{RecordKey, SlotRecord};

/// A sample waiting to be written: the slot plus where it goes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingSample<R: SlotRecord> {
    pub key: RecordKey,
    pub slot: u16,
    pub record: R,
}

/// Fixed capacity FIFO between producers and the supervisor.
///
/// Samples are written oldest first. Several samples for the same slot may be
/// queued, the last one pushed is the one that ends up on disk.
pub struct WriteQueue<R: SlotRecord, const N: usize> {
    items: Deque<PendingSample<R>, N>,
}

impl<R: SlotRecord, const N: usize> WriteQueue<R, N> {
    pub const fn new() -> Self {
        Self { items: Deque::new() }
    }

    /// Appends a sample, false if the queue is full.
    pub fn push(&mut self, sample: PendingSample<R>) -> bool {
        self.items.push_back(sample).is_ok()
    }

    pub fn pop(&mut self) -> Option<PendingSample<R>> {
        self.items.pop_front()
    }

    /// Puts a sample whose write failed back at the head. Dropped if the
    /// queue filled up in the meantime.
    pub fn requeue(&mut self, sample: PendingSample<R>) -> bool {
        self.items.push_front(sample).is_ok()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<R: SlotRecord, const N: usize> Default for WriteQueue<R, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WallboxDailySlot;

    fn sample(energy: u32) -> PendingSample<WallboxDailySlot> {
        PendingSample {
            key: RecordKey {
                subject_id: 1,
                year: 2024,
                month: 3,
                day: None,
            },
            slot: 0,
            record: WallboxDailySlot { energy },
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue: WriteQueue<WallboxDailySlot, 4> = WriteQueue::new();
        assert!(queue.push(sample(1)));
        assert!(queue.push(sample(2)));
        assert_eq!(queue.pop().map(|s| s.record.energy), Some(1));
        assert_eq!(queue.pop().map(|s| s.record.energy), Some(2));
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_overflow_keeps_earlier_items() {
        let mut queue: WriteQueue<WallboxDailySlot, 2> = WriteQueue::new();
        assert!(queue.push(sample(1)));
        assert!(queue.push(sample(2)));
        assert!(!queue.push(sample(3)), "third push must report full");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().map(|s| s.record.energy), Some(1));
        assert_eq!(queue.pop().map(|s| s.record.energy), Some(2));
    }

    #[test]
    fn test_requeue_goes_to_front() {
        let mut queue: WriteQueue<WallboxDailySlot, 2> = WriteQueue::new();
        queue.push(sample(1));
        queue.push(sample(2));
        let failed = queue.pop().expect("queue holds two samples");
        assert!(queue.requeue(failed));
        assert_eq!(queue.pop().map(|s| s.record.energy), Some(1));

        queue.push(sample(3));
        assert!(!queue.requeue(sample(4)), "full queue drops the retry");
    }
}
