//! Streaming read sessions and their chunk mailboxes.
//!
//! A read request covers up to a whole day or month of slots, far more than
//! one outbound message carries. The supervisor pages it out one chunk at a
//! time: a chunk is posted to the class mailbox and the next one is only read
//! once the protocol layer acknowledged the previous one.

use embassy_time::Instant;

use crate::record::{MAX_CHUNK_LEN, RecordClass, RecordKey};

/// A validated read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetDescriptor {
    pub key: RecordKey,
    pub first_slot: u16,
    pub amount: u16,
}

/// Request side of a session as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetState {
    Idle,
    /// Accepted, waiting for the supervisor to pick it up
    Requested(GetDescriptor),
    /// Being paged out
    Paging,
}

/// One fragment of a read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub class: RecordClass,
    /// Byte offset of this payload within the whole result
    pub offset: u32,
    /// Byte length of the whole result
    pub total: u32,
    pub payload: heapless::Vec<u8, MAX_CHUNK_LEN>,
}

/// Single-slot handoff from the supervisor to the protocol layer.
#[derive(Debug, Default)]
pub struct ChunkMailbox {
    chunk: Option<Chunk>,
}

impl ChunkMailbox {
    pub const fn new() -> Self {
        Self { chunk: None }
    }

    /// True while a posted chunk waits for its acknowledgment.
    pub fn is_ready(&self) -> bool {
        self.chunk.is_some()
    }

    /// Posts a chunk. Refused while the previous one is unacknowledged.
    pub fn post(&mut self, chunk: Chunk) -> bool {
        if self.chunk.is_some() {
            return false;
        }
        self.chunk = Some(chunk);
        true
    }

    /// Copy of the pending chunk, it stays posted until acknowledged.
    pub fn peek(&self) -> Option<Chunk> {
        self.chunk.clone()
    }

    /// Marks the pending chunk as transmitted.
    pub fn acknowledge(&mut self) -> bool {
        self.chunk.take().is_some()
    }

    pub fn clear(&mut self) {
        self.chunk = None;
    }
}

/// Supervisor side progress of one paging session.
#[derive(Debug, Clone, Copy)]
pub struct PagingSession {
    pub class: RecordClass,
    pub request: GetDescriptor,
    sent_slots: u16,
    /// Set while a posted chunk waits for its acknowledgment
    deadline: Option<Instant>,
}

impl PagingSession {
    pub fn new(class: RecordClass, request: GetDescriptor) -> Self {
        Self {
            class,
            request,
            sent_slots: 0,
            deadline: None,
        }
    }

    pub fn total_len(&self) -> u32 {
        u32::from(self.request.amount) * self.class.slot_len() as u32
    }

    /// Every chunk has been posted.
    pub fn is_complete(&self) -> bool {
        self.sent_slots >= self.request.amount
    }

    /// First slot and slot count of the next chunk.
    pub fn next_range(&self) -> (u16, u16) {
        let remaining = self.request.amount - self.sent_slots;
        (
            self.request.first_slot + self.sent_slots,
            remaining.min(self.class.chunk_slots()),
        )
    }

    /// Byte offset of the next chunk.
    pub fn next_offset(&self) -> u32 {
        u32::from(self.sent_slots) * self.class.slot_len() as u32
    }

    /// Records that `count` slots were posted and must be acknowledged by `deadline`.
    pub fn posted(&mut self, count: u16, deadline: Instant) {
        self.sent_slots += count;
        self.deadline = Some(deadline);
    }

    pub fn acknowledged(&mut self) {
        self.deadline = None;
    }

    pub fn awaiting_ack(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn request(first_slot: u16, amount: u16) -> GetDescriptor {
        GetDescriptor {
            key: RecordKey {
                subject_id: 1,
                year: 2024,
                month: 5,
                day: Some(1),
            },
            first_slot,
            amount,
        }
    }

    #[test]
    fn test_chunking_100_wallbox_slots() {
        let mut session = PagingSession::new(RecordClass::Wallbox5Min, request(10, 100));
        assert_eq!(session.total_len(), 300);

        let mut offsets = Vec::new();
        let mut lengths = Vec::new();
        let now = Instant::from_ticks(0);
        while !session.is_complete() {
            let (first, count) = session.next_range();
            assert_eq!(first, 10 + (session.next_offset() / 3) as u16);
            offsets.push(session.next_offset());
            lengths.push(u32::from(count) * 3);
            session.posted(count, now);
            session.acknowledged();
        }
        assert_eq!(offsets, [0, 60, 120, 180, 240]);
        assert_eq!(lengths.iter().sum::<u32>(), 300);
        assert!(lengths.iter().all(|&l| l <= 60));
    }

    #[test]
    fn test_last_chunk_is_short() {
        let mut session = PagingSession::new(RecordClass::WallboxDaily, request(0, 31));
        session.posted(15, Instant::from_ticks(0));
        session.posted(15, Instant::from_ticks(0));
        assert_eq!(session.next_range(), (30, 1));
    }

    #[test]
    fn test_deadline() {
        let mut session = PagingSession::new(RecordClass::EnergyManagerDaily, request(0, 2));
        assert!(!session.expired(Instant::from_ticks(100)));
        session.posted(1, Instant::from_ticks(50));
        assert!(session.awaiting_ack());
        assert!(!session.expired(Instant::from_ticks(49)));
        assert!(session.expired(Instant::from_ticks(50)));
        session.acknowledged();
        assert!(!session.expired(Instant::from_ticks(100)));
    }

    #[test]
    fn test_mailbox_holds_one_chunk() {
        let mut mailbox = ChunkMailbox::new();
        let chunk = Chunk {
            class: RecordClass::Wallbox5Min,
            offset: 0,
            total: 3,
            payload: heapless::Vec::from_slice(&[1, 2, 3]).unwrap_or_default(),
        };
        assert!(mailbox.post(chunk.clone()));
        assert!(!mailbox.post(chunk.clone()), "second chunk before ack is refused");
        assert_eq!(mailbox.peek(), Some(chunk.clone()));
        assert!(mailbox.is_ready(), "peeking does not acknowledge");
        assert!(mailbox.acknowledge());
        assert!(!mailbox.is_ready());
        assert!(!mailbox.acknowledge());
    }
}
