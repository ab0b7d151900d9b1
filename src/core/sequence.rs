use crate::types::SeqNo;

use super::queue::{PersistentQueue, QueueError};

/// Sequence numbers handed out per persisted reservation.
pub const DEFAULT_SEQUENCE_BLOCK: u64 = 64;

/// Hands out strictly increasing sequence numbers from persisted blocks.
///
/// Only the block ceiling is written to storage, so a crash skips the unused
/// tail of the current block instead of reusing it.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: SeqNo,
    end: SeqNo,
    block: u64,
}

impl SequenceAllocator {
    /// Allocator reserving `block` numbers at a time.
    pub fn new(block: u64) -> Self {
        Self {
            next: 0,
            end: 0,
            block: block.max(1),
        }
    }

    /// Next sequence number, reserving a new block when the current one is used up.
    pub fn next(&mut self, queue: &mut PersistentQueue) -> Result<SeqNo, QueueError> {
        if self.next >= self.end {
            let start = queue.reserve_sequence_block(self.block)?;
            self.next = start;
            self.end = start.saturating_add(self.block);
        }
        let seq = self.next;
        self.next += 1;
        Ok(seq)
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_SEQUENCE_BLOCK)
    }
}
