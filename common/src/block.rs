//! Per-block copy state
//!
//! A [`Block`] describes one contiguous byte range that is first read from the source and then
//! written to the destination. It owns the buffer holding that range. While an operation against
//! the block is outstanding the substrate owns the whole `Block` value, so at any instant exactly
//! one party can touch its buffer.
//!
//! Progress within the range is tracked the same way for reads and writes:
//!
//! ```text
//! base_offset          offset = base_offset + (base_len - len)
//!      |                  |
//!      v                  v
//!      [ transferred .... | pending ........... ]
//!      <------------- base_len ----------------->
//!                         <-------- len -------->
//! ```

/// Which half of the copy the block is in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Reading,
    Writing,
    Done,
}

pub struct Block {
    slot: usize,
    phase: Phase,
    base_offset: u64,
    offset: u64,
    base_len: usize,
    len: usize,
    buf: Box<[u8]>,
}

impl Block {
    /// Allocates the buffer for one concurrency slot. The buffer is reused for every block
    /// assigned to this slot.
    #[must_use]
    pub fn new(slot: usize, capacity: usize) -> Self {
        Self {
            slot,
            phase: Phase::Done,
            base_offset: 0,
            offset: 0,
            base_len: 0,
            len: 0,
            buf: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// Points the block at a new range and puts it in the reading phase.
    pub fn assign(&mut self, offset: u64, len: usize) {
        assert!(
            len <= self.buf.len(),
            "block of {len} bytes does not fit a {} byte buffer",
            self.buf.len()
        );
        self.phase = Phase::Reading;
        self.base_offset = offset;
        self.offset = offset;
        self.base_len = len;
        self.len = len;
    }

    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// File offset of the first pending byte.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Bytes still to be transferred in the current phase.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Buffer region the next operation transfers from or into.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.base_len - self.len..self.base_len]
    }

    pub fn pending_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.base_len - self.len..self.base_len]
    }

    /// Bytes of the current range that are already read (or written).
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.base_len - self.len]
    }

    /// Records that `transferred` more bytes of the current phase have completed.
    pub fn advance(&mut self, transferred: usize) {
        assert!(
            transferred <= self.len,
            "advancing by {transferred} bytes past the {} pending",
            self.len
        );
        self.offset += transferred as u64;
        self.len -= transferred;
        debug_assert_eq!(
            self.offset,
            self.base_offset + (self.base_len - self.len) as u64
        );
    }

    /// Rewinds to the start of the range once it has been read completely, ready for writing.
    pub fn begin_write(&mut self) {
        debug_assert_eq!(self.phase, Phase::Reading);
        debug_assert_eq!(self.len, 0);
        self.phase = Phase::Writing;
        self.offset = self.base_offset;
        self.len = self.base_len;
    }

    pub fn retire(&mut self) {
        debug_assert_eq!(self.len, 0);
        self.phase = Phase::Done;
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("slot", &self.slot)
            .field("phase", &self.phase)
            .field("base_offset", &self.base_offset)
            .field("offset", &self.offset)
            .field("base_len", &self.base_len)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_transfers_move_the_cursor() {
        let mut block = Block::new(0, 8);
        block.assign(100, 6);
        block.pending_mut()[..2].copy_from_slice(b"ab");
        block.advance(2);
        assert_eq!(block.offset(), 102);
        assert_eq!(block.remaining(), 4);
        assert_eq!(block.pending().len(), 4);
        assert_eq!(block.filled(), b"ab");
        block.pending_mut().copy_from_slice(b"cdef");
        block.advance(4);
        assert_eq!(block.remaining(), 0);
        assert_eq!(block.filled(), b"abcdef");
    }

    #[test]
    fn begin_write_rewinds_to_base() {
        let mut block = Block::new(3, 4);
        block.assign(40, 4);
        block.advance(4);
        block.begin_write();
        assert_eq!(block.phase(), Phase::Writing);
        assert_eq!(block.offset(), 40);
        assert_eq!(block.remaining(), 4);
        assert_eq!(block.slot(), 3);
    }

    #[test]
    fn reassigning_keeps_the_buffer() {
        let mut block = Block::new(0, 16);
        block.assign(0, 16);
        block.advance(16);
        block.begin_write();
        block.advance(16);
        block.retire();
        assert_eq!(block.phase(), Phase::Done);
        block.assign(16, 5);
        assert_eq!(block.capacity(), 16);
        assert_eq!(block.base_len(), 5);
        assert_eq!(block.pending().len(), 5);
        assert_eq!(block.phase(), Phase::Reading);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn oversized_range_is_rejected() {
        let mut block = Block::new(0, 4);
        block.assign(0, 5);
    }
}
