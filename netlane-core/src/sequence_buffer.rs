//! Fixed-capacity ring buffer keyed by 16-bit sequence numbers

use crate::protocol::{constants, sequence_greater_than, sequence_less_than, Sequence};

const EMPTY: u32 = u32::MAX;

/// Sliding window of entries indexed by `sequence % capacity`.
///
/// Storage is allocated once. A slot is only visible while its stored key
/// still equals the requested sequence, so overwritten or cleared slots read
/// as absent.
#[derive(Debug, Clone)]
pub struct SequenceBuffer<T> {
    sequence: Sequence,
    entry_sequence: Box<[u32]>,
    entries: Box<[T]>,
}

impl<T: Default> SequenceBuffer<T> {
    /// Create a buffer with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, constants::MAX_SEQUENCE_BUFFER_SIZE);
        Self {
            sequence: 0,
            entry_sequence: vec![EMPTY; capacity].into_boxed_slice(),
            entries: (0..capacity).map(|_| T::default()).collect(),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// One past the most recent inserted sequence
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Clear every slot and rewind to sequence 0
    pub fn reset(&mut self) {
        self.sequence = 0;
        self.entry_sequence.fill(EMPTY);
        for entry in self.entries.iter_mut() {
            *entry = T::default();
        }
    }

    /// Whether `sequence` is still inside the window
    pub fn test_insert(&self, sequence: Sequence) -> bool {
        let oldest = self.sequence.wrapping_sub(self.capacity() as u16);
        !sequence_less_than(sequence, oldest)
    }

    /// Claim the slot for `sequence`, resetting it to `T::default()`.
    ///
    /// Returns `None` for sequences older than the window.
    pub fn insert(&mut self, sequence: Sequence) -> Option<&mut T> {
        if !self.test_insert(sequence) {
            return None;
        }

        let next = sequence.wrapping_add(1);
        if sequence_greater_than(next, self.sequence) {
            self.remove_entries(self.sequence, sequence);
            self.sequence = next;
        }

        let index = self.index_of(sequence);
        self.entry_sequence[index] = sequence as u32;
        self.entries[index] = T::default();
        Some(&mut self.entries[index])
    }

    /// Drop the entry for `sequence` if present
    pub fn remove(&mut self, sequence: Sequence) {
        let index = self.index_of(sequence);
        if self.entry_sequence[index] == sequence as u32 {
            self.entry_sequence[index] = EMPTY;
        }
    }

    /// Whether an entry for `sequence` is stored
    pub fn exists(&self, sequence: Sequence) -> bool {
        self.entry_sequence[self.index_of(sequence)] == sequence as u32
    }

    /// Entry for `sequence`
    pub fn find(&self, sequence: Sequence) -> Option<&T> {
        let index = self.index_of(sequence);
        (self.entry_sequence[index] == sequence as u32).then(|| &self.entries[index])
    }

    /// Mutable entry for `sequence`
    pub fn find_mut(&mut self, sequence: Sequence) -> Option<&mut T> {
        let index = self.index_of(sequence);
        if self.entry_sequence[index] == sequence as u32 {
            Some(&mut self.entries[index])
        } else {
            None
        }
    }

    /// Entry stored in slot `index`, whatever its sequence
    pub fn at_index(&self, index: usize) -> Option<&T> {
        match self.entry_sequence.get(index) {
            Some(&key) if key != EMPTY => self.entries.get(index),
            _ => None,
        }
    }

    /// Ack for the latest sequence plus a bitfield of the 32 preceding ones.
    ///
    /// Bit `i` is set when `ack - i` is stored.
    pub fn generate_ack_bits(&self) -> (Sequence, u32) {
        let ack = self.sequence.wrapping_sub(1);
        let mut ack_bits = 0u32;
        for i in 0..constants::ACK_BITS {
            if self.exists(ack.wrapping_sub(i)) {
                ack_bits |= 1 << i;
            }
        }
        (ack, ack_bits)
    }

    fn index_of(&self, sequence: Sequence) -> usize {
        sequence as usize % self.capacity()
    }

    /// Clear slots for `start..=finish`, wrapping through the sequence space
    fn remove_entries(&mut self, start: Sequence, finish: Sequence) {
        let start = start as u32;
        let mut finish = finish as u32;
        if finish < start {
            finish += 65536;
        }

        if (finish - start) as usize >= self.capacity() {
            self.entry_sequence.fill(EMPTY);
            return;
        }

        for sequence in start..=finish {
            let index = self.index_of(sequence as u16);
            self.entry_sequence[index] = EMPTY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_find() {
        let mut buffer: SequenceBuffer<u32> = SequenceBuffer::new(16);
        *buffer.insert(3).unwrap() = 30;
        assert!(buffer.exists(3));
        assert_eq!(buffer.find(3), Some(&30));
        assert_eq!(buffer.sequence(), 4);
        assert!(!buffer.exists(19));
        assert_eq!(buffer.at_index(3), Some(&30));
        assert_eq!(buffer.at_index(4), None);
    }

    #[test]
    fn test_stale_insert_refused() {
        let mut buffer: SequenceBuffer<u8> = SequenceBuffer::new(16);
        buffer.insert(100).unwrap();
        assert!(!buffer.test_insert(80));
        assert!(buffer.insert(80).is_none());
        assert!(buffer.test_insert(90));
        assert!(buffer.insert(90).is_some());
    }

    #[test]
    fn test_advance_clears_skipped_slots() {
        let mut buffer: SequenceBuffer<u8> = SequenceBuffer::new(8);
        for sequence in 0..8 {
            buffer.insert(sequence);
        }
        buffer.insert(12);
        // 8..=12 were cleared, so slots for 0..=4 are gone
        for sequence in 0..5 {
            assert!(!buffer.exists(sequence));
        }
        for sequence in 5..8 {
            assert!(buffer.exists(sequence));
        }
        assert!(buffer.exists(12));
    }

    #[test]
    fn test_wraparound() {
        let mut buffer: SequenceBuffer<u16> = SequenceBuffer::new(32);
        for sequence in 65530u16..=65535 {
            buffer.insert(sequence);
        }
        for sequence in 0u16..4 {
            buffer.insert(sequence);
        }
        assert_eq!(buffer.sequence(), 4);
        assert!(buffer.exists(65533));
        assert!(buffer.exists(2));

        let (ack, bits) = buffer.generate_ack_bits();
        assert_eq!(ack, 3);
        // 3,2,1,0,65535..65530 stored
        assert_eq!(bits, (1 << 10) - 1);
    }

    #[test]
    fn test_remove_and_reset() {
        let mut buffer: SequenceBuffer<u8> = SequenceBuffer::new(8);
        buffer.insert(5);
        buffer.remove(5);
        assert!(!buffer.exists(5));
        buffer.insert(6);
        buffer.reset();
        assert!(!buffer.exists(6));
        assert_eq!(buffer.sequence(), 0);
    }
}
