//! Per-(thread, session) ordered list of buffers (§3 `BufferList`, §4.5).
//! New buffers are appended at the tail; the reader drains from the head.
//! Modeled as a `VecDeque` rather than a hand-rolled doubly-linked list:
//! the spec's invariants (head/tail access only, cycle-freedom) are
//! exactly what a deque gives you for free, with no unsafe pointer
//! plumbing to get wrong.

use std::collections::VecDeque;

use crate::buffer::Buffer;

pub struct BufferList {
    buffers: VecDeque<Buffer>,
    pub last_read_sequence_number: u64,
}

impl BufferList {
    pub fn new() -> Self {
        BufferList {
            buffers: VecDeque::new(),
            last_read_sequence_number: 0,
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn push_tail(&mut self, buffer: Buffer) {
        self.buffers.push_back(buffer);
    }

    pub fn get_and_remove_head(&mut self) -> Option<Buffer> {
        self.buffers.pop_front()
    }

    pub fn head(&self) -> Option<&Buffer> {
        self.buffers.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Buffer> {
        self.buffers.front_mut()
    }

    pub fn tail_mut(&mut self) -> Option<&mut Buffer> {
        self.buffers.back_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Checked-build invariant: only the last node may still be Writable.
    #[cfg(debug_assertions)]
    pub fn integrity_check(&self) {
        let len = self.buffers.len();
        for (i, buffer) in self.buffers.iter().enumerate() {
            if i + 1 < len {
                debug_assert!(!buffer.is_writable(), "non-tail buffer must not be writable");
            }
        }
    }
}

impl Default for BufferList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ActivityId;
    use crate::provider::Provider;
    use eventpipe_wire::{GuardLevel, Level};

    #[test]
    fn head_is_oldest_tail_is_newest() {
        let mut list = BufferList::new();
        let b1 = crate::buffer::Buffer::new(4096, 1, 0, GuardLevel::None).unwrap();
        let b2 = crate::buffer::Buffer::new(4096, 1, 0, GuardLevel::None).unwrap();
        list.push_tail(b1);
        list.push_tail(b2);
        assert_eq!(list.buffer_count(), 2);
        let head = list.get_and_remove_head().unwrap();
        assert!(head.is_writable());
        assert_eq!(list.buffer_count(), 1);
    }

    #[test]
    fn integrity_check_allows_only_tail_writable() {
        let provider = Provider::new("P", None);
        let event = provider.add_event(1, 0x1, 1, Level::Informational, false, None);
        let mut list = BufferList::new();
        let mut b1 = crate::buffer::Buffer::new(4096, 1, 0, GuardLevel::None).unwrap();
        b1.write_event(&event, ActivityId::NIL, ActivityId::NIL, 1, 1, 0, &[1], &[]);
        b1.convert_to_read_only();
        let b2 = crate::buffer::Buffer::new(4096, 1, 0, GuardLevel::None).unwrap();
        list.push_tail(b1);
        list.push_tail(b2);
        list.integrity_check();
    }
}
