//! A single record destined for a buffer (§3 `EventInstance`). Built by a
//! producer call, consumed by `Buffer::write_event`, and later re-parsed
//! from raw bytes by the reader side (see `buffer::EventRecordView`).

use std::sync::Arc;

use crate::ids::ActivityId;
use crate::provider::Event;

/// Stacks beyond this depth are truncated; chosen to match the spec's
/// stated cap.
pub const MAX_STACK_FRAMES: usize = 100;

pub struct EventInstance {
    pub event: Arc<Event>,
    pub activity_id: ActivityId,
    pub related_activity_id: ActivityId,
    pub thread_id: u64,
    pub timestamp: i64,
    pub proc_num: u32,
    pub payload: Vec<u8>,
    pub stack: Vec<u64>,
}

impl EventInstance {
    pub fn new(
        event: Arc<Event>,
        activity_id: ActivityId,
        related_activity_id: ActivityId,
        thread_id: u64,
        timestamp: i64,
        proc_num: u32,
        payload: Vec<u8>,
        mut stack: Vec<u64>,
    ) -> Self {
        stack.truncate(MAX_STACK_FRAMES);
        EventInstance {
            event,
            activity_id,
            related_activity_id,
            thread_id,
            timestamp,
            proc_num,
            payload,
            stack,
        }
    }
}
