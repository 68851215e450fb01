//! Fixed-size, page-aligned write buffers (§3 `Buffer`, §4.4). Each is
//! written by exactly one producer thread for exactly one session, and is
//! later flipped read-only for the draining reader.
//!
//! The spec models an event's provider/event identity as a raw pointer
//! (`ep_event*`) into long-lived runtime memory. Rust has no equivalent
//! of "this memory simply never moves and is never freed under us", so
//! identity is instead tracked as a parallel `Vec<Arc<Event>>` alongside
//! the mmap'd byte region — the region itself still does all the real
//! work (budget accounting, write-pointer/write-limit bounds, the
//! read-only flip), it just doesn't have to also double as a GC arena.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use eventpipe_wire::{BufferFooterLayout, BufferHeaderLayout, GuardLevel, BUFFER_FOOTER_MAGIC, BUFFER_HEADER_MAGIC};
use memmap2::MmapMut;

use crate::clock;
use crate::ids::ActivityId;
use crate::provider::Event;

const ALIGN: usize = 8;
const STATE_WRITABLE: u8 = 0;
const STATE_READONLY: u8 = 1;

fn round_up(v: usize, align: usize) -> usize {
    (v + align - 1) / align * align
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

pub struct Buffer {
    mmap: MmapMut,
    size: usize,
    state: AtomicU8,
    pub creation_timestamp: i64,
    pub writer_thread_id: u64,
    pub first_event_sequence_number: u64,
    first_event_address: usize,
    write_pointer: usize,
    limit: usize,
    write_limit: usize,
    current_read_event: Option<usize>,
    current_read_index: usize,
    guard_level: GuardLevel,
    event_refs: Vec<Arc<Event>>,
}

pub struct EventRecordView {
    pub event: Arc<Event>,
    pub activity_id: ActivityId,
    pub related_activity_id: ActivityId,
    pub thread_id: u64,
    pub timestamp: i64,
    pub proc_num: u32,
    pub payload: Vec<u8>,
    pub stack: Vec<u64>,
}

impl Buffer {
    pub fn new(
        requested_size: usize,
        writer_thread_id: u64,
        initial_sequence_number: u64,
        guard_level: GuardLevel,
    ) -> io::Result<Buffer> {
        let rounded = round_up(requested_size.max(1), page_size());
        let mut mmap = MmapMut::map_anon(rounded)?;
        let creation_timestamp = clock::now();

        let guarded = guard_level != GuardLevel::None;
        let header_len = if guarded { std::mem::size_of::<BufferHeaderLayout>() } else { 0 };
        let footer_len = if guarded { std::mem::size_of::<BufferFooterLayout>() } else { 0 };

        if guarded {
            let header = BufferHeaderLayout {
                magic: BUFFER_HEADER_MAGIC,
                creation_timestamp,
                writer_thread_id,
                first_event_sequence_number: initial_sequence_number as u32,
                _padding: 0,
            };
            mmap[0..header_len].copy_from_slice(bytemuck::bytes_of(&header));

            let checksum =
                BufferFooterLayout::checksum_for(creation_timestamp, writer_thread_id, initial_sequence_number);
            let mut inverted = BUFFER_FOOTER_MAGIC;
            for b in inverted.iter_mut() {
                *b = !*b;
            }
            let footer = BufferFooterLayout {
                magic: BUFFER_FOOTER_MAGIC,
                inverted_magic: inverted,
                checksum,
                filler: [0xEB; 8],
            };
            let footer_start = rounded - footer_len;
            mmap[footer_start..rounded].copy_from_slice(bytemuck::bytes_of(&footer));
        }

        let first_event_address = round_up(header_len, ALIGN);
        let write_limit = rounded - footer_len;

        Ok(Buffer {
            mmap,
            size: rounded,
            state: AtomicU8::new(STATE_WRITABLE),
            creation_timestamp,
            writer_thread_id,
            first_event_sequence_number: initial_sequence_number,
            first_event_address,
            write_pointer: first_event_address,
            limit: rounded,
            write_limit,
            current_read_event: None,
            current_read_index: 0,
            guard_level,
            event_refs: Vec::new(),
        })
    }

    pub fn is_writable(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_WRITABLE
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn write_limit(&self) -> usize {
        self.write_limit
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn first_event_address(&self) -> usize {
        self.first_event_address
    }

    pub fn write_pointer(&self) -> usize {
        self.write_pointer
    }

    pub fn current_read_offset(&self) -> Option<usize> {
        self.current_read_event
    }

    pub fn has_events(&self) -> bool {
        self.write_pointer > self.first_event_address
    }

    /// Preconditions: buffer is Writable, caller holds the producing
    /// thread's lock. Returns false (not an error) when the record would
    /// cross `write_limit`; the caller then retires this buffer and
    /// allocates a new one.
    pub fn write_event(
        &mut self,
        event: &Arc<Event>,
        activity_id: ActivityId,
        related_activity_id: ActivityId,
        thread_id: u64,
        timestamp: i64,
        proc_num: u32,
        payload: &[u8],
        stack: &[u64],
    ) -> bool {
        debug_assert!(self.is_writable());
        let framed = encode_record(activity_id, related_activity_id, thread_id, timestamp, proc_num, payload, stack);
        if self.write_pointer + framed.len() > self.write_limit {
            return false;
        }
        let start = self.write_pointer;
        self.mmap[start..start + framed.len()].copy_from_slice(&framed);
        self.write_pointer += framed.len();
        self.event_refs.push(event.clone());

        if cfg!(debug_assertions) && self.guard_level == GuardLevel::Full {
            self.verify_guards();
        }
        true
    }

    fn verify_guards(&self) {
        let header_len = std::mem::size_of::<BufferHeaderLayout>();
        let footer_len = std::mem::size_of::<BufferFooterLayout>();
        let header: &BufferHeaderLayout = bytemuck::from_bytes(&self.mmap[0..header_len]);
        assert_eq!(header.magic, BUFFER_HEADER_MAGIC, "buffer header magic corrupted");
        let footer: &BufferFooterLayout = bytemuck::from_bytes(&self.mmap[self.size - footer_len..self.size]);
        assert_eq!(footer.magic, BUFFER_FOOTER_MAGIC, "buffer footer magic corrupted");
    }

    /// Flips the buffer read-only and positions the reader cursor at the
    /// first event (or null if the buffer holds none). One-way.
    pub fn convert_to_read_only(&mut self) {
        self.state.store(STATE_READONLY, Ordering::Release);
        self.current_read_event = if self.has_events() {
            Some(self.first_event_address)
        } else {
            None
        };
        self.current_read_index = 0;

        if self.guard_level == GuardLevel::Full {
            unsafe {
                libc::mprotect(self.mmap.as_ptr() as *mut libc::c_void, self.size, libc::PROT_READ);
            }
        }
    }

    pub fn current_event(&self) -> Option<EventRecordView> {
        let offset = self.current_read_event?;
        let event = self.event_refs.get(self.current_read_index)?.clone();
        Some(parse_record(&self.mmap[offset..self.write_pointer], event))
    }

    /// Advances the reader cursor by the current record's flattened size;
    /// clamps to null at end.
    pub fn move_next_read_event(&mut self) {
        let Some(offset) = self.current_read_event else {
            return;
        };
        let body_len = u32::from_le_bytes(self.mmap[offset..offset + 4].try_into().unwrap()) as usize;
        let framed_len = round_up(4 + body_len, ALIGN);
        let next = offset + framed_len;
        self.current_read_index += 1;
        self.current_read_event = if next < self.write_pointer { Some(next) } else { None };
    }
}

fn encode_record(
    activity_id: ActivityId,
    related_activity_id: ActivityId,
    thread_id: u64,
    timestamp: i64,
    proc_num: u32,
    payload: &[u8],
    stack: &[u64],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 + 16 + 8 + 8 + 4 + 4 + payload.len() + 4 + stack.len() * 8);
    body.extend_from_slice(&activity_id.0);
    body.extend_from_slice(&related_activity_id.0);
    body.extend_from_slice(&thread_id.to_le_bytes());
    body.extend_from_slice(&timestamp.to_le_bytes());
    body.extend_from_slice(&proc_num.to_le_bytes());
    body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    body.extend_from_slice(payload);
    body.extend_from_slice(&(stack.len() as u32).to_le_bytes());
    for ip in stack {
        body.extend_from_slice(&ip.to_le_bytes());
    }

    let mut framed = Vec::with_capacity(4 + body.len() + ALIGN);
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    while framed.len() % ALIGN != 0 {
        framed.push(0);
    }
    framed
}

fn parse_record(bytes: &[u8], event: Arc<Event>) -> EventRecordView {
    let activity_id = ActivityId(bytes[4..20].try_into().unwrap());
    let related_activity_id = ActivityId(bytes[20..36].try_into().unwrap());
    let thread_id = u64::from_le_bytes(bytes[36..44].try_into().unwrap());
    let timestamp = i64::from_le_bytes(bytes[44..52].try_into().unwrap());
    let proc_num = u32::from_le_bytes(bytes[52..56].try_into().unwrap());
    let data_len = u32::from_le_bytes(bytes[56..60].try_into().unwrap()) as usize;
    let payload = bytes[60..60 + data_len].to_vec();
    let stack_len_off = 60 + data_len;
    let stack_len = u32::from_le_bytes(bytes[stack_len_off..stack_len_off + 4].try_into().unwrap()) as usize;
    let mut stack = Vec::with_capacity(stack_len);
    let mut off = stack_len_off + 4;
    for _ in 0..stack_len {
        stack.push(u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()));
        off += 8;
    }
    EventRecordView {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use eventpipe_wire::Level;

    fn make_event() -> Arc<Event> {
        let provider = Provider::new("P", None);
        provider.add_event(42, 0x1, 1, Level::Informational, false, None)
    }

    #[test]
    fn write_then_read_round_trips_payload() {
        let event = make_event();
        let mut buffer = Buffer::new(64 * 1024, 7, 0, GuardLevel::Full).unwrap();
        let ok = buffer.write_event(
            &event,
            ActivityId::from([1; 16]),
            ActivityId::NIL,
            7,
            100,
            0,
            &[0xDE, 0xAD, 0xBE, 0xEF],
            &[],
        );
        assert!(ok);
        buffer.convert_to_read_only();
        let view = buffer.current_event().expect("one event");
        assert_eq!(view.payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(view.activity_id, ActivityId::from([1; 16]));
        assert_eq!(view.event.event_id, 42);
        buffer.move_next_read_event();
        assert!(buffer.current_event().is_none());
    }

    #[test]
    fn write_past_limit_returns_false() {
        let event = make_event();
        let mut buffer = Buffer::new(4096, 1, 0, GuardLevel::None).unwrap();
        let big_payload = vec![0u8; 8192];
        let ok = buffer.write_event(&event, ActivityId::NIL, ActivityId::NIL, 1, 1, 0, &big_payload, &[]);
        assert!(!ok);
    }

    #[test]
    fn readonly_buffer_satisfies_pointer_ordering_invariant() {
        let event = make_event();
        let mut buffer = Buffer::new(64 * 1024, 1, 0, GuardLevel::Header).unwrap();
        buffer.write_event(&event, ActivityId::NIL, ActivityId::NIL, 1, 1, 0, &[1, 2, 3], &[]);
        buffer.convert_to_read_only();
        assert!(buffer.first_event_address() <= buffer.current_read_offset().unwrap());
        assert!(buffer.current_read_offset().unwrap() <= buffer.write_pointer());
        assert!(buffer.write_pointer() <= buffer.write_limit());
        assert!(buffer.write_limit() <= buffer.limit());
    }
}
