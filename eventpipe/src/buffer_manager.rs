//! Per-session buffer budget and the merge-reader that turns N per-thread
//! buffer streams into one timestamp-ordered sequence (§4.6).
//!
//! Allocation is a bounded CAS loop against a byte budget shared by every
//! thread writing into this session; reading is a lazily-grown min-heap
//! keyed by each tracked thread's next event timestamp, exactly mirroring
//! an external k-way merge over already-sorted-per-thread runs.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use eventpipe_wire::GuardLevel;
use log::{debug, warn};

use crate::buffer::{Buffer, EventRecordView};
use crate::clock;
use crate::provider::Event;
use crate::thread_registry::ThreadSessionState;

pub const MIN_BUDGET: usize = 100 * 1024;
pub const MAX_BUDGET: usize = 4 * 1024 * 1024 * 1024;
pub const MIN_SEQUENCE_POINT_BUDGET: usize = 1024 * 1024;
pub const MAX_SEQUENCE_POINT_BUDGET: usize = 1024 * 1024 * 1024;
pub const OVERSIZED_PAYLOAD_THRESHOLD: usize = 64 * 1024;
const MAX_SINGLE_BUFFER: usize = 1024 * 1024;
const GROWTH_INTERVAL_NANOS: i64 = 100_000_000;

pub fn clamp_budget(requested: usize) -> usize {
    requested.clamp(MIN_BUDGET, MAX_BUDGET)
}

pub fn clamp_sequence_point_budget(requested: usize) -> usize {
    if requested == 0 {
        0
    } else {
        requested.clamp(MIN_SEQUENCE_POINT_BUDGET, MAX_SEQUENCE_POINT_BUDGET)
    }
}

/// A snapshot of every tracked thread's sequence number at one instant,
/// used by the reader to bound how far events can still be reordered
/// (§4.6.5). 32-bit wraparound reconciliation across snapshots is left as
/// an open question, matching the source algorithm this was modeled on.
pub struct SequencePoint {
    pub timestamp: i64,
    pub thread_sequence_numbers: HashMap<u64, u64>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    timestamp: i64,
    os_tid: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp.cmp(&other.timestamp).then(self.os_tid.cmp(&other.os_tid))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    thread_states: Vec<Arc<ThreadSessionState>>,
    tracked: HashSet<u64>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    last_heap_growth: i64,
    sequence_points: VecDeque<SequencePoint>,
    sequence_point_bytes: usize,
    bytes_since_sequence_point: usize,
}

/// Wakes the session's streaming thread when fresh data becomes
/// drainable, without making every write take a heavyweight lock: a
/// buffer retirement calls `notify`, the streaming thread normally just
/// times out and polls anyway.
pub struct WaitEvent {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl WaitEvent {
    pub fn new() -> Self {
        WaitEvent {
            ready: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.ready.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn wait_timeout(&self, dur: Duration) {
        let guard = self.ready.lock().unwrap();
        let (mut guard, _) = self.cv.wait_timeout_while(guard, dur, |ready| !*ready).unwrap();
        *guard = false;
    }
}

impl Default for WaitEvent {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BufferManager {
    pub budget: usize,
    pub sequence_point_budget: usize,
    pub guard_level: GuardLevel,
    size_of_all_buffers: AtomicUsize,
    num_oversized_events_dropped: AtomicU64,
    num_events_written: AtomicU64,
    inner: Mutex<Inner>,
    pub wait: WaitEvent,
}

impl BufferManager {
    pub fn new(budget: usize, sequence_point_budget: usize, guard_level: GuardLevel) -> Arc<BufferManager> {
        Arc::new(BufferManager {
            budget: clamp_budget(budget),
            sequence_point_budget: clamp_sequence_point_budget(sequence_point_budget),
            guard_level,
            size_of_all_buffers: AtomicUsize::new(0),
            num_oversized_events_dropped: AtomicU64::new(0),
            num_events_written: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                thread_states: Vec::new(),
                tracked: HashSet::new(),
                heap: BinaryHeap::new(),
                last_heap_growth: 0,
                sequence_points: VecDeque::new(),
                sequence_point_bytes: 0,
                bytes_since_sequence_point: 0,
            }),
            wait: WaitEvent::new(),
        })
    }

    pub fn size_of_all_buffers(&self) -> usize {
        self.size_of_all_buffers.load(Ordering::Relaxed)
    }

    pub fn num_oversized_events_dropped(&self) -> u64 {
        self.num_oversized_events_dropped.load(Ordering::Relaxed)
    }

    pub fn num_events_written(&self) -> u64 {
        self.num_events_written.load(Ordering::Relaxed)
    }

    pub fn register_thread_state(&self, state: Arc<ThreadSessionState>) {
        self.inner.lock().unwrap().thread_states.push(state);
    }

    /// §4.6.1: `min(max(requested, base * (buffer_count + 1)), 1 MiB)`.
    /// `base` shrinks to 30 KiB in debug builds so buffer growth is
    /// exercised without needing megabyte-sized test payloads.
    fn next_buffer_size(requested: usize, buffer_count: usize) -> usize {
        let base = if cfg!(debug_assertions) { 30 * 1024 } else { 100 * 1024 };
        requested.max(base * (buffer_count + 1)).min(MAX_SINGLE_BUFFER)
    }

    fn reserve_budget(&self, amount: usize) -> bool {
        let mut spins: u32 = 0;
        loop {
            let current = self.size_of_all_buffers.load(Ordering::Acquire);
            if current + amount > self.budget {
                return false;
            }
            if self
                .size_of_all_buffers
                .compare_exchange_weak(current, current + amount, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    fn allocate_buffer_for_thread(
        &self,
        writer_thread_id: u64,
        sequence_number: u64,
        requested_size: usize,
        buffer_count: usize,
    ) -> Option<Buffer> {
        let size = Self::next_buffer_size(requested_size, buffer_count);
        if !self.reserve_budget(size) {
            debug!("buffer budget exhausted: {} + {} > {}", self.size_of_all_buffers(), size, self.budget);
            return None;
        }
        let buffer = match Buffer::new(size, writer_thread_id, sequence_number, self.guard_level) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.size_of_all_buffers.fetch_sub(size, Ordering::AcqRel);
                warn!("failed to map a new event buffer: {e}");
                return None;
            }
        };

        if self.sequence_point_budget > 0 {
            let mut inner = self.inner.lock().unwrap();
            inner.bytes_since_sequence_point += size;
            if inner.bytes_since_sequence_point >= self.sequence_point_budget {
                self.capture_and_retain_locked(&mut inner);
            }
        }

        Some(buffer)
    }

    fn capture_and_retain_locked(&self, inner: &mut Inner) {
        let mut thread_sequence_numbers = HashMap::with_capacity(inner.thread_states.len());
        for state in &inner.thread_states {
            thread_sequence_numbers.insert(state.thread.os_tid, state.sequence_number().saturating_sub(1));
        }
        let point = SequencePoint {
            timestamp: clock::now(),
            thread_sequence_numbers,
        };
        let size = 16 + point.thread_sequence_numbers.len() * 16;
        inner.sequence_point_bytes += size;
        inner.sequence_points.push_back(point);
        while inner.sequence_point_bytes > self.sequence_point_budget {
            let Some(oldest) = inner.sequence_points.pop_front() else { break };
            inner.sequence_point_bytes -= 16 + oldest.thread_sequence_numbers.len() * 16;
        }
        inner.bytes_since_sequence_point = 0;
    }

    pub fn peek_next_timestamp(&self) -> Option<i64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.heap.is_empty() || clock::now() - inner.last_heap_growth >= GROWTH_INTERVAL_NANOS {
            self.grow_heap(&mut inner);
        }
        inner.heap.peek().map(|Reverse(e)| e.timestamp)
    }

    /// Timestamp of the oldest still-queued sequence point, without
    /// consuming it. Used by a V4 session to bound a drain quantum at
    /// `min(stop_timestamp, this)` (§4.6.5).
    pub fn next_queued_sequence_point_timestamp(&self) -> Option<i64> {
        self.inner.lock().unwrap().sequence_points.front().map(|p| p.timestamp)
    }

    /// Removes and returns the oldest still-queued sequence point, if any.
    pub fn pop_sequence_point(&self) -> Option<SequencePoint> {
        let mut inner = self.inner.lock().unwrap();
        let popped = inner.sequence_points.pop_front();
        if let Some(ref p) = popped {
            inner.sequence_point_bytes -= 16 + p.thread_sequence_numbers.len() * 16;
        }
        popped
    }

    /// Writes one event into `state`'s current buffer, retiring and
    /// reallocating as needed. Every outcome here is an expected negative
    /// one, not an error: `false` means the event was dropped (budget
    /// exhausted or the event is simply too large to ever fit).
    pub fn write_event(
        &self,
        state: &ThreadSessionState,
        event: &Arc<Event>,
        activity_id: crate::ids::ActivityId,
        related_activity_id: crate::ids::ActivityId,
        thread_id: u64,
        timestamp: i64,
        proc_num: u32,
        payload: &[u8],
        stack: &[u64],
    ) -> bool {
        if payload.len() > OVERSIZED_PAYLOAD_THRESHOLD {
            state.bump_sequence_number();
            self.num_oversized_events_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut body = state.body.lock();
        let seq = state.bump_sequence_number();

        if let Some(buf) = body.current_write_buffer.as_mut() {
            if buf.is_writable()
                && buf.write_event(event, activity_id, related_activity_id, thread_id, timestamp, proc_num, payload, stack)
            {
                self.num_events_written.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }

        if let Some(mut old) = body.current_write_buffer.take() {
            old.convert_to_read_only();
            body.buffer_list.push_tail(old);
            self.wait.notify();
        }

        let buffer_count = body.buffer_list.buffer_count();
        let requested = payload.len() + 128;
        let Some(mut fresh) = self.allocate_buffer_for_thread(thread_id, seq, requested, buffer_count) else {
            return false;
        };
        let ok = fresh.write_event(event, activity_id, related_activity_id, thread_id, timestamp, proc_num, payload, stack);
        body.current_write_buffer = Some(fresh);
        if ok {
            self.num_events_written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.num_oversized_events_dropped.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Called when a thread is torn down (disable, or thread exit):
    /// retires its live write buffer into its buffer list so the final
    /// drain still sees it, without freeing budget — that happens only
    /// once the reader has actually consumed every buffer.
    pub fn suspend_write_event(&self, state: &ThreadSessionState) {
        let mut body = state.body.lock();
        if let Some(mut buf) = body.current_write_buffer.take() {
            buf.convert_to_read_only();
            body.buffer_list.push_tail(buf);
        }
        self.wait.notify();
    }

    fn grow_heap(&self, inner: &mut Inner) {
        let thread_states: Vec<Arc<ThreadSessionState>> = inner.thread_states.clone();
        for state in thread_states {
            let os_tid = state.thread.os_tid;
            if inner.tracked.contains(&os_tid) {
                continue;
            }
            let mut body = state.body.lock();
            if body.buffer_list.head().is_none() {
                if let Some(buf) = body.current_write_buffer.as_ref() {
                    if buf.has_events() {
                        let mut taken = body.current_write_buffer.take().unwrap();
                        taken.convert_to_read_only();
                        body.buffer_list.push_tail(taken);
                    }
                }
            }
            if let Some(view) = body.buffer_list.head().and_then(|b| b.current_event()) {
                inner.tracked.insert(os_tid);
                inner.heap.push(Reverse(HeapEntry { timestamp: view.timestamp, os_tid }));
            }
        }
        inner.last_heap_growth = clock::now();
    }

    /// Returns the next event across every tracked thread, in timestamp
    /// order, or `None` if nothing is currently drainable.
    pub fn get_next_event(&self) -> Option<EventRecordView> {
        let mut inner = self.inner.lock().unwrap();
        if inner.heap.is_empty() || clock::now() - inner.last_heap_growth >= GROWTH_INTERVAL_NANOS {
            self.grow_heap(&mut inner);
        }

        loop {
            let top = match inner.heap.peek() {
                Some(Reverse(entry)) => *entry,
                None => return None,
            };
            let Some(state) = inner
                .thread_states
                .iter()
                .find(|s| s.thread.os_tid == top.os_tid)
                .cloned()
            else {
                inner.heap.pop();
                inner.tracked.remove(&top.os_tid);
                continue;
            };

            let mut body = state.body.lock();
            let view = match body.buffer_list.head_mut() {
                Some(head) => head.current_event(),
                None => None,
            };
            let Some(view) = view else {
                inner.heap.pop();
                inner.tracked.remove(&top.os_tid);
                continue;
            };

            inner.heap.pop();
            body.buffer_list.head_mut().unwrap().move_next_read_event();

            if let Some(next) = body.buffer_list.head().and_then(|b| b.current_event()) {
                inner.heap.push(Reverse(HeapEntry { timestamp: next.timestamp, os_tid: top.os_tid }));
            } else {
                if let Some(exhausted) = body.buffer_list.get_and_remove_head() {
                    self.size_of_all_buffers.fetch_sub(exhausted.size(), Ordering::AcqRel);
                }
                if let Some(next_view) = body.buffer_list.head().and_then(|b| b.current_event()) {
                    inner.heap.push(Reverse(HeapEntry { timestamp: next_view.timestamp, os_tid: top.os_tid }));
                } else {
                    inner.tracked.remove(&top.os_tid);
                }
            }

            return Some(view);
        }
    }

    /// Like `get_next_event`, but only consumes and returns an event whose
    /// timestamp is `<= stop_timestamp`; otherwise leaves the heap
    /// untouched and returns `None`. Used by a drain quantum to bound how
    /// far into "now" it reads.
    pub fn get_next_event_before(&self, stop_timestamp: i64) -> Option<EventRecordView> {
        match self.peek_next_timestamp() {
            Some(ts) if ts <= stop_timestamp => self.get_next_event(),
            _ => None,
        }
    }

    /// Drains every remaining tracked event unconditionally; used for the
    /// final flush when a session is disabled.
    pub fn drain_all(&self, mut on_event: impl FnMut(EventRecordView)) {
        while let Some(view) = self.get_next_event() {
            on_event(view);
        }
    }

    pub fn capture_sequence_point(&self) -> SequencePoint {
        let inner = self.inner.lock().unwrap();
        let mut thread_sequence_numbers = HashMap::with_capacity(inner.thread_states.len());
        for state in &inner.thread_states {
            thread_sequence_numbers.insert(state.thread.os_tid, state.sequence_number().saturating_sub(1));
        }
        SequencePoint {
            timestamp: clock::now(),
            thread_sequence_numbers,
        }
    }

    /// Records a sequence point and evicts the oldest ones once the
    /// configured byte budget (approximated as 16 bytes per thread entry
    /// plus a fixed header) is exceeded. A budget of zero disables
    /// retention entirely; callers should still call `capture_sequence_point`
    /// for the wire block, they just won't be kept here for later reuse.
    pub fn retain_sequence_point(&self, point: SequencePoint) {
        if self.sequence_point_budget == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let size = 16 + point.thread_sequence_numbers.len() * 16;
        inner.sequence_point_bytes += size;
        inner.sequence_points.push_back(point);
        while inner.sequence_point_bytes > self.sequence_point_budget {
            let Some(oldest) = inner.sequence_points.pop_front() else { break };
            inner.sequence_point_bytes -= 16 + oldest.thread_sequence_numbers.len() * 16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ActivityId;
    use crate::provider::Provider;
    use crate::session::Session;
    use eventpipe_wire::Level;
    use std::sync::Weak;

    fn make_event() -> Arc<Event> {
        let provider = Provider::new("P", None);
        provider.add_event(1, 0x1, 1, Level::Informational, false, None)
    }

    fn make_state(os_tid: u64) -> Arc<ThreadSessionState> {
        let thread = crate::thread_registry::Thread::new(os_tid);
        Arc::new(ThreadSessionState::new(Weak::<Session>::new(), thread))
    }

    #[test]
    fn clamp_budget_enforces_bounds() {
        assert_eq!(clamp_budget(1), MIN_BUDGET);
        assert_eq!(clamp_budget(usize::MAX), MAX_BUDGET);
    }

    #[test]
    fn write_then_drain_round_trips_in_order() {
        let manager = BufferManager::new(MIN_BUDGET, 0, GuardLevel::None);
        let event = make_event();
        let state = make_state(11);
        manager.register_thread_state(state.clone());

        for i in 0..5u8 {
            manager.write_event(&state, &event, ActivityId::NIL, ActivityId::NIL, 11, 100 + i as i64, 0, &[i], &[]);
        }
        manager.suspend_write_event(&state);

        let mut seen = Vec::new();
        manager.drain_all(|view| seen.push(view.payload[0]));
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn budget_exhaustion_drops_events_without_panicking() {
        let manager = BufferManager::new(MIN_BUDGET, 0, GuardLevel::None);
        let event = make_event();
        let state = make_state(12);
        manager.register_thread_state(state.clone());
        let big_payload = vec![0u8; 60 * 1024];
        let mut any_dropped = false;
        for _ in 0..20 {
            if !manager.write_event(&state, &event, ActivityId::NIL, ActivityId::NIL, 12, 1, 0, &big_payload, &[]) {
                any_dropped = true;
            }
        }
        assert!(any_dropped);
    }

    #[test]
    fn oversized_payload_is_dropped_and_counted() {
        let manager = BufferManager::new(MAX_BUDGET, 0, GuardLevel::None);
        let event = make_event();
        let state = make_state(13);
        manager.register_thread_state(state.clone());
        let huge = vec![0u8; OVERSIZED_PAYLOAD_THRESHOLD + 1];
        let ok = manager.write_event(&state, &event, ActivityId::NIL, ActivityId::NIL, 13, 1, 0, &huge, &[]);
        assert!(!ok);
        assert_eq!(manager.num_oversized_events_dropped(), 1);
    }

    #[test]
    fn merge_reads_two_threads_in_timestamp_order() {
        let manager = BufferManager::new(MAX_BUDGET, 0, GuardLevel::None);
        let event = make_event();
        let a = make_state(21);
        let b = make_state(22);
        manager.register_thread_state(a.clone());
        manager.register_thread_state(b.clone());

        manager.write_event(&a, &event, ActivityId::NIL, ActivityId::NIL, 21, 10, 0, &[1], &[]);
        manager.write_event(&b, &event, ActivityId::NIL, ActivityId::NIL, 22, 5, 0, &[2], &[]);
        manager.write_event(&a, &event, ActivityId::NIL, ActivityId::NIL, 21, 20, 0, &[3], &[]);
        manager.suspend_write_event(&a);
        manager.suspend_write_event(&b);

        let mut seen = Vec::new();
        manager.drain_all(|view| seen.push(view.payload[0]));
        assert_eq!(seen, vec![2, 1, 3]);
    }

    #[test]
    fn sequence_point_budget_zero_disables_retention() {
        let manager = BufferManager::new(MIN_BUDGET, 0, GuardLevel::None);
        let point = manager.capture_sequence_point();
        manager.retain_sequence_point(point);
        assert_eq!(manager.inner.lock().unwrap().sequence_points.len(), 0);
    }
}
