//! Process-wide thread registry and per-(thread, session) state (§4.1).
//! Every thread that has ever produced an event gets exactly one `Thread`
//! here, looked up by OS tid; a thread acquires a `ThreadSessionState` the
//! first time it writes into a given session.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;

use crate::buffer::Buffer;
use crate::buffer_list::BufferList;
use crate::clock;
use crate::ids::ActivityId;
use crate::session::Session;

const NO_RUNDOWN: i32 = -1;
const IDLE: u32 = u32::MAX;

/// One slot per possible session (spec: a compact fixed-size array,
/// `session_state[0..63]`), guarded by a single spin-lock.
type SessionStateArray = [Option<Arc<ThreadSessionState>>; 64];

pub struct Thread {
    pub os_tid: u64,
    pub activity_id: Mutex<ActivityId>,
    rundown_session: AtomicI32,
    state_lock: spin::Mutex<SessionStateArray>,
    /// Index of the session currently being written to, or `u32::MAX`
    /// when idle. Used by `disable` to spin-wait in-flight writers out.
    pub write_in_progress: AtomicU32,
}

impl Thread {
    pub fn new(os_tid: u64) -> Arc<Thread> {
        Arc::new(Thread {
            os_tid,
            activity_id: Mutex::new(ActivityId::NIL),
            rundown_session: AtomicI32::new(NO_RUNDOWN),
            state_lock: spin::Mutex::new(std::array::from_fn(|_| None)),
            write_in_progress: AtomicU32::new(IDLE),
        })
    }

    pub fn get_or_create_session_state(self: &Arc<Self>, session: &Arc<Session>) -> Arc<ThreadSessionState> {
        let idx = session.index as usize;
        let mut guard = self.state_lock.lock();
        if let Some(existing) = &guard[idx] {
            return existing.clone();
        }
        let state = Arc::new(ThreadSessionState::new(Arc::downgrade(session), self.clone()));
        session.buffer_manager.register_thread_state(state.clone());
        guard[idx] = Some(state.clone());
        state
    }

    pub fn session_state(&self, session_index: u8) -> Option<Arc<ThreadSessionState>> {
        self.state_lock.lock()[session_index as usize].clone()
    }

    /// Called by the buffer manager's `suspend_write_event`.
    pub fn clear_session_state(&self, session_index: u8) -> Option<Arc<ThreadSessionState>> {
        self.state_lock.lock()[session_index as usize].take()
    }

    pub fn set_rundown_session(&self, session_index: Option<u8>) {
        self.rundown_session
            .store(session_index.map(|i| i as i32).unwrap_or(NO_RUNDOWN), Ordering::Release);
    }

    pub fn rundown_session(&self) -> Option<u8> {
        match self.rundown_session.load(Ordering::Acquire) {
            NO_RUNDOWN => None,
            v => Some(v as u8),
        }
    }

    pub fn begin_write(&self, session_index: u8) {
        self.write_in_progress.store(session_index as u32, Ordering::Release);
    }

    pub fn end_write(&self) {
        self.write_in_progress.store(IDLE, Ordering::Release);
    }

    pub fn is_idle(&self) -> bool {
        self.write_in_progress.load(Ordering::Acquire) == IDLE
    }

    /// Spins until this thread is no longer mid-write for `session_index`.
    /// Part of the disable write-in-progress handshake (§5).
    pub fn spin_until_write_done(&self, session_index: u8) {
        let target = session_index as u32;
        let mut spins: u32 = 0;
        while self.write_in_progress.load(Ordering::Acquire) == target {
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// Buffer state belonging to one (thread, session) pair, behind its own
/// spin-lock. A thread's per-session states each get their own lock
/// (rather than one lock shared across all 64 sessions) so that reading
/// session A never blocks a producer writing to session B on the same
/// thread.
pub struct ThreadSessionStateBody {
    pub current_write_buffer: Option<Buffer>,
    pub buffer_list: BufferList,
}

/// Per-(thread, session) state. Shares its `Thread` with every other
/// session this thread writes to; holds a weak back-reference to the
/// owning `Session` so the Session <-> Thread reference graph has no
/// cycle (the Session already owns the BufferManager which transitively
/// reaches this same state through the per-thread buffer lists).
pub struct ThreadSessionState {
    pub session: Weak<Session>,
    pub thread: Arc<Thread>,
    pub body: spin::Mutex<ThreadSessionStateBody>,
    sequence_number: AtomicU64,
}

impl ThreadSessionState {
    pub fn new(session: Weak<Session>, thread: Arc<Thread>) -> Self {
        ThreadSessionState {
            session,
            thread,
            body: spin::Mutex::new(ThreadSessionStateBody {
                current_write_buffer: None,
                buffer_list: BufferList::new(),
            }),
            sequence_number: AtomicU64::new(0),
        }
    }

    /// Incremented by the producing thread while holding its own lock;
    /// other threads may read it without barriers (treated as a lower
    /// bound — see §5).
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number.load(Ordering::Relaxed)
    }

    pub fn bump_sequence_number(&self) -> u64 {
        self.sequence_number.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct ThreadRegistry {
    threads: DashMap<u64, Arc<Thread>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        ThreadRegistry { threads: DashMap::new() }
    }

    pub fn get_or_create_current_thread(&self) -> Arc<Thread> {
        let tid = clock::current_thread_id();
        if let Some(existing) = self.threads.get(&tid) {
            return existing.clone();
        }
        let thread = Thread::new(tid);
        self.threads.insert(tid, thread.clone());
        thread
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Thread>)) {
        for entry in self.threads.iter() {
            f(entry.value());
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_current_thread_is_stable() {
        let registry = ThreadRegistry::new();
        let a = registry.get_or_create_current_thread();
        let b = registry.get_or_create_current_thread();
        assert_eq!(a.os_tid, b.os_tid);
        assert_eq!(registry.thread_count(), 1);
    }

    #[test]
    fn write_in_progress_starts_idle() {
        let thread = Thread::new(1);
        assert!(thread.is_idle());
        thread.begin_write(3);
        assert!(!thread.is_idle());
        thread.end_write();
        assert!(thread.is_idle());
    }
}
