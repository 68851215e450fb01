//! The process-wide facade (§4.10): the single entry point a producer or
//! a bootstrap calls. Owns the session table, the `allow_write` bitmask
//! every `write_event` call consults, and the lifecycle that start-up
//! ordering has to respect (a session can be requested before the
//! process has finished initializing).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::configuration::{Configuration, SessionProvider};
use crate::event_instance::EventInstance;
use crate::ids::{ActivityId, SessionId};
use crate::metrics::EngineMetrics;
use crate::provider::{Event, Provider, ProviderCallback};
use crate::sampler::{SampleProfiler, SingleThreadEnumerator};
use crate::session::{Session, SessionArgs, SyncCallback};
use crate::sink::EventSink;
use crate::thread_registry::ThreadRegistry;
use eventpipe_wire::{Level, SerializationFormat, SessionType, CATCH_ALL_PROVIDER_NAME};
use log::info;

pub const SAMPLE_PROFILER_PROVIDER_NAME: &str = "EventPipeSampleProfiler";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotInitialized,
    Initialized,
    ShuttingDown,
}

struct Inner {
    state: State,
    sessions: [Option<Arc<Session>>; 64],
    number_of_sessions: u32,
    can_start_threads: bool,
    deferred_enable: Vec<u8>,
    deferred_disable: Vec<u8>,
}

pub struct EnableArgs {
    pub session_type: SessionType,
    pub format: SerializationFormat,
    pub circular_buffer_mb: usize,
    pub rundown_keyword: u64,
    pub providers: Vec<SessionProvider>,
    pub sink: Option<Arc<dyn EventSink>>,
    pub sync_callback: Option<SyncCallback>,
}

pub struct EventPipe {
    inner: Mutex<Inner>,
    allow_write: AtomicU64,
    pub configuration: Arc<Configuration>,
    pub thread_registry: ThreadRegistry,
    pub metrics: Arc<EngineMetrics>,
    sampler: SamplerHandle,
}

/// Bundles the sample-profiler with the event it emits under, since the
/// event has to exist before any session can subscribe to it.
struct SamplerHandle {
    profiler: Arc<SampleProfiler>,
    event: Arc<Event>,
}

impl EventPipe {
    fn new() -> Arc<EventPipe> {
        let configuration = Configuration::new();
        let (sampler_provider, _) = configuration.create_provider(SAMPLE_PROFILER_PROVIDER_NAME, None);
        let sampler_event = sampler_provider.add_event(0, 0, 1, Level::Informational, true, None);
        let sampler = SampleProfiler::new(sampler_event.clone(), Box::new(SingleThreadEnumerator));

        Arc::new(EventPipe {
            inner: Mutex::new(Inner {
                state: State::NotInitialized,
                sessions: std::array::from_fn(|_| None),
                number_of_sessions: 0,
                can_start_threads: false,
                deferred_enable: Vec::new(),
                deferred_disable: Vec::new(),
            }),
            allow_write: AtomicU64::new(0),
            configuration,
            thread_registry: ThreadRegistry::new(),
            metrics: Arc::new(EngineMetrics::new()),
            sampler: SamplerHandle {
                profiler: sampler,
                event: sampler_event,
            },
        })
    }

    /// Idempotent. Moves `NotInitialized -> Initialized`; a second call
    /// is a no-op.
    pub fn init(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::NotInitialized {
            inner.state = State::Initialized;
            info!("eventpipe initialized");
        }
    }

    /// Allows background threads to actually start: drains sessions whose
    /// `enable` raced ahead of `init`/`finish_init`, then drains deferred
    /// disables outside the lock (§4.10).
    pub fn finish_init(&self) {
        let to_enable = {
            let mut inner = self.inner.lock().unwrap();
            inner.can_start_threads = true;
            std::mem::take(&mut inner.deferred_enable)
        };
        for index in to_enable {
            if let Some(session) = self.session_at(index) {
                session.start_streaming();
            }
        }
        let to_disable = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.deferred_disable)
        };
        for index in to_disable {
            self.disable_index(index);
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    pub fn number_of_sessions(&self) -> u32 {
        self.inner.lock().unwrap().number_of_sessions
    }

    fn session_at(&self, index: u8) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().sessions[index as usize].clone()
    }

    pub fn create_provider(&self, name: impl Into<String>, callback: Option<ProviderCallback>) -> Arc<Provider> {
        let (provider, callbacks) = self.configuration.create_provider(name, callback);
        if let Some(cb) = &provider.callback {
            for c in callbacks {
                cb(&c);
            }
        }
        provider
    }

    /// Allocates a session slot, registers its providers, and starts
    /// streaming immediately if the process has already finished
    /// initializing; otherwise the session buffers writes but its
    /// background thread waits for `finish_init`.
    pub fn enable(self: &Arc<Self>, args: EnableArgs) -> Option<SessionId> {
        let index = {
            let mut inner = self.inner.lock().unwrap();
            if inner.number_of_sessions >= 64 {
                return None;
            }
            let index = (0u8..64).find(|i| inner.sessions[*i as usize].is_none())?;
            inner.sessions[index as usize] = Some(Session::new(
                index,
                SessionArgs {
                    kind: args.session_type,
                    format: args.format,
                    circular_buffer_mb: args.circular_buffer_mb,
                    rundown_keyword: args.rundown_keyword,
                    providers: args.providers.clone(),
                    sink: args.sink,
                    sync_callback: args.sync_callback,
                },
                self.configuration.clone(),
                self.metrics.clone(),
            ));
            inner.number_of_sessions += 1;
            index
        };
        self.metrics.inc_sessions_created();

        let session = self.session_at(index)?;
        self.allow_write.fetch_or(session.mask, Ordering::AcqRel);
        self.configuration.enable(index, args.providers.clone());

        if args.providers.iter().any(|p| p.provider_name == SAMPLE_PROFILER_PROVIDER_NAME || p.provider_name == CATCH_ALL_PROVIDER_NAME) {
            let emitter = self.clone_write_emitter();
            self.sampler.profiler.start(emitter);
        }

        let should_start_now = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == State::Initialized && inner.can_start_threads {
                true
            } else {
                inner.deferred_enable.push(index);
                false
            }
        };
        if should_start_now {
            session.start_streaming();
        }

        Some(index as u64 + 1)
    }

    fn clone_write_emitter(self: &Arc<Self>) -> crate::sampler::SampleSink {
        let pipe = self.clone();
        Arc::new(move |event, activity_id, thread_id, timestamp, stack| {
            pipe.write_event_from(event, Vec::new(), activity_id, ActivityId::NIL, thread_id, timestamp, stack.to_vec());
        })
    }

    fn index_of(&self, id: SessionId) -> Option<u8> {
        if id == 0 {
            return None;
        }
        let idx = id - 1;
        if idx < 64 {
            Some(idx as u8)
        } else {
            None
        }
    }

    /// Disables a live session: clears the enable bit, tears down its
    /// provider subscription, runs rundown if requested, and drains it.
    pub fn disable(&self, id: SessionId) {
        let Some(index) = self.index_of(id) else { return };
        let can_start_threads = self.inner.lock().unwrap().can_start_threads;
        if !can_start_threads {
            self.inner.lock().unwrap().deferred_disable.push(index);
            return;
        }
        self.disable_index(index);
    }

    fn disable_index(&self, index: u8) {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            let session = inner.sessions[index as usize].take();
            if session.is_some() {
                inner.number_of_sessions = inner.number_of_sessions.saturating_sub(1);
            }
            session
        };
        let Some(session) = session else { return };
        self.metrics.dec_sessions_active();

        self.allow_write.fetch_and(!session.mask, Ordering::AcqRel);
        self.configuration.disable(index);

        if session.rundown_keyword != 0 {
            session.enable_rundown();
        }

        // §5: no thread may still be mid-write into this session's buffers
        // when the final drain starts, or a write lands after drain and is
        // lost along with its budget. Spin each thread past its current
        // write for this index, then retire its buffer into the read-only
        // list so the drain below actually sees it.
        self.thread_registry.for_each(|thread| {
            thread.spin_until_write_done(index);
            if let Some(state) = thread.session_state(index) {
                session.buffer_manager.suspend_write_event(&state);
            }
        });

        session.disable();
        self.configuration.delete_deferred_providers();
    }

    /// §4.10 `write_event`: fast-path-rejects on the event's enable mask
    /// before ever touching a lock, then fans the record out to every
    /// session bit set in both the event's mask and the process-wide
    /// `allow_write` mask.
    pub fn write_event(
        &self,
        event: &Arc<Event>,
        payload: Vec<u8>,
        activity_id: Option<ActivityId>,
        related_activity_id: Option<ActivityId>,
        stack: Vec<u64>,
    ) {
        if self.state() == State::NotInitialized {
            return;
        }
        self.write_event_from(
            event,
            payload,
            activity_id.unwrap_or(ActivityId::NIL),
            related_activity_id.unwrap_or(ActivityId::NIL),
            crate::clock::current_thread_id(),
            crate::clock::now(),
            stack,
        );
    }

    fn write_event_from(
        &self,
        event: &Arc<Event>,
        payload: Vec<u8>,
        activity_id: ActivityId,
        related_activity_id: ActivityId,
        thread_os_tid: u64,
        timestamp: i64,
        stack: Vec<u64>,
    ) {
        let mask = event.enabled_mask();
        if mask == 0 {
            return;
        }

        let thread = self.thread_registry.get_or_create_current_thread();
        debug_assert_eq!(thread.os_tid, thread_os_tid, "write_event called from a thread other than its own os_tid");

        if let Some(rundown_index) = thread.rundown_session() {
            if let Some(session) = self.session_at(rundown_index) {
                self.dispatch(&session, rundown_index, &thread, event, &payload, activity_id, related_activity_id, timestamp, &stack);
            }
            return;
        }

        let effective = self.allow_write.load(Ordering::Acquire) & mask;
        for index in 0u8..64 {
            if effective & (1u64 << index) == 0 {
                continue;
            }
            let Some(session) = self.session_at(index) else { continue };
            self.dispatch(&session, index, &thread, event, &payload, activity_id, related_activity_id, timestamp, &stack);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        session: &Arc<Session>,
        index: u8,
        thread: &Arc<crate::thread_registry::Thread>,
        event: &Arc<Event>,
        payload: &[u8],
        activity_id: ActivityId,
        related_activity_id: ActivityId,
        timestamp: i64,
        stack: &[u64],
    ) {
        thread.begin_write(index);
        let instance = EventInstance::new(
            event.clone(),
            activity_id,
            related_activity_id,
            thread.os_tid,
            timestamp,
            crate::clock::current_processor_id(),
            payload.to_vec(),
            stack.to_vec(),
        );
        let state = if session.kind == SessionType::Synchronous {
            None
        } else {
            Some(thread.get_or_create_session_state(session))
        };
        session.write_event(state.as_ref(), &instance);
        thread.end_write();
    }
}

static GLOBAL: OnceCell<Arc<EventPipe>> = OnceCell::new();

/// The process-wide instance. Created lazily on first access, matching
/// the spec's "process-wide singleton" (§4.10).
pub fn global() -> &'static Arc<EventPipe> {
    GLOBAL.get_or_init(EventPipe::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    fn fresh_pipe() -> Arc<EventPipe> {
        EventPipe::new()
    }

    #[test]
    fn write_event_before_init_is_a_no_op() {
        let pipe = fresh_pipe();
        let provider = pipe.create_provider("P", None);
        let event = provider.add_event(1, 0x1, 1, Level::Informational, false, None);
        pipe.write_event(&event, vec![1, 2, 3], None, None, Vec::new());
        assert_eq!(pipe.number_of_sessions(), 0);
    }

    #[test]
    fn enable_then_write_reaches_synchronous_callback() {
        let pipe = fresh_pipe();
        pipe.init();
        pipe.finish_init();
        let provider = pipe.create_provider("P", None);
        let event = provider.add_event(1, 0x1, 1, Level::Informational, false, None);

        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let id = pipe
            .enable(EnableArgs {
                session_type: SessionType::Synchronous,
                format: SerializationFormat::NetTraceV4,
                circular_buffer_mb: 1,
                rundown_keyword: 0,
                providers: vec![SessionProvider::new("P", 0x1, Level::Verbose)],
                sink: None,
                sync_callback: Some(Box::new(move |instance| {
                    received2.lock().unwrap().push(instance.payload.clone());
                })),
            })
            .expect("session should be allocated");
        assert_eq!(id, 1);

        pipe.write_event(&event, vec![9, 9, 9], None, None, Vec::new());
        assert_eq!(received.lock().unwrap().as_slice(), &[vec![9u8, 9, 9]]);

        pipe.disable(id);
        assert_eq!(pipe.number_of_sessions(), 0);
    }

    #[test]
    fn enable_before_finish_init_defers_streaming_start() {
        let pipe = fresh_pipe();
        pipe.init();
        let provider = pipe.create_provider("P", None);
        let _event = provider.add_event(1, 0x1, 1, Level::Informational, false, None);
        let id = pipe
            .enable(EnableArgs {
                session_type: SessionType::File,
                format: SerializationFormat::NetTraceV4,
                circular_buffer_mb: 1,
                rundown_keyword: 0,
                providers: vec![SessionProvider::catch_all()],
                sink: Some(Arc::new(MemorySink::new())),
                sync_callback: None,
            })
            .unwrap();
        assert_eq!(pipe.number_of_sessions(), 1);
        pipe.finish_init();
        pipe.disable(id);
    }

    #[test]
    fn session_table_is_exhausted_after_64_enables() {
        let pipe = fresh_pipe();
        pipe.init();
        pipe.finish_init();
        for _ in 0..64 {
            let id = pipe.enable(EnableArgs {
                session_type: SessionType::Synchronous,
                format: SerializationFormat::NetTraceV4,
                circular_buffer_mb: 1,
                rundown_keyword: 0,
                providers: vec![],
                sink: None,
                sync_callback: None,
            });
            assert!(id.is_some());
        }
        let overflow = pipe.enable(EnableArgs {
            session_type: SessionType::Synchronous,
            format: SerializationFormat::NetTraceV4,
            circular_buffer_mb: 1,
            rundown_keyword: 0,
            providers: vec![],
            sink: None,
            sync_callback: None,
        });
        assert!(overflow.is_none());
    }

    #[test]
    fn enable_disable_race_leaves_clean_state() {
        use std::sync::atomic::AtomicBool;

        let pipe = fresh_pipe();
        pipe.init();
        pipe.finish_init();
        let provider = pipe.create_provider("P", None);
        let event = provider.add_event(1, 0x1, 1, Level::Informational, false, None);

        let stop = Arc::new(AtomicBool::new(false));
        let producers: Vec<_> = (0..8)
            .map(|_| {
                let pipe = pipe.clone();
                let event = event.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        pipe.write_event(&event, vec![0, 0, 0, 0], None, None, Vec::new());
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            let id = pipe
                .enable(EnableArgs {
                    session_type: SessionType::Synchronous,
                    format: SerializationFormat::NetTraceV4,
                    circular_buffer_mb: 1,
                    rundown_keyword: 0,
                    providers: vec![SessionProvider::catch_all()],
                    sink: None,
                    sync_callback: Some(Box::new(|_| {})),
                })
                .expect("a slot should always be free between disables");
            pipe.disable(id);
        }

        stop.store(true, Ordering::Relaxed);
        for handle in producers {
            handle.join().unwrap();
        }

        assert_eq!(pipe.allow_write.load(Ordering::Acquire), 0);
        assert_eq!(pipe.number_of_sessions(), 0);
        pipe.thread_registry.for_each(|thread| assert!(thread.is_idle()));
    }
}
